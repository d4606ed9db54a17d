use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};

pub(crate) fn prometheus_builder(
    addr: SocketAddr,
    port: u16,
    max_chunk_size: usize,
) -> Result<PrometheusBuilder, BuildError> {
    let mut addr = addr;
    addr.set_port(port);

    // Duration buckets
    let duration_matcher = Matcher::Suffix(String::from("duration"));
    let n_duration_buckets = 35;
    let mut duration_buckets = Vec::with_capacity(n_duration_buckets);
    // Minimum duration in seconds
    let mut value = 0.00001;
    for _ in 0..n_duration_buckets {
        // geometric sequence
        value *= 1.5;
        duration_buckets.push(value);
    }

    // Chunk size buckets
    let chunk_size_matcher = Matcher::Full(String::from("ds_chunk_size"));
    let chunk_size_buckets: Vec<f64> = (0..20)
        .map(|x| 2.0_f64.powi(x))
        .filter(|x| (*x as usize) <= max_chunk_size)
        .collect();

    // Prometheus handler
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(duration_matcher, &duration_buckets)?
        .set_buckets_for_metric(chunk_size_matcher, &chunk_size_buckets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accepts_buckets() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(prometheus_builder(addr, 9000, 5000).is_ok());
    }
}
