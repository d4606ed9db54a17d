/// Dense retrieval job runner
mod data;
mod logging;
mod output;
mod prometheus;

pub use data::{load_corpus, load_queries, read_corpus, read_queries};
pub use logging::init_logging;
pub use output::{write_results, OutputFormat};

use anyhow::{Context, Result};
use dense_search_backend_core::Device;
use dense_search_backend_http::{HttpConfig, HttpLoader};
use dense_search_core::{ExactSearch, ScoreFunction, SearchConfig};
use std::fs::File;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[allow(clippy::too_many_arguments)]
pub async fn run(
    corpus_path: PathBuf,
    queries_path: PathBuf,
    endpoints: Vec<Device>,
    top_k: usize,
    score_function: String,
    batch_size: usize,
    corpus_chunk_size: Option<usize>,
    sort_corpus: bool,
    allow_partial: bool,
    max_client_batch_size: usize,
    query_prompt_name: Option<String>,
    passage_prompt_name: Option<String>,
    output: Option<PathBuf>,
    output_format: OutputFormat,
    run_name: String,
    prometheus_port: Option<u16>,
) -> Result<()> {
    // Fail on configuration errors before reading any data
    score_function.parse::<ScoreFunction>()?;

    if let Some(port) = prometheus_port {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        prometheus::prometheus_builder(addr, port, corpus_chunk_size.unwrap_or(5000))
            .context("failed to build prometheus recorder")?
            .install()
            .context("failed to install metrics recorder")?;
        tracing::info!("Serving Prometheus metrics on port {port}");
    }

    let start = Instant::now();
    let corpus = load_corpus(&corpus_path)?;
    let queries = load_queries(&queries_path)?;
    tracing::info!(
        "Loaded {} documents and {} queries in {:?}",
        corpus.len(),
        queries.len(),
        start.elapsed()
    );

    let loader = HttpLoader::new(HttpConfig {
        max_client_batch_size,
        query_prompt_name,
        passage_prompt_name,
        ..Default::default()
    });
    let config = SearchConfig {
        devices: endpoints,
        batch_size,
        corpus_chunk_size,
        sort_corpus,
        allow_partial,
    };
    let search = ExactSearch::new(Arc::new(loader), config);

    let query_ids: Vec<String> = queries.iter().map(|q| q.id.clone()).collect();
    let results = tokio::task::spawn_blocking(move || {
        search.search(&corpus, &queries, top_k, &score_function)
    })
    .await
    .context("search task panicked")??;
    tracing::info!("Search finished in {:?}", start.elapsed());

    match output {
        Some(path) => {
            let file =
                File::create(&path).with_context(|| format!("could not create {}", path.display()))?;
            write_results(BufWriter::new(file), &results, &query_ids, output_format, &run_name)?;
            tracing::info!("Wrote {output_format} results to {}", path.display());
        }
        None => {
            let stdout = std::io::stdout();
            write_results(stdout.lock(), &results, &query_ids, output_format, &run_name)?;
        }
    }
    Ok(())
}
