//! Device-bound workers: encode a corpus chunk, score it against the shared query matrix
//! and emit the chunk's local top-k candidates to the collector.

use crate::collector::{Collector, CollectorWriter, LocalTopK};
use crate::queue::{next_chunk, Chunk, ChunkQueue, ChunkReceiver};
use crate::similarity::{replace_nan, ScoreFunction};
use crate::SearchError;
use dense_search_backend_core::{Backend, BackendLoader, Batch, Device, Input, InputKind};
use ndarray::Array2;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::instrument;

/// Per-job state shared read-only by every worker
#[derive(Debug, Clone)]
pub struct JobContext {
    pub query_embeddings: Arc<Array2<f32>>,
    pub top_k: usize,
    pub score_function: ScoreFunction,
}

/// Encode `inputs` with at most `batch_size` inputs per backend call. Returns one row per
/// input.
pub fn encode_batches<B: Backend + ?Sized>(
    backend: &B,
    kind: InputKind,
    inputs: Vec<Input>,
    batch_size: usize,
) -> Result<Array2<f32>, SearchError> {
    let batch_size = match backend.max_batch_size() {
        Some(max_batch_size) => batch_size.min(max_batch_size),
        None => batch_size,
    }
    .max(1);

    let n_inputs = inputs.len();
    let mut dim: Option<usize> = None;
    let mut flat: Vec<f32> = Vec::new();

    let mut inputs = inputs.into_iter().peekable();
    while inputs.peek().is_some() {
        let batch: Vec<Input> = inputs.by_ref().take(batch_size).collect();
        let expected = batch.len();
        let embeddings = backend.embed(Batch {
            kind,
            inputs: batch,
        })?;

        if embeddings.len() != expected {
            return Err(SearchError::Shape(format!(
                "backend returned {} embeddings for {expected} inputs",
                embeddings.len()
            )));
        }

        for embedding in embeddings {
            match dim {
                None if embedding.is_empty() => {
                    return Err(SearchError::Shape("backend returned an empty embedding".into()))
                }
                None => {
                    dim = Some(embedding.len());
                    flat.reserve(n_inputs * embedding.len());
                }
                Some(dim) if dim != embedding.len() => {
                    return Err(SearchError::Shape(format!(
                        "embedding dimension changed from {dim} to {}",
                        embedding.len()
                    )))
                }
                Some(_) => {}
            }
            flat.extend(embedding);
        }
    }

    Array2::from_shape_vec((n_inputs, dim.unwrap_or(0)), flat)
        .map_err(|err| SearchError::Shape(err.to_string()))
}

/// Select the `min(top_k + 1, n_items)` best candidates of every query row of `scores`.
/// The extra candidate leaves room for dropping a self-match at merge time. Candidates are
/// not sorted.
///
/// Output layout is candidate-major: `values[[j, qi]]` / `indices[[j, qi]]`.
pub fn local_top_k(scores: &Array2<f32>, top_k: usize) -> (Array2<f32>, Array2<usize>) {
    let (n_queries, n_items) = scores.dim();
    let k = top_k.saturating_add(1).min(n_items);

    let mut values = Array2::zeros((k, n_queries));
    let mut indices = Array2::zeros((k, n_queries));
    let mut order: Vec<usize> = Vec::with_capacity(n_items);

    for (qi, row) in scores.outer_iter().enumerate() {
        order.clear();
        order.extend(0..n_items);
        if k > 0 && k < n_items {
            order.select_nth_unstable_by(k - 1, |&a, &b| row[b].total_cmp(&row[a]));
        }
        for (j, &idx) in order[..k].iter().enumerate() {
            values[[j, qi]] = row[idx];
            indices[[j, qi]] = idx;
        }
    }

    (values, indices)
}

#[instrument(skip_all, fields(batch_index = chunk.batch_index, size = chunk.inputs.len()))]
fn score_chunk<B: Backend + ?Sized>(
    backend: &B,
    job: &JobContext,
    chunk: Chunk,
) -> Result<LocalTopK, SearchError> {
    let batch_index = chunk.batch_index;
    let histogram = metrics::histogram!("ds_chunk_size");
    histogram.record(chunk.inputs.len() as f64);

    let start = Instant::now();
    let corpus_embeddings =
        encode_batches(backend, InputKind::Passage, chunk.inputs, chunk.batch_size)?;
    let histogram = metrics::histogram!("ds_chunk_encode_duration");
    histogram.record(start.elapsed().as_secs_f64());

    if corpus_embeddings.ncols() != job.query_embeddings.ncols() {
        return Err(SearchError::Shape(format!(
            "corpus embedding dimension {} does not match query embedding dimension {}",
            corpus_embeddings.ncols(),
            job.query_embeddings.ncols()
        )));
    }

    let start = Instant::now();
    let mut scores = job
        .score_function
        .score(job.query_embeddings.view(), corpus_embeddings.view());
    drop(corpus_embeddings);

    let replaced = replace_nan(&mut scores);
    if replaced > 0 {
        tracing::debug!("Replaced {replaced} NaN scores");
    }

    let (values, indices) = local_top_k(&scores, job.top_k);
    let histogram = metrics::histogram!("ds_chunk_score_duration");
    histogram.record(start.elapsed().as_secs_f64());

    Ok(LocalTopK {
        batch_index: batch_index as i64,
        values,
        indices,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct WorkerStats {
    processed: usize,
    failed: usize,
}

fn worker_loop(
    worker_id: usize,
    backend: Box<dyn Backend + Send>,
    job: JobContext,
    receiver: ChunkReceiver,
    writer: CollectorWriter,
) -> WorkerStats {
    let mut stats = WorkerStats::default();

    // Loop until the coordinator closes the queue and it is drained
    while let Some(chunk) = next_chunk(&receiver) {
        let batch_index = chunk.batch_index;
        let parent_span = chunk.span.clone();
        parent_span.in_scope(|| {
            let result = score_chunk(backend.as_ref(), &job, chunk)
                .and_then(|record| writer.append(record).map_err(SearchError::from));
            match result {
                Ok(()) => {
                    stats.processed += 1;
                    let counter = metrics::counter!("ds_chunk_success");
                    counter.increment(1);
                }
                Err(err) => {
                    stats.failed += 1;
                    let counter = metrics::counter!("ds_chunk_failure");
                    counter.increment(1);
                    tracing::error!("Worker {worker_id} failed on chunk {batch_index}: {err}");
                }
            }
        });
    }

    tracing::debug!(
        "Worker {worker_id} drained the queue after {} chunks",
        stats.processed
    );
    stats
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub device: Device,
    pub processed: usize,
    pub failed: usize,
    /// The worker thread panicked
    pub crashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub workers: Vec<WorkerReport>,
}

impl PoolReport {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.workers.iter().map(|w| w.failed).sum()
    }

    pub fn crashed(&self) -> usize {
        self.workers.iter().filter(|w| w.crashed).count()
    }
}

#[derive(Debug)]
struct WorkerThread {
    device: Device,
    handle: JoinHandle<WorkerStats>,
}

/// One worker thread per device, fed by a shared chunk queue
#[derive(Debug)]
pub struct WorkerPool {
    queue: ChunkQueue,
    workers: Vec<WorkerThread>,
}

impl WorkerPool {
    /// Start a worker per device and wait until each one has loaded its backend, passed a
    /// health check and written its collector warmup record.
    #[instrument(skip_all, fields(workers = devices.len()))]
    pub fn start(
        loader: Arc<dyn BackendLoader>,
        devices: &[Device],
        job: JobContext,
        collector: &Collector,
    ) -> Result<Self, SearchError> {
        if devices.is_empty() {
            return Err(SearchError::Validation(
                "at least one worker device is required".to_string(),
            ));
        }

        let (queue, receiver) = ChunkQueue::bounded(devices.len() * 4);
        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(devices.len()),
        };
        let mut readiness = Vec::with_capacity(devices.len());

        for (worker_id, device) in devices.iter().enumerate() {
            let writer = match collector.writer(worker_id) {
                Ok(writer) => writer,
                Err(err) => {
                    pool.stop();
                    return Err(err.into());
                }
            };
            let (ready_sender, ready_receiver) = oneshot::channel();
            let loader = loader.clone();
            let job = job.clone();
            let receiver = receiver.clone();
            let thread_device = device.clone();

            let spawned = std::thread::Builder::new()
                .name(format!("dense-search-worker-{worker_id}"))
                .spawn(move || {
                    let backend = match start_worker(loader.as_ref(), &thread_device, &writer) {
                        Ok(backend) => backend,
                        Err(err) => {
                            let _ = ready_sender.send(Err(err));
                            return WorkerStats::default();
                        }
                    };
                    let _ = ready_sender.send(Ok(()));
                    worker_loop(worker_id, backend, job, receiver, writer)
                });

            match spawned {
                Ok(handle) => {
                    pool.workers.push(WorkerThread {
                        device: device.clone(),
                        handle,
                    });
                    readiness.push(ready_receiver);
                }
                Err(err) => {
                    pool.stop();
                    return Err(SearchError::Pool(format!(
                        "could not spawn worker for {device}: {err}"
                    )));
                }
            }
        }
        drop(receiver);

        let mut first_error = None;
        for (ready, worker) in readiness.into_iter().zip(pool.workers.iter()) {
            let result = ready.blocking_recv().unwrap_or_else(|_| {
                Err(SearchError::Pool(format!(
                    "worker for {} exited during startup",
                    worker.device
                )))
            });
            if let Err(err) = result {
                tracing::error!("Could not start worker on {}: {err}", worker.device);
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => {
                pool.stop();
                Err(err)
            }
            None => {
                tracing::info!("Started {} workers", pool.workers.len());
                Ok(pool)
            }
        }
    }

    pub fn dispatch(&self, chunk: Chunk) -> Result<(), SearchError> {
        self.queue.dispatch(chunk).map_err(|chunk| {
            SearchError::Pool(format!(
                "every worker stopped before chunk {} was dispatched",
                chunk.batch_index
            ))
        })
    }

    /// Close the queue, let workers drain it and join them
    #[instrument(skip_all)]
    pub fn stop(self) -> PoolReport {
        self.queue.close();

        let workers = self
            .workers
            .into_iter()
            .map(|worker| match worker.handle.join() {
                Ok(stats) => WorkerReport {
                    device: worker.device,
                    processed: stats.processed,
                    failed: stats.failed,
                    crashed: false,
                },
                Err(_) => {
                    tracing::error!("Worker on {} panicked", worker.device);
                    WorkerReport {
                        device: worker.device,
                        processed: 0,
                        failed: 0,
                        crashed: true,
                    }
                }
            })
            .collect();

        PoolReport { workers }
    }
}

fn start_worker(
    loader: &dyn BackendLoader,
    device: &Device,
    writer: &CollectorWriter,
) -> Result<Box<dyn Backend + Send>, SearchError> {
    let backend = loader.load(device)?;
    backend.health()?;
    writer.warmup()?;
    tracing::debug!("Worker {} ready on {device}", writer.id());
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dense_search_backend_core::{BackendError, Embeddings};
    use ndarray::array;

    struct FixedBackend {
        dim: usize,
        max_batch_size: Option<usize>,
    }

    impl Backend for FixedBackend {
        fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn max_batch_size(&self) -> Option<usize> {
            self.max_batch_size
        }

        fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError> {
            if let Some(max) = self.max_batch_size {
                assert!(batch.len() <= max);
            }
            Ok(batch
                .inputs
                .iter()
                .map(|input| vec![input.text.len() as f32; self.dim])
                .collect())
        }
    }

    #[test]
    fn test_local_top_k_selects_best_per_query() {
        let scores = array![[0.1, 0.9, 0.5, 0.7], [0.8, 0.2, 0.3, 0.1]];
        let (values, indices) = local_top_k(&scores, 1);
        assert_eq!(values.dim(), (2, 2));

        let mut q0: Vec<usize> = indices.column(0).to_vec();
        q0.sort_unstable();
        assert_eq!(q0, vec![1, 3]);
        let mut q1: Vec<usize> = indices.column(1).to_vec();
        q1.sort_unstable();
        assert_eq!(q1, vec![0, 2]);

        for j in 0..2 {
            for qi in 0..2 {
                assert_eq!(values[[j, qi]], scores[[qi, indices[[j, qi]]]]);
            }
        }
    }

    #[test]
    fn test_local_top_k_caps_at_chunk_size() {
        let scores = array![[0.3, 0.2]];
        let (values, indices) = local_top_k(&scores, 5);
        assert_eq!(values.dim(), (2, 1));
        let mut all: Vec<usize> = indices.column(0).to_vec();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1]);
    }

    #[test]
    fn test_local_top_k_unbounded_k_keeps_every_item() {
        let scores = array![[0.3, 0.9, 0.1], [0.2, 0.4, 0.6]];
        let (values, indices) = local_top_k(&scores, usize::MAX);
        assert_eq!(values.dim(), (3, 2));
        for qi in 0..2 {
            let mut all: Vec<usize> = indices.column(qi).to_vec();
            all.sort_unstable();
            assert_eq!(all, vec![0, 1, 2]);
        }
    }

    #[test]
    fn test_encode_batches_respects_max_batch_size() {
        let backend = FixedBackend {
            dim: 3,
            max_batch_size: Some(2),
        };
        let inputs = vec![Input::text("a"), Input::text("bb"), Input::text("ccc")];
        let embeddings = encode_batches(&backend, InputKind::Query, inputs, 16).unwrap();
        assert_eq!(embeddings.dim(), (3, 3));
        assert_eq!(embeddings[[2, 0]], 3.0);
    }

    #[test]
    fn test_encode_batches_empty() {
        let backend = FixedBackend {
            dim: 3,
            max_batch_size: None,
        };
        let embeddings = encode_batches(&backend, InputKind::Passage, vec![], 4).unwrap();
        assert_eq!(embeddings.nrows(), 0);
    }

    #[test]
    fn test_score_chunk_dimension_mismatch() {
        let backend = FixedBackend {
            dim: 2,
            max_batch_size: None,
        };
        let job = JobContext {
            query_embeddings: Arc::new(array![[1.0, 0.0, 0.0]]),
            top_k: 1,
            score_function: ScoreFunction::Dot,
        };
        let chunk = Chunk {
            batch_index: 0,
            batch_size: 8,
            inputs: vec![Input::text("x")],
            span: tracing::Span::none(),
        };
        let err = score_chunk(&backend, &job, chunk).unwrap_err();
        assert!(matches!(err, SearchError::Shape(_)));
    }

    struct CrashingBackend;

    impl Backend for CrashingBackend {
        fn health(&self) -> Result<(), BackendError> {
            Ok(())
        }

        fn embed(&self, _batch: Batch) -> Result<Embeddings, BackendError> {
            panic!("device lost");
        }
    }

    struct CrashingLoader;

    impl BackendLoader for CrashingLoader {
        fn load(&self, _device: &Device) -> Result<Box<dyn Backend + Send>, BackendError> {
            Ok(Box::new(CrashingBackend))
        }
    }

    #[test]
    fn test_panicking_worker_is_reported_as_crashed() {
        let mut collector = Collector::new();
        let job = JobContext {
            query_embeddings: Arc::new(array![[1.0, 0.0]]),
            top_k: 1,
            score_function: ScoreFunction::Dot,
        };
        let pool = WorkerPool::start(
            Arc::new(CrashingLoader),
            &[Device::new("cpu:0")],
            job,
            &collector,
        )
        .unwrap();
        pool.dispatch(Chunk {
            batch_index: 0,
            batch_size: 8,
            inputs: vec![Input::text("x")],
            span: tracing::Span::none(),
        })
        .unwrap();

        let report = pool.stop();
        assert_eq!(report.crashed(), 1);
        assert_eq!(report.processed(), 0);
        assert!(report.workers[0].crashed);
        assert_eq!(report.workers[0].device, Device::new("cpu:0"));

        // The crashed worker's writer detached while unwinding
        let collected = collector.read_all().unwrap();
        assert_eq!(collected.len(), 1);
        assert!(collected[0].record.is_sentinel());
    }
}
