//! Exact dense retrieval over a corpus split across parallel workers
use crate::collector::{Collector, LocalTopK};
use crate::merge::{merge, reconcile};
use crate::queue::Chunk;
use crate::similarity::ScoreFunction;
use crate::worker::{encode_batches, JobContext, WorkerPool};
use crate::SearchError;
use dense_search_backend_core::{BackendLoader, Device, Input, InputKind};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{instrument, Span};

pub use crate::merge::SearchResults;

/// Upper bound of the derived chunk size
const MAX_CORPUS_CHUNK_SIZE: usize = 5000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusItem {
    pub id: String,
    pub title: Option<String>,
    pub text: String,
}

impl CorpusItem {
    /// Combined title and text length in characters
    pub fn len(&self) -> usize {
        self.title.as_deref().map_or(0, |t| t.chars().count()) + self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryItem {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// One worker is started per device
    pub devices: Vec<Device>,
    /// Number of inputs per encoding call
    pub batch_size: usize,
    /// Corpus items per chunk. Derived from the corpus size and worker count if unset.
    pub corpus_chunk_size: Option<usize>,
    /// Dispatch the longest documents first
    pub sort_corpus: bool,
    /// Merge whatever was collected when some chunks produced no candidates instead of
    /// failing the job
    pub allow_partial: bool,
}

impl SearchConfig {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices,
            batch_size: 128,
            corpus_chunk_size: None,
            sort_corpus: true,
            allow_partial: false,
        }
    }
}

/// Chunk size used to split a corpus of `corpus_len` items across `workers` workers.
///
/// When unset it is `min(ceil(corpus_len / workers / 10), 5000)`. The result is then capped at
/// `corpus_len - 1` and is never below 1.
pub fn resolve_chunk_size(configured: Option<usize>, corpus_len: usize, workers: usize) -> usize {
    let chunk_size = configured.unwrap_or_else(|| {
        corpus_len
            .div_ceil(workers.max(1) * 10)
            .min(MAX_CORPUS_CHUNK_SIZE)
    });
    chunk_size.min(corpus_len.saturating_sub(1)).max(1)
}

/// Corpus in dispatch order: longest combined title and text first when `sort` is set.
/// The sort is stable so equal lengths keep their input order.
pub fn dispatch_order(corpus: &[CorpusItem], sort: bool) -> Vec<&CorpusItem> {
    let mut order: Vec<&CorpusItem> = corpus.iter().collect();
    if sort {
        order.sort_by_key(|item| Reverse(item.len()));
    }
    order
}

pub struct ExactSearch {
    loader: Arc<dyn BackendLoader>,
    config: SearchConfig,
}

impl ExactSearch {
    pub fn new(loader: Arc<dyn BackendLoader>, config: SearchConfig) -> Self {
        Self { loader, config }
    }

    fn validate(&self, top_k: usize) -> Result<(), SearchError> {
        if self.config.devices.is_empty() {
            return Err(SearchError::Validation(
                "at least one worker device is required".to_string(),
            ));
        }
        if self.config.batch_size == 0 {
            return Err(SearchError::Validation(
                "`batch_size` must be greater than 0".to_string(),
            ));
        }
        if self.config.corpus_chunk_size == Some(0) {
            return Err(SearchError::Validation(
                "`corpus_chunk_size` must be greater than 0".to_string(),
            ));
        }
        if top_k == 0 {
            return Err(SearchError::Validation(
                "`top_k` must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Rank the corpus for every query and keep the `top_k` best corpus items per query,
    /// excluding the corpus item sharing the query's id.
    #[instrument(skip(self, corpus, queries), fields(corpus = corpus.len(), queries = queries.len()))]
    pub fn search(
        &self,
        corpus: &[CorpusItem],
        queries: &[QueryItem],
        top_k: usize,
        score_function: &str,
    ) -> Result<SearchResults, SearchError> {
        let score_function: ScoreFunction = score_function.parse()?;
        self.validate(top_k)?;

        if corpus.is_empty() || queries.is_empty() {
            tracing::warn!("Nothing to score: empty corpus or query set");
            return Ok(queries
                .iter()
                .map(|query| (query.id.clone(), HashMap::new()))
                .collect());
        }

        let devices = &self.config.devices;
        let chunk_size =
            resolve_chunk_size(self.config.corpus_chunk_size, corpus.len(), devices.len());

        if self.config.sort_corpus {
            tracing::info!("Sorting Corpus by document length (Longest first)...");
        }
        let order = dispatch_order(corpus, self.config.sort_corpus);

        tracing::info!("Encoding Queries in batches...");
        let query_embeddings = self.encode_queries(queries, &devices[0])?;

        let job = JobContext {
            query_embeddings: Arc::new(query_embeddings),
            top_k,
            score_function,
        };

        let mut collector = Collector::new();
        let pool = WorkerPool::start(self.loader.clone(), devices, job, &collector)?;

        tracing::info!("Encoding Corpus in batches... Warning: This might take a while!");
        tracing::info!(
            "Scoring Function: {} ({})",
            score_function.description(),
            score_function
        );
        let start = Instant::now();

        let n_chunks = order.len().div_ceil(chunk_size);
        for (batch_index, items) in order.chunks(chunk_size).enumerate() {
            let chunk = Chunk {
                batch_index,
                batch_size: self.config.batch_size,
                inputs: items
                    .iter()
                    .map(|item| Input {
                        title: item.title.clone(),
                        text: item.text.clone(),
                    })
                    .collect(),
                span: Span::current(),
            };
            if let Err(err) = pool.dispatch(chunk) {
                pool.stop();
                return Err(err);
            }
            tracing::debug!("Dispatched chunk {}/{n_chunks}", batch_index + 1);
        }

        let report = pool.stop();
        tracing::info!(
            "Encoded all batches in {:.2} seconds",
            start.elapsed().as_secs_f64()
        );
        if report.failed() > 0 || report.crashed() > 0 {
            tracing::warn!(
                "{} chunks failed, {} workers crashed",
                report.failed(),
                report.crashed()
            );
        }

        let records: Vec<LocalTopK> = collector
            .read_all()?
            .into_iter()
            .map(|collected| collected.record)
            .collect();

        let missing = reconcile(&records, n_chunks)?;
        if !missing.is_empty() {
            if !self.config.allow_partial {
                return Err(SearchError::MissingChunks {
                    missing,
                    total: n_chunks,
                });
            }
            tracing::warn!(
                "Merging partial results: {} of {n_chunks} chunks are missing",
                missing.len()
            );
        }

        tracing::info!("Formatting results...");
        let query_ids: Vec<String> = queries.iter().map(|query| query.id.clone()).collect();
        let corpus_ids: Vec<String> = order.iter().map(|item| item.id.clone()).collect();

        Ok(merge(&records, &query_ids, &corpus_ids, chunk_size, top_k))
    }

    /// Queries are encoded once, on a backend loaded for the first device. That backend is
    /// released before the workers start.
    fn encode_queries(
        &self,
        queries: &[QueryItem],
        device: &Device,
    ) -> Result<ndarray::Array2<f32>, SearchError> {
        let start = Instant::now();
        let backend = self.loader.load(device)?;
        let inputs = queries
            .iter()
            .map(|query| Input::text(query.text.clone()))
            .collect();
        let embeddings =
            encode_batches(backend.as_ref(), InputKind::Query, inputs, self.config.batch_size)?;
        drop(backend);

        let histogram = metrics::histogram!("ds_query_encode_duration");
        histogram.record(start.elapsed().as_secs_f64());
        tracing::debug!(
            "Encoded {} queries of dimension {}",
            embeddings.nrows(),
            embeddings.ncols()
        );
        Ok(embeddings)
    }
}
