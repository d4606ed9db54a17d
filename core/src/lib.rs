pub mod collector;
pub mod merge;
pub mod queue;
pub mod search;
pub mod similarity;
pub mod worker;

use crate::collector::CollectorError;
use dense_search_backend_core::BackendError;
use thiserror::Error;

pub use crate::search::{CorpusItem, ExactSearch, QueryItem, SearchConfig, SearchResults};
pub use crate::similarity::ScoreFunction;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("score function: {0} must be either (cos_sim) for cosine similarity or (dot) for dot product")]
    UnknownScoreFunction(String),
    #[error("Input validation error: {0}")]
    Validation(String),
    #[error("Embedding shape error: {0}")]
    Shape(String),
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),
    #[error("Worker pool error: {0}")]
    Pool(String),
    #[error("{} of {total} corpus chunks produced no candidates: {missing:?}", .missing.len())]
    MissingChunks { missing: Vec<usize>, total: usize },
    #[error("corpus chunks were scored more than once: {0:?}")]
    DuplicateChunks(Vec<usize>),
}
