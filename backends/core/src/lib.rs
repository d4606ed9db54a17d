use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// What a batch of inputs will be used for. Some models embed queries and passages
/// differently (prompts, separate towers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Query,
    Passage,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InputKind::Query => write!(f, "query"),
            InputKind::Passage => write!(f, "passage"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Input {
    pub title: Option<String>,
    pub text: String,
}

impl Input {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            title: None,
            text: text.into(),
        }
    }

    /// Title and text joined the way sentence-transformers retrieval models expect them
    pub fn joined(&self) -> String {
        match self.title.as_deref() {
            Some(title) if !title.is_empty() => format!("{title} {}", self.text),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Batch {
    pub kind: InputKind,
    pub inputs: Vec<Input>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pooled embedding per input, in input order
pub type Embeddings = Vec<Vec<f32>>;

pub trait Backend {
    fn health(&self) -> Result<(), BackendError>;
    fn max_batch_size(&self) -> Option<usize> {
        None
    }

    fn embed(&self, batch: Batch) -> Result<Embeddings, BackendError>;
}

/// Opaque handle naming where a worker runs: `cpu`, `cuda:1`, an endpoint URL...
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Device {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creates a model instance bound to a device. Called once per worker, on the worker's own
/// thread.
pub trait BackendLoader: Send + Sync {
    fn load(&self, device: &Device) -> Result<Box<dyn Backend + Send>, BackendError>;
}

#[derive(Debug, Error, Clone)]
pub enum BackendError {
    #[error("Could not start backend: {0}")]
    Start(String),
    #[error("{0}")]
    Inference(String),
    #[error("Backend is unhealthy")]
    Unhealthy,
}
