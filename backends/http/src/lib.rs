//! Backend that delegates encoding to a running text-embeddings-inference server

mod client;

pub use client::Client;
use dense_search_backend_core::{
    Backend, BackendError, BackendLoader, Batch, Device, Embeddings, InputKind,
};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Runtime;

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("Could not connect to embedding server: {0}")]
    Connection(String),
    #[error("Server error: {0}")]
    Inference(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        let err = if err.is_connect() || err.is_timeout() {
            Self::Connection(err.to_string())
        } else {
            Self::Inference(err.to_string())
        };
        tracing::error!("{err}");
        err
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Largest number of inputs sent in one `/embed` call. Must not exceed the server's
    /// `--max-client-batch-size`.
    pub max_client_batch_size: usize,
    /// Prompt applied by the server to query inputs
    pub query_prompt_name: Option<String>,
    /// Prompt applied by the server to passage inputs
    pub passage_prompt_name: Option<String>,
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            max_client_batch_size: 32,
            query_prompt_name: None,
            passage_prompt_name: None,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct HttpBackend {
    tokio_runtime: Runtime,
    client: Client,
    config: HttpConfig,
}

impl HttpBackend {
    pub fn new(base_url: &str, config: HttpConfig) -> std::result::Result<Self, BackendError> {
        let tokio_runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| BackendError::Start(format!("Could not start Tokio runtime: {err}")))?;

        let client = Client::new(base_url, config.timeout)
            .map_err(|err| BackendError::Start(err.to_string()))?;

        Ok(Self {
            tokio_runtime,
            client,
            config,
        })
    }

    fn prompt_name(&self, kind: InputKind) -> Option<&str> {
        match kind {
            InputKind::Query => self.config.query_prompt_name.as_deref(),
            InputKind::Passage => self.config.passage_prompt_name.as_deref(),
        }
    }
}

impl Backend for HttpBackend {
    fn health(&self) -> std::result::Result<(), BackendError> {
        if self.tokio_runtime.block_on(self.client.health()).is_err() {
            return Err(BackendError::Unhealthy);
        }
        Ok(())
    }

    fn max_batch_size(&self) -> Option<usize> {
        Some(self.config.max_client_batch_size)
    }

    fn embed(&self, batch: Batch) -> std::result::Result<Embeddings, BackendError> {
        let inputs: Vec<String> = batch.inputs.iter().map(|input| input.joined()).collect();
        self.tokio_runtime
            .block_on(self.client.embed(&inputs, self.prompt_name(batch.kind)))
            .map_err(|err| BackendError::Inference(err.to_string()))
    }
}

/// Treats every device as the base URL of one server replica
#[derive(Debug, Clone, Default)]
pub struct HttpLoader {
    config: HttpConfig,
}

impl HttpLoader {
    pub fn new(config: HttpConfig) -> Self {
        Self { config }
    }
}

impl BackendLoader for HttpLoader {
    fn load(&self, device: &Device) -> std::result::Result<Box<dyn Backend + Send>, BackendError> {
        if !device.as_str().starts_with("http://") && !device.as_str().starts_with("https://") {
            return Err(BackendError::Start(format!(
                "`{device}` is not an http(s) endpoint"
            )));
        }
        tracing::info!("Connecting worker to {device}");
        let backend = HttpBackend::new(device.as_str(), self.config.clone())?;
        Ok(Box::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loader_rejects_non_http_device() {
        let loader = HttpLoader::default();
        let err = loader.load(&Device::new("cuda:0")).err().unwrap();
        assert!(matches!(err, BackendError::Start(_)));
    }

    #[test]
    fn test_prompt_selection() {
        let config = HttpConfig {
            query_prompt_name: Some("query".to_string()),
            ..Default::default()
        };
        let backend = HttpBackend::new("http://localhost:3000/", config).unwrap();
        assert_eq!(backend.prompt_name(InputKind::Query), Some("query"));
        assert_eq!(backend.prompt_name(InputKind::Passage), None);
        assert_eq!(backend.client.base_url(), "http://localhost:3000");
        assert_eq!(backend.max_batch_size(), Some(32));
    }
}
