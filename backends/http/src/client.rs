use crate::{ClientError, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::instrument;

/// Client for the `/embed` and `/health` routes of a text-embeddings-inference server
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    normalize: bool,
    truncate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_name: Option<&'a str>,
}

impl Client {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ClientError::Inference(format!(
                "health check returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Embeddings are requested unnormalized so that `dot` scoring sees raw model outputs
    #[instrument(skip_all, fields(inputs = inputs.len()))]
    pub async fn embed(
        &self,
        inputs: &[String],
        prompt_name: Option<&str>,
    ) -> Result<Vec<Vec<f32>>> {
        let request = EmbedRequest {
            inputs,
            normalize: false,
            truncate: true,
            prompt_name,
        };

        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Inference(format!("{status}: {body}")));
        }

        let embeddings: Vec<Vec<f32>> = response.json().await?;
        Ok(embeddings)
    }
}
