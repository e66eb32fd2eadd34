//! Embedding gateway.
//!
//! Turns text into vectors by calling an external model server. The server
//! only depends on the [`EmbeddingGateway`] trait; [`OllamaGateway`] is the
//! production implementation.

use crate::config::EmbeddingSection;
use ember_vector::{validate_vector, VectorError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// Transport failure or non-success status from the model server.
    #[error("Embedding service unavailable: {0}")]
    Unavailable(String),

    /// The model returned a vector of the wrong length.
    #[error("Malformed embedding: expected {expected} dimensions, got {actual}")]
    Malformed { expected: usize, actual: usize },

    /// The model returned NaN or infinite components.
    #[error("Malformed embedding: {0}")]
    NonFinite(String),
}

/// Source of embedding vectors.
#[async_trait::async_trait]
pub trait EmbeddingGateway: Send + Sync {
    /// Embeds `text`. The result has the gateway's configured dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Calls Ollama's `/api/embeddings` endpoint.
pub struct OllamaGateway {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimensions: usize,
}

impl OllamaGateway {
    pub fn new(config: &EmbeddingSection, dimensions: usize) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::Unavailable(format!("Failed to build client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            dimensions,
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingGateway for OllamaGateway {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, model = %self.model, "Embedding request rejected");
            return Err(EmbeddingError::Unavailable(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Unavailable(format!("Invalid response body: {}", e)))?;

        check_dimensions(body.embedding, self.dimensions)
    }
}

/// Rejects vectors the engine would refuse: wrong length or non-finite values.
pub fn check_dimensions(vector: Vec<f32>, expected: usize) -> Result<Vec<f32>, EmbeddingError> {
    match validate_vector(expected, &vector) {
        Ok(()) => Ok(vector),
        Err(VectorError::DimensionMismatch { expected, actual }) => {
            Err(EmbeddingError::Malformed { expected, actual })
        }
        Err(e) => Err(EmbeddingError::NonFinite(e.to_string())),
    }
}
