//! Model Gateway (C4): typed calls to remote embedding and
//! vision-language endpoints with retry/timeout, following the reference
//! workspace's pattern of a trait-based backend plus an HTTP
//! implementation and a deterministic mock used by tests.

use async_trait::async_trait;
use kb_error::{ErrorCode, KbError};
use kb_retry::{RetryOutcome, RetryPolicy, TimeoutConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::instrument;

pub const EMBED_BATCH_CAP: usize = 32;
pub const EMBED_DIMENSION: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    Timeout,
    Transport,
    BadResponse,
    RateLimited,
}

#[derive(Debug, Error)]
#[error("model call failed ({kind:?}): {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        ModelError {
            kind,
            message: message.into(),
        }
    }

    fn retry_outcome(&self) -> RetryOutcome {
        match self.kind {
            ModelErrorKind::Timeout | ModelErrorKind::Transport | ModelErrorKind::RateLimited => {
                RetryOutcome::Retryable
            }
            ModelErrorKind::BadResponse => RetryOutcome::NonRetryable,
        }
    }
}

impl From<ModelError> for KbError {
    fn from(err: ModelError) -> Self {
        let code = match err.kind {
            ModelErrorKind::Timeout => ErrorCode::Timeout,
            ModelErrorKind::Transport => ErrorCode::Transport,
            ModelErrorKind::RateLimited => ErrorCode::RateLimited,
            ModelErrorKind::BadResponse => ErrorCode::BadResponse,
        };
        KbError::new(code, err.message)
    }
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;

    /// Batch size capped at [`EMBED_BATCH_CAP`] per call; implementors
    /// may split a larger request internally.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmCorrection {
    pub corrected_text: String,
    pub confidence: f32,
}

#[async_trait]
pub trait VlmClient: Send + Sync {
    async fn correct(&self, image_bytes: &[u8], prompt: &str) -> Result<VlmCorrection, ModelError>;
}

/// Production gateway, implementing both traits over `reqwest` with
/// per-call timeouts (30s embed / 120s vlm) and jittered retry.
pub struct HttpModelGateway {
    client: reqwest::Client,
    embed_url: String,
    vlm_url: String,
    retry_policy: RetryPolicy,
}

impl HttpModelGateway {
    pub fn new(embed_url: impl Into<String>, vlm_url: impl Into<String>) -> Self {
        HttpModelGateway {
            client: reqwest::Client::new(),
            embed_url: embed_url.into(),
            vlm_url: vlm_url.into(),
            retry_policy: RetryPolicy::default(),
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> ModelError {
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ModelError::new(ModelErrorKind::RateLimited, "rate limited by model endpoint")
        } else if status.is_server_error() {
            ModelError::new(ModelErrorKind::Transport, format!("server error: {status}"))
        } else {
            ModelError::new(ModelErrorKind::BadResponse, format!("unexpected status: {status}"))
        }
    }
}

#[derive(Serialize)]
struct EmbedBatchRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct EmbedBatchResponse {
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct VlmRequest<'a> {
    image_base64: String,
    prompt: &'a str,
}

#[async_trait]
impl EmbeddingClient for HttpModelGateway {
    #[instrument(level = "debug", skip(self, text))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let vectors = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::new(ModelErrorKind::BadResponse, "embedding service returned no vectors"))
    }

    #[instrument(level = "debug", skip(self, texts), fields(batch_len = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut all = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_CAP) {
            let batch_vec = batch.to_vec();
            let vectors = kb_retry::retry(
                &self.retry_policy,
                || {
                    let batch_vec = batch_vec.clone();
                    async move {
                        kb_retry::with_timeout(
                            TimeoutConfig::EMBED,
                            self.call_embed(&batch_vec),
                            || ModelError::new(ModelErrorKind::Timeout, "embed call timed out"),
                        )
                        .await
                    }
                },
                |e: &ModelError| e.retry_outcome(),
            )
            .await?;
            all.extend(vectors);
        }
        Ok(all)
    }
}

impl HttpModelGateway {
    async fn call_embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let resp = self
            .client
            .post(&self.embed_url)
            .json(&EmbedBatchRequest { texts: batch })
            .send()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::Transport, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        let parsed: EmbedBatchResponse = resp
            .json()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::BadResponse, e.to_string()))?;
        Ok(parsed.vectors)
    }
}

#[async_trait]
impl VlmClient for HttpModelGateway {
    #[instrument(level = "debug", skip(self, image_bytes, prompt))]
    async fn correct(&self, image_bytes: &[u8], prompt: &str) -> Result<VlmCorrection, ModelError> {
        kb_retry::retry(
            &self.retry_policy,
            || {
                kb_retry::with_timeout(
                    TimeoutConfig::VLM,
                    self.call_vlm(image_bytes, prompt),
                    || ModelError::new(ModelErrorKind::Timeout, "vlm call timed out"),
                )
            },
            |e: &ModelError| e.retry_outcome(),
        )
        .await
    }
}

impl HttpModelGateway {
    async fn call_vlm(&self, image_bytes: &[u8], prompt: &str) -> Result<VlmCorrection, ModelError> {
        use base64::Engine;
        let image_base64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let resp = self
            .client
            .post(&self.vlm_url)
            .json(&VlmRequest { image_base64, prompt })
            .send()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::Transport, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify_status(resp.status()));
        }
        resp.json()
            .await
            .map_err(|e| ModelError::new(ModelErrorKind::BadResponse, e.to_string()))
    }
}

/// Deterministic, hash-based mock used by pipeline and search tests so
/// assertions don't depend on a live model endpoint.
pub struct MockModelGateway;

#[async_trait]
impl EmbeddingClient for MockModelGateway {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        Ok(deterministic_vector(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        Ok(texts.iter().map(|t| deterministic_vector(t)).collect())
    }
}

#[async_trait]
impl VlmClient for MockModelGateway {
    async fn correct(&self, _image_bytes: &[u8], _prompt: &str) -> Result<VlmCorrection, ModelError> {
        Ok(VlmCorrection {
            corrected_text: String::new(),
            confidence: 1.0,
        })
    }
}

fn deterministic_vector(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest
        .iter()
        .take(EMBED_DIMENSION)
        .map(|b| (*b as f32) / 255.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_gateway_is_deterministic() {
        let gw = MockModelGateway;
        let a = gw.embed("reset procedure").await.unwrap();
        let b = gw.embed("reset procedure").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBED_DIMENSION);
    }

    #[tokio::test]
    async fn mock_gateway_batches_match_individual_calls() {
        let gw = MockModelGateway;
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let batch = gw.embed_batch(&texts).await.unwrap();
        let alpha = gw.embed("alpha").await.unwrap();
        assert_eq!(batch[0], alpha);
    }
}
