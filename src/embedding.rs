//! The Embedding Client (C6): batched and single text→vector calls against
//! an external HTTP endpoint accepting `{model, input}`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::CoreError;

const SINGLE_TIMEOUT: Duration = Duration::from_secs(30);
const BATCH_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(12);

#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedDatum>,
}

#[derive(Deserialize)]
struct EmbedDatum {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(cfg: &EmbeddingConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(EmbeddingClient {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            dimension: cfg.dimension,
        })
    }

    /// `Embed(text) -> Vector`.
    pub async fn embed(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>, CoreError> {
        let vectors = self
            .embed_batch_with_timeout(std::slice::from_ref(&text.to_string()), SINGLE_TIMEOUT, cancel)
            .await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::BackendUnavailable("embedding backend returned no vectors".into()))
    }

    /// `EmbedBatch(texts) -> [Vector]`, preserving input order.
    pub async fn embed_batch(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, CoreError> {
        self.embed_batch_with_timeout(texts, BATCH_TIMEOUT, cancel).await
    }

    async fn embed_batch_with_timeout(
        &self,
        texts: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, CoreError> {
        let trimmed: Vec<String> = texts.iter().map(|t| t.trim().to_string()).collect();

        let mut attempt = 0;
        loop {
            let call = self.call_once(&trimmed, timeout);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                result = call => result,
            };

            match outcome {
                Ok(vectors) => {
                    for v in &vectors {
                        if v.len() != self.dimension {
                            return Err(CoreError::DimensionMismatch {
                                expected: self.dimension,
                                actual: v.len(),
                            });
                        }
                    }
                    return Ok(vectors);
                }
                Err(RetryableError::Transient(msg)) => {
                    attempt += 1;
                    if attempt >= MAX_RETRIES {
                        return Err(CoreError::TransientEmbeddingFailure(msg));
                    }
                    warn!(attempt, %msg, "embedding backend transient failure, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    }
                }
                Err(RetryableError::Fatal(msg)) => {
                    return Err(CoreError::BackendUnavailable(msg));
                }
            }
        }
    }

    async fn call_once(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f32>>, RetryableError> {
        let body = EmbedRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    RetryableError::Transient(e.to_string())
                } else {
                    RetryableError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(RetryableError::Transient(format!("backend status {}", status)));
        }
        if status.is_client_error() {
            let text = response.text().await.unwrap_or_default();
            return Err(RetryableError::Fatal(format!("backend status {}: {}", status, text)));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| RetryableError::Transient(format!("invalid response body: {}", e)))?;

        if parsed.data.is_empty() {
            return Err(RetryableError::Transient("empty embedding data".into()));
        }
        if parsed.data.len() != texts.len() {
            return Err(RetryableError::Transient(format!(
                "expected {} vectors, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    /// `IsAvailable() -> bool`: probes a lightweight `GET /models`-equivalent
    /// endpoint.
    pub async fn is_available(&self) -> bool {
        let result = self
            .http
            .get(format!("{}/models", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "embedding backend unavailable");
                false
            }
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

enum RetryableError {
    Transient(String),
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_whitespace_before_sending() {
        let raw = vec!["  hello\n".to_string(), "world\t".to_string()];
        let trimmed: Vec<String> = raw.iter().map(|t| t.trim().to_string()).collect();
        assert_eq!(trimmed, vec!["hello".to_string(), "world".to_string()]);
    }
}
