//! Embedding service abstraction
//!
//! Provides a unified interface for embedding providers:
//! - OpenAI-compatible HTTP APIs (text-embedding-3-small at 384 dimensions)
//! - A deterministic local hashing embedder for offline use
//!
//! [`EmbeddingClient`] wraps a provider with a timeout, output validation
//! and metrics; the pipeline only talks to the client.

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, ProviderError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// OpenAI-compatible embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: Vec<&'a str>,
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_retries: config.max_retries,
        })
    }

    /// Only the v3 models accept a reduced output width
    fn requested_dimensions(&self) -> Option<usize> {
        self.model
            .starts_with("text-embedding-3")
            .then_some(self.dimension)
    }

    /// Make request with retry on transient failures
    async fn request_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self.make_request(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %e,
                        "Embedding request failed, retrying"
                    );
                    // Exponential backoff
                    let delay = Duration::from_millis(100 * 2_u64.pow(attempt));
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(AppError::EmbeddingError {
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn make_request(&self, text: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let url = format!("{}/embeddings", self.base_url);

        let request = OpenAIRequest {
            input: vec![text],
            model: &self.model,
            dimensions: self.requested_dimensions(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let result: OpenAIResponse =
            response
                .json()
                .await
                .map_err(|e| ProviderError::MalformedResponse {
                    message: format!("Failed to parse embedding response: {}", e),
                })?;

        result
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| ProviderError::MalformedResponse {
                message: "Empty embedding response".to_string(),
            })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request_with_retry(text).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase word and each word bigram is hashed into a signed bucket;
/// the result is L2-normalized. Texts sharing vocabulary land close together,
/// which is enough for offline runs and local development.
pub struct HashingEmbedder {
    dimension: usize,
    model: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model: format!("local-hashing-{}", dimension),
        }
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let value = u64::from_le_bytes(raw);
        let index = (value % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimension];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            let (i, sign) = self.bucket(word);
            vector[i] += sign;
        }
        for pair in words.windows(2) {
            let (i, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            vector[i] += 0.5 * sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vectorize(text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "embedding.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAIEmbedder::new(config, key)?))
        }
        "local" => Ok(Arc::new(HashingEmbedder::new(config.dimension))),
        other => {
            warn!(provider = other, "Unknown embedding provider, using local hashing");
            Ok(Arc::new(HashingEmbedder::new(config.dimension)))
        }
    }
}

/// Embedding front door used by the pipeline.
///
/// Bounds each call with a timeout and rejects vectors of the wrong width
/// or with non-finite components before they reach retrieval or the cache.
#[derive(Clone)]
pub struct EmbeddingClient {
    embedder: Arc<dyn Embedder>,
    dimension: usize,
    timeout: Duration,
}

impl EmbeddingClient {
    pub fn new(embedder: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            embedder,
            dimension: config.dimension,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn model_name(&self) -> &str {
        self.embedder.model_name()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[instrument(skip(self, text), fields(model = %self.embedder.model_name(), len = text.len()))]
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = Instant::now();
        let outcome = match tokio::time::timeout(self.timeout, self.embedder.embed(text)).await {
            Ok(result) => result.and_then(|v| self.validate(v)),
            Err(_) => Err(AppError::EmbeddingTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        metrics::record_embedding(
            start.elapsed().as_secs_f64(),
            self.embedder.model_name(),
            outcome.is_ok(),
        );
        if let Err(e) = &outcome {
            warn!(error = %e, "Embedding failed");
        } else {
            debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Embedded query");
        }
        outcome
    }

    fn validate(&self, embedding: Vec<f32>) -> Result<Vec<f32>> {
        // Provider output, so a wrong width is an upstream fault rather than a bad request
        if embedding.len() != self.dimension {
            return Err(AppError::EmbeddingError {
                message: format!(
                    "provider returned {} dimensions, expected {}",
                    embedding.len(),
                    self.dimension
                ),
            });
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(AppError::EmbeddingError {
                message: "embedding contains non-finite values".to_string(),
            });
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dimension(&self) -> usize {
            self.0.len()
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(vec![0.0; 384])
        }
        fn model_name(&self) -> &str {
            "slow"
        }
        fn dimension(&self) -> usize {
            384
        }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_hashing_embedder_is_deterministic() {
        let embedder = HashingEmbedder::new(384);
        let a = embedder.embed("What is grace?").await.unwrap();
        let b = embedder.embed("What is grace?").await.unwrap();
        assert_eq!(a.len(), 384);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_hashing_embedder_similarity() {
        let embedder = HashingEmbedder::new(384);
        let q = embedder.embed("tokio runtime scheduling").await.unwrap();
        let near = embedder.embed("The tokio runtime uses work stealing scheduling").await.unwrap();
        let far = embedder.embed("Baking sourdough requires patience").await.unwrap();
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[tokio::test]
    async fn test_empty_text_embeds_to_zero_vector() {
        let embedder = HashingEmbedder::new(8);
        assert_eq!(embedder.embed("").await.unwrap(), vec![0.0; 8]);
    }

    #[tokio::test]
    async fn test_client_rejects_wrong_dimension() {
        let config = EmbeddingConfig::default();
        let client = EmbeddingClient::new(Arc::new(FixedEmbedder(vec![1.0; 3])), &config);
        let err = client.embed("x").await.unwrap_err();
        assert!(matches!(err, AppError::EmbeddingError { .. }));
        assert!(err.is_server_error());
    }

    #[tokio::test]
    async fn test_client_rejects_non_finite() {
        let mut v = vec![0.1; 384];
        v[7] = f32::NAN;
        let client = EmbeddingClient::new(Arc::new(FixedEmbedder(v)), &EmbeddingConfig::default());
        assert!(matches!(client.embed("x").await, Err(AppError::EmbeddingError { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_times_out() {
        let client = EmbeddingClient::new(Arc::new(SlowEmbedder), &EmbeddingConfig::default());
        assert!(matches!(client.embed("x").await, Err(AppError::EmbeddingTimeout { .. })));
    }

    #[test]
    fn test_openai_requires_key() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            api_key: None,
            ..EmbeddingConfig::default()
        };
        assert!(matches!(create_embedder(&config), Err(AppError::Configuration { .. })));
    }

    #[test]
    fn test_v3_models_request_reduced_width() {
        let config = EmbeddingConfig {
            model: "text-embedding-3-small".to_string(),
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAIEmbedder::new(&config, "key".to_string()).unwrap();
        assert_eq!(embedder.requested_dimensions(), Some(384));
    }
}
