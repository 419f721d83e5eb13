//! Generation client
//!
//! The single failure-classification boundary in front of the LLM provider.
//! Each call goes through the circuit breaker once. Inside it, every attempt
//! gets a per-call timeout and transient failures a small bounded retry.

mod mock;
mod openai;

pub use mock::MockGenerationProvider;
pub use openai::OpenAiChatProvider;

use crate::config::GenerationConfig;
use crate::context::PromptPayload;
use crate::errors::{AppError, ProviderError, Result};
use crate::metrics;
use crate::resilience::CircuitBreaker;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// One completion call
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl From<&PromptPayload> for GenerationRequest {
    fn from(payload: &PromptPayload) -> Self {
        Self {
            system: payload.system.clone(),
            user: payload.user.clone(),
            max_tokens: payload.max_output_tokens,
            temperature: payload.temperature,
            top_p: payload.top_p,
        }
    }
}

/// LLM completion backend
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn complete(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<String, ProviderError>;

    fn name(&self) -> &str;
}

/// Create a generation provider based on configuration
pub fn create_generation_provider(
    config: &GenerationConfig,
) -> Result<Arc<dyn GenerationProvider>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "generation.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAiChatProvider::new(config, key)?))
        }
        "mock" => Ok(Arc::new(MockGenerationProvider)),
        other => {
            warn!(provider = other, "Unknown generation provider, using mock");
            Ok(Arc::new(MockGenerationProvider))
        }
    }
}

/// Breaker-guarded, retrying front door to a [`GenerationProvider`]
#[derive(Clone)]
pub struct GenerationClient {
    provider: Arc<dyn GenerationProvider>,
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
}

impl GenerationClient {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        breaker: Arc<CircuitBreaker>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            provider,
            breaker,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Complete `request`. Circuit-open rejections are returned at once.
    ///
    /// The breaker sees one outcome per call, after retries are exhausted.
    #[instrument(
        skip_all,
        fields(provider = %self.provider.name(), max_tokens = request.max_tokens)
    )]
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<String, ProviderError> {
        if request.system.trim().is_empty() || request.user.trim().is_empty() {
            return Err(ProviderError::InvalidRequest {
                message: "prompt must not be empty".to_string(),
            });
        }

        let result = self.breaker.call(|| self.with_retry(request)).await;
        if let Err(ProviderError::CircuitOpen { .. }) = &result {
            metrics::record_generation_rejected(self.provider.name());
        }
        result
    }

    async fn with_retry(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<String, ProviderError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry_base)
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let attempts = &attempts;
        let max_retries = self.max_retries;

        retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            match self.attempt(request).await {
                Ok(text) => Ok(text),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        error = %e,
                        "Generation failed, retrying"
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn attempt(
        &self,
        request: &GenerationRequest,
    ) -> std::result::Result<String, ProviderError> {
        let start = Instant::now();
        let call = self.provider.complete(request);
        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) if e.is_transient() => "transient_error",
            Err(_) => "error",
        };
        let elapsed = start.elapsed();
        metrics::record_generation(elapsed.as_secs_f64(), self.provider.name(), outcome);
        debug!(outcome, elapsed_ms = elapsed.as_millis() as u64, "Generation attempt finished");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationConfig;
    use crate::resilience::CircuitState;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tokio_test::{assert_err, assert_ok};

    /// Replays scripted outcomes, then succeeds
    struct Scripted {
        outcomes: Mutex<VecDeque<ProviderError>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outcomes: Vec<ProviderError>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationProvider for Scripted {
        async fn complete(
            &self,
            _request: &GenerationRequest,
        ) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.lock().unwrap().pop_front() {
                Some(e) => Err(e),
                None => Ok("answer".to_string()),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Hanging;

    #[async_trait]
    impl GenerationProvider for Hanging {
        async fn complete(
            &self,
            _request: &GenerationRequest,
        ) -> std::result::Result<String, ProviderError> {
            futures::future::pending().await
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            system: "system".to_string(),
            user: "user".to_string(),
            max_tokens: 100,
            temperature: 0.2,
            top_p: 0.9,
        }
    }

    fn client(provider: Arc<dyn GenerationProvider>) -> GenerationClient {
        let config = GenerationConfig::default();
        let breaker = Arc::new(CircuitBreaker::with_timeout(
            "generation",
            5,
            Duration::from_secs(60),
        ));
        GenerationClient::new(provider, breaker, &config)
    }

    fn transport() -> ProviderError {
        ProviderError::Transport {
            message: "reset".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let busy = ProviderError::Upstream {
            status: 503,
            message: "busy".into(),
        };
        let provider = Scripted::new(vec![transport(), busy]);
        let client = client(provider.clone());
        assert_eq!(assert_ok!(client.generate(&request()).await), "answer");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let provider = Scripted::new(vec![transport(); 10]);
        let client = client(provider.clone());
        assert_err!(client.generate(&request()).await);
        // One call plus two retries, recorded by the breaker as one failure
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.breaker().health().failure_count, 1);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_counts_calls_not_attempts() {
        let provider = Scripted::new(vec![transport(); 12]);
        let client = client(provider.clone());
        for _ in 0..4 {
            assert_err!(client.generate(&request()).await);
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 12);
        assert_eq!(client.breaker().health().failure_count, 4);
        assert_eq!(client.breaker().state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_are_not_retried_or_counted() {
        let provider = Scripted::new(vec![ProviderError::InvalidRequest {
            message: "bad".into(),
        }]);
        let client = client(provider.clone());
        assert!(matches!(
            client.generate(&request()).await,
            Err(ProviderError::InvalidRequest { .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.breaker().health().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_credentials_open_the_circuit() {
        let provider = Scripted::new(vec![ProviderError::from_status(401, "invalid api key"); 10]);
        let client = client(provider.clone());
        for _ in 0..5 {
            let err = assert_err!(client.generate(&request()).await);
            assert!(matches!(err, ProviderError::Upstream { status: 401, .. }));
        }
        // Not retried, and counted once per call
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
        assert_eq!(client.breaker().state(), CircuitState::Open);

        let err = assert_err!(client.generate(&request()).await);
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_not_retried() {
        let provider = Scripted::new(vec![transport(); 20]);
        let client = client(provider.clone());
        for _ in 0..5 {
            let err = assert_err!(client.generate(&request()).await);
            assert!(matches!(err, ProviderError::Transport { .. }));
        }
        assert_eq!(client.breaker().state(), CircuitState::Open);
        let before = provider.calls.load(Ordering::SeqCst);

        let err = assert_err!(client.generate(&request()).await);
        assert!(matches!(err, ProviderError::CircuitOpen { .. }));
        assert_eq!(provider.calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let client = client(Arc::new(Hanging));
        let err = assert_err!(client.generate(&request()).await);
        assert!(matches!(err, ProviderError::Timeout { .. }));
        assert_eq!(client.breaker().health().failure_count, 1);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_locally() {
        let provider = Scripted::new(vec![]);
        let client = client(provider.clone());
        let mut empty = request();
        empty.user = "  ".to_string();
        assert!(matches!(
            client.generate(&empty).await,
            Err(ProviderError::InvalidRequest { .. })
        ));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
