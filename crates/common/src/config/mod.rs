//! Configuration management for Quarry services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Document store configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Cache backing store and per-layer TTLs
    #[serde(default)]
    pub cache: CacheSettings,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Generation (LLM) service configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Circuit breaker around the generation provider
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Token window allocation
    #[serde(default)]
    pub budget: BudgetConfig,

    /// Tokenizer and chunking configuration
    #[serde(default)]
    pub tokenizer: TokenizerConfig,

    /// Prompt construction limits
    #[serde(default)]
    pub prompt: PromptConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL. When unset, an in-memory document store is used.
    pub url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

/// Which cache backing store to use
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// Networked Redis instance
    Redis,
    /// In-process TTL map
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    /// Backing store selection
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,

    /// Redis URL (only used by the redis backend)
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Query-result (L1) TTL in seconds
    #[serde(default = "default_query_ttl")]
    pub query_ttl_secs: u64,

    /// Embedding (L2) TTL in seconds
    #[serde(default = "default_embedding_ttl")]
    pub embedding_ttl_secs: u64,

    /// Context (L3) TTL in seconds
    #[serde(default = "default_context_ttl")]
    pub context_ttl_secs: u64,

    /// Per-operation timeout in milliseconds
    #[serde(default = "default_cache_op_timeout")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, local
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Generation provider: openai, mock
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    /// Chat completions endpoint
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,

    /// API key
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_generation_timeout")]
    pub timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Retries after the first attempt (transient failures only)
    #[serde(default = "default_generation_retries")]
    pub max_retries: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_retry_base")]
    pub retry_base_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before tripping open
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds to stay open before allowing a trial call
    #[serde(default = "default_reset_timeout")]
    pub reset_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Results requested per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Upper bound accepted for top_k
    #[serde(default = "default_max_top_k")]
    pub max_top_k: usize,

    /// Similarity at or above which a chunk is a context candidate
    #[serde(default = "default_relevance_threshold")]
    pub relevance_threshold: f32,

    /// Document store timeout in milliseconds
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_ms: u64,
}

/// Fixed percentage split of the model window.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BudgetConfig {
    /// Total model window in tokens
    #[serde(default = "default_window")]
    pub window_tokens: usize,

    #[serde(default = "default_system_pct")]
    pub system_pct: u8,

    #[serde(default = "default_context_pct")]
    pub context_pct: u8,

    #[serde(default = "default_query_pct")]
    pub query_pct: u8,

    #[serde(default = "default_output_pct")]
    pub output_pct: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenizerConfig {
    /// tiktoken encoding name
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Chunk window size in tokens
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap between consecutive chunks in tokens
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PromptConfig {
    /// Raw queries longer than this are rejected outright
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    /// Passages quoted verbatim when generation is down; 0 skips straight to retry-after
    #[serde(default = "default_fallback_excerpts")]
    pub fallback_excerpts: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_cache_backend() -> CacheBackend { CacheBackend::Memory }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "quarry".to_string() }
fn default_query_ttl() -> u64 { 24 * 60 * 60 }
fn default_embedding_ttl() -> u64 { 7 * 24 * 60 * 60 }
fn default_context_ttl() -> u64 { 60 * 60 }
fn default_cache_op_timeout() -> u64 { 250 }
fn default_embedding_provider() -> String { "local".to_string() }
fn default_embedding_model() -> String { "all-MiniLM-L6-v2".to_string() }
fn default_embedding_dimension() -> usize { 384 }
fn default_embedding_timeout() -> u64 { 10 }
fn default_embedding_retries() -> u32 { 2 }
fn default_generation_provider() -> String { "mock".to_string() }
fn default_generation_endpoint() -> String { OPENAI_CHAT_URL.to_string() }
fn default_generation_model() -> String { "gpt-4o-mini".to_string() }
fn default_generation_timeout() -> u64 { 30 }
fn default_temperature() -> f32 { 0.2 }
fn default_top_p() -> f32 { 0.9 }
fn default_generation_retries() -> u32 { 2 }
fn default_retry_base() -> u64 { 200 }
fn default_failure_threshold() -> u32 { 5 }
fn default_reset_timeout() -> u64 { 60 }
fn default_top_k() -> usize { 50 }
fn default_max_top_k() -> usize { 200 }
fn default_relevance_threshold() -> f32 { 0.6 }
fn default_retrieval_timeout() -> u64 { 2_000 }
fn default_window() -> usize { 2048 }
fn default_system_pct() -> u8 { 15 }
fn default_context_pct() -> u8 { 58 }
fn default_query_pct() -> u8 { 10 }
fn default_output_pct() -> u8 { 17 }
fn default_encoding() -> String { "cl100k_base".to_string() }
fn default_chunk_size() -> usize { 384 }
fn default_chunk_overlap() -> usize { 64 }
fn default_max_query_chars() -> usize { 4_000 }
fn default_fallback_excerpts() -> usize { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "quarry".to_string() }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__RETRIEVAL__TOP_K=20
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        self.budget.validate()?;

        let retrieval = &self.retrieval;
        if !(0.0..=1.0).contains(&retrieval.relevance_threshold) {
            return Err(invalid("retrieval.relevance_threshold must be within [0, 1]"));
        }
        if retrieval.top_k == 0 || retrieval.top_k > retrieval.max_top_k {
            return Err(invalid("retrieval.top_k must be within [1, max_top_k]"));
        }
        if self.tokenizer.chunk_overlap >= self.tokenizer.chunk_size {
            return Err(invalid("tokenizer.chunk_overlap must be smaller than chunk_size"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be positive"));
        }
        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be positive"));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl BudgetConfig {
    /// Every stage needs a share, and the shares cannot overflow the window.
    pub fn validate(&self) -> Result<()> {
        let shares = [self.system_pct, self.context_pct, self.query_pct, self.output_pct];
        if shares.iter().any(|pct| *pct == 0) {
            return Err(invalid("budget percentages must all be positive"));
        }
        let total: u32 = shares.iter().map(|pct| u32::from(*pct)).sum();
        if total > 100 {
            return Err(invalid(&format!("budget percentages sum to {}%, above 100%", total)));
        }
        if self.window_tokens == 0 {
            return Err(invalid("budget.window_tokens must be positive"));
        }
        Ok(())
    }

    fn share(&self, pct: u8) -> usize {
        self.window_tokens * usize::from(pct) / 100
    }

    pub fn system_tokens(&self) -> usize {
        self.share(self.system_pct)
    }

    pub fn context_tokens(&self) -> usize {
        self.share(self.context_pct)
    }

    pub fn query_tokens(&self) -> usize {
        self.share(self.query_pct)
    }

    pub fn output_tokens(&self) -> usize {
        self.share(self.output_pct)
    }
}

fn invalid(message: &str) -> AppError {
    AppError::Configuration {
        message: message.to_string(),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            query_ttl_secs: default_query_ttl(),
            embedding_ttl_secs: default_embedding_ttl(),
            context_ttl_secs: default_context_ttl(),
            op_timeout_ms: default_cache_op_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            endpoint: default_generation_endpoint(),
            api_key: None,
            model: default_generation_model(),
            timeout_secs: default_generation_timeout(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_retries: default_generation_retries(),
            retry_base_ms: default_retry_base(),
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_top_k: default_max_top_k(),
            relevance_threshold: default_relevance_threshold(),
            timeout_ms: default_retrieval_timeout(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window_tokens: default_window(),
            system_pct: default_system_pct(),
            context_pct: default_context_pct(),
            query_pct: default_query_pct(),
            output_pct: default_output_pct(),
        }
    }
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_query_chars: default_max_query_chars(),
            fallback_excerpts: default_fallback_excerpts(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheSettings::default(),
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            retrieval: RetrievalConfig::default(),
            budget: BudgetConfig::default(),
            tokenizer: TokenizerConfig::default(),
            prompt: PromptConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.retrieval.top_k, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_budget_split() {
        let budget = BudgetConfig::default();
        assert_eq!(budget.context_tokens(), 1187);
        let total = budget.system_tokens()
            + budget.context_tokens()
            + budget.query_tokens()
            + budget.output_tokens();
        assert!(total <= budget.window_tokens);
    }

    #[test]
    fn test_budget_rejects_overflowing_split() {
        let budget = BudgetConfig {
            context_pct: 70,
            ..BudgetConfig::default()
        };
        assert!(budget.validate().is_err());

        let budget = BudgetConfig {
            query_pct: 0,
            ..BudgetConfig::default()
        };
        assert!(budget.validate().is_err());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let mut config = AppConfig::default();
        config.tokenizer.chunk_overlap = config.tokenizer.chunk_size;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_ttls_are_layered() {
        let cache = CacheSettings::default();
        assert!(cache.embedding_ttl_secs > cache.query_ttl_secs);
        assert!(cache.query_ttl_secs > cache.context_ttl_secs);
    }
}
