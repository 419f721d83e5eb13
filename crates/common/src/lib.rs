//! Quarry Common Library
//!
//! Grounded question answering over a private document corpus:
//! - Tokenizer and overlapping chunker
//! - Embedding client and providers
//! - Per-owner retrieval with relevance stratification
//! - Context assembly and prompt construction with injection defense
//! - Breaker-guarded generation client
//! - Three-layer semantic cache
//! - Query orchestrator with a fallback ladder

pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod generation;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod retrieval;
pub mod tokenizer;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, ProviderError, Result};
pub use pipeline::{PipelineDeps, QueryPipeline, QueryResponse, ResponseMetadata, ResponseStatus};
pub use resilience::{CircuitBreaker, CircuitHealth, CircuitState};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
