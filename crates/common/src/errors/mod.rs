//! Error types for Quarry services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//! - Provider failure classification for the circuit breaker

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    QueryTooLong,
    InvalidOwner,
    DimensionMismatch,

    // Retrieval errors (4xxx)
    RetrievalError,
    RetrievalTimeout,

    // Budget errors (5xxx)
    BudgetExceeded,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    UpstreamError,
    EmbeddingError,
    EmbeddingTimeout,
    CircuitBreakerOpen,
    GenerationUnavailable,
    CacheError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::QueryTooLong => 1002,
            ErrorCode::InvalidOwner => 1003,
            ErrorCode::DimensionMismatch => 1004,

            ErrorCode::RetrievalError => 4001,
            ErrorCode::RetrievalTimeout => 4002,

            ErrorCode::BudgetExceeded => 5001,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            ErrorCode::UpstreamError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::EmbeddingTimeout => 8003,
            ErrorCode::CircuitBreakerOpen => 8004,
            ErrorCode::GenerationUnavailable => 8005,
            ErrorCode::CacheError => 8006,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Query too long: {length} characters exceeds limit of {limit}")]
    QueryTooLong { length: usize, limit: usize },

    #[error("Invalid owner id: {owner_id}")]
    InvalidOwner { owner_id: i64 },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // Retrieval errors
    #[error("Retrieval failed: {message}")]
    Retrieval { message: String },

    #[error("Retrieval timeout after {timeout_ms}ms")]
    RetrievalTimeout { timeout_ms: u64 },

    // Budget errors
    #[error("Token budget exceeded: {required} tokens required, window is {window}")]
    BudgetExceeded { required: usize, window: usize },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("Embedding timeout after {timeout_ms}ms")]
    EmbeddingTimeout { timeout_ms: u64 },

    #[error("Circuit breaker open for service: {service}")]
    CircuitBreakerOpen { service: String },

    #[error("Generation unavailable: {source}")]
    GenerationUnavailable {
        #[source]
        source: ProviderError,
    },

    #[error("Cache error: {message}")]
    CacheError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::QueryTooLong { .. } => ErrorCode::QueryTooLong,
            AppError::InvalidOwner { .. } => ErrorCode::InvalidOwner,
            AppError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            AppError::Retrieval { .. } => ErrorCode::RetrievalError,
            AppError::RetrievalTimeout { .. } => ErrorCode::RetrievalTimeout,
            AppError::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::EmbeddingTimeout { .. } => ErrorCode::EmbeddingTimeout,
            AppError::CircuitBreakerOpen { .. } => ErrorCode::CircuitBreakerOpen,
            AppError::GenerationUnavailable { .. } => ErrorCode::GenerationUnavailable,
            AppError::CacheError { .. } => ErrorCode::CacheError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::InvalidOwner { .. }
            | AppError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,

            // 413 Payload Too Large
            AppError::QueryTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 500 Internal Server Error
            AppError::Retrieval { .. }
            | AppError::BudgetExceeded { .. }
            | AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::EmbeddingError { .. } | AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::RetrievalTimeout { .. } | AppError::EmbeddingTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }

            // 503 Service Unavailable
            AppError::CircuitBreakerOpen { .. }
            | AppError::GenerationUnavailable { .. }
            | AppError::CacheError { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Message safe to show to callers.
    ///
    /// Upstream and internal failures may carry provider bodies or prompt fragments,
    /// so only client errors expose their full text.
    pub fn public_message(&self) -> String {
        match self {
            AppError::EmbeddingError { .. }
            | AppError::HttpClient(_)
            | AppError::GenerationUnavailable { .. } => {
                "An upstream model service failed to respond".to_string()
            }
            AppError::CircuitBreakerOpen { .. } => {
                "The answer service is temporarily unavailable".to_string()
            }
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Retrieval { .. } => "Document retrieval failed".to_string(),
            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::BudgetExceeded { .. }
            | AppError::Other(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Failure raised by an external model provider.
///
/// Classification lives here so every provider shares one boundary:
/// transient failures are retried, and only provider-side failures
/// count toward the circuit breaker.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider transport error: {message}")]
    Transport { message: String },

    #[error("Rate limited by provider")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Provider returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    #[error("Invalid provider request: {message}")]
    InvalidRequest { message: String },

    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String },
}

impl ProviderError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout { .. }
                | ProviderError::Transport { .. }
                | ProviderError::RateLimited { .. }
        ) || matches!(self, ProviderError::Upstream { status, .. } if *status >= 500)
    }

    /// Whether this failure should move the circuit breaker toward open.
    ///
    /// Caller bugs (bad arguments) and breaker rejections never count.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            ProviderError::InvalidRequest { .. } | ProviderError::CircuitOpen { .. }
        )
    }

    /// Map an HTTP status from a provider into a classified error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            429 => ProviderError::RateLimited {
                retry_after_secs: None,
            },
            408 => ProviderError::Transport {
                message: format!("status {}: {}", status, message.into()),
            },
            // Bad key, revoked access or wrong model: the provider is unusable
            401 | 403 | 404 => ProviderError::Upstream {
                status,
                message: message.into(),
            },
            400..=499 => ProviderError::InvalidRequest {
                message: format!("status {}: {}", status, message.into()),
            },
            _ => ProviderError::Upstream {
                status,
                message: message.into(),
            },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout { timeout_ms: 0 }
        } else if err.is_decode() {
            ProviderError::MalformedResponse {
                message: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), err.to_string())
        } else {
            ProviderError::Transport {
                message: err.to_string(),
            }
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::CircuitOpen { service } => AppError::CircuitBreakerOpen { service },
            other => AppError::GenerationUnavailable { source: other },
        }
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        // Log based on severity; the full text stays in the logs
        if self.is_server_error() {
            tracing::error!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %self,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message: self.public_message(),
                details: None,
                request_id: None, // Should be filled by middleware
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<sea_orm::TryGetError> for AppError {
    fn from(err: sea_orm::TryGetError) -> Self {
        AppError::Database(err.into())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::CacheError {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
