//! Health check handlers

use axum::{extract::State, Json};
use serde::Serialize;

use crate::AppState;
use quarry_common::{cache::SemanticCacheStats, CircuitHealth, CircuitState};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub document_store: CheckResult,
    pub cache: CacheCheck,
    pub generation: CircuitHealth,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
}

#[derive(Serialize)]
pub struct CacheCheck {
    pub status: String,
    #[serde(flatten)]
    pub stats: SemanticCacheStats,
}

fn up_down(ok: bool) -> String {
    let status = if ok { "up" } else { "down" };
    status.to_string()
}

/// Dependency health. An open circuit or an unreachable cache degrades
/// the service without taking it down; only the document store is fatal.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let report = state.pipeline.health().await;

    let status = if !report.store_ok {
        "unhealthy"
    } else if !report.cache_ok || report.circuit.state != CircuitState::Closed {
        "degraded"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: quarry_common::VERSION,
        checks: HealthChecks {
            document_store: CheckResult {
                status: up_down(report.store_ok),
            },
            cache: CacheCheck {
                status: up_down(report.cache_ok),
                stats: report.cache,
            },
            generation: report.circuit,
        },
    })
}

/// Circuit breaker snapshot for the generation dependency
pub async fn circuit(State(state): State<AppState>) -> Json<CircuitHealth> {
    Json(state.pipeline.circuit_health())
}
