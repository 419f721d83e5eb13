//! Quarry API Gateway
//!
//! Thin HTTP surface over the query pipeline.
//! Handles:
//! - Request routing
//! - Rate limiting
//! - Observability (logging, metrics)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use quarry_common::{
    cache,
    config::{AppConfig, ObservabilityConfig},
    db::{DbPool, DocumentStore, InMemoryDocumentStore, PgDocumentStore},
    embeddings, generation,
    metrics::{self, EMBEDDING_BUCKETS, METRICS_PREFIX, QUERY_BUCKETS},
    CircuitBreaker, PipelineDeps, QueryPipeline,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use middleware::rate_limit::{create_rate_limiter, rate_limit_middleware};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<QueryPipeline>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability);
    info!("Starting Quarry API Gateway v{}", quarry_common::VERSION);

    config.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;
    let config = Arc::new(config);

    // Initialize metrics
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_query_duration_seconds", METRICS_PREFIX)),
            QUERY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_embedding_duration_seconds", METRICS_PREFIX)),
            EMBEDDING_BUCKETS,
        )?
        .install()
        .context("failed to install Prometheus exporter")?;
    metrics::register_metrics();
    info!(%metrics_addr, "Metrics exporter listening");

    let pipeline = build_pipeline(&config).await?;

    // Create app state
    let state = AppState {
        config: config.clone(),
        pipeline: Arc::new(pipeline),
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wire the pipeline's backends from configuration
async fn build_pipeline(config: &AppConfig) -> anyhow::Result<QueryPipeline> {
    let store: Arc<dyn DocumentStore> = match &config.database.url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = DbPool::new(url, &config.database).await?;
            Arc::new(PgDocumentStore::new(pool))
        }
        None => {
            warn!("No database configured, serving from an empty in-memory document store");
            Arc::new(InMemoryDocumentStore::new())
        }
    };

    let deps = PipelineDeps {
        store,
        cache_store: cache::create_store(&config.cache).await,
        embedder: embeddings::create_embedder(&config.embedding)?,
        generator: generation::create_generation_provider(&config.generation)?,
        breaker: Arc::new(CircuitBreaker::new("generation", &config.circuit_breaker)),
    };

    Ok(QueryPipeline::new(config, deps)?)
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Health endpoints are never rate limited
    let health_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/health/circuit", get(handlers::health::circuit));

    let mut api_routes = Router::new()
        .route("/query", post(handlers::query::answer_query))
        .route(
            "/owners/{owner_id}/documents/changed",
            post(handlers::query::documents_changed),
        );

    let rate_limit = &state.config.rate_limit;
    if rate_limit.enabled {
        let limiter = create_rate_limiter(rate_limit.requests_per_second, rate_limit.burst);
        api_routes = api_routes.layer(axum::middleware::from_fn(
            move |request: axum::extract::Request, next: axum::middleware::Next| {
                rate_limit_middleware(request, next, limiter.clone())
            },
        ));
    }

    // Compose the app
    Router::new()
        .nest("/v2", api_routes.merge(health_routes))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
