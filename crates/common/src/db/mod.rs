//! Document store access
//!
//! Provides:
//! - Passage chunk model
//! - `DocumentStore` trait consumed by retrieval
//! - PostgreSQL (SeaORM raw statements) and in-memory implementations
//! - Connection pool management

mod models;
mod store;

pub use models::{DocumentMetadata, PassageChunk};
pub use store::{DocumentStore, InMemoryDocumentStore, PgDocumentStore};

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    connection: DatabaseConnection,
}

impl DbPool {
    /// Connect using the configured URL
    pub async fn new(url: &str, config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to document database...");

        let mut opts = ConnectOptions::new(url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let connection = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");
        Ok(Self { connection })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.connection
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.connection
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }
}
