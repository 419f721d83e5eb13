//! Redis-backed cache store

use super::CacheStore;
use crate::config::CacheSettings;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::debug;

/// Keys fetched per SCAN round trip during pattern deletes
const SCAN_BATCH: usize = 500;

/// Redis cache client
///
/// The multiplexed connection is cloned per operation, so no lock is held
/// while a command is in flight.
pub struct RedisStore {
    connection: MultiplexedConnection,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to the configured Redis instance
    pub async fn new(settings: &CacheSettings) -> Result<Self> {
        let client = Client::open(settings.url.as_str()).map_err(|e| AppError::CacheError {
            message: format!("Failed to create Redis client: {}", e),
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to connect to Redis: {}", e),
            })?;

        Ok(Self {
            connection,
            key_prefix: settings.key_prefix.clone(),
        })
    }

    /// Build a prefixed key
    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.key(key);
        let mut conn = self.connection.clone();

        let value: Option<String> = conn.get(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to get key '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, hit = value.is_some(), "Redis get");
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let full_key = self.key(key);
        let mut conn = self.connection.clone();

        conn.set_ex::<_, _, ()>(&full_key, value, ttl_secs)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Failed to set key '{}': {}", full_key, e),
            })?;

        debug!(key = %full_key, ttl_secs, "Redis set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.key(key);
        let mut conn = self.connection.clone();

        let deleted: i64 = conn.del(&full_key).await.map_err(|e| AppError::CacheError {
            message: format!("Failed to delete key '{}': {}", full_key, e),
        })?;

        debug!(key = %full_key, deleted = deleted > 0, "Redis delete");
        Ok(deleted > 0)
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let full_pattern = self.key(pattern);
        let mut conn = self.connection.clone();
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        // SCAN instead of KEYS so a large keyspace never blocks the server
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&full_pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(|e| AppError::CacheError {
                    message: format!("Failed to scan '{}': {}", full_pattern, e),
                })?;

            if !batch.is_empty() {
                let deleted: u64 = conn.del(&batch).await.map_err(|e| AppError::CacheError {
                    message: format!("Failed to delete keys for '{}': {}", full_pattern, e),
                })?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(pattern = %full_pattern, removed, "Redis pattern delete");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| AppError::CacheError {
                message: format!("Redis ping failed: {}", e),
            })?;
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
