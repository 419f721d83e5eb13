//! Cache backing stores and the three-layer semantic cache
//!
//! Provides:
//! - `CacheStore` capability trait (get / set-with-ttl / delete / delete-by-pattern)
//! - Redis and in-process implementations selected by configuration
//! - Query normalization and key builders
//! - `SemanticCache` with query-result, embedding and context layers

mod memory_store;
mod redis_store;
mod semantic;

pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;
pub use semantic::{CacheLayer, CachedQueryResult, LayerStats, SemanticCache, SemanticCacheStats};

use crate::config::{CacheBackend, CacheSettings};
use crate::errors::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Minimal key-value capability the pipeline needs from a cache.
///
/// Keys passed in are unprefixed; stores apply their own namespace.
/// Patterns use `*` as the only wildcard.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a raw value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a raw value that expires after `ttl_secs`
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Delete one key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete all keys matching a glob pattern, returning the number removed
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;

    /// Check connectivity
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;
}

/// Build the configured store.
///
/// An unreachable Redis at startup does not stop the service: the
/// in-process store takes over and a warning is logged.
pub async fn create_store(settings: &CacheSettings) -> Arc<dyn CacheStore> {
    match settings.backend {
        CacheBackend::Redis => match RedisStore::new(settings).await {
            Ok(store) => {
                info!(url = %settings.url, "Connected to Redis cache");
                Arc::new(store)
            }
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process cache");
                Arc::new(MemoryStore::new(&settings.key_prefix))
            }
        },
        CacheBackend::Memory => Arc::new(MemoryStore::new(&settings.key_prefix)),
    }
}

/// Normalize query text so near-duplicate phrasings share cache keys.
///
/// Lowercases, drops punctuation and symbols, and collapses whitespace runs.
pub fn normalize_query(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.chars().flat_map(char::to_lowercase) {
        if ch.is_alphanumeric() {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.push(ch);
        } else if ch.is_whitespace() {
            pending_space = true;
        }
        // Punctuation is removed without introducing a word break
    }

    out
}

/// Cache key builder helpers
pub mod keys {
    use sha2::{Digest, Sha256};
    use uuid::Uuid;

    /// Hex SHA-256 of the input
    pub fn digest(input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }

    /// Stable fingerprint of an embedding vector (bit-exact)
    pub fn embedding_fingerprint(embedding: &[f32]) -> String {
        let mut hasher = Sha256::new();
        for value in embedding {
            hasher.update(value.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Order-independent fingerprint of a set of chunk ids
    pub fn chunk_set(chunk_ids: &[Uuid]) -> String {
        let mut ids: Vec<&Uuid> = chunk_ids.iter().collect();
        ids.sort();
        ids.dedup();
        let mut hasher = Sha256::new();
        for id in ids {
            hasher.update(id.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// L1 index key: points at the latest full entry for this query
    pub fn query_index(owner_id: i64, normalized_query: &str) -> String {
        format!("l1:idx:{}:{}", owner_id, digest(normalized_query))
    }

    /// L1 full key: answer grounded on exactly these chunks
    pub fn query_result(owner_id: i64, normalized_query: &str, chunk_ids: &[Uuid]) -> String {
        format!(
            "l1:res:{}:{}:{}",
            owner_id,
            digest(normalized_query),
            chunk_set(chunk_ids)
        )
    }

    /// Pattern matching every L1 index entry of an owner
    pub fn query_index_pattern(owner_id: i64) -> String {
        format!("l1:idx:{}:*", owner_id)
    }

    /// L2 key: embedding of a normalized query under a model
    pub fn embedding(normalized_query: &str, model: &str) -> String {
        format!("l2:{}:{}", model, digest(normalized_query))
    }

    /// L3 key: retrieval results for an owner and query vector
    pub fn context(owner_id: i64, embedding: &[f32], top_k: usize) -> String {
        format!(
            "l3:{}:{}:{}",
            owner_id,
            embedding_fingerprint(embedding),
            top_k
        )
    }

    /// Pattern matching every L3 entry of an owner
    pub fn context_pattern(owner_id: i64) -> String {
        format!("l3:{}:*", owner_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("What is Grace?"), "what is grace");
        assert_eq!(normalize_query("  what   IS grace  "), "what is grace");
        assert_eq!(normalize_query("what's\tgrace!!"), "whats grace");
        assert_eq!(normalize_query("ÉTÉ, Été"), "été été");
        assert_eq!(normalize_query("?!"), "");
    }

    #[test]
    fn test_near_duplicates_share_keys() {
        let a = normalize_query("What is grace?");
        let b = normalize_query("what is GRACE");
        assert_eq!(keys::query_index(1, &a), keys::query_index(1, &b));
        assert_eq!(keys::embedding(&a, "m"), keys::embedding(&b, "m"));
    }

    #[test]
    fn test_key_builders() {
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();

        // Chunk order does not matter
        assert_eq!(
            keys::query_result(1, "q", &[id_a, id_b]),
            keys::query_result(1, "q", &[id_b, id_a])
        );
        assert_ne!(
            keys::query_result(1, "q", &[id_a]),
            keys::query_result(1, "q", &[id_a, id_b])
        );
        // Owners never share entries
        assert_ne!(keys::query_index(1, "q"), keys::query_index(2, "q"));
        assert!(keys::context(7, &[0.5, 0.25], 50).starts_with("l3:7:"));
        assert!(keys::query_index(7, "q").starts_with("l1:idx:7:"));
    }

    #[test]
    fn test_owner_patterns_do_not_overlap() {
        // "l3:1:*" must not match keys of owner 12
        let pattern = keys::context_pattern(1);
        let other = keys::context(12, &[1.0], 5);
        assert!(!memory_store::glob_match(&pattern, &other));
        assert!(memory_store::glob_match(&pattern, &keys::context(1, &[1.0], 5)));
    }
}
