//! Three-layer semantic cache
//!
//! - L1 query result: `(owner, normalized query, used chunk ids)` → final response
//! - L2 embedding: `(normalized query, model)` → query vector
//! - L3 context: `(owner, embedding fingerprint, top_k)` → ranked chunks
//!
//! Every operation is bounded by a timeout and degrades to a miss or no-op
//! on backing-store failure. Caching never fails a request.

use super::{keys, CacheStore};
use crate::config::CacheSettings;
use crate::errors::Result;
use crate::metrics;
use crate::pipeline::QueryResponse;
use crate::retrieval::RankedChunks;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cache layer identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayer {
    QueryResult,
    Embedding,
    Context,
}

impl CacheLayer {
    pub fn name(&self) -> &'static str {
        match self {
            CacheLayer::QueryResult => "l1",
            CacheLayer::Embedding => "l2",
            CacheLayer::Context => "l3",
        }
    }

    fn index(&self) -> usize {
        match self {
            CacheLayer::QueryResult => 0,
            CacheLayer::Embedding => 1,
            CacheLayer::Context => 2,
        }
    }
}

/// L1 value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQueryResult {
    /// Chunks the answer was grounded on
    pub chunk_ids: Vec<Uuid>,
    pub response: QueryResponse,
    pub cached_at: DateTime<Utc>,
}

#[derive(Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time counters for one layer
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct LayerStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Counters for all layers plus backing-store status
#[derive(Debug, Clone, Serialize)]
pub struct SemanticCacheStats {
    pub backend: &'static str,
    pub degraded: bool,
    pub l1: LayerStats,
    pub l2: LayerStats,
    pub l3: LayerStats,
}

/// Semantic cache over a shared [`CacheStore`]
pub struct SemanticCache {
    store: Arc<dyn CacheStore>,
    query_ttl_secs: u64,
    embedding_ttl_secs: u64,
    context_ttl_secs: u64,
    op_timeout: Duration,
    /// Set after a failure so repeats log at debug; cleared on success
    degraded: AtomicBool,
    counters: [LayerCounters; 3],
}

impl SemanticCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: &CacheSettings) -> Self {
        Self {
            store,
            query_ttl_secs: settings.query_ttl_secs,
            embedding_ttl_secs: settings.embedding_ttl_secs,
            context_ttl_secs: settings.context_ttl_secs,
            op_timeout: Duration::from_millis(settings.op_timeout_ms),
            degraded: AtomicBool::new(false),
            counters: Default::default(),
        }
    }

    // ---- L1 -------------------------------------------------------------

    /// Look up the latest answer for a query via the owner's index entry
    pub async fn get_query(
        &self,
        owner_id: i64,
        normalized_query: &str,
    ) -> Option<CachedQueryResult> {
        let index_key = keys::query_index(owner_id, normalized_query);
        let result = match self.fetch::<String>(CacheLayer::QueryResult, &index_key).await {
            Some(full_key) => {
                self.fetch::<CachedQueryResult>(CacheLayer::QueryResult, &full_key)
                    .await
            }
            None => None,
        };
        self.record(CacheLayer::QueryResult, result.is_some());
        result
    }

    /// Look up an answer grounded on exactly `chunk_ids`
    pub async fn get_query_exact(
        &self,
        owner_id: i64,
        normalized_query: &str,
        chunk_ids: &[Uuid],
    ) -> Option<CachedQueryResult> {
        let key = keys::query_result(owner_id, normalized_query, chunk_ids);
        let result = self
            .fetch::<CachedQueryResult>(CacheLayer::QueryResult, &key)
            .await;
        self.record(CacheLayer::QueryResult, result.is_some());
        result
    }

    /// Store an answer under its full key and point the index at it
    pub async fn put_query(
        &self,
        owner_id: i64,
        normalized_query: &str,
        entry: &CachedQueryResult,
    ) {
        let full_key = keys::query_result(owner_id, normalized_query, &entry.chunk_ids);
        if self
            .store_value(CacheLayer::QueryResult, &full_key, entry, self.query_ttl_secs)
            .await
        {
            let index_key = keys::query_index(owner_id, normalized_query);
            self.store_value(CacheLayer::QueryResult, &index_key, &full_key, self.query_ttl_secs)
                .await;
        }
    }

    // ---- L2 -------------------------------------------------------------

    pub async fn get_embedding(&self, normalized_query: &str, model: &str) -> Option<Vec<f32>> {
        let key = keys::embedding(normalized_query, model);
        let result = self.fetch::<Vec<f32>>(CacheLayer::Embedding, &key).await;
        self.record(CacheLayer::Embedding, result.is_some());
        result
    }

    pub async fn put_embedding(&self, normalized_query: &str, model: &str, embedding: &[f32]) {
        let key = keys::embedding(normalized_query, model);
        self.store_value(CacheLayer::Embedding, &key, &embedding, self.embedding_ttl_secs)
            .await;
    }

    // ---- L3 -------------------------------------------------------------

    pub async fn get_context(
        &self,
        owner_id: i64,
        embedding: &[f32],
        top_k: usize,
    ) -> Option<RankedChunks> {
        let key = keys::context(owner_id, embedding, top_k);
        let result = self.fetch::<RankedChunks>(CacheLayer::Context, &key).await;
        self.record(CacheLayer::Context, result.is_some());
        result
    }

    pub async fn put_context(
        &self,
        owner_id: i64,
        embedding: &[f32],
        top_k: usize,
        context: &RankedChunks,
    ) {
        let key = keys::context(owner_id, embedding, top_k);
        self.store_value(CacheLayer::Context, &key, context, self.context_ttl_secs)
            .await;
    }

    // ---- Invalidation & health -----------------------------------------

    /// Drop an owner's context entries and query index entries.
    ///
    /// Full L1 entries stay; they are only reachable through an index entry
    /// or an exact chunk-id match, and changed documents get new chunk ids.
    pub async fn invalidate_owner(&self, owner_id: i64) -> u64 {
        let mut removed = 0;
        for (layer, pattern) in [
            (CacheLayer::Context, keys::context_pattern(owner_id)),
            (CacheLayer::QueryResult, keys::query_index_pattern(owner_id)),
        ] {
            if let Some(n) = self
                .guarded(layer, "delete_pattern", self.store.delete_pattern(&pattern))
                .await
            {
                removed += n;
            }
        }
        debug!(owner_id, removed, "Invalidated owner cache entries");
        removed
    }

    /// Whether the backing store answers a ping within the op timeout
    pub async fn is_reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(self.op_timeout, self.store.ping()).await,
            Ok(Ok(()))
        )
    }

    pub fn stats(&self) -> SemanticCacheStats {
        let snapshot = |layer: CacheLayer| {
            let c = &self.counters[layer.index()];
            LayerStats {
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
                errors: c.errors.load(Ordering::Relaxed),
            }
        };
        SemanticCacheStats {
            backend: self.store.backend(),
            degraded: self.degraded.load(Ordering::Relaxed),
            l1: snapshot(CacheLayer::QueryResult),
            l2: snapshot(CacheLayer::Embedding),
            l3: snapshot(CacheLayer::Context),
        }
    }

    // ---- Internals ------------------------------------------------------

    async fn fetch<T: DeserializeOwned>(&self, layer: CacheLayer, key: &str) -> Option<T> {
        let raw = self.guarded(layer, "get", self.store.get(key)).await.flatten()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(
                    cache = layer.name(),
                    key,
                    error = %e,
                    "Malformed cache value, treating as miss"
                );
                None
            }
        }
    }

    async fn store_value<T: Serialize + ?Sized>(
        &self,
        layer: CacheLayer,
        key: &str,
        value: &T,
        ttl_secs: u64,
    ) -> bool {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(cache = layer.name(), error = %e, "Failed to serialize cache value");
                return false;
            }
        };
        self.guarded(layer, "set", self.store.set_with_ttl(key, &json, ttl_secs))
            .await
            .is_some()
    }

    async fn guarded<T, F>(&self, layer: CacheLayer, op: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    debug!(backend = self.store.backend(), "Cache backing store recovered");
                }
                Some(value)
            }
            Ok(Err(e)) => {
                self.fail(layer, op, &e.to_string());
                None
            }
            Err(_) => {
                self.fail(layer, op, "operation timed out");
                None
            }
        }
    }

    fn fail(&self, layer: CacheLayer, op: &'static str, reason: &str) {
        self.counters[layer.index()]
            .errors
            .fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_error(layer.name(), op);

        if self.degraded.swap(true, Ordering::Relaxed) {
            debug!(cache = layer.name(), op, reason, "Cache unavailable");
        } else {
            warn!(
                cache = layer.name(),
                op,
                reason,
                backend = self.store.backend(),
                "Cache unavailable, continuing without it"
            );
        }
    }

    fn record(&self, layer: CacheLayer, hit: bool) {
        let c = &self.counters[layer.index()];
        if hit {
            c.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            c.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache(hit, layer.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::errors::AppError;
    use crate::pipeline::{ResponseMetadata, ResponseStatus};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Store whose every call fails
    struct DownStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CacheStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::CacheError { message: "connection refused".into() })
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: u64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(AppError::CacheError { message: "connection refused".into() })
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Err(AppError::CacheError { message: "connection refused".into() })
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
            Err(AppError::CacheError { message: "connection refused".into() })
        }
        async fn ping(&self) -> Result<()> {
            Err(AppError::CacheError { message: "connection refused".into() })
        }
        fn backend(&self) -> &'static str {
            "down"
        }
    }

    /// Store that never answers
    struct HangingStore;

    #[async_trait]
    impl CacheStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            futures::future::pending().await
        }
        async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: u64) -> Result<()> {
            futures::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            futures::future::pending().await
        }
        async fn delete_pattern(&self, _pattern: &str) -> Result<u64> {
            futures::future::pending().await
        }
        async fn ping(&self) -> Result<()> {
            futures::future::pending().await
        }
        fn backend(&self) -> &'static str {
            "hanging"
        }
    }

    fn memory_cache() -> SemanticCache {
        SemanticCache::new(Arc::new(MemoryStore::new("t")), &CacheSettings::default())
    }

    fn entry(chunk_ids: Vec<Uuid>, answer: &str) -> CachedQueryResult {
        CachedQueryResult {
            chunk_ids,
            response: QueryResponse {
                answer: answer.to_string(),
                sources: vec![],
                metadata: ResponseMetadata::new(ResponseStatus::Answered),
            },
            cached_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_query_layer_roundtrip() {
        let cache = memory_cache();
        let ids = vec![Uuid::new_v4(), Uuid::new_v4()];

        assert!(cache.get_query(1, "what is grace").await.is_none());
        cache.put_query(1, "what is grace", &entry(ids.clone(), "Grace is...")).await;

        let hit = cache.get_query(1, "what is grace").await.unwrap();
        assert_eq!(hit.response.answer, "Grace is...");

        let reversed: Vec<Uuid> = ids.iter().rev().copied().collect();
        assert!(cache.get_query_exact(1, "what is grace", &reversed).await.is_some());
        assert!(cache.get_query_exact(1, "what is grace", &ids[..1]).await.is_none());
        assert!(cache.get_query(2, "what is grace").await.is_none());

        let stats = cache.stats();
        assert_eq!(stats.l1.hits, 2);
        assert_eq!(stats.l1.misses, 3);
    }

    #[tokio::test]
    async fn test_invalidate_owner_drops_index_and_context() {
        let cache = memory_cache();
        let ids = vec![Uuid::new_v4()];
        let embedding = vec![0.1_f32, 0.2, 0.3];

        cache.put_query(1, "q", &entry(ids.clone(), "a")).await;
        cache.put_query(2, "q", &entry(ids.clone(), "b")).await;
        cache
            .put_context(1, &embedding, 50, &RankedChunks::default())
            .await;
        cache.put_embedding("q", "model", &embedding).await;

        cache.invalidate_owner(1).await;

        assert!(cache.get_query(1, "q").await.is_none());
        assert!(cache.get_context(1, &embedding, 50).await.is_none());
        // Other owners and the owner-independent embedding layer survive
        assert!(cache.get_query(2, "q").await.is_some());
        assert_eq!(cache.get_embedding("q", "model").await, Some(embedding));
    }

    #[tokio::test]
    async fn test_embedding_layer_is_bit_exact() {
        let cache = memory_cache();
        let embedding = vec![0.123_456_79_f32, -1.0e-7, 1.0];
        cache.put_embedding("q", "m", &embedding).await;
        assert_eq!(cache.get_embedding("q", "m").await, Some(embedding));
        assert!(cache.get_embedding("q", "other-model").await.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_store_degrades_to_miss() {
        let store = Arc::new(DownStore { calls: AtomicUsize::new(0) });
        let cache = SemanticCache::new(store.clone(), &CacheSettings::default());

        cache.put_embedding("q", "m", &[1.0]).await;
        assert!(cache.get_embedding("q", "m").await.is_none());
        assert!(cache.get_query(1, "q").await.is_none());
        assert_eq!(cache.invalidate_owner(1).await, 0);
        assert!(!cache.is_reachable().await);

        let stats = cache.stats();
        assert!(stats.degraded);
        assert!(stats.l2.errors >= 2);
        assert!(store.calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_store_times_out() {
        let cache = SemanticCache::new(Arc::new(HangingStore), &CacheSettings::default());
        assert!(cache.get_embedding("q", "m").await.is_none());
        cache.put_embedding("q", "m", &[1.0]).await;
        assert_eq!(cache.stats().l2.errors, 2);
    }

    #[tokio::test]
    async fn test_malformed_value_is_miss() {
        let store = Arc::new(MemoryStore::new("t"));
        store
            .set_with_ttl(&keys::embedding("q", "m"), "not json", 60)
            .await
            .unwrap();
        let cache = SemanticCache::new(store, &CacheSettings::default());
        assert!(cache.get_embedding("q", "m").await.is_none());
        assert!(!cache.stats().degraded);
    }
}
