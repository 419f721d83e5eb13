//! In-process TTL map used when Redis is not configured or unreachable

use super::CacheStore;
use crate::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local cache store
///
/// Expired entries are never returned; they are dropped lazily on access
/// and swept on writes.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
    key_prefix: String,
}

impl MemoryStore {
    pub fn new(key_prefix: &str) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            key_prefix: key_prefix.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.key(key);
        let now = Instant::now();

        {
            let entries = self.entries.read().await;
            match entries.get(&full_key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: drop it so the map does not grow with dead keys
        let mut entries = self.entries.write().await;
        if entries.get(&full_key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(&full_key);
        }
        Ok(None)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let full_key = self.key(key);
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        entries.retain(|_, e| e.is_live(now));
        entries.insert(
            full_key,
            Entry {
                value: value.to_string(),
                expires_at: now + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let full_key = self.key(key);
        let now = Instant::now();
        let removed = self.entries.write().await.remove(&full_key);
        Ok(removed.is_some_and(|e| e.is_live(now)))
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<u64> {
        let full_pattern = self.key(pattern);
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|k, _| !glob_match(&full_pattern, k));
        let removed = (before - entries.len()) as u64;
        debug!(pattern = %full_pattern, removed, "Memory pattern delete");
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

/// Match `text` against a pattern where `*` matches any run of characters.
pub(super) fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) || text.len() < first.len() + last.len() || !text.ends_with(last) {
        return false;
    }

    let mut rest = &text[first.len()..text.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}
