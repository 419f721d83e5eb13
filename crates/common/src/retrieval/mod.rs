//! Per-owner vector similarity search with relevance stratification

use crate::config::RetrievalConfig;
use crate::db::{DocumentMetadata, DocumentStore, PassageChunk};
use crate::errors::{AppError, Result};
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// A ranked chunk. Carries everything downstream needs except the vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub chunk_id: Uuid,
    pub parent_document_id: Uuid,
    pub text: String,
    pub token_count: usize,
    pub owner_id: i64,
    pub document_title: String,
    pub document_metadata: DocumentMetadata,
    /// Cosine similarity clamped to [0, 1]
    pub relevance_score: f32,
}

impl RetrievalResult {
    fn from_chunk(chunk: PassageChunk, relevance_score: f32) -> Self {
        Self {
            chunk_id: chunk.chunk_id,
            parent_document_id: chunk.parent_document_id,
            text: chunk.text,
            token_count: chunk.token_count,
            owner_id: chunk.owner_id,
            document_title: chunk.document_title,
            document_metadata: chunk.document_metadata,
            relevance_score,
        }
    }
}

/// Retrieval output split at the relevance threshold, each side in rank order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedChunks {
    pub high: Vec<RetrievalResult>,
    pub low: Vec<RetrievalResult>,
}

impl RankedChunks {
    pub fn is_empty(&self) -> bool {
        self.high.is_empty() && self.low.is_empty()
    }
}

/// Retrieval engine over a [`DocumentStore`]
#[derive(Clone)]
pub struct RetrievalEngine {
    store: Arc<dyn DocumentStore>,
    dimension: usize,
    threshold: f32,
    max_top_k: usize,
    timeout: Duration,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn DocumentStore>, config: &RetrievalConfig, dimension: usize) -> Self {
        Self {
            store,
            dimension,
            threshold: config.relevance_threshold,
            max_top_k: config.max_top_k,
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Rank the owner's chunks against `query_embedding`.
    ///
    /// Fails whole on storage error or timeout; never returns a partial list.
    #[instrument(skip(self, query_embedding))]
    pub async fn retrieve(
        &self,
        query_embedding: &[f32],
        owner_id: i64,
        top_k: usize,
    ) -> Result<RankedChunks> {
        self.validate(query_embedding, owner_id, top_k)?;
        let start = Instant::now();

        let timeout_ms = self.timeout.as_millis() as u64;
        let fetch = self.store.get_chunks(owner_id);
        let chunks = match tokio::time::timeout(self.timeout, fetch).await {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => {
                warn!(owner_id, error = %e, "Document store failed");
                return Err(AppError::Retrieval {
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(owner_id, timeout_ms, "Document store timed out");
                return Err(AppError::RetrievalTimeout { timeout_ms });
            }
        };

        let fetched = chunks.len();
        let mut scored: Vec<RetrievalResult> = Vec::with_capacity(fetched);
        for chunk in chunks {
            // Ownership is checked before any scoring happens
            if chunk.owner_id != owner_id {
                warn!(
                    owner_id,
                    chunk_owner = chunk.owner_id,
                    chunk_id = %chunk.chunk_id,
                    "Store returned a chunk of another owner, dropping it"
                );
                continue;
            }
            if chunk.embedding.len() != self.dimension {
                warn!(
                    chunk_id = %chunk.chunk_id,
                    expected = self.dimension,
                    actual = chunk.embedding.len(),
                    "Skipping chunk with mismatched embedding width"
                );
                continue;
            }
            let score = cosine_similarity(query_embedding, &chunk.embedding);
            scored.push(RetrievalResult::from_chunk(chunk, score));
        }

        scored.sort_by(rank_order);
        scored.truncate(top_k);

        let (high, low): (Vec<_>, Vec<_>) = scored
            .into_iter()
            .partition(|r| r.relevance_score >= self.threshold);

        metrics::record_retrieval(start.elapsed().as_secs_f64(), high.len() + low.len());
        debug!(
            owner_id,
            fetched,
            high = high.len(),
            low = low.len(),
            "Retrieval complete"
        );

        Ok(RankedChunks { high, low })
    }

    fn validate(&self, query_embedding: &[f32], owner_id: i64, top_k: usize) -> Result<()> {
        if owner_id <= 0 {
            return Err(AppError::InvalidOwner { owner_id });
        }
        if query_embedding.len() != self.dimension {
            return Err(AppError::DimensionMismatch {
                expected: self.dimension,
                actual: query_embedding.len(),
            });
        }
        if query_embedding.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Validation {
                message: "query embedding contains non-finite values".to_string(),
                field: Some("embedding".to_string()),
            });
        }
        if top_k == 0 || top_k > self.max_top_k {
            return Err(AppError::Validation {
                message: format!("top_k must be between 1 and {}", self.max_top_k),
                field: Some("top_k".to_string()),
            });
        }
        Ok(())
    }
}

/// Higher score first, then more recent document, then chunk id
fn rank_order(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    b.relevance_score
        .total_cmp(&a.relevance_score)
        .then_with(|| {
            b.document_metadata
                .updated_at
                .cmp(&a.document_metadata.updated_at)
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Cosine similarity clamped to [0, 1]; zero vectors score 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let similarity = dot / (norm_a.sqrt() * norm_b.sqrt());
    if similarity.is_finite() {
        similarity.clamp(0.0, 1.0) as f32
    } else {
        0.0
    }
}
