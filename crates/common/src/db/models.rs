//! Passage chunk model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Document-level fields carried on every chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub author: Option<String>,
    /// Used for recency tie-breaks
    pub updated_at: DateTime<Utc>,
}

/// A retrievable slice of one document.
///
/// Immutable: when the parent document changes its chunks are replaced
/// with new ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageChunk {
    pub chunk_id: Uuid,
    pub parent_document_id: Uuid,
    pub text: String,
    pub token_count: usize,
    pub owner_id: i64,
    pub embedding: Vec<f32>,
    pub document_title: String,
    pub document_metadata: DocumentMetadata,
}
