//! Document store implementations

use super::models::{DocumentMetadata, PassageChunk};
use super::DbPool;
use crate::embeddings::EmbeddingClient;
use crate::errors::Result;
use crate::tokenizer::TextTokenizer;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbBackend, Statement};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Source of passage chunks for retrieval
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// All chunks belonging to `owner_id`
    async fn get_chunks(&self, owner_id: i64) -> Result<Vec<PassageChunk>>;

    /// Check connectivity
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Process-local document store for tests and offline runs
#[derive(Default)]
pub struct InMemoryDocumentStore {
    /// Chunks keyed by parent document
    documents: RwLock<HashMap<Uuid, Vec<PassageChunk>>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all chunks of a document
    pub async fn upsert_document(&self, document_id: Uuid, chunks: Vec<PassageChunk>) {
        self.documents.write().await.insert(document_id, chunks);
    }

    /// Remove a document, returning whether it existed
    pub async fn delete_document(&self, document_id: Uuid) -> bool {
        self.documents.write().await.remove(&document_id).is_some()
    }

    /// Chunk, embed and store a document, returning its id
    #[allow(clippy::too_many_arguments)]
    pub async fn add_document(
        &self,
        owner_id: i64,
        title: &str,
        author: Option<&str>,
        text: &str,
        tokenizer: &TextTokenizer,
        embeddings: &EmbeddingClient,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Result<Uuid> {
        let document_id = Uuid::new_v4();
        let metadata = DocumentMetadata {
            author: author.map(str::to_string),
            updated_at: Utc::now(),
        };

        let mut chunks = Vec::new();
        for window in tokenizer.chunk(text, chunk_size, chunk_overlap)? {
            let embedding = embeddings.embed(window.text).await?;
            chunks.push(PassageChunk {
                chunk_id: Uuid::new_v4(),
                parent_document_id: document_id,
                text: window.text.to_string(),
                token_count: window.token_count,
                owner_id,
                embedding,
                document_title: title.to_string(),
                document_metadata: metadata.clone(),
            });
        }

        debug!(owner_id, %document_id, chunks = chunks.len(), "Stored document");
        self.upsert_document(document_id, chunks).await;
        Ok(document_id)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get_chunks(&self, owner_id: i64) -> Result<Vec<PassageChunk>> {
        Ok(self
            .documents
            .read()
            .await
            .values()
            .flatten()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }
}

/// PostgreSQL-backed document store.
///
/// Expects `documents(id uuid, owner_id bigint, title text, author text,
/// updated_at timestamptz)` and `chunks(id uuid, document_id uuid, content
/// text, token_count int, embedding vector(384))`.
#[derive(Clone)]
pub struct PgDocumentStore {
    pool: DbPool,
}

impl PgDocumentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    #[instrument(skip(self))]
    async fn get_chunks(&self, owner_id: i64) -> Result<Vec<PassageChunk>> {
        let sql = r#"
            SELECT
                c.id,
                c.document_id,
                c.content,
                c.token_count,
                d.owner_id,
                c.embedding::text,
                d.title,
                d.author,
                d.updated_at
            FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.owner_id = $1
              AND c.embedding IS NOT NULL
        "#;

        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, sql, [owner_id.into()]);
        let rows = self.pool.conn().query_all(stmt).await?;

        let mut chunks = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_id: Uuid = row.try_get_by_index(0)?;
            let raw_embedding: String = row.try_get_by_index(5)?;
            let Some(embedding) = parse_vector(&raw_embedding) else {
                warn!(%chunk_id, "Skipping chunk with unparseable embedding");
                continue;
            };
            let token_count: i32 = row.try_get_by_index(3)?;

            chunks.push(PassageChunk {
                chunk_id,
                parent_document_id: row.try_get_by_index(1)?,
                text: row.try_get_by_index(2)?,
                token_count: usize::try_from(token_count).unwrap_or(0),
                owner_id: row.try_get_by_index(4)?,
                embedding,
                document_title: row.try_get_by_index(6)?,
                document_metadata: DocumentMetadata {
                    author: row.try_get_by_index(7)?,
                    updated_at: row.try_get_by_index::<DateTime<Utc>>(8)?,
                },
            });
        }

        debug!(owner_id, count = chunks.len(), "Loaded chunks");
        Ok(chunks)
    }

    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }
}

/// Parse pgvector text output (`[0.1,0.2,...]`)
fn parse_vector(raw: &str) -> Option<Vec<f32>> {
    let inner = raw.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|v| v.trim().parse::<f32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embeddings::HashingEmbedder;
    use std::sync::Arc;

    fn chunk(owner_id: i64, document_id: Uuid) -> PassageChunk {
        PassageChunk {
            chunk_id: Uuid::new_v4(),
            parent_document_id: document_id,
            text: "text".to_string(),
            token_count: 1,
            owner_id,
            embedding: vec![1.0; 4],
            document_title: "Doc".to_string(),
            document_metadata: DocumentMetadata {
                author: None,
                updated_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(parse_vector("[1,2.5,-3]"), Some(vec![1.0, 2.5, -3.0]));
        assert_eq!(parse_vector(" [ 0.5 , 0.25 ] "), Some(vec![0.5, 0.25]));
        assert_eq!(parse_vector("[]"), Some(vec![]));
        assert_eq!(parse_vector("1,2"), None);
        assert_eq!(parse_vector("[1,x]"), None);
    }

    #[tokio::test]
    async fn test_in_memory_filters_by_owner() {
        let store = InMemoryDocumentStore::new();
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        store.upsert_document(doc_a, vec![chunk(1, doc_a), chunk(1, doc_a)]).await;
        store.upsert_document(doc_b, vec![chunk(2, doc_b)]).await;

        assert_eq!(store.get_chunks(1).await.unwrap().len(), 2);
        assert_eq!(store.get_chunks(2).await.unwrap().len(), 1);
        assert!(store.get_chunks(3).await.unwrap().is_empty());

        assert!(store.delete_document(doc_a).await);
        assert!(store.get_chunks(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_document_chunks_and_embeds() {
        let store = InMemoryDocumentStore::new();
        let tokenizer = TextTokenizer::heuristic();
        let config = EmbeddingConfig::default();
        let embedder = Arc::new(HashingEmbedder::new(config.dimension));
        let embeddings = EmbeddingClient::new(embedder, &config);
        let text = "Grace is unmerited favor. ".repeat(100);

        let id = store
            .add_document(7, "Grace", Some("A. Author"), &text, &tokenizer, &embeddings, 64, 8)
            .await
            .unwrap();

        let chunks = store.get_chunks(7).await.unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.parent_document_id == id));
        assert!(chunks.iter().all(|c| c.embedding.len() == 384));
        assert_eq!(chunks[0].document_metadata.author.as_deref(), Some("A. Author"));
    }
}
