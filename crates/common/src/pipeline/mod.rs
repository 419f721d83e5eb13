//! Query orchestrator
//!
//! One request lifecycle: validate → L1 → L2/embed → L3/retrieve →
//! assemble → prompt → breaker-guarded generation → L1 write. When
//! generation is unavailable the fallback ladder keeps the service
//! answering: exact cached answer, then verbatim excerpts, then a
//! retry-after response.

use crate::cache::{
    normalize_query, CacheStore, CachedQueryResult, SemanticCache, SemanticCacheStats,
};
use crate::config::AppConfig;
use crate::context::{ContextAssembler, ContextBundle, InjectionGuard, PromptBuilder, Source};
use crate::db::DocumentStore;
use crate::embeddings::{EmbeddingClient, Embedder};
use crate::errors::{AppError, ProviderError, Result};
use crate::generation::{GenerationClient, GenerationProvider, GenerationRequest};
use crate::metrics;
use crate::resilience::{CircuitBreaker, CircuitHealth, CircuitState};
use crate::retrieval::{RankedChunks, RetrievalEngine, RetrievalResult};
use crate::tokenizer::TextTokenizer;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

const NO_CONTEXT_ANSWER: &str =
    "I couldn't find anything in your documents that answers this question.";

const EXCERPTS_NOTE: &str = "The answer service is temporarily unavailable. \
Here are the most relevant passages from your documents:";

const UNAVAILABLE_ANSWER: &str =
    "The answer service is temporarily unavailable. Please try again shortly.";

const OVERSIZED_REASON: &str =
    "The matching passages are too long to fit the context budget.";

/// Characters of each related passage shown as a preview
const RELATED_PREVIEW_CHARS: usize = 240;

/// How a query was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Answered,
    Rejected,
    NoContext,
    CachedFallback,
    ExcerptsFallback,
    Unavailable,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Answered => "answered",
            ResponseStatus::Rejected => "rejected",
            ResponseStatus::NoContext => "no_context",
            ResponseStatus::CachedFallback => "cached_fallback",
            ResponseStatus::ExcerptsFallback => "excerpts_fallback",
            ResponseStatus::Unavailable => "unavailable",
        }
    }
}

/// Low-relevance passage surfaced alongside a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedPassage {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub document_title: String,
    pub relevance_score: f32,
    pub preview: String,
}

impl From<&RetrievalResult> for RelatedPassage {
    fn from(chunk: &RetrievalResult) -> Self {
        let preview = match chunk.text.char_indices().nth(RELATED_PREVIEW_CHARS) {
            Some((end, _)) => format!("{}…", chunk.text[..end].trim_end()),
            None => chunk.text.clone(),
        };
        Self {
            chunk_id: chunk.chunk_id,
            document_id: chunk.parent_document_id,
            document_title: chunk.document_title.clone(),
            relevance_score: chunk.relevance_score,
            preview,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Prompt plus answer tokens; zero when no generation happened
    pub tokens_used: usize,
    pub chunks_used: usize,
    pub truncated: bool,
    pub from_cache: bool,
    pub circuit_state: CircuitState,
    pub status: ResponseStatus,
    #[serde(default)]
    pub related: Vec<RelatedPassage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ResponseMetadata {
    pub fn new(status: ResponseStatus) -> Self {
        Self {
            tokens_used: 0,
            chunks_used: 0,
            truncated: false,
            from_cache: false,
            circuit_state: CircuitState::Closed,
            status,
            related: Vec::new(),
            reason: None,
            retry_after_secs: None,
        }
    }
}

/// Result of [`QueryPipeline::answer_query`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub metadata: ResponseMetadata,
}

/// Backends the pipeline is assembled from
pub struct PipelineDeps {
    pub store: Arc<dyn DocumentStore>,
    pub cache_store: Arc<dyn CacheStore>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn GenerationProvider>,
    pub breaker: Arc<CircuitBreaker>,
}

/// Liveness of the pipeline's collaborators
#[derive(Debug, Clone, Serialize)]
pub struct PipelineHealth {
    pub store_ok: bool,
    pub cache_ok: bool,
    pub cache: SemanticCacheStats,
    pub circuit: CircuitHealth,
}

/// Query orchestrator
pub struct QueryPipeline {
    tokenizer: TextTokenizer,
    embeddings: EmbeddingClient,
    store: Arc<dyn DocumentStore>,
    retrieval: RetrievalEngine,
    assembler: ContextAssembler,
    prompts: PromptBuilder,
    generation: GenerationClient,
    cache: SemanticCache,
    top_k: usize,
    context_budget: usize,
    max_query_chars: usize,
    fallback_excerpts: usize,
}

impl QueryPipeline {
    /// Wire the pipeline. Fails on an invalid budget or template.
    pub fn new(config: &AppConfig, deps: PipelineDeps) -> Result<Self> {
        config.validate()?;

        let tokenizer = TextTokenizer::from_config(&config.tokenizer);
        let embeddings = EmbeddingClient::new(deps.embedder, &config.embedding);
        let retrieval =
            RetrievalEngine::new(deps.store.clone(), &config.retrieval, embeddings.dimension());
        let prompts = PromptBuilder::new(
            tokenizer.clone(),
            InjectionGuard::new()?,
            &config.budget,
            &config.generation,
        )?;
        let generation =
            GenerationClient::new(deps.generator, deps.breaker, &config.generation);

        info!(
            tokenizer = tokenizer.name(),
            embedding_model = embeddings.model_name(),
            cache_backend = deps.cache_store.backend(),
            context_budget = config.budget.context_tokens(),
            "Query pipeline ready"
        );

        Ok(Self {
            assembler: ContextAssembler::new(tokenizer.clone()),
            cache: SemanticCache::new(deps.cache_store, &config.cache),
            store: deps.store,
            tokenizer,
            embeddings,
            retrieval,
            prompts,
            generation,
            top_k: config.retrieval.top_k,
            context_budget: config.budget.context_tokens(),
            max_query_chars: config.prompt.max_query_chars,
            fallback_excerpts: config.prompt.fallback_excerpts,
        })
    }

    /// Embedding client, for ingestion helpers that must share the query model
    pub fn embeddings(&self) -> &EmbeddingClient {
        &self.embeddings
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Answer `query` over the documents of `owner_id`.
    ///
    /// Input problems, missing context and generation outages are normal
    /// responses; only embedding, retrieval and budget failures are errors.
    #[instrument(skip(self, query), fields(query_chars = query.chars().count()))]
    pub async fn answer_query(&self, owner_id: i64, query: &str) -> Result<QueryResponse> {
        let start = Instant::now();
        let result = self.run(owner_id, query).await;

        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(response) => {
                let metadata = &response.metadata;
                metrics::record_query(elapsed, metadata.status.as_str(), metadata.from_cache);
                info!(
                    status = response.metadata.status.as_str(),
                    from_cache = response.metadata.from_cache,
                    chunks_used = response.metadata.chunks_used,
                    elapsed_ms = (elapsed * 1000.0) as u64,
                    "Query finished"
                );
            }
            Err(e) => {
                metrics::record_query(elapsed, "error", false);
                warn!(error = %e, code = ?e.code(), "Query failed");
            }
        }
        result
    }

    /// Breaker snapshot for the generation dependency
    pub fn circuit_health(&self) -> CircuitHealth {
        self.generation.breaker().health()
    }

    /// Drop the owner's context entries and query index entries
    #[instrument(skip(self))]
    pub async fn on_document_changed(&self, owner_id: i64) -> Result<u64> {
        if owner_id <= 0 {
            return Err(AppError::InvalidOwner { owner_id });
        }
        Ok(self.cache.invalidate_owner(owner_id).await)
    }

    pub fn cache_stats(&self) -> SemanticCacheStats {
        self.cache.stats()
    }

    pub async fn health(&self) -> PipelineHealth {
        let store_ok = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Document store health check failed");
                false
            }
        };
        PipelineHealth {
            store_ok,
            cache_ok: self.cache.is_reachable().await,
            cache: self.cache.stats(),
            circuit: self.circuit_health(),
        }
    }

    async fn run(&self, owner_id: i64, query: &str) -> Result<QueryResponse> {
        let normalized = match self.validate_input(owner_id, query) {
            Ok(normalized) => normalized,
            Err(e) => {
                debug!(error = %e, "Query rejected");
                return Ok(self.rejected(e.public_message()));
            }
        };

        if let Some(hit) = self.cache.get_query(owner_id, &normalized).await {
            debug!("Answered from query cache");
            let mut response = hit.response;
            response.metadata.from_cache = true;
            response.metadata.circuit_state = self.generation.breaker().state();
            return Ok(response);
        }

        let embedding = self.query_embedding(&normalized).await?;
        let ranked = self.ranked_chunks(owner_id, &embedding).await?;

        if ranked.high.is_empty() {
            return Ok(self.no_context(&ranked));
        }

        let bundle = self.assembler.build(ranked.high, ranked.low, self.context_budget);
        metrics::record_context_tokens(bundle.total_tokens);
        if bundle.chunks_used.is_empty() {
            return Ok(self.oversized_context(&bundle));
        }
        let payload = self.prompts.build(owner_id, query, &bundle)?;

        match self.generation.generate(&GenerationRequest::from(&payload)).await {
            Ok(text) => {
                let answer = self.prompts.guard_output(owner_id, text);
                let tokens_used = payload.accounting.system
                    + payload.accounting.user
                    + self.tokenizer.count(&answer);

                let mut metadata = self.metadata_for(&bundle, ResponseStatus::Answered);
                metadata.tokens_used = tokens_used;
                let response = QueryResponse {
                    answer,
                    sources: bundle.sources.clone(),
                    metadata,
                };

                let entry = CachedQueryResult {
                    chunk_ids: bundle.chunk_ids(),
                    response: response.clone(),
                    cached_at: Utc::now(),
                };
                self.cache.put_query(owner_id, &normalized, &entry).await;
                Ok(response)
            }
            Err(e) => Ok(self.fallback(owner_id, &normalized, &bundle, e).await),
        }
    }

    /// Normalized query text, or the reason it cannot be served
    fn validate_input(&self, owner_id: i64, query: &str) -> Result<String> {
        if owner_id <= 0 {
            return Err(AppError::InvalidOwner { owner_id });
        }
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation {
                message: "query must not be empty".to_string(),
                field: Some("query".to_string()),
            });
        }
        let length = trimmed.chars().count();
        if length > self.max_query_chars {
            return Err(AppError::QueryTooLong {
                length,
                limit: self.max_query_chars,
            });
        }
        let normalized = normalize_query(trimmed);
        if normalized.is_empty() {
            return Err(AppError::Validation {
                message: "query contains no searchable text".to_string(),
                field: Some("query".to_string()),
            });
        }
        Ok(normalized)
    }

    async fn query_embedding(&self, normalized: &str) -> Result<Vec<f32>> {
        let model = self.embeddings.model_name();
        if let Some(embedding) = self.cache.get_embedding(normalized, model).await {
            return Ok(embedding);
        }
        let embedding = self.embeddings.embed(normalized).await?;
        self.cache.put_embedding(normalized, model, &embedding).await;
        Ok(embedding)
    }

    async fn ranked_chunks(&self, owner_id: i64, embedding: &[f32]) -> Result<RankedChunks> {
        if let Some(ranked) = self.cache.get_context(owner_id, embedding, self.top_k).await {
            return Ok(ranked);
        }
        let ranked = self.retrieval.retrieve(embedding, owner_id, self.top_k).await?;
        self.cache.put_context(owner_id, embedding, self.top_k, &ranked).await;
        Ok(ranked)
    }

    fn rejected(&self, reason: String) -> QueryResponse {
        let mut metadata = ResponseMetadata::new(ResponseStatus::Rejected);
        metadata.circuit_state = self.generation.breaker().state();
        metadata.reason = Some(reason);
        QueryResponse {
            answer: String::new(),
            sources: Vec::new(),
            metadata,
        }
    }

    fn no_context(&self, ranked: &RankedChunks) -> QueryResponse {
        let mut metadata = ResponseMetadata::new(ResponseStatus::NoContext);
        metadata.circuit_state = self.generation.breaker().state();
        metadata.related = ranked.low.iter().map(RelatedPassage::from).collect();
        QueryResponse {
            answer: NO_CONTEXT_ANSWER.to_string(),
            sources: Vec::new(),
            metadata,
        }
    }

    /// Relevant chunks exist but none fits the budget. The model is not
    /// called; skipped chunks come back as related passages, uncached.
    fn oversized_context(&self, bundle: &ContextBundle) -> QueryResponse {
        warn!(
            skipped = bundle.chunks_skipped.len(),
            budget = bundle.token_budget,
            "No relevant chunk fits the context budget"
        );
        let mut metadata = self.metadata_for(bundle, ResponseStatus::NoContext);
        metadata.related = bundle
            .chunks_skipped
            .iter()
            .chain(&bundle.low_relevance_retained)
            .map(RelatedPassage::from)
            .collect();
        metadata.reason = Some(OVERSIZED_REASON.to_string());
        QueryResponse {
            answer: NO_CONTEXT_ANSWER.to_string(),
            sources: Vec::new(),
            metadata,
        }
    }

    fn metadata_for(&self, bundle: &ContextBundle, status: ResponseStatus) -> ResponseMetadata {
        let mut metadata = ResponseMetadata::new(status);
        metadata.chunks_used = bundle.chunks_used.len();
        metadata.truncated = bundle.truncated;
        metadata.circuit_state = self.generation.breaker().state();
        metadata.related = bundle
            .low_relevance_retained
            .iter()
            .map(RelatedPassage::from)
            .collect();
        metadata
    }

    /// Cached answer for the same chunks, then excerpts, then retry-after.
    /// Nothing produced here is written back to the cache.
    async fn fallback(
        &self,
        owner_id: i64,
        normalized: &str,
        bundle: &ContextBundle,
        error: ProviderError,
    ) -> QueryResponse {
        warn!(owner_id, error = %error, "Generation unavailable, using fallback");
        let note = AppError::from(error.clone()).public_message();

        if let Some(hit) = self
            .cache
            .get_query_exact(owner_id, normalized, &bundle.chunk_ids())
            .await
        {
            let mut response = hit.response;
            response.metadata.status = ResponseStatus::CachedFallback;
            response.metadata.from_cache = true;
            response.metadata.circuit_state = self.generation.breaker().state();
            response.metadata.reason = Some(note);
            return response;
        }

        if self.fallback_excerpts > 0 && !bundle.chunks_used.is_empty() {
            let mut answer = String::from(EXCERPTS_NOTE);
            for chunk in bundle.chunks_used.iter().take(self.fallback_excerpts) {
                answer.push_str(&format!("\n\n[{}] {}", chunk.document_title, chunk.text.trim()));
            }
            let mut metadata = self.metadata_for(bundle, ResponseStatus::ExcerptsFallback);
            metadata.reason = Some(note);
            return QueryResponse {
                answer,
                sources: bundle.sources.clone(),
                metadata,
            };
        }

        let health = self.circuit_health();
        let retry_after_secs = health.retry_after_secs.or(match error {
            ProviderError::RateLimited { retry_after_secs } => retry_after_secs,
            _ => None,
        });
        let mut metadata = self.metadata_for(bundle, ResponseStatus::Unavailable);
        metadata.reason = Some(note);
        metadata.retry_after_secs = retry_after_secs;
        QueryResponse {
            answer: UNAVAILABLE_ANSWER.to_string(),
            sources: Vec::new(),
            metadata,
        }
    }
}
