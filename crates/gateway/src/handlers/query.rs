//! Query and document-change handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use quarry_common::{
    errors::{AppError, Result},
    QueryResponse,
};

/// Query request.
///
/// Only a transport-level size bound is checked here; empty or over-long
/// questions come back from the pipeline as `rejected` responses.
#[derive(Debug, Deserialize, Validate)]
pub struct QueryRequest {
    pub owner_id: i64,

    #[validate(length(max = 65536))]
    pub query: String,
}

/// Answer a question over the owner's documents
pub async fn answer_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: Some("query".to_string()),
    })?;

    let response = state
        .pipeline
        .answer_query(request.owner_id, &request.query)
        .await?;

    Ok(Json(response))
}

#[derive(Serialize)]
pub struct DocumentsChangedResponse {
    pub owner_id: i64,
    pub invalidated_entries: u64,
}

/// Invalidate cached context for an owner whose documents changed
pub async fn documents_changed(
    State(state): State<AppState>,
    Path(owner_id): Path<i64>,
) -> Result<Json<DocumentsChangedResponse>> {
    let invalidated_entries = state.pipeline.on_document_changed(owner_id).await?;

    tracing::info!(owner_id, invalidated_entries, "Owner cache invalidated");

    Ok(Json(DocumentsChangedResponse {
        owner_id,
        invalidated_entries,
    }))
}
