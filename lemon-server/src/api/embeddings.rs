//! Embeddings and reranking endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::error::Result;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/embeddings", post(embeddings))
        .route("/reranking", post(reranking))
}

/// POST /embeddings - embedding vectors for the given input.
async fn embeddings(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(state.orchestrator.embeddings(&request).await?))
}

/// POST /reranking - relevance scores for documents against a query.
async fn reranking(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(state.orchestrator.reranking(&request).await?))
}
