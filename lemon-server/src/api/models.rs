//! Model listing and deletion endpoints.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/models", get(list_models))
        .route("/delete", post(delete_model))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    show_all: bool,
}

/// GET /models - downloaded models; `?show_all=true` includes the whole
/// catalog with a `downloaded` flag per row.
async fn list_models(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Value> {
    let data = state.models.list(query.show_all);
    Json(json!({
        "object": "list",
        "data": data,
    }))
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    model: String,
}

/// POST /delete - remove a model's files. A loaded engine serving the
/// model is stopped first.
async fn delete_model(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DeleteRequest>,
) -> Result<Json<Value>> {
    state.orchestrator.unload_model(&request.model).await;
    state.models.delete(&request.model)?;
    Ok(Json(json!({ "status": "deleted", "model": request.model })))
}
