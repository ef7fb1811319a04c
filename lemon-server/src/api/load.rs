//! Explicit model load and unload endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/load", post(load))
        .route("/unload", post(unload))
}

/// POST /load - ensure a model is loaded with the given options.
///
/// The body names the model and optionally a backend; every other field
/// is a load-time option and participates in the options fingerprint, so
/// `{"model":"M","ctx_size":8192}` after a 2048 load swaps the engine.
async fn load(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>> {
    let Value::Object(mut fields) = body else {
        return Err(Error::InvalidRequest("body must be an object".to_string()));
    };

    let model = fields
        .remove("model")
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .ok_or_else(|| Error::InvalidRequest("model is required".to_string()))?;
    let backend = fields
        .remove("backend")
        .and_then(|v| v.as_str().map(|s| s.to_string()));
    let options: Map<String, Value> = fields;

    let loaded = state
        .orchestrator
        .ensure_loaded(&model, Some(options), backend.as_deref())
        .await?;

    Ok(Json(json!({
        "status": "loaded",
        "model": loaded.model_name,
        "recipe": loaded.recipe,
        "backend": loaded.backend,
        "fingerprint": loaded.fingerprint,
    })))
}

#[derive(Debug, serde::Deserialize)]
struct UnloadRequest {
    #[serde(default)]
    model: Option<String>,
}

/// POST /unload - stop the engine serving a model, or all engines when no
/// model is named.
async fn unload(
    State(state): State<Arc<AppState>>,
    Json(request): Json<UnloadRequest>,
) -> Json<Value> {
    match request.model {
        Some(model) => {
            state.orchestrator.unload_model(&model).await;
            Json(json!({ "status": "unloaded", "model": model }))
        }
        None => {
            state.orchestrator.unload_all().await;
            Json(json!({ "status": "unloaded" }))
        }
    }
}
