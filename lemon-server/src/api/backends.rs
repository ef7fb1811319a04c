//! Backend install and uninstall endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::artifact::ProgressCallback;
use crate::backend::spec::{default_backend, get_spec, host_support};
use crate::error::{Error, Result};
use crate::events::sse_response;
use crate::state::AppState;
use crate::transfers::TransferKind;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/install", post(install))
        .route("/uninstall", post(uninstall))
}

#[derive(Debug, Deserialize)]
struct BackendRequest {
    recipe: String,
    #[serde(default)]
    backend: Option<String>,
}

impl BackendRequest {
    /// Resolve to a concrete (recipe, backend) target, rejecting
    /// unsupported hosts before any stream opens.
    fn resolve(&self) -> Result<(String, String)> {
        let spec = get_spec(&self.recipe)?;
        let backend = self
            .backend
            .clone()
            .unwrap_or_else(|| default_backend(spec).to_string());
        if let Err(reason) = host_support(spec, &backend) {
            return Err(Error::UnsupportedBackend {
                recipe: self.recipe.clone(),
                backend,
                reason,
            });
        }
        Ok((self.recipe.clone(), backend))
    }
}

/// POST /install - install a backend, answering with an event stream
/// `progress* → (complete | error)`.
async fn install(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackendRequest>,
) -> Result<Response> {
    let (recipe, backend) = request.resolve()?;
    let display_name = format!("{recipe}:{backend}");

    let state = state.clone();
    Ok(sse_response(display_name.clone(), move |events| async move {
        let abort = state
            .transfers
            .begin(&display_name, TransferKind::Backend)?;

        let progress: ProgressCallback = {
            let transfers = state.transfers.clone();
            let name = display_name.clone();
            Arc::new(move |bytes, total| {
                transfers.record_progress(&name, bytes, total);
                events.progress(bytes, total);
            })
        };

        let result = state
            .backends
            .install(&recipe, &backend, Some(abort), Some(progress))
            .await;
        state.transfers.finish(&display_name, &result);
        if result.is_ok() {
            state.transfers.acknowledge(&display_name);
        }
        result
    }))
}

/// POST /uninstall - remove a backend's install directory.
async fn uninstall(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BackendRequest>,
) -> Result<Json<Value>> {
    let spec = get_spec(&request.recipe)?;
    let backend = request
        .backend
        .clone()
        .unwrap_or_else(|| default_backend(spec).to_string());

    state.backends.uninstall(&request.recipe, &backend).await?;
    Ok(Json(json!({
        "status": "uninstalled",
        "recipe": request.recipe,
        "backend": backend,
    })))
}
