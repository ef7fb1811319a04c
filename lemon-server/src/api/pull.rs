//! Model download endpoints: the SSE pull stream and its control channel.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::backend::artifact::ProgressCallback;
use crate::error::{Error, Result};
use crate::events::sse_response;
use crate::models::download::pull_model;
use crate::models::ModelInfo;
use crate::state::AppState;
use crate::transfers::TransferKind;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/pull", post(pull))
        .route("/pull/control", post(control))
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    model: String,
    /// Registration data for a user-supplied model.
    #[serde(default)]
    registration: Option<ModelInfo>,
}

/// POST /pull - start a model download, answering with an event stream
/// `progress* → (complete | error)`.
///
/// A registration, when present, is persisted before the first progress
/// event: a cancelled download still leaves the model registered as
/// not-downloaded.
async fn pull(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PullRequest>,
) -> Result<Response> {
    if let Some(registration) = request.registration {
        state
            .models
            .register_user_model(&request.model, registration)?;
    }

    let info = state
        .models
        .get(&request.model)
        .ok_or_else(|| Error::ModelNotFound(request.model.clone()))?;

    let state = state.clone();
    let model = request.model.clone();
    Ok(sse_response(request.model, move |events| async move {
        let abort = state.transfers.begin(&model, TransferKind::Model)?;

        let progress: ProgressCallback = {
            let transfers = state.transfers.clone();
            let name = model.clone();
            Arc::new(move |bytes, total| {
                transfers.record_progress(&name, bytes, total);
                events.progress(bytes, total);
            })
        };

        let result = pull_model(
            &state.models,
            state.orchestrator.hub(),
            &info,
            abort,
            Some(progress),
        )
        .await;
        state.transfers.finish(&model, &result);

        // The complete frame is the consumer's acknowledgment.
        if result.is_ok() {
            state.transfers.acknowledge(&model);
        }
        result
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ControlAction {
    Pause,
    Cancel,
    Resume,
}

#[derive(Debug, Deserialize)]
struct ControlRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    recipe: Option<String>,
    #[serde(default)]
    backend: Option<String>,
    action: ControlAction,
}

impl ControlRequest {
    fn display_name(&self) -> Result<String> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }
        match (&self.recipe, &self.backend) {
            (Some(recipe), Some(backend)) => Ok(format!("{recipe}:{backend}")),
            _ => Err(Error::InvalidRequest(
                "control requires either model or recipe+backend".to_string(),
            )),
        }
    }
}

/// POST /pull/control - pause, cancel or resume a transfer.
///
/// Pause triggers the abort flag but keeps partial files; cancel removes
/// them; resume re-enters the pull pipeline, which skips already-complete
/// shards.
async fn control(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<Value>> {
    let name = request.display_name()?;

    match request.action {
        ControlAction::Pause => {
            state.transfers.pause(&name)?;
            Ok(Json(json!({ "status": "pausing", "transfer": name })))
        }
        ControlAction::Cancel => {
            state.transfers.cancel(&name)?;
            Ok(Json(json!({ "status": "cancelling", "transfer": name })))
        }
        ControlAction::Resume => {
            let model = request.model.ok_or_else(|| {
                Error::InvalidRequest("resume applies to model transfers".to_string())
            })?;
            let info = state
                .models
                .get(&model)
                .ok_or_else(|| Error::ModelNotFound(model.clone()))?;

            let orchestrator = state.orchestrator.clone();
            let name = model.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.pull_tracked(&name, &info, false).await {
                    tracing::warn!("resume of {name} failed: {e}");
                }
            });
            Ok(Json(json!({ "status": "resumed", "transfer": model })))
        }
    }
}
