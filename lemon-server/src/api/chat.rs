//! Completion-family endpoints (OpenAI-compatible).

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::error::Result;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
        .route("/responses", post(responses))
}

fn wants_stream(request: &Value) -> bool {
    request
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Answer a streaming completion by copying the child's SSE bytes
/// through unmodified.
async fn stream_response(
    state: &AppState,
    child_path: &str,
    request: &Value,
) -> Result<Response> {
    let stream = state
        .orchestrator
        .completion_stream(child_path, request)
        .await?;

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts are valid"))
}

/// POST /chat/completions - chat completion, streamed when requested.
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Response> {
    if wants_stream(&request) {
        return stream_response(&state, "/v1/chat/completions", &request).await;
    }
    let response = state.orchestrator.chat_completion(&request).await?;
    Ok(Json(response).into_response())
}

/// POST /completions - legacy text completion.
async fn completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Response> {
    if wants_stream(&request) {
        return stream_response(&state, "/v1/completions", &request).await;
    }
    let response = state.orchestrator.completion(&request).await?;
    Ok(Json(response).into_response())
}

/// POST /responses - the responses API.
async fn responses(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Response> {
    if wants_stream(&request) {
        return stream_response(&state, "/v1/responses", &request).await;
    }
    let response = state.orchestrator.responses(&request).await?;
    Ok(Json(response).into_response())
}
