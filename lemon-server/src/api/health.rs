//! Health and stats endpoints.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::orchestrator::{EngineSummary, Stats};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    /// Engines the orchestrator believes are ready; no probing happens
    /// here.
    engines: Vec<EngineSummary>,
}

/// GET /health - currently loaded engines from the orchestrator's view.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let engines = state.orchestrator.loaded_engines().await;
    Json(HealthResponse {
        status: "ok",
        engines,
    })
}

/// GET /stats - last-request token and timing counters.
async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(state.orchestrator.stats())
}
