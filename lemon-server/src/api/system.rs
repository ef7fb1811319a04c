//! System information endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/system-info", get(system_info))
}

/// GET /system-info - the recipes cache plus transfer status.
///
/// The cache is populated on the first request; afterwards install and
/// uninstall keep it current with targeted entry updates, so this read
/// never re-probes the filesystem.
async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let recipes = if state.backends.recipes_cache_is_empty() {
        state.backends.refresh_recipes_cache().await
    } else {
        state.backends.get_recipes_cache()
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "recipes": recipes,
        "transfers": state.transfers.snapshot(),
    }))
}
