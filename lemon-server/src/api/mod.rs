//! HTTP API surface.

pub mod audio;
pub mod backends;
pub mod chat;
pub mod embeddings;
pub mod health;
pub mod images;
pub mod load;
pub mod models;
pub mod pull;
pub mod system;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use axum::Router;

use crate::state::AppState;

/// Build the API router. Endpoints are served both at the root and under
/// `/api/v1` for OpenAI-client compatibility.
pub fn router() -> Router<Arc<AppState>> {
    let routes = Router::new()
        .merge(health::router())
        .merge(system::router())
        .merge(models::router())
        .merge(pull::router())
        .merge(backends::router())
        .merge(load::router())
        .merge(chat::router())
        .merge(embeddings::router())
        .merge(images::router())
        .merge(audio::router());

    Router::new()
        .merge(routes.clone())
        .nest("/api/v1", routes)
}

/// Middleware that logs HTTP requests at INFO level.
pub async fn request_logger(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;

    let status = response.status();
    let duration = start.elapsed();

    tracing::info!(
        method = %method,
        path = %path,
        status = %status.as_u16(),
        duration_ms = %duration.as_millis(),
        "HTTP request"
    );

    response
}
