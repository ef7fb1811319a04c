//! Image generation, edit and variation endpoints.
//!
//! Generations take JSON; edits and variations take `multipart/form-data`
//! like the OpenAI API. Binary parts are carried to the engine as base64
//! fields and re-encoded into the child's multipart there.

use std::sync::Arc;

use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/images/generations", post(generations))
        .route("/images/edits", post(edits))
        .route("/images/variations", post(variations))
}

/// POST /images/generations - text-to-image.
async fn generations(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Json<Value>> {
    Ok(Json(state.orchestrator.image_generations(&request).await?))
}

/// Collect a multipart form into a JSON request body. `image` and `mask`
/// parts become base64 `image_data` / `mask_data` fields.
async fn multipart_to_request(mut multipart: Multipart) -> Result<Value> {
    let mut fields = Map::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "image[]" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Bad image part: {e}")))?;
                fields.insert(
                    "image_data".to_string(),
                    json!(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                );
            }
            "mask" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Bad mask part: {e}")))?;
                fields.insert(
                    "mask_data".to_string(),
                    json!(base64::engine::general_purpose::STANDARD.encode(&bytes)),
                );
            }
            "" => continue,
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Bad {name} part: {e}")))?;
                // Numeric form values arrive as text; keep numbers as
                // numbers so the engine sees OpenAI-shaped JSON.
                let value = text
                    .parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| text.parse::<f64>().map(Value::from))
                    .unwrap_or(Value::String(text));
                fields.insert(name, value);
            }
        }
    }

    Ok(Value::Object(fields))
}

/// POST /images/edits - prompt-guided image editing (multipart).
async fn edits(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let request = multipart_to_request(multipart).await?;
    Ok(Json(state.orchestrator.image_edits(&request).await?))
}

/// POST /images/variations - variations of an input image (multipart).
async fn variations(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>> {
    let request = multipart_to_request(multipart).await?;
    Ok(Json(state.orchestrator.image_variations(&request).await?))
}
