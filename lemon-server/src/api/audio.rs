//! Audio endpoints: transcription in, speech out.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use crate::engine::MultipartField;
use crate::error::{Error, Result};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/audio/transcriptions", post(transcriptions))
        .route("/audio/speech", post(speech))
}

/// POST /audio/transcriptions - speech to text (multipart, OpenAI shape:
/// a `file` part plus a `model` field).
async fn transcriptions(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut model: Option<String> = None;
    let mut fields: Vec<MultipartField> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidRequest(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("audio.wav").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Bad file part: {e}")))?;
                fields.push(MultipartField::file(
                    "file",
                    bytes.to_vec(),
                    &filename,
                    &content_type,
                ));
            }
            "model" => {
                model = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| Error::InvalidRequest(format!("Bad model part: {e}")))?,
                );
            }
            "" => continue,
            other => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidRequest(format!("Bad {other} part: {e}")))?;
                fields.push(MultipartField::text(other, text));
            }
        }
    }

    let model = model.ok_or_else(|| Error::InvalidRequest("model is required".to_string()))?;
    if !fields.iter().any(|f| f.name == "file") {
        return Err(Error::InvalidRequest("file is required".to_string()));
    }

    Ok(Json(
        state
            .orchestrator
            .audio_transcription(&model, fields)
            .await?,
    ))
}

/// POST /audio/speech - text to speech, answering binary audio.
async fn speech(
    State(state): State<Arc<AppState>>,
    Json(request): Json<Value>,
) -> Result<Response> {
    let (content_type, stream) = state.orchestrator.audio_speech(&request).await?;

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(stream))
        .expect("static response parts are valid"))
}
