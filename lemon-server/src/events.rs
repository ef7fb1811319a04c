//! Server-sent-event plumbing for install and pull streams.
//!
//! A worker task drives an [`EventSender`]; frames flow through an
//! unbounded channel into the response body. The terminal `complete` or
//! `error` frame is emitted from the worker's result, after which the
//! channel closes and the stream ends.

use std::convert::Infallible;

use axum::body::Body;
use axum::http::header;
use axum::response::Response;
use bytes::Bytes;
use lemon_common::events::{format_frame, ProgressEvent};
use serde_json::json;
use tokio::sync::mpsc;

use crate::error::Error;

#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<String>,
    display_name: String,
}

impl EventSender {
    pub fn progress(&self, bytes_received: u64, total_bytes: u64) {
        let event = ProgressEvent::new(bytes_received, total_bytes, &self.display_name);
        let data = serde_json::to_value(&event).unwrap_or_default();
        let _ = self.tx.send(format_frame("progress", &data));
    }

    pub fn complete(&self) {
        let _ = self.tx.send(format_frame("complete", &json!({})));
    }

    pub fn error(&self, error: &Error) {
        let _ = self
            .tx
            .send(format_frame("error", &json!({ "error": error.to_string() })));
    }
}

/// Run `work` in the background and answer with its event stream.
///
/// The HTTP status is committed before the outcome is known, so failures
/// surface as the terminal `error` frame; anything that can be rejected
/// up front should be checked before calling this.
pub fn sse_response<F, Fut>(display_name: String, work: F) -> Response
where
    F: FnOnce(EventSender) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = crate::error::Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let sender = EventSender { tx, display_name };

    tokio::spawn(async move {
        let result = work(sender.clone()).await;
        match result {
            Ok(()) => sender.complete(),
            Err(e) => {
                tracing::warn!("{}: {e}", sender.display_name);
                sender.error(&e);
            }
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<Bytes, Infallible>(Bytes::from(frame)), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static response parts are valid")
}
