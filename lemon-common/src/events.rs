//! Line-framed progress event protocol.
//!
//! Install and pull streams carry server-sent-event frames:
//!
//! ```text
//! event:progress
//! data:{"bytes_received":1024,"total_bytes":4096,"percent":25.0,"display_name":"llamacpp:vulkan"}
//!
//! ```
//!
//! A frame is an optional `event:` line, a `data:` line, and a blank
//! terminator. `progress` frames repeat until a terminal `complete` or
//! `error` frame ends the stream. Completion is defined by the `complete`
//! frame, not by transport EOF: a consumer that has seen `complete` must
//! treat any subsequent transport error as success.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default event name when a `data:` line arrives without a preceding
/// `event:` line (or after a blank-line reset).
const DEFAULT_EVENT: &str = "progress";

/// Payload of a `progress` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub bytes_received: u64,
    /// Zero when the transport withholds the size.
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default)]
    pub percent: f32,
    #[serde(default)]
    pub display_name: String,
}

impl ProgressEvent {
    pub fn new(bytes_received: u64, total_bytes: u64, display_name: &str) -> Self {
        let percent = if total_bytes > 0 {
            (bytes_received as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };
        Self {
            bytes_received,
            total_bytes,
            percent,
            display_name: display_name.to_string(),
        }
    }
}

/// A parsed frame from an install/pull stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Complete(Value),
    /// A non-standard event name; carried through for forward compatibility.
    Other { event: String, data: Value },
}

/// Raised by the parser when the stream carries a terminal `error` frame.
#[derive(Debug, thiserror::Error)]
pub enum StreamProtocolError {
    #[error("{0}")]
    Server(String),
}

/// Write one frame in the wire format.
pub fn format_frame(event: &str, data: &Value) -> String {
    format!("event:{}\ndata:{}\n\n", event, data)
}

/// Incremental consumer-side parser for the event frames.
///
/// Feed it one line at a time (without the trailing newline):
/// - `event:` sets the event name for the next `data:` line.
/// - `data:` yields a [`StreamEvent`], or raises for `error` frames.
/// - a blank line resets the event name back to `progress`.
/// - malformed JSON on a non-`error` frame is logged and skipped; the
///   stream continues.
#[derive(Debug, Default)]
pub struct EventFrameParser {
    current_event: Option<String>,
}

impl EventFrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(
        &mut self,
        line: &str,
    ) -> Result<Option<StreamEvent>, StreamProtocolError> {
        if line.is_empty() {
            self.current_event = None;
            return Ok(None);
        }

        if let Some(name) = line.strip_prefix("event:") {
            self.current_event = Some(name.trim().to_string());
            return Ok(None);
        }

        let Some(payload) = line.strip_prefix("data:") else {
            // Comment lines and unknown fields are ignored per SSE rules.
            return Ok(None);
        };

        let event = self
            .current_event
            .as_deref()
            .unwrap_or(DEFAULT_EVENT)
            .to_string();

        let data: Value = match serde_json::from_str(payload.trim()) {
            Ok(v) => v,
            Err(e) => {
                if event == "error" {
                    // An unparseable error frame still terminates the stream.
                    return Err(StreamProtocolError::Server(payload.trim().to_string()));
                }
                tracing::warn!(event = %event, "skipping malformed event payload: {e}");
                return Ok(None);
            }
        };

        match event.as_str() {
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown stream error")
                    .to_string();
                Err(StreamProtocolError::Server(message))
            }
            "complete" => Ok(Some(StreamEvent::Complete(data))),
            "progress" => match serde_json::from_value::<ProgressEvent>(data.clone()) {
                Ok(p) => Ok(Some(StreamEvent::Progress(p))),
                Err(e) => {
                    tracing::warn!("skipping malformed progress payload: {e}");
                    Ok(None)
                }
            },
            _ => Ok(Some(StreamEvent::Other { event, data })),
        }
    }
}
