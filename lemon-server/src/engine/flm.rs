//! FastFlowLM engine: the vendor-installed NPU runtime.
//!
//! FLM addresses models by checkpoint, not by the gateway's model name, so
//! forwarded request bodies get their `model` field rewritten before they
//! reach the child.

use std::sync::Mutex;

use serde_json::Value;

use super::wrapped::{LaunchSpec, WrappedServer};
use super::{LoadContext, CHAT_UNARY_TIMEOUT_SECS, EMBEDDINGS_TIMEOUT_SECS};
use crate::backend::flm as vendor;
use crate::backend::spec::spec_for_recipe;
use crate::error::{Error, Result};

pub struct FlmServer {
    base: WrappedServer,
    checkpoint: Mutex<String>,
}

impl FlmServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("flm").expect("flm spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
            checkpoint: Mutex::new(String::new()),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    /// Copy of the request with `model` rewritten to the loaded
    /// checkpoint.
    pub fn with_checkpoint_model(&self, request: &Value) -> Value {
        let mut out = request.clone();
        let checkpoint = self.checkpoint.lock().unwrap().clone();
        if !checkpoint.is_empty() {
            if let Some(obj) = out.as_object_mut() {
                obj.insert("model".to_string(), Value::String(checkpoint));
            }
        }
        out
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let exe = vendor::find_executable().ok_or_else(|| Error::UnsupportedBackend {
            recipe: "flm".to_string(),
            backend: ctx.backend.clone(),
            reason: "flm executable not found on PATH".to_string(),
        })?;

        *self.checkpoint.lock().unwrap() = ctx.info.checkpoint.clone();
        tracing::info!(
            "Loading {} ({}) with flm",
            ctx.model_name,
            ctx.info.checkpoint
        );

        let args = vec![
            "serve".to_string(),
            ctx.info.checkpoint.clone(),
            "--port".to_string(),
            "{port}".to_string(),
        ];

        self.base
            .launch(
                &ctx.backend,
                LaunchSpec {
                    exe_path: exe,
                    args,
                    env: Vec::new(),
                    filter_health_logs: true,
                },
            )
            .await
    }

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        let request = self.with_checkpoint_model(request);
        self.base
            .forward_request("/v1/chat/completions", &request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        let request = self.with_checkpoint_model(request);
        self.base
            .forward_request("/v1/completions", &request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        let request = self.with_checkpoint_model(request);
        self.base
            .forward_request("/v1/responses", &request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        let request = self.with_checkpoint_model(request);
        self.base
            .forward_request("/v1/embeddings", &request, EMBEDDINGS_TIMEOUT_SECS)
            .await
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        let request = self.with_checkpoint_model(request);
        self.base
            .forward_request("/v1/rerank", &request, EMBEDDINGS_TIMEOUT_SECS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_rewrite_uses_checkpoint() {
        let server = FlmServer::new(false, None);
        *server.checkpoint.lock().unwrap() = "qwen3:4b".to_string();

        let request = json!({"model": "Qwen3-4B-FLM", "messages": []});
        let rewritten = server.with_checkpoint_model(&request);
        assert_eq!(rewritten["model"], json!("qwen3:4b"));
        // Original is untouched.
        assert_eq!(request["model"], json!("Qwen3-4B-FLM"));
    }

    #[test]
    fn test_model_rewrite_before_load_is_identity() {
        let server = FlmServer::new(false, None);
        let request = json!({"model": "x"});
        assert_eq!(server.with_checkpoint_model(&request), request);
    }
}
