//! ryzenai-server engine: completion-family inference on the NPU.

use serde_json::Value;

use super::wrapped::{LaunchSpec, WrappedServer};
use super::{LoadContext, CHAT_UNARY_TIMEOUT_SECS};
use crate::backend::spec::spec_for_recipe;
use crate::error::Result;

pub struct RyzenAiServer {
    base: WrappedServer,
}

impl RyzenAiServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("ryzenai-llm").expect("ryzenai-llm spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let main = ctx.require_main()?;
        tracing::info!("Loading {} with ryzenai-server", ctx.model_name);

        let mut args = vec![
            "-m".to_string(),
            main.display().to_string(),
            "--port".to_string(),
            "{port}".to_string(),
            "--ctx-size".to_string(),
            ctx.options.get_u64("ctx_size", 4096).to_string(),
        ];
        if self.base.is_debug() {
            args.push("--verbose".to_string());
        }

        self.base
            .launch(
                &ctx.backend,
                LaunchSpec {
                    exe_path: ctx.exe_path.clone(),
                    args,
                    env: Vec::new(),
                    // The NPU warmup is slow; keep the probe chatter out of
                    // the logs.
                    filter_health_logs: true,
                },
            )
            .await
    }

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        self.base
            .forward_request("/v1/chat/completions", request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        self.base
            .forward_request("/v1/completions", request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        self.base
            .forward_request("/v1/responses", request, CHAT_UNARY_TIMEOUT_SECS)
            .await
    }
}
