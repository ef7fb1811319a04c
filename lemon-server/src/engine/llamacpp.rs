//! llama-server engine: chat, completions, embeddings and reranking over
//! GGUF models.

use serde_json::Value;

use super::wrapped::{LaunchSpec, WrappedServer};
use super::{LoadContext, CHAT_UNARY_TIMEOUT_SECS, EMBEDDINGS_TIMEOUT_SECS};
use crate::backend::spec::spec_for_recipe;
use crate::error::Result;

pub struct LlamaCppServer {
    base: WrappedServer,
}

impl LlamaCppServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("llamacpp").expect("llamacpp spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let main = ctx.require_main()?;
        tracing::info!(
            "Loading {} with llama-server, options: {}",
            ctx.model_name,
            ctx.options.to_log_string()
        );

        let mut args = vec![
            "-m".to_string(),
            main.display().to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            "{port}".to_string(),
            "-c".to_string(),
            ctx.options.get_u64("ctx_size", 4096).to_string(),
            "-ngl".to_string(),
            ctx.options.get_u64("gpu_layers", 99).to_string(),
            "--jinja".to_string(),
        ];

        if let Some(mmproj) = &ctx.mmproj_path {
            args.push("--mmproj".to_string());
            args.push(mmproj.display().to_string());
        }
        if ctx.info.embedding {
            args.push("--embedding".to_string());
        }
        if ctx.info.reranking {
            args.push("--reranking".to_string());
        }
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

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        self.base
            .forward_request("/v1/embeddings", request, EMBEDDINGS_TIMEOUT_SECS)
            .await
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        self.base
            .forward_request("/v1/rerank", request, EMBEDDINGS_TIMEOUT_SECS)
            .await
    }
}
