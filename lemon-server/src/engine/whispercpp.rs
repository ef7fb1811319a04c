//! whisper-server engine: speech-to-text transcription.

use serde_json::Value;

use super::wrapped::{LaunchSpec, MultipartField, WrappedServer};
use super::{LoadContext, AUDIO_TIMEOUT_SECS};
use crate::backend::spec::spec_for_recipe;
use crate::error::Result;

pub struct WhisperServer {
    base: WrappedServer,
}

impl WhisperServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("whispercpp").expect("whispercpp spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let main = ctx.require_main()?;
        tracing::info!("Loading {} with whisper-server", ctx.model_name);

        let mut args = vec![
            "-m".to_string(),
            main.display().to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--port".to_string(),
            "{port}".to_string(),
            // Accept non-wav uploads; the server converts internally.
            "--convert".to_string(),
        ];
        if self.base.is_debug() {
            args.push("--print-progress".to_string());
        }

        self.base
            .launch(
                &ctx.backend,
                LaunchSpec {
                    exe_path: ctx.exe_path.clone(),
                    args,
                    env: Vec::new(),
                    filter_health_logs: false,
                },
            )
            .await
    }

    /// Forward a transcription as multipart; whisper-server answers
    /// `{"text": …}` which is passed through verbatim.
    pub async fn transcribe(&self, fields: Vec<MultipartField>) -> Result<Value> {
        self.base
            .forward_multipart_request("/inference", fields, AUDIO_TIMEOUT_SECS)
            .await
    }
}
