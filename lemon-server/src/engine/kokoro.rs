//! koko engine: text-to-speech synthesis.

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;

use super::wrapped::{LaunchSpec, WrappedServer};
use super::{LoadContext, AUDIO_TIMEOUT_SECS};
use crate::backend::spec::spec_for_recipe;
use crate::error::Result;

pub struct KokoroServer {
    base: WrappedServer,
}

impl KokoroServer {
    pub fn new(debug: bool, load_timeout_override: Option<u64>) -> Self {
        let spec = spec_for_recipe("kokoro").expect("kokoro spec is registered");
        Self {
            base: WrappedServer::new(spec, debug, load_timeout_override),
        }
    }

    pub fn base(&self) -> &WrappedServer {
        &self.base
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        let main = ctx.require_main()?;
        tracing::info!("Loading {} with koko", ctx.model_name);

        // Voice data sits next to the model file; koko resolves it from
        // the model directory.
        let mut args = vec![
            "-m".to_string(),
            main.display().to_string(),
            "--port".to_string(),
            "{port}".to_string(),
        ];
        if self.base.is_debug() {
            args.push("-v".to_string());
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

    /// Forward a speech request; the child answers binary audio which is
    /// streamed straight through.
    pub async fn speak(
        &self,
        request: &Value,
    ) -> Result<(String, impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>)> {
        self.base
            .forward_binary_request("/v1/audio/speech", request, AUDIO_TIMEOUT_SECS)
            .await
    }
}
