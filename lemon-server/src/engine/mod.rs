//! Inference engines.
//!
//! Every engine wraps one child server process behind [`WrappedServer`].
//! The set is closed and statically known, so dispatch is an enum: an
//! operation a variant doesn't serve answers `UnsupportedOperation`
//! without touching the child.

pub mod flm;
pub mod kokoro;
pub mod llamacpp;
pub mod ryzenai;
pub mod sd;
pub mod whispercpp;
pub mod wrapped;

use std::path::PathBuf;

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::models::ModelInfo;
pub use wrapped::{MultipartField, WrappedServer};

/// Forward timeouts per endpoint family.
pub const CHAT_UNARY_TIMEOUT_SECS: u64 = 30;
pub const EMBEDDINGS_TIMEOUT_SECS: u64 = 120;
pub const IMAGE_TIMEOUT_SECS: u64 = 600;
pub const AUDIO_TIMEOUT_SECS: u64 = 600;

/// Per-model load options from the request body.
#[derive(Debug, Clone, Default)]
pub struct RecipeOptions(Map<String, Value>);

impl RecipeOptions {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.0.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
    }

    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    pub fn to_log_string(&self) -> String {
        if self.0.is_empty() {
            return "(defaults)".to_string();
        }
        self.0
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Everything a concrete engine needs to build its argv.
pub struct LoadContext {
    pub model_name: String,
    pub info: ModelInfo,
    pub exe_path: PathBuf,
    pub main_path: Option<PathBuf>,
    pub mmproj_path: Option<PathBuf>,
    pub text_encoder_path: Option<PathBuf>,
    pub vae_path: Option<PathBuf>,
    pub backend: String,
    pub options: RecipeOptions,
}

impl LoadContext {
    pub fn require_main(&self) -> Result<&PathBuf> {
        self.main_path.as_ref().ok_or_else(|| {
            Error::ModelNotFound(format!(
                "Model file not found for checkpoint {}",
                self.info.checkpoint
            ))
        })
    }
}

/// The closed set of engines.
pub enum Engine {
    LlamaCpp(llamacpp::LlamaCppServer),
    WhisperCpp(whispercpp::WhisperServer),
    SdCpp(sd::SdServer),
    Kokoro(kokoro::KokoroServer),
    RyzenAi(ryzenai::RyzenAiServer),
    Flm(flm::FlmServer),
}

impl Engine {
    pub fn create(recipe: &str, debug: bool, load_timeout_override: Option<u64>) -> Result<Self> {
        Ok(match recipe {
            "llamacpp" => {
                Engine::LlamaCpp(llamacpp::LlamaCppServer::new(debug, load_timeout_override))
            }
            "whispercpp" => {
                Engine::WhisperCpp(whispercpp::WhisperServer::new(debug, load_timeout_override))
            }
            "sd-cpp" => Engine::SdCpp(sd::SdServer::new(debug, load_timeout_override)),
            "kokoro" => Engine::Kokoro(kokoro::KokoroServer::new(debug, load_timeout_override)),
            "ryzenai-llm" => {
                Engine::RyzenAi(ryzenai::RyzenAiServer::new(debug, load_timeout_override))
            }
            "flm" => Engine::Flm(flm::FlmServer::new(debug, load_timeout_override)),
            other => return Err(Error::InvalidRequest(format!("Unknown recipe: {other}"))),
        })
    }

    pub fn base(&self) -> &WrappedServer {
        match self {
            Engine::LlamaCpp(s) => s.base(),
            Engine::WhisperCpp(s) => s.base(),
            Engine::SdCpp(s) => s.base(),
            Engine::Kokoro(s) => s.base(),
            Engine::RyzenAi(s) => s.base(),
            Engine::Flm(s) => s.base(),
        }
    }

    pub fn recipe(&self) -> &'static str {
        self.base().recipe()
    }

    pub async fn load(&self, ctx: &LoadContext) -> Result<()> {
        match self {
            Engine::LlamaCpp(s) => s.load(ctx).await,
            Engine::WhisperCpp(s) => s.load(ctx).await,
            Engine::SdCpp(s) => s.load(ctx).await,
            Engine::Kokoro(s) => s.load(ctx).await,
            Engine::RyzenAi(s) => s.load(ctx).await,
            Engine::Flm(s) => s.load(ctx).await,
        }
    }

    pub async fn unload(&self) {
        self.base().unload().await;
    }

    fn unsupported(&self, operation: &str) -> Error {
        Error::unsupported_operation(operation, self.recipe())
    }

    // ========================================================================
    // Completion family
    // ========================================================================

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::LlamaCpp(s) => s.chat_completion(request).await,
            Engine::RyzenAi(s) => s.chat_completion(request).await,
            Engine::Flm(s) => s.chat_completion(request).await,
            _ => Err(self.unsupported("Chat completion")),
        }
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::LlamaCpp(s) => s.completion(request).await,
            Engine::RyzenAi(s) => s.completion(request).await,
            Engine::Flm(s) => s.completion(request).await,
            _ => Err(self.unsupported("Text completion")),
        }
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::LlamaCpp(s) => s.responses(request).await,
            Engine::RyzenAi(s) => s.responses(request).await,
            Engine::Flm(s) => s.responses(request).await,
            _ => Err(self.unsupported("Responses")),
        }
    }

    /// Streaming forward for the completion family. `path` is the child's
    /// endpoint; SSE frames pass through unmodified.
    pub async fn completion_stream(
        &self,
        path: &str,
        request: &Value,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>> {
        match self {
            Engine::LlamaCpp(s) => s.base().forward_streaming_request(path, request).await,
            Engine::RyzenAi(s) => s.base().forward_streaming_request(path, request).await,
            Engine::Flm(s) => {
                let transformed = s.with_checkpoint_model(request);
                s.base().forward_streaming_request(path, &transformed).await
            }
            _ => Err(self.unsupported("Streaming completion")),
        }
    }

    // ========================================================================
    // Embeddings / reranking
    // ========================================================================

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::LlamaCpp(s) => s.embeddings(request).await,
            Engine::Flm(s) => s.embeddings(request).await,
            _ => Err(self.unsupported("Embeddings")),
        }
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::LlamaCpp(s) => s.reranking(request).await,
            Engine::Flm(s) => s.reranking(request).await,
            _ => Err(self.unsupported("Reranking")),
        }
    }

    // ========================================================================
    // Images
    // ========================================================================

    pub async fn image_generations(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::SdCpp(s) => s.image_generations(request).await,
            _ => Err(self.unsupported("Image generation")),
        }
    }

    pub async fn image_edits(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::SdCpp(s) => s.image_edits(request).await,
            _ => Err(self.unsupported("Image edits")),
        }
    }

    pub async fn image_variations(&self, request: &Value) -> Result<Value> {
        match self {
            Engine::SdCpp(s) => s.image_variations(request).await,
            _ => Err(self.unsupported("Image variations")),
        }
    }

    // ========================================================================
    // Audio
    // ========================================================================

    pub async fn audio_transcription(&self, fields: Vec<MultipartField>) -> Result<Value> {
        match self {
            Engine::WhisperCpp(s) => s.transcribe(fields).await,
            _ => Err(self.unsupported("Audio transcription")),
        }
    }

    pub async fn audio_speech(
        &self,
        request: &Value,
    ) -> Result<(String, impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>)> {
        match self {
            Engine::Kokoro(s) => s.speak(request).await,
            _ => Err(self.unsupported("Audio speech")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recipe_options_accessors() {
        let mut map = Map::new();
        map.insert("ctx_size".into(), json!(8192));
        map.insert("cfg_scale".into(), json!(7.5));
        map.insert("sd-cpp_backend".into(), json!("rocm"));
        let options = RecipeOptions::new(map);

        assert_eq!(options.get_u64("ctx_size", 4096), 8192);
        assert_eq!(options.get_u64("missing", 4096), 4096);
        assert!((options.get_f64("cfg_scale", 1.0) - 7.5).abs() < f64::EPSILON);
        assert_eq!(options.get_str("sd-cpp_backend"), Some("rocm"));
    }

    #[test]
    fn test_recipe_options_log_string() {
        assert_eq!(RecipeOptions::default().to_log_string(), "(defaults)");
        let mut map = Map::new();
        map.insert("ctx_size".into(), json!(2048));
        assert_eq!(RecipeOptions::new(map).to_log_string(), "ctx_size=2048");
    }

    #[tokio::test]
    async fn test_unsupported_operations_by_variant() {
        let sd = Engine::create("sd-cpp", false, None).unwrap();
        let err = sd.chat_completion(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert!(err.to_string().contains("sd-cpp"));

        let llama = Engine::create("llamacpp", false, None).unwrap();
        let err = llama.image_generations(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));

        let whisper = Engine::create("whispercpp", false, None).unwrap();
        let err = whisper.embeddings(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_create_unknown_recipe() {
        assert!(Engine::create("ollama", false, None).is_err());
    }
}
