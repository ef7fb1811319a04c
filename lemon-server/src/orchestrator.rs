//! Request orchestration: the pre-flight state machine and router.
//!
//! For an inference request naming model `M`, the fast path forwards to an
//! already-loaded engine whose (recipe, model, options fingerprint) match.
//! Otherwise pre-flight runs under the engine slot's load lock: ensure the
//! backend is installed, ensure the weights are on disk, swap out whatever
//! else occupies the slot, spawn and wait for readiness. At most one engine
//! instance exists per (recipe, backend) at any time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::Stream;
use lemon_common::Capability;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::backend::spec::{default_backend, get_spec, host_support, BackendSpec, InstallKind};
use crate::backend::version::Version;
use crate::backend::{flm, BackendManager};
use crate::config::Config;
use crate::engine::{Engine, LoadContext, MultipartField, RecipeOptions};
use crate::error::{Error, Result};
use crate::models::download::{self, HubClient};
use crate::models::{ModelInfo, ModelManager};
use crate::transfers::{TransferKind, TransferRegistry};

/// Stable fingerprint of a normalized load-option map. Keys are sorted by
/// the JSON map representation, and FNV-1a keeps the value identical
/// across processes.
pub fn options_fingerprint(options: &Map<String, Value>) -> String {
    let canonical = Value::Object(options.clone()).to_string();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in canonical.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    format!("{hash:016x}")
}

/// A live engine bound to one loaded model.
pub struct LoadedEngine {
    pub engine: Engine,
    pub recipe: String,
    pub backend: String,
    pub model_name: String,
    pub fingerprint: String,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

/// `/health` row for one loaded engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub recipe: String,
    pub backend: String,
    pub model: String,
    pub fingerprint: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub loaded_at: chrono::DateTime<chrono::Utc>,
}

/// Last-request token and timing counters for `/stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Stats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub time_to_first_token_ms: f64,
    pub tokens_per_second: f64,
}

type SlotKey = (String, String);

#[derive(Default)]
struct SlotEntry {
    load_lock: Arc<tokio::sync::Mutex<()>>,
    current: Option<Arc<LoadedEngine>>,
}

pub struct Orchestrator {
    config: Config,
    backends: Arc<BackendManager>,
    models: Arc<ModelManager>,
    hub: HubClient,
    transfers: Arc<TransferRegistry>,
    /// Held only for lookup and insertion, never across spawn or I/O.
    slots: Mutex<HashMap<SlotKey, SlotEntry>>,
    stats: Mutex<Stats>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        backends: Arc<BackendManager>,
        models: Arc<ModelManager>,
        transfers: Arc<TransferRegistry>,
    ) -> Self {
        Self::with_hub(config, backends, models, transfers, HubClient::new())
    }

    pub fn with_hub(
        config: Config,
        backends: Arc<BackendManager>,
        models: Arc<ModelManager>,
        transfers: Arc<TransferRegistry>,
        hub: HubClient,
    ) -> Self {
        Self {
            config,
            backends,
            models,
            hub,
            transfers,
            slots: Mutex::new(HashMap::new()),
            stats: Mutex::new(Stats::default()),
        }
    }

    pub fn models(&self) -> &ModelManager {
        &self.models
    }

    pub fn backends(&self) -> &BackendManager {
        &self.backends
    }

    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    pub fn transfers(&self) -> &TransferRegistry {
        &self.transfers
    }

    // ========================================================================
    // Slot bookkeeping
    // ========================================================================

    fn load_lock(&self, key: &SlotKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(key.clone()).or_default().load_lock.clone()
    }

    fn current(&self, key: &SlotKey) -> Option<Arc<LoadedEngine>> {
        let slots = self.slots.lock().unwrap();
        slots.get(key).and_then(|s| s.current.clone())
    }

    fn set_current(&self, key: &SlotKey, engine: Option<Arc<LoadedEngine>>) {
        let mut slots = self.slots.lock().unwrap();
        slots.entry(key.clone()).or_default().current = engine;
    }

    /// Fast-path match: same model, and either the caller sent no options
    /// (matches whatever is loaded) or the fingerprints agree.
    fn matching_engine(
        &self,
        key: &SlotKey,
        model_name: &str,
        fingerprint: Option<&str>,
    ) -> Option<Arc<LoadedEngine>> {
        let current = self.current(key)?;
        if current.model_name != model_name {
            return None;
        }
        match fingerprint {
            None => Some(current),
            Some(fp) if current.fingerprint == fp => Some(current),
            Some(_) => None,
        }
    }

    /// All currently-loaded engines, from the orchestrator's own view (no
    /// probing).
    pub async fn loaded_engines(&self) -> Vec<EngineSummary> {
        let engines: Vec<Arc<LoadedEngine>> = {
            let slots = self.slots.lock().unwrap();
            slots.values().filter_map(|s| s.current.clone()).collect()
        };

        let mut out = Vec::new();
        for loaded in engines {
            out.push(EngineSummary {
                recipe: loaded.recipe.clone(),
                backend: loaded.backend.clone(),
                model: loaded.model_name.clone(),
                fingerprint: loaded.fingerprint.clone(),
                port: loaded.engine.base().port(),
                pid: loaded.engine.base().pid().await,
                loaded_at: loaded.loaded_at,
            });
        }
        out.sort_by(|a, b| (&a.recipe, &a.backend).cmp(&(&b.recipe, &b.backend)));
        out
    }

    // ========================================================================
    // Load / unload entry points
    // ========================================================================

    /// Ensure `model_name` is loaded, returning the engine. `options`
    /// present forces a matching fingerprint (reloading on mismatch);
    /// absent options accept whatever is loaded.
    pub async fn ensure_loaded(
        &self,
        model_name: &str,
        options: Option<Map<String, Value>>,
        backend_override: Option<&str>,
    ) -> Result<Arc<LoadedEngine>> {
        let info = self
            .models
            .get(model_name)
            .ok_or_else(|| Error::ModelNotFound(model_name.to_string()))?;
        let spec = get_spec(&info.recipe)?;
        let backend = backend_override
            .map(|b| b.to_string())
            .unwrap_or_else(|| default_backend(spec).to_string());
        let key: SlotKey = (info.recipe.clone(), backend.clone());

        let requested_fp = options.as_ref().map(|o| options_fingerprint(o));
        if let Some(engine) = self.matching_engine(&key, model_name, requested_fp.as_deref()) {
            return Ok(engine);
        }

        // Serialize pre-flight per slot; a concurrent attempt gets "busy"
        // instead of queueing behind a long install.
        let load_lock = self.load_lock(&key);
        let Ok(_permit) = load_lock.try_lock() else {
            return Err(Error::Busy(format!(
                "{}:{} is already loading",
                key.0, key.1
            )));
        };

        if let Some(engine) = self.matching_engine(&key, model_name, requested_fp.as_deref()) {
            return Ok(engine);
        }

        if let Err(reason) = host_support(spec, &backend) {
            return Err(Error::UnsupportedBackend {
                recipe: info.recipe.clone(),
                backend,
                reason,
            });
        }

        if !self.backend_installed(spec, &backend).await {
            self.install_backend_tracked(&info.recipe, &backend).await?;
        }

        if !self.models.is_downloaded(&info) {
            self.pull_tracked(model_name, &info, false).await?;
        }

        // The slot holds at most one instance; unload happens-before the
        // next load under the slot lock.
        if let Some(previous) = self.current(&key) {
            tracing::info!(
                "Unloading {} to make room for {}",
                previous.model_name,
                model_name
            );
            previous.engine.unload().await;
            self.set_current(&key, None);
        }

        let options_map = options.unwrap_or_default();
        let loaded = self
            .spawn_engine(&info, model_name, &backend, options_map)
            .await?;
        let loaded = Arc::new(loaded);
        self.set_current(&key, Some(loaded.clone()));
        Ok(loaded)
    }

    async fn spawn_engine(
        &self,
        info: &ModelInfo,
        model_name: &str,
        backend: &str,
        options_map: Map<String, Value>,
    ) -> Result<LoadedEngine> {
        let fingerprint = options_fingerprint(&options_map);
        let ctx = self.load_context(info, model_name, backend, RecipeOptions::new(options_map))?;

        let engine = Engine::create(
            &info.recipe,
            self.config.is_debug(),
            self.config.engines.load_timeout_secs,
        )?;
        engine.load(&ctx).await?;

        Ok(LoadedEngine {
            engine,
            recipe: info.recipe.clone(),
            backend: backend.to_string(),
            model_name: model_name.to_string(),
            fingerprint,
            loaded_at: chrono::Utc::now(),
        })
    }

    fn load_context(
        &self,
        info: &ModelInfo,
        model_name: &str,
        backend: &str,
        options: RecipeOptions,
    ) -> Result<LoadContext> {
        let spec = get_spec(&info.recipe)?;

        let exe_path = if matches!(spec.install, InstallKind::VendorInstaller) {
            flm::find_executable().ok_or_else(|| Error::UnsupportedBackend {
                recipe: info.recipe.clone(),
                backend: backend.to_string(),
                reason: "executable not found after installation".to_string(),
            })?
        } else {
            self.backends
                .artifacts()
                .installed_executable(spec, backend)
                .map(|(_, exe)| exe)
                .ok_or_else(|| Error::Internal(format!(
                    "{}:{backend} executable missing after install",
                    info.recipe
                )))?
        };

        Ok(LoadContext {
            model_name: model_name.to_string(),
            info: info.clone(),
            exe_path,
            main_path: self.models.resolved_path(info, "main"),
            mmproj_path: self.models.resolved_path(info, "mmproj"),
            text_encoder_path: self.models.resolved_path(info, "text_encoder"),
            vae_path: self.models.resolved_path(info, "vae"),
            backend: backend.to_string(),
            options,
        })
    }

    async fn backend_installed(&self, spec: &'static BackendSpec, backend: &str) -> bool {
        if matches!(spec.install, InstallKind::VendorInstaller) {
            let Some(installed) = flm::installed_version().await else {
                return false;
            };
            let required = self
                .backends
                .required_version(spec.recipe, backend)
                .unwrap_or_default();
            return Version::parse(&installed).at_least(&Version::parse(&required))
                && flm::driver_version_ok().await;
        }

        match self.backends.artifacts().installed_executable(spec, backend) {
            Some((installed, _)) => {
                let required = self
                    .backends
                    .required_version(spec.recipe, backend)
                    .unwrap_or_default();
                Version::parse(&installed).at_least(&Version::parse(&required))
            }
            None => false,
        }
    }

    /// Backend install with a registered Transfer so the download tracker
    /// observes it.
    pub async fn install_backend_tracked(&self, recipe: &str, backend: &str) -> Result<()> {
        let display_name = format!("{recipe}:{backend}");
        let abort = self.transfers.begin(&display_name, TransferKind::Backend)?;

        let transfers = self.transfers.clone();
        let name = display_name.clone();
        let progress: crate::backend::artifact::ProgressCallback =
            Arc::new(move |bytes, total| transfers.record_progress(&name, bytes, total));

        let result = self
            .backends
            .install(recipe, backend, Some(abort), Some(progress))
            .await;
        self.transfers.finish(&display_name, &result);
        result
    }

    /// Model pull with a registered Transfer. `force` removes existing
    /// files first (model-invalidated recovery).
    pub async fn pull_tracked(&self, model_name: &str, info: &ModelInfo, force: bool) -> Result<()> {
        if force {
            let _ = self.models.delete(model_name);
        }

        let abort = self.transfers.begin(model_name, TransferKind::Model)?;
        let transfers = self.transfers.clone();
        let name = model_name.to_string();
        let progress: crate::backend::artifact::ProgressCallback =
            Arc::new(move |bytes, total| transfers.record_progress(&name, bytes, total));

        let result =
            download::pull_model(&self.models, &self.hub, info, abort, Some(progress)).await;
        self.transfers.finish(model_name, &result);
        result
    }

    /// Unload whatever engine currently serves `model_name`. Unknown
    /// models and not-loaded models are a no-op.
    pub async fn unload_model(&self, model_name: &str) {
        let keys: Vec<SlotKey> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .current
                        .as_ref()
                        .is_some_and(|c| c.model_name == model_name)
                })
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in keys {
            self.unload_slot(&key).await;
        }
    }

    pub async fn unload_all(&self) {
        let keys: Vec<SlotKey> = {
            let slots = self.slots.lock().unwrap();
            slots.keys().cloned().collect()
        };
        for key in keys {
            self.unload_slot(&key).await;
        }
    }

    async fn unload_slot(&self, key: &SlotKey) {
        let load_lock = self.load_lock(key);
        let _permit = load_lock.lock().await;
        if let Some(current) = self.current(key) {
            current.engine.unload().await;
            self.set_current(key, None);
        }
    }

    // ========================================================================
    // Inference entry points
    // ========================================================================

    fn model_from_request(&self, request: &Value) -> Result<(String, ModelInfo)> {
        let name = request
            .get("model")
            .and_then(|m| m.as_str())
            .ok_or_else(|| Error::InvalidRequest("model is required".to_string()))?;
        let info = self
            .models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        Ok((name.to_string(), info))
    }

    /// Capability gate, checked before any pre-flight side effect: an
    /// unsupported operation spawns nothing.
    fn check_capability(&self, info: &ModelInfo, capability: Capability, operation: &str) -> Result<()> {
        let spec = get_spec(&info.recipe)?;
        if !spec.supports(capability) {
            return Err(Error::unsupported_operation(operation, &info.recipe));
        }
        Ok(())
    }

    async fn engine_for(
        &self,
        request: &Value,
        capability: Capability,
        operation: &str,
    ) -> Result<(String, Arc<LoadedEngine>)> {
        let (name, info) = self.model_from_request(request)?;
        self.check_capability(&info, capability, operation)?;
        let engine = self.ensure_loaded(&name, None, None).await?;
        Ok((name, engine))
    }

    /// Recover from a model-invalidated answer: drop the engine, re-pull,
    /// reload. Used for exactly one retry.
    async fn recover_model(&self, name: &str) -> Result<Arc<LoadedEngine>> {
        tracing::warn!("{name} invalidated by engine; re-pulling once");
        let info = self
            .models
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        self.unload_model(name).await;
        self.pull_tracked(name, &info, true).await?;
        self.ensure_loaded(name, None, None).await
    }

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        let (name, engine) = self
            .engine_for(request, Capability::Completions, "Chat completion")
            .await?;
        let result = match engine.engine.chat_completion(request).await {
            Err(Error::ModelInvalidated(_)) => {
                let engine = self.recover_model(&name).await?;
                engine.engine.chat_completion(request).await
            }
            other => other,
        }?;
        self.record_completion(&result);
        Ok(result)
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        let (name, engine) = self
            .engine_for(request, Capability::Completions, "Text completion")
            .await?;
        let result = match engine.engine.completion(request).await {
            Err(Error::ModelInvalidated(_)) => {
                let engine = self.recover_model(&name).await?;
                engine.engine.completion(request).await
            }
            other => other,
        }?;
        self.record_completion(&result);
        Ok(result)
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        let (name, engine) = self
            .engine_for(request, Capability::Completions, "Responses")
            .await?;
        let result = match engine.engine.responses(request).await {
            Err(Error::ModelInvalidated(_)) => {
                let engine = self.recover_model(&name).await?;
                engine.engine.responses(request).await
            }
            other => other,
        }?;
        self.record_completion(&result);
        Ok(result)
    }

    /// Streaming completion-family forward; `child_path` is the child's
    /// endpoint for the requested flavor.
    pub async fn completion_stream(
        &self,
        child_path: &str,
        request: &Value,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>> {
        let (name, engine) = self
            .engine_for(request, Capability::Completions, "Streaming completion")
            .await?;
        match engine.engine.completion_stream(child_path, request).await {
            Err(Error::ModelInvalidated(_)) => {
                let engine = self.recover_model(&name).await?;
                engine.engine.completion_stream(child_path, request).await
            }
            other => other,
        }
    }

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        let (_, engine) = self
            .engine_for(request, Capability::Embeddings, "Embeddings")
            .await?;
        engine.engine.embeddings(request).await
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        let (_, engine) = self
            .engine_for(request, Capability::Reranking, "Reranking")
            .await?;
        engine.engine.reranking(request).await
    }

    pub async fn image_generations(&self, request: &Value) -> Result<Value> {
        let (_, engine) = self
            .engine_for(request, Capability::ImageGenerate, "Image generation")
            .await?;
        engine.engine.image_generations(request).await
    }

    pub async fn image_edits(&self, request: &Value) -> Result<Value> {
        let (_, engine) = self
            .engine_for(request, Capability::ImageEdit, "Image edits")
            .await?;
        engine.engine.image_edits(request).await
    }

    pub async fn image_variations(&self, request: &Value) -> Result<Value> {
        let (_, engine) = self
            .engine_for(request, Capability::ImageVariation, "Image variations")
            .await?;
        engine.engine.image_variations(request).await
    }

    pub async fn audio_transcription(
        &self,
        model_name: &str,
        fields: Vec<MultipartField>,
    ) -> Result<Value> {
        let info = self
            .models
            .get(model_name)
            .ok_or_else(|| Error::ModelNotFound(model_name.to_string()))?;
        self.check_capability(&info, Capability::AudioTranscribe, "Audio transcription")?;
        let engine = self.ensure_loaded(model_name, None, None).await?;
        engine.engine.audio_transcription(fields).await
    }

    pub async fn audio_speech(
        &self,
        request: &Value,
    ) -> Result<(String, impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>)> {
        let (_, engine) = self
            .engine_for(request, Capability::AudioSpeak, "Audio speech")
            .await?;
        engine.engine.audio_speech(request).await
    }

    // ========================================================================
    // Stats
    // ========================================================================

    fn record_completion(&self, response: &Value) {
        let mut stats = self.stats.lock().unwrap();
        stats.requests += 1;
        if let Some(usage) = response.get("usage") {
            stats.input_tokens = usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            stats.output_tokens = usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
        }
        // llama-server style timings, when present.
        if let Some(timings) = response.get("timings") {
            stats.time_to_first_token_ms = timings
                .get("prompt_ms")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            stats.tokens_per_second = timings
                .get("predicted_per_second")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_orchestrator() -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().join("cache");
        config.config_dir = dir.path().join("config");

        let backends = Arc::new(BackendManager::new(&config).unwrap());
        let models = Arc::new(
            ModelManager::new(config.models_dir(), config.user_models_path()).unwrap(),
        );
        let transfers = Arc::new(TransferRegistry::new());
        (
            Orchestrator::new(config, backends, models, transfers),
            dir,
        )
    }

    #[test]
    fn test_fingerprint_is_stable_and_order_insensitive() {
        let a: Map<String, Value> =
            serde_json::from_value(json!({"ctx": 2048, "temp": 0.5})).unwrap();
        let b: Map<String, Value> =
            serde_json::from_value(json!({"temp": 0.5, "ctx": 2048})).unwrap();
        assert_eq!(options_fingerprint(&a), options_fingerprint(&b));

        let c: Map<String, Value> = serde_json::from_value(json!({"ctx": 8192})).unwrap();
        assert_ne!(options_fingerprint(&a), options_fingerprint(&c));
    }

    #[test]
    fn test_fingerprint_empty_map() {
        let empty = Map::new();
        assert_eq!(options_fingerprint(&empty).len(), 16);
    }

    #[tokio::test]
    async fn test_unknown_model_is_not_found() {
        let (orchestrator, _dir) = test_orchestrator();
        let err = orchestrator
            .chat_completion(&json!({"model": "ghost", "messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_model_field_is_invalid() {
        let (orchestrator, _dir) = test_orchestrator();
        let err = orchestrator
            .chat_completion(&json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_capability_mismatch_spawns_nothing() {
        let (orchestrator, _dir) = test_orchestrator();
        // SDXL-Turbo-GGUF is an image model; chat must fail without any
        // engine appearing.
        let err = orchestrator
            .chat_completion(&json!({"model": "SDXL-Turbo-GGUF", "messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert!(orchestrator.loaded_engines().await.is_empty());
    }

    #[tokio::test]
    async fn test_audio_speech_on_text_model_is_unsupported() {
        let (orchestrator, _dir) = test_orchestrator();
        let err = orchestrator
            .audio_speech(&json!({"model": "Qwen3-0.6B-GGUF", "input": "hi"}))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn test_health_empty_initially() {
        let (orchestrator, _dir) = test_orchestrator();
        assert!(orchestrator.loaded_engines().await.is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_model_is_noop() {
        let (orchestrator, _dir) = test_orchestrator();
        orchestrator.unload_model("ghost").await;
        orchestrator.unload_all().await;
    }

    #[test]
    fn test_stats_record_from_response() {
        let (orchestrator, _dir) = test_orchestrator();
        orchestrator.record_completion(&json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 40},
            "timings": {"prompt_ms": 85.0, "predicted_per_second": 52.3}
        }));
        let stats = orchestrator.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.input_tokens, 12);
        assert_eq!(stats.output_tokens, 40);
        assert!((stats.tokens_per_second - 52.3).abs() < f64::EPSILON);
    }
}
