//! Model catalog and on-disk resolution.
//!
//! The gateway knows two kinds of models: the built-in catalog shipped as a
//! resource, and user registrations persisted in `user_models.json`. A
//! checkpoint string (`org/repo` with an optional `:variant`) maps to a
//! deterministic subtree under `<cache_root>/models`.

pub mod download;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const BUNDLED_MODELS: &str = include_str!("../../resources/server_models.json");

/// Catalog entry for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Hub repo plus optional `:variant` selecting one quantization.
    pub checkpoint: String,
    pub recipe: String,
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default)]
    pub vision: bool,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub reranking: bool,
    /// Multimodal projector filename for vision models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mmproj: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_encoder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vae: Option<String>,
}

impl ModelInfo {
    /// `(repo, variant)` halves of the checkpoint string.
    pub fn split_checkpoint(&self) -> (&str, Option<&str>) {
        match self.checkpoint.split_once(':') {
            Some((repo, variant)) => (repo, Some(variant)),
            None => (self.checkpoint.as_str(), None),
        }
    }

    pub fn repo(&self) -> &str {
        self.split_checkpoint().0
    }

    pub fn variant(&self) -> Option<&str> {
        self.split_checkpoint().1
    }

    fn aux_filename(&self, role: &str) -> Option<&str> {
        match role {
            "mmproj" => self.mmproj.as_deref(),
            "text_encoder" => self.text_encoder.as_deref(),
            "vae" => self.vae.as_deref(),
            _ => None,
        }
    }
}

/// Listing row for `/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub id: String,
    pub checkpoint: String,
    pub recipe: String,
    pub downloaded: bool,
    pub reasoning: bool,
    pub vision: bool,
    pub embedding: bool,
    pub reranking: bool,
}

/// Non-primary shards look like `…-00002-of-00003.gguf`; only the first
/// shard is handed to the engine.
fn is_non_primary_shard(filename: &str) -> bool {
    if let Some(pos) = filename.find("-of-") {
        let prefix = &filename[..pos];
        if let Some(dash_pos) = prefix.rfind('-') {
            let shard_num = &prefix[dash_pos + 1..];
            if shard_num.chars().all(|c| c.is_ascii_digit()) && shard_num != "00001" {
                return true;
            }
        }
    }
    false
}

fn is_weight_file(filename: &str) -> bool {
    let lower = filename.to_lowercase();
    [".gguf", ".bin", ".safetensors", ".onnx", ".pth"]
        .iter()
        .any(|ext| lower.ends_with(ext))
}

pub struct ModelManager {
    models_dir: PathBuf,
    user_models_path: PathBuf,
    builtin: BTreeMap<String, ModelInfo>,
    user: Mutex<BTreeMap<String, ModelInfo>>,
}

impl ModelManager {
    pub fn new(models_dir: PathBuf, user_models_path: PathBuf) -> Result<Self> {
        let builtin: BTreeMap<String, ModelInfo> = serde_json::from_str(BUNDLED_MODELS)
            .map_err(|e| Error::Internal(format!("Malformed bundled model catalog: {e}")))?;

        let user = if user_models_path.exists() {
            let raw = std::fs::read_to_string(&user_models_path)
                .map_err(|e| Error::Internal(format!("Failed to read user models: {e}")))?;
            serde_json::from_str(&raw)
                .map_err(|e| Error::Internal(format!("Malformed user_models.json: {e}")))?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            models_dir,
            user_models_path,
            builtin,
            user: Mutex::new(user),
        })
    }

    pub fn get(&self, name: &str) -> Option<ModelInfo> {
        if let Some(info) = self.user.lock().unwrap().get(name) {
            return Some(info.clone());
        }
        self.builtin.get(name).cloned()
    }

    /// Persist a user registration. Written before the first download
    /// progress event, so a cancelled pull still leaves the model
    /// registered as not-downloaded.
    pub fn register_user_model(&self, name: &str, info: ModelInfo) -> Result<()> {
        let snapshot = {
            let mut user = self.user.lock().unwrap();
            user.insert(name.to_string(), info);
            user.clone()
        };

        if let Some(parent) = self.user_models_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("Failed to create config dir: {e}")))?;
        }
        let raw = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| Error::Internal(format!("Failed to serialize user models: {e}")))?;
        std::fs::write(&self.user_models_path, raw)
            .map_err(|e| Error::Internal(format!("Failed to write user_models.json: {e}")))?;
        Ok(())
    }

    /// Known + downloaded models. Without `show_all`, only downloaded
    /// models are listed.
    pub fn list(&self, show_all: bool) -> Vec<ModelSummary> {
        let user = self.user.lock().unwrap();
        let mut out = Vec::new();
        // A user registration shadows a builtin entry of the same name.
        let builtin = self
            .builtin
            .iter()
            .filter(|(name, _)| !user.contains_key(*name));
        for (name, info) in builtin.chain(user.iter()) {
            let downloaded = self.is_downloaded(info);
            if !show_all && !downloaded {
                continue;
            }
            out.push(ModelSummary {
                id: name.clone(),
                checkpoint: info.checkpoint.clone(),
                recipe: info.recipe.clone(),
                downloaded,
                reasoning: info.reasoning,
                vision: info.vision,
                embedding: info.embedding,
                reranking: info.reranking,
            });
        }
        out
    }

    /// The deterministic on-disk subtree for a checkpoint.
    pub fn checkpoint_dir(&self, info: &ModelInfo) -> PathBuf {
        let (repo, _) = info.split_checkpoint();
        let mut dir = self.models_dir.clone();
        for part in repo.split('/') {
            dir.push(part);
        }
        dir
    }

    pub fn is_downloaded(&self, info: &ModelInfo) -> bool {
        // FLM keeps its own model store; the gateway asks the CLI instead
        // of the filesystem, and treats presence of any resolved path as
        // downloaded when the CLI is unavailable.
        if info.recipe == "flm" {
            return download::flm_model_present(info);
        }
        let main = self.resolved_path(info, "main");
        let aux_ok = ["mmproj", "text_encoder", "vae"].iter().all(|role| {
            info.aux_filename(role).is_none() || self.resolved_path(info, role).is_some()
        });
        main.is_some() && aux_ok
    }

    /// On-disk path for a named role (`main`, `mmproj`, `text_encoder`,
    /// `vae`), or `None` when the role is absent or not yet downloaded.
    pub fn resolved_path(&self, info: &ModelInfo, role: &str) -> Option<PathBuf> {
        let dir = self.checkpoint_dir(info);

        if role != "main" {
            let filename = info.aux_filename(role)?;
            let path = find_file(&dir, |name| name == filename)?;
            return Some(path);
        }

        let variant = info.variant().map(|v| v.to_lowercase());
        let aux_names: Vec<&str> = ["mmproj", "text_encoder", "vae"]
            .iter()
            .filter_map(|r| info.aux_filename(r))
            .collect();

        find_file(&dir, |name| {
            if !is_weight_file(name) || is_non_primary_shard(name) {
                return false;
            }
            if aux_names.iter().any(|aux| *aux == name) {
                return false;
            }
            match &variant {
                Some(v) => name.to_lowercase().contains(v),
                None => true,
            }
        })
    }

    /// Remove a model's files. The registration, if any, stays.
    pub fn delete(&self, name: &str) -> Result<()> {
        let info = self
            .get(name)
            .ok_or_else(|| Error::ModelNotFound(name.to_string()))?;
        let dir = self.checkpoint_dir(&info);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::Internal(format!("Failed to delete {}: {e}", dir.display())))?;
            tracing::info!("Deleted model files at {}", dir.display());
        }
        Ok(())
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }
}

/// Depth-first search for the first file whose name satisfies the
/// predicate. Directories sort before evaluation for determinism.
fn find_file<F: Fn(&str) -> bool + Copy>(dir: &Path, pred: F) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut files: Vec<PathBuf> = Vec::new();
    let mut subdirs: Vec<PathBuf> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else {
            files.push(path);
        }
    }
    files.sort();
    subdirs.sort();

    for file in files {
        if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
            if pred(name) {
                return Some(file);
            }
        }
    }
    subdirs.iter().find_map(|d| find_file(d, pred))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_tempdir() -> (ModelManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(
            dir.path().join("models"),
            dir.path().join("config").join("user_models.json"),
        )
        .unwrap();
        (manager, dir)
    }

    fn put_file(manager: &ModelManager, info: &ModelInfo, name: &str) {
        let dir = manager.checkpoint_dir(info);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(name), b"weights").unwrap();
    }

    #[test]
    fn test_bundled_catalog_parses() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen3-4B-Instruct-GGUF").unwrap();
        assert_eq!(info.recipe, "llamacpp");
        assert_eq!(info.variant(), Some("Q4_K_M"));
        assert!(manager.get("no-such-model").is_none());
    }

    #[test]
    fn test_checkpoint_split() {
        let info = ModelInfo {
            checkpoint: "org/repo:Q4_K_M".to_string(),
            recipe: "llamacpp".to_string(),
            reasoning: false,
            vision: false,
            embedding: false,
            reranking: false,
            mmproj: None,
            text_encoder: None,
            vae: None,
        };
        assert_eq!(info.repo(), "org/repo");
        assert_eq!(info.variant(), Some("Q4_K_M"));
    }

    #[test]
    fn test_resolved_path_matches_variant() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen3-0.6B-GGUF").unwrap();
        put_file(&manager, &info, "Qwen3-0.6B-Q4_K_M.gguf");
        put_file(&manager, &info, "Qwen3-0.6B-Q8_0.gguf");

        let main = manager.resolved_path(&info, "main").unwrap();
        assert!(main.to_string_lossy().contains("Q4_K_M"));
    }

    #[test]
    fn test_resolved_path_skips_non_primary_shards() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen3-0.6B-GGUF").unwrap();
        put_file(&manager, &info, "Qwen3-0.6B-Q4_K_M-00002-of-00002.gguf");
        put_file(&manager, &info, "Qwen3-0.6B-Q4_K_M-00001-of-00002.gguf");

        let main = manager.resolved_path(&info, "main").unwrap();
        assert!(main.to_string_lossy().contains("00001-of-00002"));
    }

    #[test]
    fn test_resolved_path_aux_roles() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen2.5-VL-7B-Instruct-GGUF").unwrap();
        put_file(&manager, &info, "Qwen2.5-VL-7B-Instruct-Q4_K_M.gguf");
        put_file(&manager, &info, "mmproj-Qwen2.5-VL-7B-Instruct-f16.gguf");

        assert!(manager.resolved_path(&info, "mmproj").is_some());
        assert!(manager.resolved_path(&info, "vae").is_none());

        // The main role never resolves to the projector file.
        let main = manager.resolved_path(&info, "main").unwrap();
        assert!(!main.to_string_lossy().contains("mmproj"));
    }

    #[test]
    fn test_is_downloaded_requires_aux_files() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen2.5-VL-7B-Instruct-GGUF").unwrap();
        put_file(&manager, &info, "Qwen2.5-VL-7B-Instruct-Q4_K_M.gguf");
        assert!(!manager.is_downloaded(&info));

        put_file(&manager, &info, "mmproj-Qwen2.5-VL-7B-Instruct-f16.gguf");
        assert!(manager.is_downloaded(&info));
    }

    #[test]
    fn test_list_show_all_toggle() {
        let (manager, _dir) = manager_with_tempdir();
        assert!(manager.list(false).is_empty());

        let all = manager.list(true);
        assert!(!all.is_empty());
        assert!(all.iter().all(|m| !m.downloaded));
    }

    #[test]
    fn test_user_registration_persists_and_overrides() {
        let (manager, dir) = manager_with_tempdir();
        let info = ModelInfo {
            checkpoint: "me/custom-model:Q5_K_M".to_string(),
            recipe: "llamacpp".to_string(),
            reasoning: false,
            vision: false,
            embedding: false,
            reranking: false,
            mmproj: None,
            text_encoder: None,
            vae: None,
        };
        manager.register_user_model("my-model", info).unwrap();
        assert!(manager.get("my-model").is_some());

        // Registration survives a reload.
        let reloaded = ModelManager::new(
            dir.path().join("models"),
            dir.path().join("config").join("user_models.json"),
        )
        .unwrap();
        assert_eq!(
            reloaded.get("my-model").unwrap().checkpoint,
            "me/custom-model:Q5_K_M"
        );
    }

    #[test]
    fn test_delete_removes_files_keeps_registration() {
        let (manager, _dir) = manager_with_tempdir();
        let info = manager.get("Qwen3-0.6B-GGUF").unwrap();
        put_file(&manager, &info, "Qwen3-0.6B-Q4_K_M.gguf");
        assert!(manager.is_downloaded(&info));

        manager.delete("Qwen3-0.6B-GGUF").unwrap();
        assert!(!manager.is_downloaded(&info));
        assert!(manager.get("Qwen3-0.6B-GGUF").is_some());
    }

    #[test]
    fn test_delete_unknown_model() {
        let (manager, _dir) = manager_with_tempdir();
        assert!(matches!(
            manager.delete("ghost"),
            Err(Error::ModelNotFound(_))
        ));
    }

    #[test]
    fn test_is_non_primary_shard() {
        assert!(!is_non_primary_shard("model-00001-of-00002.gguf"));
        assert!(is_non_primary_shard("model-00002-of-00002.gguf"));
        assert!(is_non_primary_shard("model-00003-of-00005.gguf"));
        assert!(!is_non_primary_shard("model.gguf"));
    }
}
