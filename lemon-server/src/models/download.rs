//! Model weight downloads from the hub.
//!
//! A pull streams every file the checkpoint needs into the model's
//! directory, emitting cumulative progress. Files land as `.part` and are
//! renamed when complete, so resume can skip finished shards by comparing
//! on-disk size against the hub-reported size. Pause keeps partials on
//! disk; cancel removes the in-flight one.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::backend::artifact::ProgressCallback;
use crate::backend::flm;
use crate::error::{AbortReason, Error, Result};
use crate::models::{ModelInfo, ModelManager};
use crate::transfers::AbortFlag;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(33);

pub struct HubClient {
    client: reqwest::Client,
    base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubFile {
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    size: u64,
}

impl Default for HubClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    pub fn new() -> Self {
        Self::with_base("https://huggingface.co".to_string())
    }

    /// Base URL override for tests.
    pub fn with_base(base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn list_files(&self, repo: &str) -> Result<Vec<HubFile>> {
        let url = format!("{}/api/models/{repo}/tree/main?recursive=true", self.base);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("Failed to list {repo}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::ModelNotFound(repo.to_string()));
        }
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "Listing {repo} failed with status {}",
                response.status()
            )));
        }

        let entries: Vec<TreeEntry> = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("Malformed tree listing for {repo}: {e}")))?;

        Ok(entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .map(|e| HubFile {
                path: e.path,
                size: e.size,
            })
            .collect())
    }

    fn file_url(&self, repo: &str, path: &str) -> String {
        format!("{}/{repo}/resolve/main/{path}", self.base)
    }
}

/// Pick the files a checkpoint actually needs from the repo tree.
///
/// With a variant, only weight files matching it are taken (plus any named
/// auxiliary files); without one, everything except repo housekeeping.
pub fn select_files(info: &ModelInfo, files: &[HubFile]) -> Vec<HubFile> {
    let variant = info.variant().map(|v| v.to_lowercase());
    let aux: Vec<&str> = [
        info.mmproj.as_deref(),
        info.text_encoder.as_deref(),
        info.vae.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    files
        .iter()
        .filter(|f| {
            let basename = f.path.rsplit('/').next().unwrap_or(&f.path);
            if f.path.split('/').any(|part| part.starts_with('.')) {
                return false;
            }
            if basename.to_lowercase().ends_with(".md") {
                return false;
            }
            if aux.contains(&basename) {
                return true;
            }
            match &variant {
                Some(v) => {
                    super::is_weight_file(basename) && basename.to_lowercase().contains(v)
                }
                None => true,
            }
        })
        .cloned()
        .collect()
}

/// Stream a checkpoint's weights to disk.
///
/// Event sequence seen by the caller's progress callback: cumulative
/// `(bytes, total)` pairs, rate-limited, with exactly one final pair at
/// `bytes == total`.
pub async fn pull_model(
    manager: &ModelManager,
    hub: &HubClient,
    info: &ModelInfo,
    abort: Arc<AbortFlag>,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    if info.recipe == "flm" {
        return pull_flm_model(info, &abort).await;
    }

    let (repo, _) = info.split_checkpoint();
    let files = select_files(info, &hub.list_files(repo).await?);
    if files.is_empty() {
        return Err(Error::ModelNotFound(format!(
            "{} has no files matching {}",
            repo, info.checkpoint
        )));
    }

    let total: u64 = files.iter().map(|f| f.size).sum();
    let dir = manager.checkpoint_dir(info);
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", dir.display())))?;

    let mut completed: u64 = 0;
    let mut last_emit = Instant::now() - PROGRESS_INTERVAL;

    for file in &files {
        abort.check()?;

        // The hub layout is preserved under the checkpoint directory.
        let dest = dir.join(&file.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", parent.display())))?;
        }

        // Resume support: a fully-sized file from an earlier attempt is
        // kept as-is.
        if let Ok(meta) = tokio::fs::metadata(&dest).await {
            if meta.len() == file.size {
                completed += file.size;
                if let Some(ref cb) = progress {
                    if completed < total && last_emit.elapsed() >= PROGRESS_INTERVAL {
                        cb(completed, total);
                        last_emit = Instant::now();
                    }
                }
                continue;
            }
        }

        let url = hub.file_url(repo, &file.path);
        let part = dest.with_extension("part");

        let result = download_one(
            &hub.client,
            &url,
            &part,
            &abort,
            &mut completed,
            total,
            &mut last_emit,
            progress.as_ref(),
        )
        .await;

        match result {
            Ok(()) => {
                tokio::fs::rename(&part, &dest)
                    .await
                    .map_err(|e| Error::Internal(format!("Failed to finalize download: {e}")))?;
            }
            Err(e) => {
                // Pause retains partials for a later resume; anything else
                // removes the in-flight file.
                if !matches!(e, Error::DownloadAborted(AbortReason::Paused)) {
                    let _ = tokio::fs::remove_file(&part).await;
                }
                return Err(e);
            }
        }
    }

    if let Some(ref cb) = progress {
        cb(completed, total);
    }
    tracing::info!("Pulled {} ({} bytes)", info.checkpoint, completed);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn download_one(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    abort: &AbortFlag,
    completed: &mut u64,
    total: u64,
    last_emit: &mut Instant,
    progress: Option<&ProgressCallback>,
) -> Result<()> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Transport(format!("Failed to start download: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "Download of {url} failed with status {}",
            response.status()
        )));
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", dest.display())))?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        abort.check()?;
        let chunk = chunk.map_err(|e| Error::Transport(format!("Download error: {e}")))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write chunk: {e}")))?;
        *completed += chunk.len() as u64;

        if let Some(cb) = progress {
            if *completed < total && last_emit.elapsed() >= PROGRESS_INTERVAL {
                cb(*completed, total);
                *last_emit = Instant::now();
            }
        }
    }
    file.flush()
        .await
        .map_err(|e| Error::Internal(format!("Failed to flush download: {e}")))?;
    Ok(())
}

/// FLM owns its model store; the pull hands off to the vendor CLI. The
/// transfer is not byte-addressable from here, so progress is start/end
/// only and abort is honored between CLI invocations.
async fn pull_flm_model(info: &ModelInfo, abort: &AbortFlag) -> Result<()> {
    abort.check()?;
    let exe = flm::find_executable().ok_or_else(|| Error::UnsupportedBackend {
        recipe: "flm".to_string(),
        backend: "npu".to_string(),
        reason: "flm executable not found; install the flm backend first".to_string(),
    })?;

    let status = tokio::process::Command::new(&exe)
        .args(["pull", &info.checkpoint])
        .status()
        .await
        .map_err(|e| Error::Internal(format!("Failed to run flm pull: {e}")))?;

    if !status.success() {
        return Err(Error::Internal(format!(
            "flm pull {} exited with {status}",
            info.checkpoint
        )));
    }
    Ok(())
}

/// Whether the vendor CLI reports a checkpoint as present.
pub fn flm_model_present(info: &ModelInfo) -> bool {
    let Some(exe) = flm::find_executable() else {
        return false;
    };
    let Ok(output) = std::process::Command::new(&exe).arg("list").output() else {
        return false;
    };
    if !output.status.success() {
        return false;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.contains(&info.checkpoint))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfers::AbortFlag;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gguf_info(checkpoint: &str) -> ModelInfo {
        ModelInfo {
            checkpoint: checkpoint.to_string(),
            recipe: "llamacpp".to_string(),
            reasoning: false,
            vision: false,
            embedding: false,
            reranking: false,
            mmproj: None,
            text_encoder: None,
            vae: None,
        }
    }

    fn file(path: &str, size: u64) -> HubFile {
        HubFile {
            path: path.to_string(),
            size,
        }
    }

    #[test]
    fn test_select_files_with_variant() {
        let info = gguf_info("org/repo:Q4_K_M");
        let files = vec![
            file("model-Q4_K_M.gguf", 100),
            file("model-Q8_0.gguf", 200),
            file("README.md", 5),
            file(".gitattributes", 1),
            file("config.json", 10),
        ];
        let selected = select_files(&info, &files);
        assert_eq!(selected, vec![file("model-Q4_K_M.gguf", 100)]);
    }

    #[test]
    fn test_select_files_includes_named_aux() {
        let mut info = gguf_info("org/repo:Q4_K_M");
        info.mmproj = Some("mmproj-f16.gguf".to_string());
        let files = vec![
            file("model-Q4_K_M.gguf", 100),
            file("mmproj-f16.gguf", 50),
            file("mmproj-f32.gguf", 90),
        ];
        let selected = select_files(&info, &files);
        assert_eq!(selected.len(), 2);
        assert!(selected.iter().any(|f| f.path == "mmproj-f16.gguf"));
        assert!(!selected.iter().any(|f| f.path == "mmproj-f32.gguf"));
    }

    #[test]
    fn test_select_files_without_variant_takes_everything_useful() {
        let info = gguf_info("org/repo");
        let files = vec![
            file("model.safetensors", 100),
            file("voices/af.bin", 10),
            file("README.md", 5),
        ];
        let selected = select_files(&info, &files);
        assert_eq!(selected.len(), 2);
    }

    async fn hub_with_one_file(body: &[u8]) -> (MockServer, HubClient) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/models/org/repo/tree/main"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"type": "file", "path": "model-Q4_K_M.gguf", "size": body.len()},
                {"type": "directory", "path": "voices", "size": 0}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/repo/resolve/main/model-Q4_K_M.gguf"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&server)
            .await;
        let client = HubClient::with_base(server.uri());
        (server, client)
    }

    #[tokio::test]
    async fn test_pull_streams_file_and_reports_progress() {
        let body = vec![7u8; 4096];
        let (_server, hub) = hub_with_one_file(&body).await;

        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(
            dir.path().join("models"),
            dir.path().join("user_models.json"),
        )
        .unwrap();

        let info = gguf_info("org/repo:Q4_K_M");
        let seen: Arc<std::sync::Mutex<Vec<(u64, u64)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |b, t| sink.lock().unwrap().push((b, t)));

        pull_model(
            &manager,
            &hub,
            &info,
            Arc::new(AbortFlag::default()),
            Some(cb),
        )
        .await
        .unwrap();

        assert!(manager.is_downloaded(&info));
        let seen = seen.lock().unwrap();
        let (bytes, total) = *seen.last().unwrap();
        assert_eq!(bytes, 4096);
        assert_eq!(total, 4096);
        assert_eq!(seen.iter().filter(|(b, t)| b == t).count(), 1);
    }

    #[tokio::test]
    async fn test_pull_skips_complete_files_on_resume() {
        let body = vec![7u8; 1024];
        let (server, hub) = hub_with_one_file(&body).await;

        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(
            dir.path().join("models"),
            dir.path().join("user_models.json"),
        )
        .unwrap();
        let info = gguf_info("org/repo:Q4_K_M");

        // Pre-place a fully-sized file.
        let model_dir = manager.checkpoint_dir(&info);
        std::fs::create_dir_all(&model_dir).unwrap();
        std::fs::write(model_dir.join("model-Q4_K_M.gguf"), &body).unwrap();

        pull_model(&manager, &hub, &info, Arc::new(AbortFlag::default()), None)
            .await
            .unwrap();

        // Only the tree listing was fetched; the weight file was skipped.
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.path().contains("/tree/main"));
    }

    #[tokio::test]
    async fn test_cancelled_pull_removes_partials() {
        let body = vec![7u8; 1024];
        let (_server, hub) = hub_with_one_file(&body).await;

        let dir = tempfile::tempdir().unwrap();
        let manager = ModelManager::new(
            dir.path().join("models"),
            dir.path().join("user_models.json"),
        )
        .unwrap();
        let info = gguf_info("org/repo:Q4_K_M");

        let abort = Arc::new(AbortFlag::default());
        abort.cancel();

        let err = pull_model(&manager, &hub, &info, abort, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DownloadAborted(AbortReason::Cancelled)
        ));
        assert!(!manager.is_downloaded(&info));

        // No .part leftovers anywhere under the model dir.
        let model_dir = manager.checkpoint_dir(&info);
        if model_dir.exists() {
            let leftovers: Vec<_> = std::fs::read_dir(&model_dir)
                .unwrap()
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "part"))
                .collect();
            assert!(leftovers.is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_repo_is_model_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let hub = HubClient::with_base(server.uri());
        let err = hub.list_files("org/ghost").await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(_)));
    }
}
