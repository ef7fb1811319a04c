//! Artifact store: fetches engine release archives and manages the
//! versioned install directories under `<cache_root>/bin`.
//!
//! Layout invariant: `<bin>/<recipe>/<backend>/<version>/` exists only when
//! that version extracted completely and the recipe's executable is inside.
//! Extraction goes to a `<version>.partial` sibling first and is renamed
//! into place, so an interrupted install never corrupts a prior version.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::backend::spec::BackendSpec;
use crate::error::{Error, Result};
use crate::transfers::AbortFlag;

/// Minimum interval between progress callbacks.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(33);

/// Attempts and backoff for removing install directories that antivirus or
/// indexing may briefly lock.
const REMOVE_ATTEMPTS: u32 = 5;
const REMOVE_BACKOFF: Duration = Duration::from_millis(500);

pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

pub struct ArtifactStore {
    bin_dir: PathBuf,
    client: reqwest::Client,
    release_base: String,
}

impl ArtifactStore {
    pub fn new(bin_dir: PathBuf) -> Self {
        Self::with_release_base(bin_dir, "https://github.com".to_string())
    }

    /// Base URL override for tests.
    pub fn with_release_base(bin_dir: PathBuf, release_base: String) -> Self {
        Self {
            bin_dir,
            client: reqwest::Client::new(),
            release_base: release_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn install_dir(&self, recipe: &str, backend: &str) -> PathBuf {
        self.bin_dir.join(recipe).join(backend)
    }

    pub fn version_dir(&self, recipe: &str, backend: &str, version: &str) -> PathBuf {
        self.install_dir(recipe, backend).join(version)
    }

    /// The installed version and executable path, if any version directory
    /// holds the recipe's executable. With multiple leftovers the highest
    /// version wins; installs prune siblings so that is transient.
    pub fn installed_executable(
        &self,
        spec: &BackendSpec,
        backend: &str,
    ) -> Option<(String, PathBuf)> {
        let dir = self.install_dir(spec.recipe, backend);
        let entries = std::fs::read_dir(&dir).ok()?;

        let mut found: Vec<(String, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || path.extension().is_some_and(|e| e == "partial") {
                continue;
            }
            if let Some(exe) = find_executable(&path, spec.exe_name) {
                let version = entry.file_name().to_string_lossy().into_owned();
                found.push((version, exe));
            }
        }

        found.into_iter().max_by(|(a, _), (b, _)| {
            use crate::backend::version::Version;
            if Version::parse(a).at_least(&Version::parse(b)) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Less
            }
        })
    }

    /// Download `filename` from the GitHub release `version` of `repo` and
    /// extract it into the versioned install directory. On success, prior
    /// version directories under the same `(recipe, backend)` are removed.
    pub async fn install_from_github(
        &self,
        spec: &BackendSpec,
        version: &str,
        repo: &str,
        filename: &str,
        backend: &str,
        abort: Option<Arc<AbortFlag>>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let parent = self.install_dir(spec.recipe, backend);
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", parent.display())))?;

        let url = format!(
            "{}/{repo}/releases/download/{version}/{filename}",
            self.release_base
        );
        let archive_path = parent.join(filename);

        tracing::info!("Downloading {url}");
        let download = self
            .fetch_to_file(&url, &archive_path, abort.as_deref(), progress)
            .await;
        if let Err(e) = download {
            let _ = tokio::fs::remove_file(&archive_path).await;
            return Err(e);
        }

        let partial_dir = parent.join(format!("{version}.partial"));
        let target_dir = parent.join(version);

        let extracted = self
            .extract_archive(&archive_path, &partial_dir, spec.exe_name)
            .await;
        let _ = tokio::fs::remove_file(&archive_path).await;

        if let Err(e) = extracted {
            let _ = tokio::fs::remove_dir_all(&partial_dir).await;
            return Err(e);
        }

        // A stale same-version directory (e.g. missing its executable)
        // is replaced wholesale.
        if target_dir.exists() {
            remove_dir_with_retries(&target_dir).await?;
        }
        tokio::fs::rename(&partial_dir, &target_dir).await.map_err(|e| {
            Error::Internal(format!(
                "Failed to move extracted archive into place: {e}"
            ))
        })?;

        self.prune_old_versions(spec.recipe, backend, version).await;

        tracing::info!(
            "Installed {}:{} {version} at {}",
            spec.recipe,
            backend,
            target_dir.display()
        );
        Ok(())
    }

    /// Stream a URL to a file with rate-limited progress callbacks and a
    /// received-size check against the advertised length.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        abort: Option<&AbortFlag>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let response = self
            .client
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

        let total_bytes = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", dest.display())))?;

        let mut downloaded: u64 = 0;
        let mut last_emit = Instant::now() - PROGRESS_INTERVAL;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            if let Some(flag) = abort {
                flag.check()?;
            }
            let chunk = chunk.map_err(|e| Error::Transport(format!("Download error: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(format!("Failed to write chunk: {e}")))?;
            downloaded += chunk.len() as u64;

            if let Some(ref cb) = progress {
                let is_final = total_bytes > 0 && downloaded == total_bytes;
                if !is_final && last_emit.elapsed() >= PROGRESS_INTERVAL {
                    cb(downloaded, total_bytes);
                    last_emit = Instant::now();
                }
            }
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("Failed to flush archive: {e}")))?;

        if total_bytes > 0 && downloaded != total_bytes {
            return Err(Error::Transport(format!(
                "Truncated download: got {downloaded} of {total_bytes} bytes"
            )));
        }

        // Exactly one final callback, at EOF or when the known size is
        // fully received.
        if let Some(ref cb) = progress {
            cb(downloaded, total_bytes);
        }

        Ok(())
    }

    async fn extract_archive(
        &self,
        archive_path: &Path,
        target_dir: &Path,
        exe_name: &str,
    ) -> Result<()> {
        if target_dir.exists() {
            tokio::fs::remove_dir_all(target_dir)
                .await
                .map_err(|e| Error::Internal(format!("Failed to clear partial dir: {e}")))?;
        }
        tokio::fs::create_dir_all(target_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create partial dir: {e}")))?;

        let archive = archive_path.to_path_buf();
        let target = target_dir.to_path_buf();
        let name = archive_path.to_string_lossy().into_owned();

        tokio::task::spawn_blocking(move || {
            if name.ends_with(".zip") {
                extract_zip(&archive, &target)
            } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
                extract_tar_gz(&archive, &target)
            } else {
                Err(Error::Internal(format!("Unsupported archive format: {name}")))
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("Extraction task failed: {e}")))??;

        let Some(exe) = find_executable(target_dir, exe_name) else {
            return Err(Error::Internal(format!(
                "Archive did not contain the expected executable {exe_name}"
            )));
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755));
        }
        #[cfg(not(unix))]
        let _ = exe;

        Ok(())
    }

    /// Remove every sibling version directory except the one just
    /// installed. Leftover `.partial` directories go too.
    async fn prune_old_versions(&self, recipe: &str, backend: &str, keep: &str) {
        let parent = self.install_dir(recipe, backend);
        let Ok(mut entries) = tokio::fs::read_dir(&parent).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() || entry.file_name().to_string_lossy() == keep {
                continue;
            }
            tracing::info!("Removing prior version: {}", path.display());
            if let Err(e) = remove_dir_with_retries(&path).await {
                tracing::warn!("Failed to prune {}: {e}", path.display());
            }
        }
    }

    /// Remove the whole `(recipe, backend)` install directory.
    pub async fn remove_install_dir(&self, recipe: &str, backend: &str) -> Result<()> {
        let dir = self.install_dir(recipe, backend);
        if !dir.exists() {
            tracing::info!("Nothing to uninstall at {}", dir.display());
            return Ok(());
        }
        remove_dir_with_retries(&dir).await?;
        tracing::info!("Removed {}", dir.display());
        Ok(())
    }
}

/// Transient file locks (antivirus, indexing) make a first `remove_dir_all`
/// flaky on some hosts; retry with a short backoff before failing.
async fn remove_dir_with_retries(dir: &Path) -> Result<()> {
    let mut last_err = None;
    for attempt in 0..REMOVE_ATTEMPTS {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => return Ok(()),
            Err(_) if !dir.exists() => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < REMOVE_ATTEMPTS {
                    tokio::time::sleep(REMOVE_BACKOFF).await;
                }
            }
        }
    }
    Err(Error::Internal(format!(
        "Failed to remove {}: {}",
        dir.display(),
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Archives nest their binaries differently (`build/bin/llama-server`,
/// top-level `sd-server`); search recursively for the named executable.
pub fn find_executable(dir: &Path, exe_name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if entry.file_name().to_string_lossy() == exe_name {
            return Some(path);
        }
    }
    subdirs.iter().find_map(|d| find_executable(d, exe_name))
}

fn extract_zip(archive_path: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Internal(format!("Failed to open archive: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::Internal(format!("Failed to read zip archive: {e}")))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| Error::Internal(format!("Failed to read zip entry: {e}")))?;
        let Some(rel) = entry.enclosed_name() else {
            continue;
        };
        let dest = target.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&dest)
                .map_err(|e| Error::Internal(format!("Failed to create dir: {e}")))?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Internal(format!("Failed to create dir: {e}")))?;
        }
        let mut out = std::fs::File::create(&dest)
            .map_err(|e| Error::Internal(format!("Failed to create {}: {e}", dest.display())))?;
        std::io::copy(&mut entry, &mut out)
            .map_err(|e| Error::Internal(format!("Failed to extract {}: {e}", dest.display())))?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode));
        }
    }
    Ok(())
}

fn extract_tar_gz(archive_path: &Path, target: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Internal(format!("Failed to open archive: {e}")))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(target)
        .map_err(|e| Error::Internal(format!("Failed to extract tar archive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::spec_for_recipe;
    use std::io::Write;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_find_executable_nested() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("build").join("bin");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("llama-server"), b"bin").unwrap();

        let found = find_executable(dir.path(), "llama-server").unwrap();
        assert!(found.ends_with("build/bin/llama-server"));
        assert!(find_executable(dir.path(), "other-server").is_none());
    }

    #[tokio::test]
    async fn test_install_extracts_and_prunes_old_version() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let cache = tempfile::tempdir().unwrap();
        let server = mock_release().await;
        let store = ArtifactStore::with_release_base(cache.path().to_path_buf(), server.uri());

        // Pre-existing old version must survive failure and die on success.
        let old_dir = store.version_dir("llamacpp", "cpu", "b6000");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join(spec.exe_name), b"old").unwrap();

        store
            .install_from_github(spec, "b6210", "ggml-org/llama.cpp", "llama.zip", "cpu", None, None)
            .await
            .unwrap();

        let (version, exe) = store.installed_executable(spec, "cpu").unwrap();
        assert_eq!(version, "b6210");
        assert!(exe.exists());
        assert!(!old_dir.exists(), "old version was not pruned");
    }

    #[tokio::test]
    async fn test_failed_extract_leaves_prior_version_intact() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let cache = tempfile::tempdir().unwrap();

        let server = wiremock::MockServer::start().await;
        // An archive without the expected executable.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_bytes(zip_bytes(&[("readme.txt", b"no binary here")])),
            )
            .mount(&server)
            .await;

        let store = ArtifactStore::with_release_base(cache.path().to_path_buf(), server.uri());

        let old_dir = store.version_dir("llamacpp", "cpu", "b6000");
        std::fs::create_dir_all(&old_dir).unwrap();
        std::fs::write(old_dir.join(spec.exe_name), b"old").unwrap();

        let err = store
            .install_from_github(spec, "b6210", "ggml-org/llama.cpp", "llama.zip", "cpu", None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected executable"));

        // Prior version untouched, no partial leftovers.
        assert!(old_dir.join(spec.exe_name).exists());
        assert!(!store.version_dir("llamacpp", "cpu", "b6210").exists());
        assert!(!store
            .install_dir("llamacpp", "cpu")
            .join("b6210.partial")
            .exists());
    }

    #[tokio::test]
    async fn test_truncated_download_fails() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let cache = tempfile::tempdir().unwrap();

        let server = wiremock::MockServer::start().await;
        let body = zip_bytes(&[(spec.exe_name, b"bin" as &[u8])]);
        // Claim more bytes than we send.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .insert_header("content-length", (body.len() + 10).to_string().as_str())
                    .set_body_bytes(body),
            )
            .mount(&server)
            .await;

        let store = ArtifactStore::with_release_base(cache.path().to_path_buf(), server.uri());
        let err = store
            .install_from_github(spec, "b6210", "ggml-org/llama.cpp", "llama.zip", "cpu", None, None)
            .await
            .unwrap_err();
        let msg = err.to_string().to_lowercase();
        assert!(msg.contains("truncated") || msg.contains("download error"), "{msg}");
    }

    #[tokio::test]
    async fn test_progress_final_callback_has_full_size() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let cache = tempfile::tempdir().unwrap();
        let server = mock_release().await;
        let store = ArtifactStore::with_release_base(cache.path().to_path_buf(), server.uri());

        let seen: Arc<std::sync::Mutex<Vec<(u64, u64)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |b, t| sink.lock().unwrap().push((b, t)));

        store
            .install_from_github(
                spec,
                "b6210",
                "ggml-org/llama.cpp",
                "llama.zip",
                "cpu",
                None,
                Some(cb),
            )
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let (bytes, total) = *seen.last().unwrap();
        assert_eq!(bytes, total);
        assert!(total > 0);
        // Monotonically non-decreasing.
        assert!(seen.windows(2).all(|w| w[0].0 <= w[1].0));
        // Final callback exactly once.
        assert_eq!(seen.iter().filter(|(b, t)| b == t).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_download() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let cache = tempfile::tempdir().unwrap();
        let server = mock_release().await;
        let store = ArtifactStore::with_release_base(cache.path().to_path_buf(), server.uri());

        let abort = Arc::new(AbortFlag::default());
        abort.cancel();

        let err = store
            .install_from_github(
                spec,
                "b6210",
                "ggml-org/llama.cpp",
                "llama.zip",
                "cpu",
                Some(abort),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownloadAborted(_)));
        assert!(!store.version_dir("llamacpp", "cpu", "b6210").exists());
    }

    #[tokio::test]
    async fn test_remove_install_dir_missing_is_ok() {
        let cache = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(cache.path().to_path_buf());
        store.remove_install_dir("llamacpp", "cpu").await.unwrap();
    }

    /// Mock release server answering every GET with a valid llama archive.
    async fn mock_release() -> wiremock::MockServer {
        let server = wiremock::MockServer::start().await;
        let spec = spec_for_recipe("llamacpp").unwrap();
        let body = zip_bytes(&[
            ("build/bin/placeholder.txt", b"x" as &[u8]),
            (&format!("build/bin/{}", spec.exe_name), b"binary"),
        ]);
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
        server
    }
}
