//! Base behavior shared by every wrapped engine subprocess: port choice,
//! launch, readiness polling, HTTP forwarding, unload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::backend::spec::BackendSpec;
use crate::error::{Error, Result};
use crate::process::{self, ProcessHandle, SpawnOptions};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// One part of a `multipart/form-data` forward.
pub struct MultipartField {
    pub name: String,
    pub value: MultipartValue,
}

pub enum MultipartValue {
    Text(String),
    /// Binary payload with filename and content type.
    File {
        bytes: Vec<u8>,
        filename: String,
        content_type: String,
    },
}

impl MultipartField {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: MultipartValue::Text(value.into()),
        }
    }

    pub fn file(name: &str, bytes: Vec<u8>, filename: &str, content_type: &str) -> Self {
        Self {
            name: name.to_string(),
            value: MultipartValue::File {
                bytes,
                filename: filename.to_string(),
                content_type: content_type.to_string(),
            },
        }
    }
}

/// Launch-time inputs an engine derives its argv from.
pub struct LaunchSpec {
    pub exe_path: PathBuf,
    pub args: Vec<String>,
    /// Extra environment on top of the runtime-library pathing.
    pub env: Vec<(String, String)>,
    pub filter_health_logs: bool,
}

/// The wrapped child server an engine forwards to.
pub struct WrappedServer {
    spec: &'static BackendSpec,
    port: AtomicU16,
    handle: Mutex<Option<ProcessHandle>>,
    client: reqwest::Client,
    debug: bool,
    load_timeout: Duration,
}

impl WrappedServer {
    pub fn new(spec: &'static BackendSpec, debug: bool, load_timeout_override: Option<u64>) -> Self {
        Self {
            spec,
            port: AtomicU16::new(0),
            handle: Mutex::new(None),
            client: reqwest::Client::new(),
            debug,
            load_timeout: Duration::from_secs(
                load_timeout_override.unwrap_or(spec.load_timeout_secs),
            ),
        }
    }

    pub fn recipe(&self) -> &'static str {
        self.spec.recipe
    }

    pub fn is_debug(&self) -> bool {
        self.debug
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    pub async fn is_loaded(&self) -> bool {
        self.port() != 0 && self.handle.lock().await.is_some()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().map(|h| h.pid())
    }

    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    /// Choose a port, spawn the child with runtime-library pathing, and
    /// poll the recipe's readiness path until it answers 2xx.
    pub async fn launch(&self, backend: &str, launch: LaunchSpec) -> Result<()> {
        let port = process::choose_port().await?;
        self.port.store(port, Ordering::SeqCst);

        let mut args = launch.args;
        for arg in &mut args {
            if arg == "{port}" {
                *arg = port.to_string();
            }
        }

        let mut env = runtime_library_env(&launch.exe_path, backend);
        env.extend(launch.env);

        let options = SpawnOptions {
            working_dir: None,
            env,
            inherit_output: self.debug,
            filter_health_logs: launch
                .filter_health_logs
                .then(|| self.spec.readiness_path.to_string()),
        };

        let mut handle = process::start_process(&launch.exe_path, &args, options).await?;

        if let Err(e) = self.wait_for_ready(&mut handle).await {
            handle.stop().await;
            self.port.store(0, Ordering::SeqCst);
            return Err(e);
        }

        *self.handle.lock().await = Some(handle);
        tracing::info!(
            "{} ready at http://127.0.0.1:{port}",
            self.spec.recipe
        );
        Ok(())
    }

    async fn wait_for_ready(&self, handle: &mut ProcessHandle) -> Result<()> {
        let url = format!(
            "http://127.0.0.1:{}{}",
            self.port(),
            self.spec.readiness_path
        );
        let start = Instant::now();

        loop {
            if start.elapsed() > self.load_timeout {
                return Err(Error::EngineNotReady {
                    recipe: self.spec.recipe.to_string(),
                    backend: String::new(),
                    elapsed_ms: start.elapsed().as_millis() as u64,
                });
            }

            if !handle.is_running() {
                return Err(Error::Internal(format!(
                    "{} exited during startup",
                    self.spec.recipe
                )));
            }

            if let Ok(resp) = self.client.get(&url).send().await {
                if resp.status().is_success() {
                    tracing::debug!(
                        "{} became ready after {:?}",
                        self.spec.recipe,
                        start.elapsed()
                    );
                    return Ok(());
                }
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop the child and reset the port. Safe to call repeatedly.
    pub async fn unload(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(mut handle) = guard.take() {
            tracing::info!(
                "Stopping {} (pid {})",
                self.spec.recipe,
                handle.pid()
            );
            handle.stop().await;
        }
        self.port.store(0, Ordering::SeqCst);
    }

    fn not_loaded(&self) -> Error {
        Error::Internal(format!("{} is not loaded", self.spec.recipe))
    }

    /// Unary JSON forward to the child.
    pub async fn forward_request(
        &self,
        path: &str,
        body: &Value,
        timeout_secs: u64,
    ) -> Result<Value> {
        if self.port() == 0 {
            return Err(self.not_loaded());
        }
        let url = format!("{}{path}", self.base_url());

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.spec.recipe)))?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            Error::Transport(format!("{} returned a non-JSON body: {e}", self.spec.recipe))
        })?;

        if !status.is_success() {
            return Err(classify_child_error(self.spec.recipe, status, &payload));
        }
        Ok(payload)
    }

    /// Chunked forward; the returned stream is copied verbatim to the
    /// caller, including SSE frames when the child emits them.
    pub async fn forward_streaming_request(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>> {
        if self.port() == 0 {
            return Err(self.not_loaded());
        }
        let url = format!("{}{path}", self.base_url());

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.spec.recipe)))?;

        let status = response.status();
        if !status.is_success() {
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            return Err(classify_child_error(self.spec.recipe, status, &payload));
        }
        Ok(response.bytes_stream())
    }

    /// Multipart forward for endpoints taking binary fields.
    pub async fn forward_multipart_request(
        &self,
        path: &str,
        fields: Vec<MultipartField>,
        timeout_secs: u64,
    ) -> Result<Value> {
        if self.port() == 0 {
            return Err(self.not_loaded());
        }
        let url = format!("{}{path}", self.base_url());

        let mut form = reqwest::multipart::Form::new();
        for field in fields {
            form = match field.value {
                MultipartValue::Text(text) => form.text(field.name, text),
                MultipartValue::File {
                    bytes,
                    filename,
                    content_type,
                } => {
                    let part = reqwest::multipart::Part::bytes(bytes)
                        .file_name(filename)
                        .mime_str(&content_type)
                        .map_err(|e| Error::InvalidRequest(format!("Bad content type: {e}")))?;
                    form.part(field.name, part)
                }
            };
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.spec.recipe)))?;

        let status = response.status();
        let payload: Value = response.json().await.map_err(|e| {
            Error::Transport(format!("{} returned a non-JSON body: {e}", self.spec.recipe))
        })?;
        if !status.is_success() {
            return Err(classify_child_error(self.spec.recipe, status, &payload));
        }
        Ok(payload)
    }

    /// Forward returning the raw response body stream (binary audio).
    pub async fn forward_binary_request(
        &self,
        path: &str,
        body: &Value,
        timeout_secs: u64,
    ) -> Result<(String, impl Stream<Item = std::result::Result<Bytes, reqwest::Error>>)> {
        if self.port() == 0 {
            return Err(self.not_loaded());
        }
        let url = format!("{}{path}", self.base_url());

        let response = self
            .client
            .post(&url)
            .json(body)
            .timeout(Duration::from_secs(timeout_secs))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{}: {e}", self.spec.recipe)))?;

        let status = response.status();
        if !status.is_success() {
            let payload: Value = response.json().await.unwrap_or(Value::Null);
            return Err(classify_child_error(self.spec.recipe, status, &payload));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        Ok((content_type, response.bytes_stream()))
    }
}

/// Engines shipped with vendor runtime libraries need the install
/// directory on the dynamic-linker path at launch. The host value is
/// prepended-to, never replaced.
pub fn runtime_library_env(exe_path: &Path, backend: &str) -> Vec<(String, String)> {
    let Some(exe_dir) = exe_path.parent() else {
        return Vec::new();
    };
    let dir = exe_dir.to_string_lossy().into_owned();

    if cfg!(unix) {
        let value = match std::env::var("LD_LIBRARY_PATH") {
            Ok(existing) if !existing.is_empty() => format!("{dir}:{existing}"),
            _ => dir,
        };
        vec![("LD_LIBRARY_PATH".to_string(), value)]
    } else if backend == "rocm" {
        // ROCm builds need hipblaslt.dll and friends next to the exe.
        let value = match std::env::var("PATH") {
            Ok(existing) if !existing.is_empty() => format!("{dir};{existing}"),
            _ => dir,
        };
        vec![("PATH".to_string(), value)]
    } else {
        Vec::new()
    }
}

/// Map a child error payload onto the gateway taxonomy. Model
/// invalidation is recognized so the orchestrator can re-pull once.
fn classify_child_error(recipe: &str, status: reqwest::StatusCode, payload: &Value) -> Error {
    let message = payload
        .get("error")
        .map(|e| {
            e.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| e.to_string())
        })
        .unwrap_or_else(|| payload.to_string());

    let lower = message.to_lowercase();
    if lower.contains("model_invalidated")
        || lower.contains("model not found")
        || lower.contains("no such model")
    {
        return Error::ModelInvalidated(message);
    }
    Error::Transport(format!("{recipe} answered {status}: {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::spec_for_recipe;
    use serde_json::json;

    #[test]
    fn test_runtime_library_env_prepends() {
        let envs = runtime_library_env(Path::new("/cache/bin/llamacpp/cpu/b1/llama-server"), "cpu");
        if cfg!(unix) {
            assert_eq!(envs.len(), 1);
            let (key, value) = &envs[0];
            assert_eq!(key, "LD_LIBRARY_PATH");
            assert!(value.starts_with("/cache/bin/llamacpp/cpu/b1"));
            if let Ok(host) = std::env::var("LD_LIBRARY_PATH") {
                if !host.is_empty() {
                    assert!(value.ends_with(&host), "host path must be preserved");
                }
            }
        }
    }

    #[test]
    fn test_classify_model_invalidated() {
        let err = classify_child_error(
            "llamacpp",
            reqwest::StatusCode::NOT_FOUND,
            &json!({"error": {"message": "model not found: qwen"}}),
        );
        assert!(matches!(err, Error::ModelInvalidated(_)));

        let err = classify_child_error(
            "llamacpp",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            &json!({"error": {"message": "out of memory"}}),
        );
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_forward_before_load_fails() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let server = WrappedServer::new(spec, false, None);
        assert!(!server.is_loaded().await);
        let err = server
            .forward_request("/v1/chat/completions", &json!({}), 5)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[tokio::test]
    async fn test_unload_without_load_is_noop() {
        let spec = spec_for_recipe("llamacpp").unwrap();
        let server = WrappedServer::new(spec, false, None);
        server.unload().await;
        server.unload().await;
        assert_eq!(server.port(), 0);
    }
}
