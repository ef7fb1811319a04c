//! Child process supervision and loopback port allocation.
//!
//! Every engine runs as a separately-spawned OS process reached over
//! loopback HTTP. This module owns spawning, liveness checks and the
//! graceful-then-forced stop sequence.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};

use crate::error::{Error, Result};

/// Grace period between the termination signal and a force kill.
const STOP_GRACE_SECS: u64 = 5;

#[derive(Debug, Default, Clone)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Mirror child output into the gateway log.
    pub inherit_output: bool,
    /// Readiness-probe path whose request lines are dropped from the
    /// child's log output, so a 200 ms poll loop doesn't swamp warmup logs.
    pub filter_health_logs: Option<String>,
}

/// A supervised child process.
pub struct ProcessHandle {
    pid: u32,
    exe_name: String,
    child: Option<Child>,
}

pub async fn start_process(
    exe_path: &Path,
    args: &[String],
    options: SpawnOptions,
) -> Result<ProcessHandle> {
    let mut cmd = Command::new(exe_path);
    cmd.args(args);

    if let Some(ref dir) = options.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    cmd.stdin(Stdio::null()).kill_on_drop(true);

    let capture = options.inherit_output || options.filter_health_logs.is_some();
    if capture {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let exe_name = exe_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| exe_path.display().to_string());

    let mut child = cmd.spawn().map_err(|e| {
        Error::Internal(format!(
            "Failed to spawn {}: {e}",
            exe_path.display()
        ))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Internal(format!("{exe_name} exited before reporting a pid")))?;

    if capture {
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, exe_name.clone(), options.filter_health_logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, exe_name.clone(), options.filter_health_logs.clone());
        }
    }

    tracing::info!("Spawned {} (pid: {})", exe_name, pid);

    Ok(ProcessHandle {
        pid,
        exe_name,
        child: Some(child),
    })
}

/// Copy child output lines into the gateway log, dropping readiness-probe
/// request lines when a filter path is set.
fn forward_output<R>(reader: R, exe_name: String, filter_path: Option<String>)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(ref path) = filter_path {
                if line.contains(&format!("GET {path}")) || line.contains(&format!("\"{path}\"")) {
                    continue;
                }
            }
            tracing::debug!(target: "engine", "[{}] {}", exe_name, line);
        }
    });
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// False once the child has exited. Never blocks.
    pub fn is_running(&mut self) -> bool {
        match self.child {
            Some(ref mut child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Graceful stop: termination signal, wait up to the grace period,
    /// then force-kill. Stopping an already-stopped handle is a no-op.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            // No graceful signal that the wrapped servers handle on
            // Windows; go straight to kill after the grace period.
        }

        match tokio::time::timeout(Duration::from_secs(STOP_GRACE_SECS), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!("{} (pid {}) exited with {}", self.exe_name, self.pid, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for {} (pid {}): {}", self.exe_name, self.pid, e);
            }
            Err(_elapsed) => {
                tracing::warn!(
                    "{} (pid {}) didn't stop within {}s, killing",
                    self.exe_name,
                    self.pid,
                    STOP_GRACE_SECS
                );
                let _ = child.kill().await;
            }
        }
    }
}

/// Ask the OS for an ephemeral loopback port.
///
/// The socket is closed before the child binds it; the race window is
/// accepted, and the engines retry their bind once on failure.
pub async fn choose_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind for port allocation: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| Error::Internal(format!("Failed to read local addr: {e}")))?
        .port();
    drop(listener);
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_choose_port_returns_nonzero() {
        let port = choose_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_choose_port_is_bindable() {
        // The returned port must still be free within the same process.
        let mut hits = 0;
        for _ in 0..100 {
            let port = choose_port().await.unwrap();
            if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                hits += 1;
            }
        }
        assert!(hits >= 99, "only {hits}/100 allocated ports were bindable");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_stop() {
        let mut handle = start_process(
            Path::new("/bin/sleep"),
            &["30".to_string()],
            SpawnOptions::default(),
        )
        .await
        .unwrap();

        assert!(handle.is_running());
        handle.stop().await;
        assert!(!handle.is_running());

        // Idempotent.
        handle.stop().await;
        assert!(!handle.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_is_running_false_after_exit() {
        let mut handle = start_process(
            Path::new("/bin/true"),
            &[],
            SpawnOptions::default(),
        )
        .await
        .unwrap();

        // Give the child a moment to exit on its own.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let result = start_process(
            Path::new("/nonexistent/engine-binary"),
            &[],
            SpawnOptions::default(),
        )
        .await;
        assert!(result.is_err());
    }
}
