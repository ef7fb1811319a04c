//! FastFlowLM lifecycle.
//!
//! Unlike every other recipe, flm is not an archive the gateway extracts:
//! the vendor ships `flm-setup.exe` with its own install logic and PATH
//! registration. The gateway downloads the installer, runs it silently,
//! and afterwards only locates and version-checks the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::artifact::{ArtifactStore, ProgressCallback};
use crate::backend::version::Version;
use crate::error::{Error, Result};
use crate::transfers::AbortFlag;

pub const INSTALLER_FILENAME: &str = "flm-setup.exe";
pub const VENDOR_REPO: &str = "FastFlowLM/FastFlowLM";

/// Oldest NPU driver the vendor runtime works with.
pub const MIN_NPU_DRIVER_VERSION: &str = "32.0.203.240";

const VERIFY_ATTEMPTS: u32 = 10;
const VERIFY_BACKOFF: Duration = Duration::from_secs(1);

/// Locate the vendor-installed executable: PATH first, then the default
/// install directory the vendor installer uses.
pub fn find_executable() -> Option<PathBuf> {
    let exe = if cfg!(windows) { "flm.exe" } else { "flm" };
    if let Ok(path) = which::which(exe) {
        return Some(path);
    }
    let default_dir = if cfg!(windows) {
        PathBuf::from("C:\\Program Files\\flm")
    } else {
        PathBuf::from("/opt/flm")
    };
    let candidate = default_dir.join(exe);
    candidate.exists().then_some(candidate)
}

/// Version string reported by `flm --version`, if the executable is
/// present and answers.
pub async fn installed_version() -> Option<String> {
    let exe = find_executable()?;
    let output = tokio::process::Command::new(&exe)
        .arg("--version")
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    parse_version_output(&text)
}

/// First whitespace-separated token that looks like a version.
fn parse_version_output(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == '(' || c == ')' || c == ','))
        .find(|t| {
            t.contains('.')
                && t.chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_digit() || c == 'v' || c == 'V')
        })
        .map(|t| t.to_string())
}

/// NPU driver version. `LEMON_NPU_DRIVER_VERSION` overrides the probe,
/// which keeps driver gating testable off-target.
pub async fn npu_driver_version() -> Option<String> {
    if let Ok(v) = std::env::var("LEMON_NPU_DRIVER_VERSION") {
        if !v.is_empty() {
            return Some(v);
        }
    }
    #[cfg(windows)]
    {
        let output = tokio::process::Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "(Get-PnpDevice -FriendlyName '*NPU*' | Get-PnpDeviceProperty DEVPKEY_Device_DriverVersion).Data",
            ])
            .output()
            .await
            .ok()?;
        let text = String::from_utf8_lossy(&output.stdout);
        let line = text.lines().find(|l| !l.trim().is_empty())?;
        return Some(line.trim().to_string());
    }
    #[cfg(not(windows))]
    None
}

pub async fn driver_version_ok() -> bool {
    match npu_driver_version().await {
        Some(v) => Version::parse(&v).at_least(&Version::parse(MIN_NPU_DRIVER_VERSION)),
        None => false,
    }
}

/// Download and silently run the vendor installer unless the installed
/// version already satisfies `required_version`.
pub async fn install_if_needed(
    store: &ArtifactStore,
    required_version: &str,
    abort: Option<Arc<AbortFlag>>,
    progress: Option<ProgressCallback>,
) -> Result<()> {
    if !cfg!(windows) {
        return Err(Error::UnsupportedBackend {
            recipe: "flm".to_string(),
            backend: "npu".to_string(),
            reason: "FastFlowLM is only supported on Windows".to_string(),
        });
    }

    if let Some(installed) = installed_version().await {
        if Version::parse(&installed).at_least(&Version::parse(required_version)) {
            tracing::info!("flm {installed} already satisfies {required_version}");
            return Ok(());
        }
        tracing::info!("flm {installed} is older than {required_version}, upgrading");
    }

    let installer_path = std::env::temp_dir().join(INSTALLER_FILENAME);
    let url = format!(
        "https://github.com/{VENDOR_REPO}/releases/download/{required_version}/{INSTALLER_FILENAME}"
    );
    store
        .fetch_to_file(&url, &installer_path, abort.as_deref(), progress)
        .await?;

    tracing::info!("Running vendor installer: {}", installer_path.display());
    let status = tokio::process::Command::new(&installer_path)
        .arg("/S")
        .status()
        .await
        .map_err(|e| Error::BackendInstallFailed {
            recipe: "flm".to_string(),
            backend: "npu".to_string(),
            cause: format!("Failed to run installer: {e}"),
        })?;
    let _ = tokio::fs::remove_file(&installer_path).await;

    if !status.success() {
        return Err(Error::BackendInstallFailed {
            recipe: "flm".to_string(),
            backend: "npu".to_string(),
            cause: format!("Installer exited with {status}"),
        });
    }

    verify_installation(required_version).await
}

/// The installer registers PATH entries asynchronously; poll until the
/// executable answers with the expected version.
async fn verify_installation(expected_version: &str) -> Result<()> {
    let expected = Version::parse(expected_version);
    for _ in 0..VERIFY_ATTEMPTS {
        if let Some(installed) = installed_version().await {
            if Version::parse(&installed).at_least(&expected) {
                return Ok(());
            }
        }
        tokio::time::sleep(VERIFY_BACKOFF).await;
    }
    Err(Error::BackendInstallFailed {
        recipe: "flm".to_string(),
        backend: "npu".to_string(),
        cause: format!("flm {expected_version} not found after running the installer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("flm version 0.9.8"),
            Some("0.9.8".to_string())
        );
        assert_eq!(
            parse_version_output("FastFlowLM v0.9.8 (build 123)"),
            Some("v0.9.8".to_string())
        );
        assert_eq!(parse_version_output("no version here"), None);
    }

    #[test]
    fn test_parse_version_output_skips_plain_words() {
        // "llama.cpp" style tokens with a leading letter other than v
        // are not versions.
        assert_eq!(
            parse_version_output("powered by llama.cpp runtime 1.2.3"),
            Some("1.2.3".to_string())
        );
    }

    #[tokio::test]
    async fn test_driver_gate_uses_env_override() {
        // Serialized via the env var; restore afterwards.
        std::env::set_var("LEMON_NPU_DRIVER_VERSION", "32.0.203.311");
        assert!(driver_version_ok().await);

        std::env::set_var("LEMON_NPU_DRIVER_VERSION", "31.0.100.1");
        assert!(!driver_version_ok().await);

        std::env::remove_var("LEMON_NPU_DRIVER_VERSION");
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_install_rejected_off_windows() {
        let store = super::super::artifact::ArtifactStore::new(std::env::temp_dir());
        let err = install_if_needed(&store, "v0.9.8", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedBackend { .. }));
    }
}
