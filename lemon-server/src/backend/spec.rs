//! Static table of engine recipes.
//!
//! A recipe is a family of inference engine sharing an executable name and a
//! capability signature; a backend is a build variant of it (vulkan, rocm,
//! cpu, npu). The set is closed: everything the gateway knows about a recipe
//! lives in this table.

use lemon_common::Capability;

use crate::error::{Error, Result};

/// Source location of a release archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallParams {
    /// GitHub `owner/repo`.
    pub repo: String,
    /// OS- and arch-specific archive filename within the release.
    pub filename: String,
}

/// How a recipe gets onto the host.
#[derive(Clone, Copy)]
pub enum InstallKind {
    /// Archive downloaded from a GitHub release and extracted by the
    /// artifact store.
    GithubRelease(fn(backend: &str, version: &str) -> Result<InstallParams>),
    /// The vendor ships its own installer with its own lifecycle; the
    /// gateway only locates and version-checks the result.
    VendorInstaller,
}

pub struct BackendSpec {
    pub recipe: &'static str,
    pub exe_name: &'static str,
    pub backends: &'static [&'static str],
    pub capabilities: &'static [Capability],
    /// Path polled on the child until it answers 2xx.
    pub readiness_path: &'static str,
    /// Readiness deadline for this recipe.
    pub load_timeout_secs: u64,
    pub install: InstallKind,
}

impl BackendSpec {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(windows)]
mod exe {
    pub const LLAMA: &str = "llama-server.exe";
    pub const WHISPER: &str = "whisper-server.exe";
    pub const SD: &str = "sd-server.exe";
    pub const KOKORO: &str = "koko.exe";
    pub const RYZENAI: &str = "ryzenai-server.exe";
    pub const FLM: &str = "flm.exe";
}
#[cfg(not(windows))]
mod exe {
    pub const LLAMA: &str = "llama-server";
    pub const WHISPER: &str = "whisper-server";
    pub const SD: &str = "sd-server";
    pub const KOKORO: &str = "koko";
    pub const RYZENAI: &str = "ryzenai-server";
    pub const FLM: &str = "flm";
}

static SPECS: &[BackendSpec] = &[
    BackendSpec {
        recipe: "llamacpp",
        exe_name: exe::LLAMA,
        backends: &["vulkan", "rocm", "metal", "cpu"],
        capabilities: &[
            Capability::Completions,
            Capability::Embeddings,
            Capability::Reranking,
        ],
        readiness_path: "/health",
        load_timeout_secs: 120,
        install: InstallKind::GithubRelease(llamacpp_install_params),
    },
    BackendSpec {
        recipe: "whispercpp",
        exe_name: exe::WHISPER,
        backends: &["cpu"],
        capabilities: &[Capability::AudioTranscribe],
        readiness_path: "/",
        load_timeout_secs: 60,
        install: InstallKind::GithubRelease(whispercpp_install_params),
    },
    BackendSpec {
        recipe: "sd-cpp",
        exe_name: exe::SD,
        backends: &["cpu", "rocm"],
        capabilities: &[
            Capability::ImageGenerate,
            Capability::ImageEdit,
            Capability::ImageVariation,
        ],
        readiness_path: "/",
        load_timeout_secs: 120,
        install: InstallKind::GithubRelease(sd_install_params),
    },
    BackendSpec {
        recipe: "kokoro",
        exe_name: exe::KOKORO,
        backends: &["cpu"],
        capabilities: &[Capability::AudioSpeak],
        readiness_path: "/",
        load_timeout_secs: 60,
        install: InstallKind::GithubRelease(kokoro_install_params),
    },
    BackendSpec {
        recipe: "ryzenai-llm",
        exe_name: exe::RYZENAI,
        backends: &["npu"],
        capabilities: &[Capability::Completions],
        readiness_path: "/health",
        load_timeout_secs: 300,
        install: InstallKind::GithubRelease(ryzenai_install_params),
    },
    BackendSpec {
        recipe: "flm",
        exe_name: exe::FLM,
        backends: &["npu"],
        capabilities: &[
            Capability::Completions,
            Capability::Embeddings,
            Capability::Reranking,
        ],
        readiness_path: "/api/tags",
        load_timeout_secs: 120,
        install: InstallKind::VendorInstaller,
    },
];

pub fn all_specs() -> &'static [BackendSpec] {
    SPECS
}

pub fn spec_for_recipe(recipe: &str) -> Option<&'static BackendSpec> {
    SPECS.iter().find(|s| s.recipe == recipe)
}

pub fn get_spec(recipe: &str) -> Result<&'static BackendSpec> {
    spec_for_recipe(recipe)
        .ok_or_else(|| Error::InvalidRequest(format!("Unknown recipe: {recipe}")))
}

/// Find the recipe that serves a capability. The table keeps one recipe per
/// non-completion capability, and `llamacpp` is the completions default.
pub fn recipe_for_capability(capability: Capability) -> Option<&'static BackendSpec> {
    if capability == Capability::Completions {
        return spec_for_recipe("llamacpp");
    }
    SPECS
        .iter()
        .find(|s| s.supports(capability) && s.recipe != "llamacpp")
        .or_else(|| SPECS.iter().find(|s| s.supports(capability)))
}

/// The backend a recipe uses on this host when the caller names none.
pub fn default_backend(spec: &BackendSpec) -> &'static str {
    for candidate in spec.backends {
        if host_support(spec, candidate).is_ok() {
            return candidate;
        }
    }
    spec.backends[0]
}

/// OS-support predicate: Ok, or an explanatory message for `unsupported`.
pub fn host_support(spec: &BackendSpec, backend: &str) -> std::result::Result<(), String> {
    if !spec.backends.contains(&backend) {
        return Err(format!(
            "{} has no {backend} backend; available: {}",
            spec.recipe,
            spec.backends.join(", ")
        ));
    }

    match (spec.recipe, backend) {
        ("llamacpp", "vulkan") if cfg!(target_os = "macos") => {
            Err("Vulkan builds are not published for macOS; use the metal backend".into())
        }
        ("llamacpp", "metal") if !cfg!(target_os = "macos") => {
            Err("Metal is only available on macOS".into())
        }
        (_, "rocm") => {
            if cfg!(target_os = "macos") {
                Err("ROCm is only supported on Windows and Linux".into())
            } else if rocm_arch().is_none() {
                Err("No supported ROCm GPU detected".into())
            } else {
                Ok(())
            }
        }
        (_, "npu") => {
            if cfg!(windows) {
                Ok(())
            } else {
                Err(format!(
                    "{} requires a Ryzen AI NPU and is only supported on Windows",
                    spec.recipe
                ))
            }
        }
        _ => Ok(()),
    }
}

/// Detected ROCm GPU architecture, if any. The ROCm runtime ships alongside
/// the engine archive; this only answers whether the host GPU is one the
/// prebuilt binaries target. `LEMON_ROCM_ARCH` forces the answer for
/// unlisted cards.
pub fn rocm_arch() -> Option<String> {
    if let Ok(arch) = std::env::var("LEMON_ROCM_ARCH") {
        if !arch.is_empty() {
            return Some(arch);
        }
    }
    #[cfg(target_os = "linux")]
    {
        if std::path::Path::new("/opt/rocm").exists() || which::which("rocminfo").is_ok() {
            return Some("gfx1100".to_string());
        }
    }
    #[cfg(windows)]
    {
        if std::env::var_os("HIP_PATH").is_some() {
            return Some("gfx1100".to_string());
        }
    }
    None
}

// ============================================================================
// Install params per recipe
// ============================================================================

fn os_unsupported(recipe: &str, backend: &str) -> Error {
    Error::UnsupportedBackend {
        recipe: recipe.to_string(),
        backend: backend.to_string(),
        reason: format!("No release archive for this platform ({})", std::env::consts::OS),
    }
}

fn llamacpp_install_params(backend: &str, version: &str) -> Result<InstallParams> {
    // ROCm builds come from a dedicated repo; the upstream project does not
    // publish them.
    if backend == "rocm" {
        let filename = if cfg!(windows) {
            format!("llama-{version}-windows-rocm-x64.zip")
        } else if cfg!(target_os = "linux") {
            format!("llama-{version}-ubuntu-rocm-x64.zip")
        } else {
            return Err(os_unsupported("llamacpp", backend));
        };
        return Ok(InstallParams {
            repo: "lemonade-sdk/llamacpp-rocm".to_string(),
            filename,
        });
    }

    let filename = if cfg!(windows) {
        match backend {
            "vulkan" => format!("llama-{version}-bin-win-vulkan-x64.zip"),
            "cpu" => format!("llama-{version}-bin-win-cpu-x64.zip"),
            _ => return Err(os_unsupported("llamacpp", backend)),
        }
    } else if cfg!(target_os = "macos") {
        format!("llama-{version}-bin-macos-arm64.zip")
    } else {
        match backend {
            "vulkan" => format!("llama-{version}-bin-ubuntu-vulkan-x64.zip"),
            "cpu" => format!("llama-{version}-bin-ubuntu-x64.zip"),
            _ => return Err(os_unsupported("llamacpp", backend)),
        }
    };

    Ok(InstallParams {
        repo: "ggml-org/llama.cpp".to_string(),
        filename,
    })
}

fn whispercpp_install_params(_backend: &str, version: &str) -> Result<InstallParams> {
    let filename = if cfg!(windows) {
        format!("whisper-{version}-bin-win-x64.zip")
    } else if cfg!(target_os = "macos") {
        format!("whisper-{version}-bin-macos-arm64.zip")
    } else {
        format!("whisper-{version}-bin-ubuntu-x64.zip")
    };
    Ok(InstallParams {
        repo: "ggml-org/whisper.cpp".to_string(),
        filename,
    })
}

/// Release tags look like `master-631-8c4ed7b`; archive filenames drop the
/// middle counter (`sd-master-8c4ed7b-…`).
pub fn sd_short_version(version: &str) -> String {
    let mut dashes = version.match_indices('-');
    match (dashes.next(), dashes.next()) {
        (Some((first, _)), Some((second, _))) => {
            format!("{}-{}", &version[..first], &version[second + 1..])
        }
        _ => version.to_string(),
    }
}

fn sd_install_params(backend: &str, version: &str) -> Result<InstallParams> {
    let short = sd_short_version(version);

    let filename = if backend == "rocm" {
        if cfg!(windows) {
            format!("sd-{short}-bin-win-rocm-x64.zip")
        } else if cfg!(target_os = "linux") {
            format!("sd-{short}-bin-Linux-Ubuntu-24.04-x86_64-rocm.zip")
        } else {
            return Err(os_unsupported("sd-cpp", backend));
        }
    } else if cfg!(windows) {
        format!("sd-{short}-bin-win-avx2-x64.zip")
    } else if cfg!(target_os = "macos") {
        format!("sd-{short}-bin-Darwin-macOS-15.7.2-arm64.zip")
    } else {
        format!("sd-{short}-bin-Linux-Ubuntu-24.04-x86_64.zip")
    };

    Ok(InstallParams {
        repo: "superm1/stable-diffusion.cpp".to_string(),
        filename,
    })
}

fn kokoro_install_params(_backend: &str, version: &str) -> Result<InstallParams> {
    let filename = if cfg!(windows) {
        format!("koko-{version}-win-x64.zip")
    } else if cfg!(target_os = "macos") {
        format!("koko-{version}-macos-arm64.tar.gz")
    } else {
        format!("koko-{version}-linux-x64.tar.gz")
    };
    Ok(InstallParams {
        repo: "lemonade-sdk/kokoro-server".to_string(),
        filename,
    })
}

fn ryzenai_install_params(_backend: &str, _version: &str) -> Result<InstallParams> {
    // Single-platform recipe: one archive name across versions.
    Ok(InstallParams {
        repo: "lemonade-sdk/ryzenai-server".to_string(),
        filename: "ryzenai-server.zip".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_lookup() {
        assert!(spec_for_recipe("llamacpp").is_some());
        assert!(spec_for_recipe("sd-cpp").is_some());
        assert!(spec_for_recipe("ollama").is_none());
    }

    #[test]
    fn test_every_recipe_has_backends_and_capabilities() {
        for spec in all_specs() {
            assert!(!spec.backends.is_empty(), "{} has no backends", spec.recipe);
            assert!(
                !spec.capabilities.is_empty(),
                "{} has no capabilities",
                spec.recipe
            );
        }
    }

    #[test]
    fn test_capability_routing() {
        assert_eq!(
            recipe_for_capability(Capability::Completions).unwrap().recipe,
            "llamacpp"
        );
        assert_eq!(
            recipe_for_capability(Capability::ImageGenerate).unwrap().recipe,
            "sd-cpp"
        );
        assert_eq!(
            recipe_for_capability(Capability::AudioTranscribe).unwrap().recipe,
            "whispercpp"
        );
        assert_eq!(
            recipe_for_capability(Capability::AudioSpeak).unwrap().recipe,
            "kokoro"
        );
    }

    #[test]
    fn test_sd_short_version() {
        assert_eq!(sd_short_version("master-631-8c4ed7b"), "master-8c4ed7b");
        // Fewer than two dashes: unchanged.
        assert_eq!(sd_short_version("v1.2.3"), "v1.2.3");
        assert_eq!(sd_short_version("master-8c4ed7b"), "master-8c4ed7b");
    }

    #[test]
    fn test_sd_install_params_uses_short_version() {
        let params = sd_install_params("cpu", "master-631-8c4ed7b").unwrap();
        assert!(params.filename.contains("master-8c4ed7b"));
        assert!(!params.filename.contains("631"));
        assert_eq!(params.repo, "superm1/stable-diffusion.cpp");
    }

    #[test]
    fn test_ryzenai_archive_is_fixed() {
        let params = ryzenai_install_params("npu", "v1.5.0").unwrap();
        assert_eq!(params.filename, "ryzenai-server.zip");
    }

    #[test]
    fn test_npu_recipes_rejected_off_windows() {
        if cfg!(windows) {
            return;
        }
        let spec = spec_for_recipe("ryzenai-llm").unwrap();
        let err = host_support(spec, "npu").unwrap_err();
        assert!(err.contains("Windows"));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let spec = spec_for_recipe("whispercpp").unwrap();
        assert!(host_support(spec, "vulkan").is_err());
    }

    #[test]
    fn test_default_backend_is_supported_or_first() {
        for spec in all_specs() {
            let backend = default_backend(spec);
            assert!(spec.backends.contains(&backend));
        }
    }

    #[test]
    fn test_llamacpp_rocm_comes_from_dedicated_repo() {
        if cfg!(target_os = "macos") {
            return;
        }
        let params = llamacpp_install_params("rocm", "b6210").unwrap();
        assert_eq!(params.repo, "lemonade-sdk/llamacpp-rocm");
    }
}
