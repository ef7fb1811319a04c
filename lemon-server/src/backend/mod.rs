//! Backend manager: installs, uninstalls and tracks native engine
//! distributions, and publishes the recipes cache consumed by
//! `/system-info`.

pub mod artifact;
pub mod flm;
pub mod spec;
pub mod version;

use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::{json, Value};

use crate::backend::artifact::{ArtifactStore, ProgressCallback};
use crate::backend::spec::{all_specs, get_spec, host_support, BackendSpec, InstallKind};
use crate::backend::version::{Version, VersionRegistry};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transfers::AbortFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Installed,
    Installable,
    UpdateRequired,
    Unsupported,
}

impl BackendState {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendState::Installed => "installed",
            BackendState::Installable => "installable",
            BackendState::UpdateRequired => "update_required",
            BackendState::Unsupported => "unsupported",
        }
    }
}

/// Probed status of one (recipe, backend) target.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub state: BackendState,
    pub message: String,
    pub action: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeStatus {
    pub recipe: String,
    pub backends: Vec<BackendStatus>,
}

/// Fields kept coherent in the cache across installed / not-installed
/// transitions, computed in one call.
#[derive(Debug, Clone, Default)]
pub struct BackendEnrichment {
    pub release_url: String,
    pub download_filename: String,
    pub version: String,
}

pub struct BackendManager {
    artifacts: ArtifactStore,
    versions: VersionRegistry,
    /// JSON-shaped recipes view; `Value::Null` until first populated.
    /// Guarded by a plain mutex, never held across I/O.
    cache: Mutex<Value>,
}

impl BackendManager {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            artifacts: ArtifactStore::new(config.bin_dir()),
            versions: VersionRegistry::load(&config.backend_versions_path())?,
            cache: Mutex::new(Value::Null),
        })
    }

    #[cfg(test)]
    pub fn with_artifacts(artifacts: ArtifactStore) -> Self {
        Self {
            artifacts,
            versions: VersionRegistry::bundled(),
            cache: Mutex::new(Value::Null),
        }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub fn required_version(&self, recipe: &str, backend: &str) -> Result<String> {
        self.versions.required(recipe, backend)
    }

    fn install_action(recipe: &str, backend: &str) -> String {
        format!("lemon-server install {recipe}:{backend}")
    }

    // ========================================================================
    // Core operations
    // ========================================================================

    pub async fn install(
        &self,
        recipe: &str,
        backend: &str,
        abort: Option<Arc<AbortFlag>>,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        tracing::info!("Installing {recipe}:{backend}");
        let spec = get_spec(recipe)?;

        if let Err(reason) = host_support(spec, backend) {
            return Err(Error::UnsupportedBackend {
                recipe: recipe.to_string(),
                backend: backend.to_string(),
                reason,
            });
        }

        let required = self.versions.required(recipe, backend)?;

        match spec.install {
            InstallKind::VendorInstaller => {
                flm::install_if_needed(&self.artifacts, &required, abort, progress).await?;
            }
            InstallKind::GithubRelease(params_fn) => {
                // Installing the version already on disk is a no-op.
                if let Some((installed, _)) = self.artifacts.installed_executable(spec, backend) {
                    if Version::parse(&installed).at_least(&Version::parse(&required)) {
                        tracing::info!(
                            "{recipe}:{backend} {installed} already satisfies {required}"
                        );
                        self.update_recipes_cache_entry(recipe, backend, true);
                        return Ok(());
                    }
                }

                let params = params_fn(backend, &required)?;
                self.artifacts
                    .install_from_github(
                        spec,
                        &required,
                        &params.repo,
                        &params.filename,
                        backend,
                        abort,
                        progress,
                    )
                    .await
                    .map_err(|e| match e {
                        // Abort is the caller's doing, not an install failure.
                        Error::DownloadAborted(_) => e,
                        other => Error::BackendInstallFailed {
                            recipe: recipe.to_string(),
                            backend: backend.to_string(),
                            cause: other.to_string(),
                        },
                    })?;
            }
        }

        self.update_recipes_cache_entry(recipe, backend, true);
        Ok(())
    }

    pub async fn uninstall(&self, recipe: &str, backend: &str) -> Result<()> {
        tracing::info!("Uninstalling {recipe}:{backend}");

        if recipe == "flm" {
            return Err(Error::InvalidRequest(
                "Uninstall FastFlowLM using the vendor's uninstaller.".to_string(),
            ));
        }

        get_spec(recipe)?;
        self.artifacts.remove_install_dir(recipe, backend).await?;
        self.update_recipes_cache_entry(recipe, backend, false);
        Ok(())
    }

    // ========================================================================
    // Query operations
    // ========================================================================

    /// Probe every (recipe, backend) target in the spec table.
    pub async fn get_all_backends_status(&self) -> Vec<RecipeStatus> {
        let mut result = Vec::new();
        for spec in all_specs() {
            let mut backends = Vec::new();
            for backend in spec.backends {
                backends.push(self.backend_status(spec, backend).await);
            }
            result.push(RecipeStatus {
                recipe: spec.recipe.to_string(),
                backends,
            });
        }
        result
    }

    async fn backend_status(&self, spec: &'static BackendSpec, backend: &str) -> BackendStatus {
        if let Err(reason) = host_support(spec, backend) {
            return BackendStatus {
                name: backend.to_string(),
                state: BackendState::Unsupported,
                message: reason,
                action: String::new(),
                version: String::new(),
            };
        }

        let required = self.versions.required(spec.recipe, backend).unwrap_or_default();

        if matches!(spec.install, InstallKind::VendorInstaller) {
            return self.vendor_status(spec, backend, &required).await;
        }

        match self.artifacts.installed_executable(spec, backend) {
            None => BackendStatus {
                name: backend.to_string(),
                state: BackendState::Installable,
                message: "Backend is supported but not installed.".to_string(),
                action: Self::install_action(spec.recipe, backend),
                version: required,
            },
            Some((installed, _)) => {
                if Version::parse(&installed).at_least(&Version::parse(&required)) {
                    BackendStatus {
                        name: backend.to_string(),
                        state: BackendState::Installed,
                        message: String::new(),
                        action: String::new(),
                        version: installed,
                    }
                } else {
                    BackendStatus {
                        name: backend.to_string(),
                        state: BackendState::UpdateRequired,
                        message: format!(
                            "Installed version {installed} is older than required {required}."
                        ),
                        action: Self::install_action(spec.recipe, backend),
                        version: installed,
                    }
                }
            }
        }
    }

    /// The vendor-installed recipe: state comes from a PATH lookup plus a
    /// version probe and the NPU driver gate, and the install action hands
    /// off to the vendor installer.
    async fn vendor_status(
        &self,
        spec: &'static BackendSpec,
        backend: &str,
        required: &str,
    ) -> BackendStatus {
        let Some(installed) = flm::installed_version().await else {
            return BackendStatus {
                name: backend.to_string(),
                state: BackendState::Installable,
                message: format!("{} is supported but not installed.", spec.recipe),
                action: Self::install_action(spec.recipe, backend),
                version: required.to_string(),
            };
        };

        let version_ok =
            Version::parse(&installed).at_least(&Version::parse(required));
        let driver_ok = flm::driver_version_ok().await;

        if version_ok && driver_ok {
            BackendStatus {
                name: backend.to_string(),
                state: BackendState::Installed,
                message: String::new(),
                action: String::new(),
                version: installed,
            }
        } else {
            let message = if !version_ok {
                format!("Installed version {installed} is older than required {required}.")
            } else {
                format!(
                    "NPU driver older than required {}.",
                    flm::MIN_NPU_DRIVER_VERSION
                )
            };
            BackendStatus {
                name: backend.to_string(),
                state: BackendState::UpdateRequired,
                message,
                action: Self::install_action(spec.recipe, backend),
                version: installed,
            }
        }
    }

    /// Release URL, archive filename and version in one call.
    pub fn get_backend_enrichment(&self, recipe: &str, backend: &str) -> BackendEnrichment {
        let mut result = BackendEnrichment::default();

        let Ok(version) = self.versions.required(recipe, backend) else {
            return result;
        };

        if recipe == "flm" {
            result.release_url =
                format!("https://github.com/{}/releases/tag/{version}", flm::VENDOR_REPO);
            result.download_filename = flm::INSTALLER_FILENAME.to_string();
            result.version = version;
            return result;
        }

        let Some(spec) = spec::spec_for_recipe(recipe) else {
            return result;
        };
        if let InstallKind::GithubRelease(params_fn) = spec.install {
            if let Ok(params) = params_fn(backend, &version) {
                result.release_url =
                    format!("https://github.com/{}/releases/tag/{version}", params.repo);
                result.download_filename = params.filename;
            }
        }
        result.version = version;
        result
    }

    // ========================================================================
    // Recipes cache
    // ========================================================================

    /// Build the cache from probed statuses. Called on the first
    /// `/system-info`; afterwards install/uninstall keep it current with
    /// targeted updates.
    pub async fn refresh_recipes_cache(&self) -> Value {
        let statuses = self.get_all_backends_status().await;

        let mut recipes = serde_json::Map::new();
        for recipe_status in statuses {
            let mut backends = serde_json::Map::new();
            for b in recipe_status.backends {
                let mut entry = serde_json::Map::new();
                entry.insert("state".into(), json!(b.state.as_str()));
                entry.insert("message".into(), json!(b.message));
                entry.insert("action".into(), json!(b.action));
                if !b.version.is_empty() {
                    entry.insert("version".into(), json!(b.version));
                }
                let enrichment = self.get_backend_enrichment(&recipe_status.recipe, &b.name);
                if !enrichment.release_url.is_empty() {
                    entry.insert("release_url".into(), json!(enrichment.release_url));
                }
                if !enrichment.download_filename.is_empty() {
                    entry.insert(
                        "download_filename".into(),
                        json!(enrichment.download_filename),
                    );
                }
                backends.insert(b.name, Value::Object(entry));
            }
            recipes.insert(
                recipe_status.recipe,
                json!({ "backends": Value::Object(backends) }),
            );
        }

        let cache = Value::Object(recipes);
        *self.cache.lock().unwrap() = cache.clone();
        cache
    }

    pub fn get_recipes_cache(&self) -> Value {
        self.cache.lock().unwrap().clone()
    }

    pub fn recipes_cache_is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_null()
    }

    /// Mutate exactly one backend entry; everything else — including rows
    /// marked unsupported — stays untouched.
    pub fn update_recipes_cache_entry(&self, recipe: &str, backend: &str, installed: bool) {
        // Enrichment reads config tables only; compute it before taking
        // the cache lock.
        let enrichment = self.get_backend_enrichment(recipe, backend);

        let mut cache = self.cache.lock().unwrap();
        if cache.is_null() {
            return;
        }

        let Some(info) = cache
            .get_mut(recipe)
            .and_then(|r| r.get_mut("backends"))
            .and_then(|b| b.get_mut(backend))
            .and_then(|v| v.as_object_mut())
        else {
            return;
        };

        let current_state = info
            .get("state")
            .and_then(|s| s.as_str())
            .unwrap_or("unsupported")
            .to_string();

        if current_state == "unsupported" {
            info.insert("action".into(), json!(""));
        } else if installed {
            info.insert("state".into(), json!("installed"));
            info.insert("message".into(), json!(""));
            info.insert("action".into(), json!(""));
        } else {
            info.insert("state".into(), json!("installable"));
            info.insert(
                "message".into(),
                json!("Backend is supported but not installed."),
            );
            info.insert("action".into(), json!(Self::install_action(recipe, backend)));
        }

        // Version stays visible in /system-info even when not installed.
        if !enrichment.version.is_empty() {
            info.insert("version".into(), json!(enrichment.version));
        } else {
            info.remove("version");
        }
        if !enrichment.release_url.is_empty() {
            info.insert("release_url".into(), json!(enrichment.release_url));
        }
        if !enrichment.download_filename.is_empty() {
            info.insert(
                "download_filename".into(),
                json!(enrichment.download_filename),
            );
        }
    }
}
