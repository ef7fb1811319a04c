//! Configuration for the gateway.

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    /// Root for engine binaries (`bin/`) and model weights (`models/`).
    /// Overridden by LEMON_CACHE_DIR.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Root for backend_versions.json and user_models.json.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    /// Log verbosity handed to child engines. Overridden by LEMON_LOG_LEVEL.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub engines: EnginesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnginesConfig {
    /// Readiness deadline override; recipe defaults apply when unset.
    #[serde(default)]
    pub load_timeout_secs: Option<u64>,
    /// Graceful shutdown grace before force-kill.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    /// Mirror child engine stdout/stderr into the gateway log.
    #[serde(default)]
    pub log_engine_output: bool,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            log_engine_output: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_timeout() -> u64 {
    5
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lemon")
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lemon")
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Sources, in order of precedence:
    /// 1. LEMON_CACHE_DIR / LEMON_LOG_LEVEL direct overrides
    /// 2. Environment variables (LEMON__SECTION__KEY format)
    /// 3. lemon.toml file (if present)
    /// 4. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::builder()
            .set_default("api.host", default_host())?
            .set_default("api.port", default_port() as i64)?
            .add_source(File::with_name("lemon").required(false))
            .add_source(
                Environment::with_prefix("LEMON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = loader.try_deserialize()?;

        if let Ok(dir) = std::env::var("LEMON_CACHE_DIR") {
            if !dir.is_empty() {
                config.cache_dir = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var("LEMON_LOG_LEVEL") {
            if !level.is_empty() {
                config.log_level = level;
            }
        }

        Ok(config)
    }

    /// Engine install directories live under `<cache_dir>/bin`.
    pub fn bin_dir(&self) -> PathBuf {
        self.cache_dir.join("bin")
    }

    /// Model weights live under `<cache_dir>/models`.
    pub fn models_dir(&self) -> PathBuf {
        self.cache_dir.join("models")
    }

    pub fn user_models_path(&self) -> PathBuf {
        self.config_dir.join("user_models.json")
    }

    pub fn backend_versions_path(&self) -> PathBuf {
        self.config_dir.join("backend_versions.json")
    }

    pub fn is_debug(&self) -> bool {
        self.log_level.eq_ignore_ascii_case("debug")
            || self.log_level.eq_ignore_ascii_case("trace")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            cache_dir: default_cache_dir(),
            config_dir: default_config_dir(),
            log_level: default_log_level(),
            engines: EnginesConfig::default(),
        }
    }
}
