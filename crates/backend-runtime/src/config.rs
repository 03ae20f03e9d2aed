//! Configuration types for the backend runtime

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{defaults, flm, timeouts};
use crate::error::{BackendError, Result};

const CACHE_DIR_ENV: &str = "BACKEND_RUNTIME_CACHE_DIR";
const DEBUG_ENV: &str = "BACKEND_RUNTIME_DEBUG";

/// Bounded retry used for directory removal on uninstall
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::UNINSTALL_ATTEMPTS,
            backoff_ms: defaults::UNINSTALL_BACKOFF_MS,
        }
    }
}

/// How long a freshly spawned backend gets to answer its readiness probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessPolicy {
    pub max_retries: u32,
    pub interval_ms: u64,
}

impl ReadinessPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_retries: defaults::READY_MAX_RETRIES,
            interval_ms: defaults::READY_INTERVAL_MS,
        }
    }
}

/// FastFlowLM installer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlmConfig {
    pub min_npu_driver_version: String,
    pub driver_update_url: String,
    pub verify_max_retries: u32,
    pub verify_interval_ms: u64,
}

impl Default for FlmConfig {
    fn default() -> Self {
        Self {
            min_npu_driver_version: flm::MIN_NPU_DRIVER_VERSION.to_string(),
            driver_update_url: flm::DRIVER_UPDATE_URL.to_string(),
            verify_max_retries: flm::VERIFY_MAX_RETRIES,
            verify_interval_ms: flm::VERIFY_INTERVAL_MS,
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root under which `bin/<recipe>/<backend>` install directories live
    pub cache_dir: PathBuf,
    /// Prefix of the install hint placed in status `action` fields
    pub install_command: String,
    pub uninstall_retry: RetryPolicy,
    pub readiness: ReadinessPolicy,
    /// Default timeout for unary proxied requests (seconds)
    pub request_timeout_secs: u64,
    /// Verbose backend logging and inherited subprocess output
    pub debug: bool,
    pub flm: FlmConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            install_command: defaults::INSTALL_COMMAND.to_string(),
            uninstall_retry: RetryPolicy::default(),
            readiness: ReadinessPolicy::default(),
            request_timeout_secs: timeouts::REQUEST_SECS,
            debug: false,
            flm: FlmConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("backend-runtime")
}

impl OrchestratorConfig {
    /// Load from a JSON file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        Ok(config.with_env_overrides())
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            if !dir.is_empty() {
                self.cache_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var(DEBUG_ENV) {
            self.debug = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// `<cache>/bin`, where every recipe gets its own directory
    pub fn bin_dir(&self) -> PathBuf {
        self.cache_dir.join("bin")
    }

    /// Scratch space for in-flight downloads
    pub fn download_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Required artifact version per recipe and backend variant.
///
/// Loaded once at startup and read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionConfig(BTreeMap<String, BTreeMap<String, String>>);

impl VersionConfig {
    /// The version table shipped with the crate
    pub fn bundled() -> Result<Self> {
        Self::from_json(include_str!("../resources/backend_versions.json"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn version(&self, recipe: &str, backend: &str) -> Result<&str> {
        self.0
            .get(recipe)
            .and_then(|backends| backends.get(backend))
            .map(String::as_str)
            .ok_or_else(|| BackendError::MissingVersionConfig {
                recipe: recipe.to_string(),
                backend: backend.to_string(),
            })
    }

    pub fn set(&mut self, recipe: &str, backend: &str, version: &str) {
        self.0
            .entry(recipe.to_string())
            .or_default()
            .insert(backend.to_string(), version.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_versions_cover_every_recipe() {
        let versions = VersionConfig::bundled().unwrap();
        for (recipe, backend) in [
            ("llamacpp", "vulkan"),
            ("llamacpp", "rocm"),
            ("flm", "npu"),
            ("sd-cpp", "cpu"),
            ("kokoro", "cpu"),
            ("ryzenai-llm", "npu"),
        ] {
            assert!(versions.version(recipe, backend).is_ok(), "{recipe}:{backend}");
        }
    }

    #[test]
    fn test_missing_entries_are_errors() {
        let versions = VersionConfig::from_json(r#"{"llamacpp": {"cpu": "b1"}}"#).unwrap();
        assert_eq!(versions.version("llamacpp", "cpu").unwrap(), "b1");
        assert!(matches!(
            versions.version("llamacpp", "rocm"),
            Err(BackendError::MissingVersionConfig { .. })
        ));
        assert!(versions.version("kokoro", "cpu").is_err());
    }

    #[test]
    fn test_config_defaults_and_partial_json() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"cache_dir": "/tmp/rt", "uninstall_retry": {"attempts": 2, "backoff_ms": 10}}"#)
                .unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/rt"));
        assert_eq!(config.uninstall_retry.attempts, 2);
        assert_eq!(config.readiness, ReadinessPolicy::default());
        assert_eq!(config.bin_dir(), PathBuf::from("/tmp/rt/bin"));
        assert_eq!(config.flm.min_npu_driver_version, "32.0.203.311");
    }
}
