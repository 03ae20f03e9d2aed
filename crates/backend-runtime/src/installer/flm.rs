//! FastFlowLM installer
//!
//! FastFlowLM ships as a system-wide Windows installer rather than a release
//! archive, so it bypasses the artifact path of [`super::Installer`]. The
//! installed `flm` executable is discovered on `PATH`, its version is read
//! from `flm version` and a fresh install must pass `flm validate`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::FlmConfig;
use crate::constants::{flm, github};
use crate::error::{BackendError, Result};
use crate::platform::{Os, Platform};
use crate::types::{report, DownloadProgress, ProgressCallback};
use crate::version::{is_at_least, Version};

use super::fetch::ArtifactFetcher;

/// System probes and side effects the FLM installer depends on
pub trait FlmEnvironment: Send + Sync {
    fn find_executable(&self) -> Option<PathBuf>;

    /// Output of `flm version`, already reduced to the version string
    fn installed_version(&self) -> Option<String>;

    /// Version of the installed NPU driver, if one can be determined
    fn npu_driver_version(&self) -> Option<String>;

    fn run_installer(&self, installer: &Path, silent: bool) -> Result<()>;

    /// Run `flm validate` against `executable`
    fn validate(&self, executable: &Path) -> Result<()>;
}

/// Queries the real machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemFlmEnvironment;

impl SystemFlmEnvironment {
    fn default_install_path() -> Option<PathBuf> {
        if cfg!(windows) {
            let path = PathBuf::from(r"C:\Program Files\flm\flm.exe");
            path.exists().then_some(path)
        } else {
            None
        }
    }
}

impl FlmEnvironment for SystemFlmEnvironment {
    fn find_executable(&self) -> Option<PathBuf> {
        which::which("flm").ok().or_else(Self::default_install_path)
    }

    fn installed_version(&self) -> Option<String> {
        let exe = self.find_executable()?;
        let output = Command::new(&exe).arg("version").output().ok()?;
        if !output.status.success() {
            log::debug!("`flm version` exited with {}", output.status);
            return None;
        }
        parse_version_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn npu_driver_version(&self) -> Option<String> {
        if !cfg!(windows) {
            return None;
        }
        let output = Command::new("powershell")
            .args([
                "-NoProfile",
                "-Command",
                "Get-CimInstance Win32_PnPSignedDriver | \
                 Where-Object { $_.DeviceName -like '*NPU*' } | \
                 Select-Object -First 1 -ExpandProperty DriverVersion",
            ])
            .output()
            .ok()?;
        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!version.is_empty()).then_some(version)
    }

    fn run_installer(&self, installer: &Path, silent: bool) -> Result<()> {
        let mut cmd = Command::new(installer);
        if silent {
            cmd.arg("/VERYSILENT");
        }
        log::info!("Running FastFlowLM installer (silent: {})", silent);

        let status = cmd
            .status()
            .map_err(|e| BackendError::Install(format!("Failed to run FastFlowLM installer: {}", e)))?;
        if !status.success() {
            return Err(BackendError::Install(format!(
                "FastFlowLM installer exited with {}",
                status
            )));
        }
        Ok(())
    }

    fn validate(&self, executable: &Path) -> Result<()> {
        let output = Command::new(executable)
            .arg("validate")
            .output()
            .map_err(|e| BackendError::Install(format!("Failed to run `flm validate`: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackendError::Install(format!(
                "`flm validate` failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

/// Pull the version token out of `flm version` output such as `FLM v0.9.10`
pub fn parse_version_output(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .rev()
        .find(|token| !Version::parse(token).is_empty() && token.contains('.'))
        .map(|token| token.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlmInstallOutcome {
    pub version: String,
    /// A previous FastFlowLM was replaced; models it validated may need to be
    /// pulled again
    pub was_upgraded: bool,
}

/// Installs and upgrades FastFlowLM
pub struct FlmInstaller {
    env: Arc<dyn FlmEnvironment>,
    fetcher: Arc<dyn ArtifactFetcher>,
    platform: Platform,
    download_dir: PathBuf,
    config: FlmConfig,
    /// Memoized `flm version`; outer `None` means not queried yet
    cached_version: Mutex<Option<Option<String>>>,
}

impl FlmInstaller {
    pub fn new(
        env: Arc<dyn FlmEnvironment>,
        fetcher: Arc<dyn ArtifactFetcher>,
        platform: Platform,
        download_dir: PathBuf,
        config: FlmConfig,
    ) -> Self {
        Self {
            env,
            fetcher,
            platform,
            download_dir,
            config,
            cached_version: Mutex::new(None),
        }
    }

    pub fn executable(&self) -> Option<PathBuf> {
        self.env.find_executable()
    }

    /// Memoized `flm version`. The query itself runs without the cache lock.
    pub fn installed_version(&self) -> Option<String> {
        let cached = self.cached_version.lock().clone();
        if let Some(version) = cached {
            return version;
        }
        let version = self.env.installed_version();
        *self.cached_version.lock() = Some(version.clone());
        version
    }

    /// [`Self::installed_version`] with the query moved to the blocking pool
    pub async fn installed_version_async(&self) -> Result<Option<String>> {
        let cached = self.cached_version.lock().clone();
        if let Some(version) = cached {
            return Ok(version);
        }
        let env = self.env.clone();
        let version = tokio::task::spawn_blocking(move || env.installed_version())
            .await
            .map_err(|e| BackendError::Install(format!("`flm version` task failed: {}", e)))?;
        *self.cached_version.lock() = Some(version.clone());
        Ok(version)
    }

    pub fn invalidate_version_cache(&self) {
        *self.cached_version.lock() = None;
    }

    fn check_platform(&self) -> Result<()> {
        if self.platform.os != Os::Windows {
            return Err(BackendError::unsupported_backend(
                flm::RECIPE,
                flm::BACKEND,
                "FastFlowLM requires Windows with an NPU",
            ));
        }
        Ok(())
    }

    fn check_npu_driver(&self) -> Result<()> {
        let required = &self.config.min_npu_driver_version;
        match self.env.npu_driver_version() {
            Some(found) if !is_at_least(&found, required) => Err(BackendError::NpuDriverTooOld {
                found,
                required: required.clone(),
                update_url: self.config.driver_update_url.clone(),
            }),
            Some(found) => {
                log::debug!("NPU driver {} satisfies {}", found, required);
                Ok(())
            }
            None => {
                log::warn!("Could not determine NPU driver version, continuing");
                Ok(())
            }
        }
    }

    /// Install or upgrade FastFlowLM so that at least `required` is present
    pub async fn install_if_needed(
        &self,
        required: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<FlmInstallOutcome> {
        self.check_platform()?;
        self.check_npu_driver()?;

        let installed = self.installed_version_async().await?;
        if let Some(current) = installed.as_deref() {
            if is_at_least(current, required) {
                log::debug!("FastFlowLM {} satisfies {}", current, required);
                return Ok(FlmInstallOutcome {
                    version: current.to_string(),
                    was_upgraded: false,
                });
            }
            log::info!("Upgrading FastFlowLM from {} to {}", current, required);
        } else {
            log::info!("FastFlowLM not found, installing {}", required);
        }

        std::fs::create_dir_all(&self.download_dir)?;
        let installer_path = self.download_dir.join(flm::INSTALLER_FILENAME);
        let url = github::download_url(flm::REPO, required, flm::INSTALLER_FILENAME);

        report(
            progress,
            DownloadProgress::status(format!("Downloading {}...", flm::INSTALLER_FILENAME)),
        );
        let result = self.download_and_run(&url, &installer_path, installed.is_some(), progress).await;
        let _ = std::fs::remove_file(&installer_path);
        result?;

        self.verify_installation(required).await?;

        report(
            progress,
            DownloadProgress {
                status: "Complete".to_string(),
                current: 0,
                total: 0,
                done: true,
                error: None,
            },
        );

        Ok(FlmInstallOutcome {
            version: required.to_string(),
            was_upgraded: installed.is_some(),
        })
    }

    async fn download_and_run(
        &self,
        url: &str,
        installer_path: &Path,
        silent: bool,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        self.fetcher.fetch(url, installer_path, progress).await?;

        report(progress, DownloadProgress::status("Running installer..."));

        let env = self.env.clone();
        let path = installer_path.to_path_buf();
        tokio::task::spawn_blocking(move || env.run_installer(&path, silent))
            .await
            .map_err(|e| BackendError::Install(format!("Installer task failed: {}", e)))?
    }

    /// Poll `flm version` until it reports at least `required`, then run
    /// `flm validate`
    async fn verify_installation(&self, required: &str) -> Result<()> {
        let interval = std::time::Duration::from_millis(self.config.verify_interval_ms);
        let attempts = self.config.verify_max_retries.max(1);

        for attempt in 1..=attempts {
            self.invalidate_version_cache();
            if let Some(found) = self.installed_version_async().await? {
                if is_at_least(&found, required) {
                    log::info!("FastFlowLM {} installed, validating", found);
                    return self.validate().await;
                }
                log::debug!(
                    "FastFlowLM reports {} (attempt {}/{}), waiting for {}",
                    found,
                    attempt,
                    attempts,
                    required
                );
            }
            if attempt < attempts {
                tokio::time::sleep(interval).await;
            }
        }

        self.invalidate_version_cache();
        Err(BackendError::Install(format!(
            "FastFlowLM {} could not be verified after installation",
            required
        )))
    }

    async fn validate(&self) -> Result<()> {
        let executable = self.env.find_executable().ok_or_else(|| {
            BackendError::Install("flm executable not found on PATH after installation".to_string())
        })?;
        let env = self.env.clone();
        tokio::task::spawn_blocking(move || env.validate(&executable))
            .await
            .map_err(|e| BackendError::Install(format!("`flm validate` task failed: {}", e)))?
    }
}
