//! Download, extract and remove backend binaries
//!
//! Every recipe/backend pair installs into `<cache>/bin/<recipe>/<backend>`.
//! The presence of that directory is the ground truth for "installed"; a
//! `version.txt` marker inside it records which release was extracted.
//!
//! Installs are staged: the artifact is downloaded to a `.part` file and
//! extracted into a sibling staging directory, which only replaces the live
//! install directory once extraction succeeded.

pub mod archive;
pub mod fetch;
pub mod flm;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::config::RetryPolicy;
use crate::constants::{github, VERSION_MARKER};
use crate::error::{BackendError, Result};
use crate::platform::Platform;
use crate::registry::BackendSpec;
use crate::types::{report, DownloadProgress, ProgressCallback};

pub use fetch::{ArtifactFetcher, HttpFetcher};

/// Resolved artifact coordinates for one recipe/backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallParams {
    pub repo: String,
    pub filename: String,
    pub version: String,
}

impl InstallParams {
    pub fn release_url(&self) -> String {
        github::release_url(&self.repo, &self.version)
    }

    pub fn download_url(&self) -> String {
        github::download_url(&self.repo, &self.version, &self.filename)
    }
}

/// What an install call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub recipe: String,
    pub backend: String,
    pub version: String,
    /// A different version was installed before this run replaced it.
    /// Callers should treat previously validated model checkpoints for the
    /// backend as stale.
    pub was_upgraded: bool,
    /// Nothing was downloaded because a suitable install already existed
    pub already_installed: bool,
}

/// Filesystem side of backend installation
pub struct Installer {
    bin_dir: PathBuf,
    download_dir: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl Installer {
    pub fn new(bin_dir: PathBuf, download_dir: PathBuf, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            bin_dir,
            download_dir,
            fetcher,
        }
    }

    pub fn fetcher(&self) -> &Arc<dyn ArtifactFetcher> {
        &self.fetcher
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn install_directory(&self, recipe: &str, backend: &str) -> PathBuf {
        self.bin_dir.join(recipe).join(backend)
    }

    pub fn is_installed(&self, recipe: &str, backend: &str) -> bool {
        self.install_directory(recipe, backend).is_dir()
    }

    /// Version recorded by the last successful install, if any
    pub fn installed_version(&self, recipe: &str, backend: &str) -> Option<String> {
        let marker = self.install_directory(recipe, backend).join(VERSION_MARKER);
        std::fs::read_to_string(marker)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Locate the recipe's executable inside its install directory
    pub fn find_binary(&self, spec: &BackendSpec, platform: &Platform, backend: &str) -> Option<PathBuf> {
        let dir = self.install_directory(spec.recipe, backend);
        archive::find_file(&dir, &spec.executable_name(platform))
    }

    /// Download and extract `params` unless a matching install already exists
    pub async fn install_from_github(
        &self,
        spec: &BackendSpec,
        platform: &Platform,
        backend: &str,
        params: &InstallParams,
        do_not_upgrade: bool,
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallOutcome> {
        let install_dir = self.install_directory(spec.recipe, backend);
        let installed_version = self.installed_version(spec.recipe, backend);
        let has_binary = self.find_binary(spec, platform, backend).is_some();

        let mut outcome = InstallOutcome {
            recipe: spec.recipe.to_string(),
            backend: backend.to_string(),
            version: params.version.clone(),
            was_upgraded: false,
            already_installed: false,
        };

        if has_binary {
            match installed_version.as_deref() {
                Some(v) if v == params.version => {
                    log::debug!("{}:{} {} already installed", spec.recipe, backend, v);
                    outcome.already_installed = true;
                    return Ok(outcome);
                }
                Some(v) if do_not_upgrade => {
                    log::info!(
                        "{}:{} has {} installed, skipping upgrade to {}",
                        spec.recipe,
                        backend,
                        v,
                        params.version
                    );
                    outcome.version = v.to_string();
                    outcome.already_installed = true;
                    return Ok(outcome);
                }
                Some(v) => {
                    log::info!(
                        "Upgrading {}:{} from {} to {}",
                        spec.recipe,
                        backend,
                        v,
                        params.version
                    );
                    outcome.was_upgraded = true;
                }
                None => {
                    log::warn!(
                        "{}:{} has no version marker, reinstalling",
                        spec.recipe,
                        backend
                    );
                    outcome.was_upgraded = true;
                }
            }
        }

        std::fs::create_dir_all(&self.download_dir).map_err(|e| {
            BackendError::Install(format!("Failed to create download directory: {}", e))
        })?;

        let archive_path = self.download_dir.join(&params.filename);
        let partial_path = self.download_dir.join(format!("{}.part", params.filename));
        let staging_dir = staging_path(&install_dir);

        report(
            progress,
            DownloadProgress::status(format!("Downloading {}...", params.filename)),
        );

        let result = self
            .download_and_stage(params, &partial_path, &archive_path, &staging_dir, progress)
            .await
            .and_then(|()| check_staged_binary(&staging_dir, &spec.executable_name(platform), params))
            .and_then(|()| self.promote(&staging_dir, &install_dir, &params.version));

        // Partial-failure cleanup: nothing from a failed run stays behind, and
        // the live install is only touched by a successful promote
        let _ = std::fs::remove_file(&partial_path);
        let _ = std::fs::remove_file(&archive_path);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&staging_dir);
        }
        result?;

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

        log::info!(
            "Installed {}:{} {} to {:?}",
            spec.recipe,
            backend,
            params.version,
            install_dir
        );
        Ok(outcome)
    }

    async fn download_and_stage(
        &self,
        params: &InstallParams,
        partial_path: &Path,
        archive_path: &Path,
        staging_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<()> {
        self.fetcher
            .fetch(&params.download_url(), partial_path, progress)
            .await?;
        std::fs::rename(partial_path, archive_path)?;

        report(progress, DownloadProgress::status("Extracting..."));

        if staging_dir.exists() {
            std::fs::remove_dir_all(staging_dir)?;
        }
        std::fs::create_dir_all(staging_dir)?;

        let archive = archive_path.to_path_buf();
        let staging = staging_dir.to_path_buf();
        let filename = params.filename.clone();
        tokio::task::spawn_blocking(move || archive::extract(&archive, &filename, &staging))
            .await
            .map_err(|e| BackendError::Install(format!("Extraction task failed: {}", e)))?
    }

    fn promote(&self, staging_dir: &Path, install_dir: &Path, version: &str) -> Result<()> {
        std::fs::write(staging_dir.join(VERSION_MARKER), version)?;
        if install_dir.exists() {
            std::fs::remove_dir_all(install_dir).map_err(|e| {
                BackendError::Install(format!("Failed to replace {:?}: {}", install_dir, e))
            })?;
        }
        if let Some(parent) = install_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(staging_dir, install_dir)?;
        Ok(())
    }

    /// Remove an install directory, retrying transient failures.
    ///
    /// Returns whether anything was removed.
    pub async fn remove_install_dir(
        &self,
        recipe: &str,
        backend: &str,
        policy: &RetryPolicy,
    ) -> Result<bool> {
        self.remove_install_dir_with(recipe, backend, policy, |path| std::fs::remove_dir_all(path))
            .await
    }

    /// [`Self::remove_install_dir`] with a caller-supplied remover
    pub(crate) async fn remove_install_dir_with<F>(
        &self,
        recipe: &str,
        backend: &str,
        policy: &RetryPolicy,
        remove: F,
    ) -> Result<bool>
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        let dir = self.install_directory(recipe, backend);
        if !dir.exists() {
            log::info!("Nothing to uninstall at: {:?}", dir);
            return Ok(false);
        }

        remove_dir_with_retry(&dir, policy, remove).await?;
        log::info!("Removed: {:?}", dir);
        Ok(true)
    }
}

/// The executable must be present in the staged tree before it may replace
/// the live install
fn check_staged_binary(staging_dir: &Path, executable: &str, params: &InstallParams) -> Result<()> {
    let binary = archive::find_file(staging_dir, executable).ok_or_else(|| {
        BackendError::Install(format!(
            "{} not found in {} after extraction",
            executable, params.filename
        ))
    })?;
    archive::mark_executable(&binary)
}

fn staging_path(install_dir: &Path) -> PathBuf {
    let mut name = install_dir
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".staging");
    install_dir.with_file_name(name)
}

/// Call `remove` until the directory is gone or the policy's attempts run out.
///
/// Antivirus scanners and indexers briefly hold handles on freshly extracted
/// files, so a failed attempt is retried after the policy's backoff.
pub async fn remove_dir_with_retry<F>(path: &Path, policy: &RetryPolicy, mut remove: F) -> Result<()>
where
    F: FnMut(&Path) -> std::io::Result<()>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match remove(path) {
            Ok(()) => return Ok(()),
            Err(_) if !path.exists() => return Ok(()),
            Err(e) => {
                log::warn!(
                    "Failed to remove {:?} (attempt {}/{}): {}",
                    path,
                    attempt,
                    attempts,
                    e
                );
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(policy.backoff()).await;
        }
    }

    Err(BackendError::UninstallLocked {
        path: path.to_path_buf(),
        source: last_error.unwrap_or_else(|| std::io::Error::other("directory is locked")),
    })
}
