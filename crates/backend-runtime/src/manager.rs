//! Backend manager
//!
//! Entry point for everything install-related: resolving artifacts for a
//! recipe/backend pair, installing and uninstalling them, reporting release
//! metadata and keeping the recipe status cache current.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{OrchestratorConfig, VersionConfig};
use crate::constants::{flm, github};
use crate::error::{BackendError, Result};
use crate::installer::flm::{FlmEnvironment, FlmInstaller, SystemFlmEnvironment};
use crate::installer::{ArtifactFetcher, HttpFetcher, InstallOutcome, InstallParams, Installer};
use crate::platform::{Os, Platform};
use crate::registry::{BackendRegistry, BackendSpec};
use crate::status::{
    BackendEnrichment, BackendState, BackendStatus, BackendStatusEntry, RecipeMap,
    RecipeStatus, RecipeStatusCache,
};
use crate::types::ProgressCallback;

pub struct BackendManager {
    config: OrchestratorConfig,
    versions: VersionConfig,
    registry: BackendRegistry,
    platform: Platform,
    fetcher: Arc<dyn ArtifactFetcher>,
    flm_env: Arc<dyn FlmEnvironment>,
    installer: Installer,
    flm: FlmInstaller,
    cache: RecipeStatusCache,
}

impl BackendManager {
    /// Manager for the current machine, downloading over HTTP
    pub fn new(config: OrchestratorConfig, versions: VersionConfig) -> Self {
        Self::assemble(
            config,
            versions,
            Platform::current(),
            Arc::new(HttpFetcher::new()),
            Arc::new(SystemFlmEnvironment),
        )
    }

    fn assemble(
        config: OrchestratorConfig,
        versions: VersionConfig,
        platform: Platform,
        fetcher: Arc<dyn ArtifactFetcher>,
        flm_env: Arc<dyn FlmEnvironment>,
    ) -> Self {
        let installer = Installer::new(config.bin_dir(), config.download_dir(), fetcher.clone());
        let flm = FlmInstaller::new(
            flm_env.clone(),
            fetcher.clone(),
            platform.clone(),
            config.download_dir(),
            config.flm.clone(),
        );

        Self {
            config,
            versions,
            registry: BackendRegistry::new(),
            platform,
            fetcher,
            flm_env,
            installer,
            flm,
            cache: RecipeStatusCache::new(),
        }
    }

    fn rebuild(self) -> Self {
        let cache = self.cache.snapshot();
        let rebuilt = Self::assemble(
            self.config,
            self.versions,
            self.platform,
            self.fetcher,
            self.flm_env,
        );
        if let Some(recipes) = cache {
            rebuilt.cache.set(recipes);
        }
        Self {
            registry: self.registry,
            ..rebuilt
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self.rebuild()
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = fetcher;
        self.rebuild()
    }

    pub fn with_flm_environment(mut self, env: Arc<dyn FlmEnvironment>) -> Self {
        self.flm_env = env;
        self.rebuild()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn flm(&self) -> &FlmInstaller {
        &self.flm
    }

    pub fn versions(&self) -> &VersionConfig {
        &self.versions
    }

    // ------------------------------------------------------------------
    // Install parameters
    // ------------------------------------------------------------------

    /// Repository, asset name and version for a recipe/backend
    pub fn get_install_params(&self, recipe: &str, backend: &str) -> Result<InstallParams> {
        if recipe == flm::RECIPE {
            return Err(BackendError::UnsupportedInstallPath(recipe.to_string()));
        }

        let spec = self.registry.get(recipe)?;
        let version = self.versions.version(recipe, backend)?;
        let artifact = spec.resolve(&self.platform, backend, version)?;

        Ok(InstallParams {
            repo: artifact.repo,
            filename: artifact.filename,
            version: version.to_string(),
        })
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    /// Install (or upgrade) a backend to the configured version
    pub async fn install_backend(
        &self,
        recipe: &str,
        backend: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallOutcome> {
        log::info!("Installing {}:{}", recipe, backend);
        self.ensure_installed(recipe, backend, false, progress).await
    }

    /// Install a backend if it is missing or out of date.
    ///
    /// With `do_not_upgrade`, any existing install is accepted as is.
    pub async fn ensure_installed(
        &self,
        recipe: &str,
        backend: &str,
        do_not_upgrade: bool,
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallOutcome> {
        let outcome = if recipe == flm::RECIPE {
            self.install_flm(backend, progress).await?
        } else {
            let spec = self.registry.get(recipe)?;
            let params = self.get_install_params(recipe, backend)?;
            self.installer
                .install_from_github(spec, &self.platform, backend, &params, do_not_upgrade, progress)
                .await?
        };

        self.update_cache_entry(recipe, backend, true);
        Ok(outcome)
    }

    async fn install_flm(
        &self,
        backend: &str,
        progress: Option<&ProgressCallback>,
    ) -> Result<InstallOutcome> {
        let required = self.versions.version(flm::RECIPE, backend)?;
        let result = self.flm.install_if_needed(required, progress).await?;
        Ok(InstallOutcome {
            recipe: flm::RECIPE.to_string(),
            backend: backend.to_string(),
            version: result.version,
            was_upgraded: result.was_upgraded,
            already_installed: false,
        })
    }

    /// Remove a backend's install directory and mark it installable
    pub async fn uninstall_backend(&self, recipe: &str, backend: &str) -> Result<()> {
        self.uninstall_backend_with(recipe, backend, |path| std::fs::remove_dir_all(path))
            .await
    }

    /// The cache entry is only patched once the directory is gone
    pub(crate) async fn uninstall_backend_with<F>(
        &self,
        recipe: &str,
        backend: &str,
        remove: F,
    ) -> Result<()>
    where
        F: FnMut(&Path) -> std::io::Result<()>,
    {
        log::info!("Uninstalling {}:{}", recipe, backend);

        if recipe == flm::RECIPE {
            return Err(BackendError::UninstallNotSupported(
                "Uninstall FastFlowLM using their Windows uninstaller.".to_string(),
            ));
        }

        let spec = self.registry.get(recipe)?;
        self.installer
            .remove_install_dir_with(spec.recipe, backend, &self.config.uninstall_retry, remove)
            .await?;

        self.update_cache_entry(recipe, backend, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query operations (never fail; empty string means unknown)
    // ------------------------------------------------------------------

    pub fn get_latest_version(&self, recipe: &str, backend: &str) -> String {
        self.versions
            .version(recipe, backend)
            .map(str::to_string)
            .unwrap_or_default()
    }

    pub fn get_release_url(&self, recipe: &str, backend: &str) -> String {
        self.get_backend_enrichment(recipe, backend).release_url
    }

    pub fn get_download_filename(&self, recipe: &str, backend: &str) -> String {
        if recipe == flm::RECIPE {
            return String::new();
        }
        self.get_install_params(recipe, backend)
            .map(|p| p.filename)
            .unwrap_or_default()
    }

    /// Version, release URL and asset name in one lookup
    pub fn get_backend_enrichment(&self, recipe: &str, backend: &str) -> BackendEnrichment {
        if recipe == flm::RECIPE {
            let version = self.get_latest_version(recipe, backend);
            let release_url = if version.is_empty() {
                String::new()
            } else {
                github::release_url(flm::REPO, &version)
            };
            return BackendEnrichment {
                release_url,
                download_filename: flm::INSTALLER_FILENAME.to_string(),
                version,
            };
        }

        match self.get_install_params(recipe, backend) {
            Ok(params) => BackendEnrichment {
                release_url: params.release_url(),
                download_filename: params.filename,
                version: params.version,
            },
            Err(e) => {
                log::debug!("No enrichment for {}:{}: {}", recipe, backend, e);
                BackendEnrichment::default()
            }
        }
    }

    // ------------------------------------------------------------------
    // Filesystem queries
    // ------------------------------------------------------------------

    pub fn install_directory(&self, recipe: &str, backend: &str) -> PathBuf {
        self.installer.install_directory(recipe, backend)
    }

    pub fn is_installed(&self, recipe: &str, backend: &str) -> bool {
        if recipe == flm::RECIPE {
            return self.flm.installed_version().is_some();
        }
        self.installer.is_installed(recipe, backend)
    }

    /// Path of the installed server executable for a recipe/backend
    pub fn backend_binary_path(&self, spec: &BackendSpec, backend: &str) -> Result<PathBuf> {
        if spec.recipe == flm::RECIPE {
            return self
                .flm
                .executable()
                .ok_or_else(|| BackendError::Install("flm executable not found on PATH".to_string()));
        }
        self.installer
            .find_binary(spec, &self.platform, backend)
            .ok_or_else(|| {
                BackendError::Install(format!(
                    "{} not found in {:?}",
                    spec.executable_name(&self.platform),
                    self.install_directory(spec.recipe, backend)
                ))
            })
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn install_action(&self, recipe: &str, backend: &str) -> String {
        format!("{} {}:{}", self.config.install_command, recipe, backend)
    }

    fn support_error(&self, recipe: &str, backend: &str) -> Option<String> {
        if recipe == flm::RECIPE {
            return (self.platform.os != Os::Windows)
                .then(|| "FastFlowLM requires Windows with an NPU".to_string());
        }
        self.get_install_params(recipe, backend)
            .err()
            .map(|e| match e {
                BackendError::UnsupportedBackend { reason, .. } => reason,
                other => other.to_string(),
            })
    }

    /// Status of every known recipe/backend on this system
    pub fn backends_status(&self) -> Vec<RecipeStatus> {
        self.registry
            .recipes()
            .map(|spec| RecipeStatus {
                recipe: spec.recipe.to_string(),
                backends: spec
                    .backends
                    .iter()
                    .map(|backend| BackendStatus {
                        name: backend.to_string(),
                        entry: self.backend_status(spec.recipe, backend),
                    })
                    .collect(),
            })
            .collect()
    }

    fn backend_status(&self, recipe: &str, backend: &str) -> BackendStatusEntry {
        let enrichment = self.get_backend_enrichment(recipe, backend);
        let mut entry = BackendStatusEntry {
            version: (!enrichment.version.is_empty()).then_some(enrichment.version),
            release_url: (!enrichment.release_url.is_empty()).then_some(enrichment.release_url),
            ..Default::default()
        };

        if let Some(reason) = self.support_error(recipe, backend) {
            entry.state = BackendState::Unsupported;
            entry.message = reason;
        } else if self.is_installed(recipe, backend) {
            entry.state = BackendState::Installed;
        } else {
            entry.state = BackendState::Installable;
            entry.message = "Backend is supported but not installed.".to_string();
            entry.action = self.install_action(recipe, backend);
        }
        entry
    }

    pub fn set_recipes_cache(&self, recipes: RecipeMap) {
        self.cache.set(recipes);
    }

    pub fn set_recipes_cache_json(&self, recipes: serde_json::Value) -> Result<()> {
        self.cache.set_from_json(recipes)
    }

    pub fn recipes_cache(&self) -> Option<RecipeMap> {
        self.cache.snapshot()
    }

    fn update_cache_entry(&self, recipe: &str, backend: &str, installed: bool) {
        // Enrichment is computed before the cache lock is taken
        let enrichment = self.get_backend_enrichment(recipe, backend);
        let action = self.install_action(recipe, backend);
        if self.cache.patch(recipe, backend, installed, &action, &enrichment) {
            log::debug!("Updated cached status for {}:{}", recipe, backend);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::installer::archive::fixtures;
    use crate::installer::fetch::fake::StaticFetcher;
    use crate::installer::flm::fake::FakeFlmEnvironment;
    use crate::platform::Arch;
    use crate::status::to_recipe_map;

    fn manager(root: &std::path::Path, fetcher: StaticFetcher) -> BackendManager {
        let config = OrchestratorConfig::default().with_cache_dir(root);
        BackendManager::new(config, VersionConfig::bundled().unwrap())
            .with_platform(Platform::new(Os::Linux, Arch::X86_64))
            .with_fetcher(Arc::new(fetcher))
            .with_flm_environment(Arc::new(FakeFlmEnvironment::default()))
    }

    fn llama_fetcher() -> StaticFetcher {
        StaticFetcher::default().with_file(
            "llama-b6510-bin-ubuntu-x64.zip",
            fixtures::zip_bytes(&[("build/bin/llama-server", b"bin")]),
        )
    }

    #[test]
    fn test_install_params() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), StaticFetcher::default());

        let params = manager.get_install_params("llamacpp", "cpu").unwrap();
        assert_eq!(params.repo, "ggml-org/llama.cpp");
        assert_eq!(params.filename, "llama-b6510-bin-ubuntu-x64.zip");
        assert_eq!(params.version, "b6510");

        assert!(matches!(
            manager.get_install_params("flm", "npu"),
            Err(BackendError::UnsupportedInstallPath(_))
        ));
        assert!(matches!(
            manager.get_install_params("nope", "cpu"),
            Err(BackendError::UnknownRecipe(_))
        ));
        assert!(matches!(
            manager.get_install_params("llamacpp", "cuda"),
            Err(BackendError::MissingVersionConfig { .. })
        ));
    }

    #[test]
    fn test_enrichment_never_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), StaticFetcher::default());

        let flm = manager.get_backend_enrichment("flm", "npu");
        assert_eq!(flm.version, "v0.9.10");
        assert_eq!(
            flm.release_url,
            "https://github.com/FastFlowLM/FastFlowLM/releases/tag/v0.9.10"
        );
        assert_eq!(flm.download_filename, "flm-setup.exe");

        assert_eq!(manager.get_backend_enrichment("nope", "cpu"), BackendEnrichment::default());
        assert_eq!(manager.get_latest_version("nope", "cpu"), "");
        assert_eq!(manager.get_download_filename("flm", "npu"), "");
        assert_eq!(
            manager.get_release_url("llamacpp", "cpu"),
            "https://github.com/ggml-org/llama.cpp/releases/tag/b6510"
        );
    }

    #[tokio::test]
    async fn test_install_and_uninstall_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), llama_fetcher());
        manager.set_recipes_cache(to_recipe_map(&manager.backends_status()));

        let outcome = manager.install_backend("llamacpp", "cpu", None).await.unwrap();
        assert_eq!(outcome.version, "b6510");
        assert!(manager.is_installed("llamacpp", "cpu"));
        assert!(manager
            .backend_binary_path(&llamacpp_spec(), "cpu")
            .unwrap()
            .ends_with("llama-server"));

        let cached = manager.recipes_cache().unwrap();
        let cpu = &cached["llamacpp"].backends["cpu"];
        assert_eq!(cpu.state, BackendState::Installed);
        assert_eq!(cpu.version.as_deref(), Some("b6510"));

        manager.uninstall_backend("llamacpp", "cpu").await.unwrap();
        assert!(!manager.is_installed("llamacpp", "cpu"));
        let cached = manager.recipes_cache().unwrap();
        let cpu = &cached["llamacpp"].backends["cpu"];
        assert_eq!(cpu.state, BackendState::Installable);
        assert_eq!(cpu.action, "backend-runtime recipes --install llamacpp:cpu");

        // Uninstalling again is a no-op
        manager.uninstall_backend("llamacpp", "cpu").await.unwrap();
    }

    fn fast_retry_manager(root: &std::path::Path) -> BackendManager {
        let mut config = OrchestratorConfig::default().with_cache_dir(root);
        config.uninstall_retry = RetryPolicy {
            attempts: 4,
            backoff_ms: 1,
        };
        BackendManager::new(config, VersionConfig::bundled().unwrap())
            .with_platform(Platform::new(Os::Linux, Arch::X86_64))
            .with_fetcher(Arc::new(llama_fetcher()))
            .with_flm_environment(Arc::new(FakeFlmEnvironment::default()))
    }

    fn cached_state(manager: &BackendManager) -> BackendState {
        manager.recipes_cache().unwrap()["llamacpp"].backends["cpu"].state
    }

    #[tokio::test]
    async fn test_uninstall_retries_through_transient_locks() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fast_retry_manager(tmp.path());
        manager.set_recipes_cache(to_recipe_map(&manager.backends_status()));
        manager.install_backend("llamacpp", "cpu", None).await.unwrap();
        assert_eq!(cached_state(&manager), BackendState::Installed);

        let mut calls = 0;
        manager
            .uninstall_backend_with("llamacpp", "cpu", |path| {
                calls += 1;
                if calls < 3 {
                    Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "in use"))
                } else {
                    std::fs::remove_dir_all(path)
                }
            })
            .await
            .unwrap();

        assert_eq!(calls, 3);
        assert!(!manager.is_installed("llamacpp", "cpu"));
        assert_eq!(cached_state(&manager), BackendState::Installable);
    }

    #[tokio::test]
    async fn test_locked_uninstall_leaves_cache_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = fast_retry_manager(tmp.path());
        manager.set_recipes_cache(to_recipe_map(&manager.backends_status()));
        manager.install_backend("llamacpp", "cpu", None).await.unwrap();

        let mut calls = 0;
        let err = manager
            .uninstall_backend_with("llamacpp", "cpu", |_| {
                calls += 1;
                Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "in use"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::UninstallLocked { .. }));
        assert_eq!(calls, 4);
        assert!(manager.install_directory("llamacpp", "cpu").exists());
        assert!(manager.is_installed("llamacpp", "cpu"));
        let cached = manager.recipes_cache().unwrap();
        let cpu = &cached["llamacpp"].backends["cpu"];
        assert_eq!(cpu.state, BackendState::Installed);
        assert_eq!(cpu.version.as_deref(), Some("b6510"));
    }

    fn llamacpp_spec() -> BackendSpec {
        crate::backend::llamacpp::SPEC
    }

    #[tokio::test]
    async fn test_unknown_recipe_install_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), StaticFetcher::default());

        let err = manager.install_backend("nope", "cpu", None).await.unwrap_err();
        assert!(err.is_configuration_error());
        let err = manager.uninstall_backend("nope", "cpu").await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownRecipe(_)));
    }

    #[tokio::test]
    async fn test_flm_cannot_be_uninstalled() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), StaticFetcher::default());

        let err = manager.uninstall_backend("flm", "npu").await.unwrap_err();
        assert!(err.to_string().contains("Windows uninstaller"));
    }

    #[test]
    fn test_status_report() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path(), StaticFetcher::default());
        let status = manager.backends_status();

        let find = |recipe: &str, backend: &str| {
            status
                .iter()
                .find(|r| r.recipe == recipe)
                .and_then(|r| r.backends.iter().find(|b| b.name == backend))
                .map(|b| b.entry.clone())
                .unwrap()
        };

        assert_eq!(find("llamacpp", "cpu").state, BackendState::Installable);
        assert_eq!(find("llamacpp", "metal").state, BackendState::Unsupported);
        assert_eq!(find("flm", "npu").state, BackendState::Unsupported);
        assert_eq!(find("ryzenai-llm", "npu").state, BackendState::Unsupported);
        assert_eq!(find("kokoro", "cpu").state, BackendState::Installable);
        assert_eq!(find("sd-cpp", "rocm").state, BackendState::Unsupported);
    }
}
