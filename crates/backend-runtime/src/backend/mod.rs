//! Backend adapters
//!
//! One adapter per recipe family. An adapter owns a [`SubprocessServer`],
//! installs its binary through the [`BackendManager`], decides the launch
//! arguments and readiness probe, and implements the capability traits its
//! server speaks. Callers work with `Box<dyn Backend>` and dispatch through
//! the methods on `dyn Backend`, which turn missing capabilities into
//! [`BackendError::UnsupportedOperation`].

pub mod flm;
pub mod kokoro;
pub mod llamacpp;
pub mod ryzenai;
pub mod sd;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::capabilities::{
    Capability, CapabilitySet, CompletionBackend, EmbeddingsBackend, ImageBackend, Operation,
    RerankingBackend, TextToSpeechBackend,
};
use crate::error::{BackendError, Result};
use crate::installer::InstallOutcome;
use crate::manager::BackendManager;
use crate::platform::{Os, Platform};
use crate::registry::BackendSpec;
use crate::server::{ByteSink, SubprocessServer};
use crate::types::{ModelInfo, RecipeOptions, ServerStatus};

pub use flm::FlmBackend;
pub use kokoro::KokoroBackend;
pub use llamacpp::LlamaCppBackend;
pub use ryzenai::RyzenAiBackend;
pub use sd::SdBackend;

/// A wrapped inference server for one recipe
#[async_trait]
pub trait Backend: Send + Sync {
    fn recipe(&self) -> &'static str;

    /// Family name used in error messages, e.g. `sd-cpp (image generation model)`
    fn display_name(&self) -> &str;

    /// Install if needed, start the server and wait until it is ready
    async fn load(
        &mut self,
        model: &ModelInfo,
        options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()>;

    fn unload(&mut self);

    fn server(&self) -> &SubprocessServer;

    fn is_loaded(&self) -> bool {
        self.server().is_loaded()
    }

    fn status(&self) -> ServerStatus {
        self.server().status()
    }

    fn as_completion(&self) -> Option<&dyn CompletionBackend> {
        None
    }

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsBackend> {
        None
    }

    fn as_reranking(&self) -> Option<&dyn RerankingBackend> {
        None
    }

    fn as_image(&self) -> Option<&dyn ImageBackend> {
        None
    }

    fn as_speech(&self) -> Option<&dyn TextToSpeechBackend> {
        None
    }

    fn capabilities(&self) -> CapabilitySet {
        let mut set = CapabilitySet::empty();
        if self.as_completion().is_some() {
            set = set.with(Capability::Completion);
        }
        if self.as_embeddings().is_some() {
            set = set.with(Capability::Embeddings);
        }
        if self.as_reranking().is_some() {
            set = set.with(Capability::Reranking);
        }
        if self.as_image().is_some() {
            set = set.with(Capability::Image);
        }
        if self.as_speech().is_some() {
            set = set.with(Capability::TextToSpeech);
        }
        set
    }
}

impl dyn Backend {
    fn unsupported(&self, operation: Operation) -> BackendError {
        BackendError::unsupported_operation(operation.display_name(), self.display_name())
    }

    fn completion_backend(&self, operation: Operation) -> Result<&dyn CompletionBackend> {
        self.as_completion().ok_or_else(|| self.unsupported(operation))
    }

    fn image_backend(&self, operation: Operation) -> Result<&dyn ImageBackend> {
        self.as_image().ok_or_else(|| self.unsupported(operation))
    }

    pub fn supports(&self, operation: Operation) -> bool {
        self.capabilities().contains(operation.capability())
    }

    pub async fn chat_completion(&self, request: &Value) -> Result<Value> {
        self.completion_backend(Operation::ChatCompletion)?
            .chat_completion(request)
            .await
    }

    pub async fn completion(&self, request: &Value) -> Result<Value> {
        self.completion_backend(Operation::Completion)?
            .completion(request)
            .await
    }

    pub async fn responses(&self, request: &Value) -> Result<Value> {
        self.completion_backend(Operation::Responses)?
            .responses(request)
            .await
    }

    pub async fn stream_completion(
        &self,
        operation: Operation,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !operation.is_streamable() {
            return Err(self.unsupported(operation));
        }
        self.completion_backend(operation)?
            .stream_completion(operation, request, sink, cancel)
            .await
    }

    pub async fn embeddings(&self, request: &Value) -> Result<Value> {
        self.as_embeddings()
            .ok_or_else(|| self.unsupported(Operation::Embeddings))?
            .embeddings(request)
            .await
    }

    pub async fn reranking(&self, request: &Value) -> Result<Value> {
        self.as_reranking()
            .ok_or_else(|| self.unsupported(Operation::Reranking))?
            .reranking(request)
            .await
    }

    pub async fn image_generations(&self, request: &Value) -> Result<Value> {
        self.image_backend(Operation::ImageGenerations)?
            .image_generations(request)
            .await
    }

    pub async fn image_edits(&self, request: &Value) -> Result<Value> {
        self.image_backend(Operation::ImageEdits)?
            .image_edits(request)
            .await
    }

    pub async fn image_variations(&self, request: &Value) -> Result<Value> {
        self.image_backend(Operation::ImageVariations)?
            .image_variations(request)
            .await
    }

    pub async fn audio_speech(
        &self,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.as_speech()
            .ok_or_else(|| self.unsupported(Operation::AudioSpeech))?
            .audio_speech(request, sink, cancel)
            .await
    }

    /// Run any unary operation by kind
    pub async fn execute(&self, operation: Operation, request: &Value) -> Result<Value> {
        match operation {
            Operation::ChatCompletion => self.chat_completion(request).await,
            Operation::Completion => self.completion(request).await,
            Operation::Responses => self.responses(request).await,
            Operation::Embeddings => self.embeddings(request).await,
            Operation::Reranking => self.reranking(request).await,
            Operation::ImageGenerations => self.image_generations(request).await,
            Operation::ImageEdits => self.image_edits(request).await,
            Operation::ImageVariations => self.image_variations(request).await,
            Operation::AudioSpeech => Err(BackendError::unsupported_operation(
                "Non-streaming text to speech",
                self.display_name(),
            )),
        }
    }
}

/// Construct the adapter for `recipe`
pub fn create(recipe: &str, manager: Arc<BackendManager>) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match recipe {
        llamacpp::RECIPE => Box::new(LlamaCppBackend::new(manager)),
        flm::RECIPE => Box::new(FlmBackend::new(manager)),
        sd::RECIPE => Box::new(SdBackend::new(manager)),
        kokoro::RECIPE => Box::new(KokoroBackend::new(manager)),
        ryzenai::RECIPE => Box::new(RyzenAiBackend::new(manager)),
        other => return Err(BackendError::UnknownRecipe(other.to_string())),
    };
    Ok(backend)
}

// ============================================================================
// Shared load helpers
// ============================================================================

/// Ensure `spec` is installed for `backend` and return its executable
pub(crate) async fn install_and_locate(
    manager: &BackendManager,
    spec: &BackendSpec,
    backend: &str,
    do_not_upgrade: bool,
) -> Result<(PathBuf, InstallOutcome)> {
    let outcome = manager
        .ensure_installed(spec.recipe, backend, do_not_upgrade, None)
        .await?;
    let executable = manager.backend_binary_path(spec, backend)?;
    log::debug!("Using {} at {:?}", spec.recipe, executable);
    Ok((executable, outcome))
}

/// The model's main file, which must exist and not be a directory
pub(crate) fn require_model_file(model: &ModelInfo, role: &str) -> Result<PathBuf> {
    let path = model.resolved_path(role).ok_or_else(|| {
        BackendError::InvalidModel(format!(
            "Model file not found for checkpoint: {}",
            model.checkpoint
        ))
    })?;
    check_model_file(path)?;
    Ok(path.clone())
}

pub(crate) fn check_model_file(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(BackendError::InvalidModel(format!(
            "Model path is a directory, not a file: {}",
            path.display()
        )));
    }
    if !path.exists() {
        return Err(BackendError::InvalidModel(format!(
            "Model file does not exist: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Directory holding the executable, for loader search paths
pub(crate) fn executable_dir(executable: &Path) -> PathBuf {
    executable
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default()
}

/// Loader search path override so bundled shared libraries next to the
/// executable are found. On Windows only ROCm builds need it.
pub(crate) fn loader_env(platform: &Platform, backend: &str, executable: &Path) -> Vec<(String, String)> {
    if platform.os == Os::Windows && backend != "rocm" {
        return Vec::new();
    }
    vec![platform.library_path_env(&executable_dir(executable))]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::config::{OrchestratorConfig, ReadinessPolicy, VersionConfig};
    use crate::installer::fetch::fake::StaticFetcher;
    use crate::installer::flm::fake::FakeFlmEnvironment;
    use crate::platform::Arch;

    pub fn linux() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64)
    }

    /// Manager rooted in `root`, on Linux x86_64, with nothing to download
    pub fn manager(root: &Path) -> Arc<BackendManager> {
        manager_with(root, linux(), StaticFetcher::default())
    }

    /// Manager with a short readiness budget so failed loads finish quickly
    pub fn manager_with(root: &Path, platform: Platform, fetcher: StaticFetcher) -> Arc<BackendManager> {
        let mut config = OrchestratorConfig::default().with_cache_dir(root);
        config.readiness = ReadinessPolicy {
            max_retries: 30,
            interval_ms: 10,
        };
        Arc::new(
            BackendManager::new(config, VersionConfig::bundled().unwrap())
                .with_platform(platform)
                .with_fetcher(Arc::new(fetcher))
                .with_flm_environment(Arc::new(FakeFlmEnvironment::default())),
        )
    }

    /// A shell script standing in for a server binary
    pub fn script(body: &str) -> Vec<u8> {
        format!("#!/bin/sh\n{}\n", body).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_every_recipe() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = testing::manager(tmp.path());

        let expected = [
            ("llamacpp", &[Capability::Completion, Capability::Embeddings, Capability::Reranking][..]),
            ("flm", &[Capability::Completion, Capability::Embeddings, Capability::Reranking][..]),
            ("sd-cpp", &[Capability::Image][..]),
            ("kokoro", &[Capability::TextToSpeech][..]),
            ("ryzenai-llm", &[Capability::Completion][..]),
        ];

        for (recipe, capabilities) in expected {
            let backend = create(recipe, manager.clone()).unwrap();
            assert_eq!(backend.recipe(), recipe);
            assert!(!backend.is_loaded());
            assert_eq!(backend.capabilities().iter().collect::<Vec<_>>(), capabilities, "{recipe}");
        }
    }

    #[test]
    fn test_create_unknown_recipe() {
        let tmp = tempfile::tempdir().unwrap();
        let err = create("whisper", testing::manager(tmp.path())).err().unwrap();
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_unloaded_backend_reports_not_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = create("llamacpp", testing::manager(tmp.path())).unwrap();
        let err = backend
            .chat_completion(&serde_json::json!({"messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ModelNotLoaded(_)));
    }

    #[test]
    fn test_loader_env() {
        let exe = Path::new("/cache/bin/sd-cpp/rocm/sd-server");
        let env = loader_env(&testing::linux(), "cpu", exe);
        assert_eq!(env[0].0, "LD_LIBRARY_PATH");
        assert!(env[0].1.starts_with("/cache/bin/sd-cpp/rocm"));

        let windows = Platform::new(Os::Windows, crate::platform::Arch::X86_64);
        assert!(loader_env(&windows, "cpu", exe).is_empty());
        assert_eq!(loader_env(&windows, "rocm", exe)[0].0, "PATH");
    }

    #[test]
    fn test_model_file_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("model.gguf");
        std::fs::write(&file, b"gguf").unwrap();

        let model = ModelInfo::new("m", "org/m").with_file("main", &file);
        assert_eq!(require_model_file(&model, "main").unwrap(), file);

        let err = require_model_file(&ModelInfo::new("m", "org/m"), "main").unwrap_err();
        assert!(err.to_string().contains("org/m"));

        let dir_model = ModelInfo::new("m", "org/m").with_file("main", tmp.path());
        assert!(require_model_file(&dir_model, "main")
            .unwrap_err()
            .to_string()
            .contains("directory"));

        let missing = ModelInfo::new("m", "org/m").with_file("main", tmp.path().join("nope"));
        assert!(require_model_file(&missing, "main").is_err());
    }
}
