//! Subprocess-backed AI inference backends
//!
//! This library installs, launches and proxies to local inference servers:
//! - **llama.cpp**: chat/completions, embeddings and reranking from GGUF models
//! - **FastFlowLM**: the same API surface on AMD NPUs (Windows installer)
//! - **stable-diffusion.cpp**: image generation, edits and variations
//! - **Kokoro**: text to speech
//! - **Ryzen AI**: chat/completions on AMD NPUs
//!
//! # Example
//!
//! ```rust,ignore
//! use backend_runtime::{create, BackendManager, ModelInfo, OrchestratorConfig, RecipeOptions, VersionConfig};
//! use std::sync::Arc;
//!
//! let manager = Arc::new(BackendManager::new(OrchestratorConfig::from_env(), VersionConfig::bundled()?));
//! let mut backend = create("llamacpp", manager.clone())?;
//!
//! let model = ModelInfo::new("Qwen3-0.6B", "unsloth/Qwen3-0.6B-GGUF").with_file("main", "/models/qwen3.gguf");
//! backend.load(&model, &RecipeOptions::new().with("llamacpp_backend", "vulkan"), false).await?;
//!
//! let reply = backend.chat_completion(&request).await?;
//! ```

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod constants;
pub mod error;
pub mod installer;
pub mod manager;
pub mod platform;
pub mod process;
pub mod registry;
pub mod server;
pub mod status;
pub mod types;
pub mod version;

// Re-exports for convenience
pub use backend::{
    create, Backend, FlmBackend, KokoroBackend, LlamaCppBackend, RyzenAiBackend, SdBackend,
};
pub use capabilities::{
    Capability, CapabilitySet, CompletionBackend, EmbeddingsBackend, ImageBackend, Operation,
    RerankingBackend, TextToSpeechBackend,
};
pub use config::{FlmConfig, OrchestratorConfig, ReadinessPolicy, RetryPolicy, VersionConfig};
pub use error::{BackendError, ErrorKind, Result};
pub use installer::{ArtifactFetcher, HttpFetcher, InstallOutcome, InstallParams};
pub use manager::BackendManager;
pub use platform::{Arch, Os, Platform};
pub use registry::{ArtifactParams, BackendRegistry, BackendSpec};
pub use server::{ByteSink, ServerState, SubprocessServer};
pub use status::{BackendState, RecipeMap, RecipeStatus, RecipeStatusCache};
pub use types::{DownloadProgress, ModelInfo, ProgressCallback, RecipeOptions, ServerStatus};
pub use version::Version;
