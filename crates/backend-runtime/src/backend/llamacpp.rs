//! llama.cpp backend
//!
//! Wraps `llama-server`, which speaks the OpenAI chat/completions API plus
//! `/v1/embeddings` and `/v1/rerank`. Upstream builds come from
//! `ggml-org/llama.cpp`; ROCm builds per GPU family come from
//! `lemonade-sdk/llamacpp-rocm`.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{install_and_locate, loader_env, require_model_file, Backend};
use crate::capabilities::{CompletionBackend, EmbeddingsBackend, Operation, RerankingBackend};
use crate::constants::{defaults, probes};
use crate::error::{BackendError, Result};
use crate::manager::BackendManager;
use crate::platform::{Arch, Os, Platform};
use crate::process::LaunchOptions;
use crate::registry::{ArtifactParams, BackendSpec};
use crate::server::{ByteSink, LaunchSpec, SubprocessServer};
use crate::types::{ModelInfo, RecipeOptions};

pub const RECIPE: &str = "llamacpp";

const REPO: &str = "ggml-org/llama.cpp";
const ROCM_REPO: &str = "lemonade-sdk/llamacpp-rocm";

pub const SPEC: BackendSpec = BackendSpec {
    recipe: RECIPE,
    executable: "llama-server",
    backends: &["vulkan", "rocm", "metal", "cpu"],
    resolver: Some(resolve_artifact),
};

/// Release asset for a platform/backend pair
pub fn resolve_artifact(platform: &Platform, backend: &str, version: &str) -> Result<ArtifactParams> {
    let unsupported = |reason: &str| BackendError::unsupported_backend(RECIPE, backend, reason);

    let filename = match (backend, platform.os, platform.arch) {
        ("vulkan", Os::Windows, _) => format!("llama-{}-bin-win-vulkan-x64.zip", version),
        ("vulkan", Os::Linux, _) => format!("llama-{}-bin-ubuntu-vulkan-x64.zip", version),
        ("vulkan", ..) => return Err(unsupported("Vulkan builds are only available for Windows and Linux")),

        ("rocm", os, _) => {
            let arch = platform
                .rocm_arch
                .as_deref()
                .ok_or_else(|| unsupported("No ROCm-capable AMD GPU was detected"))?;
            let filename = match os {
                Os::Windows => format!("llama-{}-windows-rocm-{}-x64.zip", version, arch),
                Os::Linux => format!("llama-{}-ubuntu-rocm-{}-x64.zip", version, arch),
                _ => return Err(unsupported("ROCm builds are only available for Windows and Linux")),
            };
            return Ok(ArtifactParams::new(ROCM_REPO, filename));
        }

        ("metal", Os::MacOs, Arch::Aarch64) => format!("llama-{}-bin-macos-arm64.zip", version),
        ("metal", ..) => return Err(unsupported("Metal requires an Apple Silicon Mac")),

        ("cpu", Os::Windows, _) => format!("llama-{}-bin-win-cpu-x64.zip", version),
        ("cpu", Os::Linux, _) => format!("llama-{}-bin-ubuntu-x64.zip", version),
        ("cpu", Os::MacOs, Arch::Aarch64) => format!("llama-{}-bin-macos-arm64.zip", version),
        ("cpu", Os::MacOs, _) => format!("llama-{}-bin-macos-x64.zip", version),
        ("cpu", ..) => return Err(unsupported("Unsupported platform for llama.cpp")),

        _ => return Err(unsupported("Unknown llama.cpp backend")),
    };

    Ok(ArtifactParams::new(REPO, filename))
}

/// Backend used when the model options don't pick one
fn default_backend(platform: &Platform) -> &'static str {
    match (platform.os, platform.arch) {
        (Os::MacOs, Arch::Aarch64) => "metal",
        _ => "vulkan",
    }
}

pub struct LlamaCppBackend {
    manager: Arc<BackendManager>,
    server: SubprocessServer,
}

impl LlamaCppBackend {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        let server = SubprocessServer::new("llama-server", manager.config());
        Self { manager, server }
    }
}

struct LaunchArgs<'a> {
    model: &'a Path,
    mmproj: Option<&'a Path>,
    port: u16,
    ctx_size: i64,
    gpu: bool,
    embeddings: bool,
    reranking: bool,
    debug: bool,
}

fn build_args(launch: &LaunchArgs<'_>) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        launch.model.to_string_lossy().to_string(),
        "--port".to_string(),
        launch.port.to_string(),
        "--ctx-size".to_string(),
        launch.ctx_size.to_string(),
        "--jinja".to_string(),
    ];

    if let Some(mmproj) = launch.mmproj {
        args.push("--mmproj".to_string());
        args.push(mmproj.to_string_lossy().to_string());
    }
    if launch.gpu {
        // Offload every layer
        args.push("-ngl".to_string());
        args.push("99".to_string());
    }
    if launch.embeddings {
        args.push("--embeddings".to_string());
    }
    if launch.reranking {
        args.push("--reranking".to_string());
    }
    if launch.debug {
        args.push("--verbose".to_string());
    }

    args
}

#[async_trait]
impl Backend for LlamaCppBackend {
    fn recipe(&self) -> &'static str {
        RECIPE
    }

    fn display_name(&self) -> &str {
        "llamacpp"
    }

    async fn load(
        &mut self,
        model: &ModelInfo,
        options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        log::info!("Loading {} with llama.cpp", model.name);
        log::debug!("Per-model settings: {}", options.to_log_string());

        let platform = self.manager.platform().clone();
        let backend = options.backend_for(RECIPE, default_backend(&platform));
        let model_path = require_model_file(model, "main")?;

        let (executable, _) =
            install_and_locate(&self.manager, &SPEC, &backend, do_not_upgrade).await?;

        let port = self.server.choose_port()?;
        let args = build_args(&LaunchArgs {
            model: &model_path,
            mmproj: model.resolved_path("mmproj").map(|p| p.as_path()),
            port,
            ctx_size: options.get_i64("ctx_size").unwrap_or(defaults::CONTEXT_SIZE),
            gpu: backend != "cpu",
            embeddings: model.has_label("embeddings"),
            reranking: model.has_label("reranking"),
            debug: self.server.debug(),
        });

        let launch = LaunchSpec {
            args,
            options: LaunchOptions {
                inherit_output: self.server.debug(),
                filter_health_logs: true,
                env: loader_env(&platform, &backend, &executable),
                ..Default::default()
            },
            executable,
            probe_path: probes::HEALTH,
        };

        self.server.launch(launch).await
    }

    fn unload(&mut self) {
        self.server.unload();
    }

    fn server(&self) -> &SubprocessServer {
        &self.server
    }

    fn as_completion(&self) -> Option<&dyn CompletionBackend> {
        Some(self)
    }

    fn as_embeddings(&self) -> Option<&dyn EmbeddingsBackend> {
        Some(self)
    }

    fn as_reranking(&self) -> Option<&dyn RerankingBackend> {
        Some(self)
    }
}

#[async_trait]
impl CompletionBackend for LlamaCppBackend {
    async fn chat_completion(&self, request: &Value) -> Result<Value> {
        self.server
            .forward_request(Operation::ChatCompletion.endpoint(), request, None)
            .await
    }

    async fn completion(&self, request: &Value) -> Result<Value> {
        self.server
            .forward_request(Operation::Completion.endpoint(), request, None)
            .await
    }

    async fn responses(&self, request: &Value) -> Result<Value> {
        self.server
            .forward_request(Operation::Responses.endpoint(), request, None)
            .await
    }

    async fn stream_completion(
        &self,
        operation: Operation,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.server
            .forward_streaming_request(operation.endpoint(), request, sink, true, cancel)
            .await
    }
}

#[async_trait]
impl EmbeddingsBackend for LlamaCppBackend {
    async fn embeddings(&self, request: &Value) -> Result<Value> {
        self.server
            .forward_request(Operation::Embeddings.endpoint(), request, None)
            .await
    }
}

#[async_trait]
impl RerankingBackend for LlamaCppBackend {
    async fn reranking(&self, request: &Value) -> Result<Value> {
        self.server
            .forward_request(Operation::Reranking.endpoint(), request, None)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing;
    use crate::installer::archive::fixtures;
    use crate::installer::fetch::fake::StaticFetcher;
    use crate::test_support::spawn_mock;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    fn file(platform: &Platform, backend: &str) -> Result<String> {
        resolve_artifact(platform, backend, "b6510").map(|p| p.filename)
    }

    #[test]
    fn test_artifacts_for_every_supported_pair() {
        let windows = Platform::new(Os::Windows, Arch::X86_64);
        let linux = Platform::new(Os::Linux, Arch::X86_64);
        let mac_arm = Platform::new(Os::MacOs, Arch::Aarch64);
        let mac_intel = Platform::new(Os::MacOs, Arch::X86_64);

        assert_eq!(file(&windows, "vulkan").unwrap(), "llama-b6510-bin-win-vulkan-x64.zip");
        assert_eq!(file(&linux, "vulkan").unwrap(), "llama-b6510-bin-ubuntu-vulkan-x64.zip");
        assert_eq!(file(&windows, "cpu").unwrap(), "llama-b6510-bin-win-cpu-x64.zip");
        assert_eq!(file(&linux, "cpu").unwrap(), "llama-b6510-bin-ubuntu-x64.zip");
        assert_eq!(file(&mac_arm, "cpu").unwrap(), "llama-b6510-bin-macos-arm64.zip");
        assert_eq!(file(&mac_intel, "cpu").unwrap(), "llama-b6510-bin-macos-x64.zip");
        assert_eq!(file(&mac_arm, "metal").unwrap(), "llama-b6510-bin-macos-arm64.zip");

        let rocm = resolve_artifact(&linux.clone().with_rocm_arch("gfx110X"), "rocm", "b1066").unwrap();
        assert_eq!(rocm.repo, "lemonade-sdk/llamacpp-rocm");
        assert_eq!(rocm.filename, "llama-b1066-ubuntu-rocm-gfx110X-x64.zip");
        let rocm = resolve_artifact(&windows.clone().with_rocm_arch("gfx1151"), "rocm", "b1066").unwrap();
        assert_eq!(rocm.filename, "llama-b1066-windows-rocm-gfx1151-x64.zip");
    }

    #[test]
    fn test_unsupported_pairs() {
        let linux = Platform::new(Os::Linux, Arch::X86_64);
        let mac_arm = Platform::new(Os::MacOs, Arch::Aarch64);

        for (platform, backend) in [
            (&linux, "metal"),
            (&linux, "rocm"),
            (&mac_arm, "vulkan"),
            (&mac_arm.clone().with_rocm_arch("gfx110X"), "rocm"),
            (&linux, "cuda"),
        ] {
            assert!(
                matches!(file(platform, backend), Err(BackendError::UnsupportedBackend { .. })),
                "{:?} {}",
                platform.os,
                backend
            );
        }
        assert!(file(&Platform::new(Os::Other, Arch::X86_64), "cpu").is_err());
    }

    #[test]
    fn test_launch_args() {
        let args = build_args(&LaunchArgs {
            model: Path::new("/models/qwen.gguf"),
            mmproj: Some(Path::new("/models/mmproj.gguf")),
            port: 8123,
            ctx_size: 8192,
            gpu: true,
            embeddings: false,
            reranking: true,
            debug: false,
        });
        assert_eq!(
            args.join(" "),
            "-m /models/qwen.gguf --port 8123 --ctx-size 8192 --jinja --mmproj /models/mmproj.gguf -ngl 99 --reranking"
        );
    }

    #[tokio::test]
    async fn test_forwarding_endpoints() {
        let router = Router::new()
            .route("/v1/embeddings", post(|| async { Json(json!({"data": [{"embedding": [0.1]}]})) }))
            .route("/v1/rerank", post(|| async { Json(json!({"results": [{"index": 0}]})) }));
        let port = spawn_mock(router).await;

        let tmp = tempfile::tempdir().unwrap();
        let mut backend = LlamaCppBackend::new(testing::manager(tmp.path()));
        backend.server.attach_for_test(port);
        let backend: Box<dyn Backend> = Box::new(backend);

        let embeddings = backend.embeddings(&json!({"input": "hi"})).await.unwrap();
        assert_eq!(embeddings["data"][0]["embedding"][0], 0.1);
        let ranked = backend.reranking(&json!({"query": "q", "documents": ["d"]})).await.unwrap();
        assert_eq!(ranked["results"][0]["index"], 0);

        let err = backend.image_generations(&json!({"prompt": "x"})).await.unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedOperation { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_load_that_never_becomes_ready() {
        let tmp = tempfile::tempdir().unwrap();
        let model = tmp.path().join("model.gguf");
        std::fs::write(&model, b"gguf").unwrap();
        let pidfile = tmp.path().join("server.pid");

        let server_script = testing::script(&format!("echo $$ > {}\nexec sleep 30", pidfile.display()));
        let fetcher = StaticFetcher::default().with_file(
            "llama-b6510-bin-ubuntu-x64.zip",
            fixtures::zip_bytes(&[("llama-server", server_script.as_slice())]),
        );
        let manager = testing::manager_with(tmp.path(), testing::linux(), fetcher);
        let mut backend = LlamaCppBackend::new(manager.clone());

        let err = backend
            .load(
                &ModelInfo::new("Qwen", "org/qwen").with_file("main", &model),
                &RecipeOptions::new().with("llamacpp_backend", "cpu"),
                false,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BackendError::BackendNotReady { .. }));
        assert!(!backend.is_loaded());
        assert!(manager.is_installed("llamacpp", "cpu"));

        // The spawned server was stopped, not leaked
        if let Ok(pid) = std::fs::read_to_string(&pidfile) {
            let alive = std::process::Command::new("kill")
                .args(["-0", pid.trim()])
                .status()
                .unwrap()
                .success();
            assert!(!alive);
        }
    }

    #[tokio::test]
    async fn test_load_rejects_missing_model() {
        let tmp = tempfile::tempdir().unwrap();
        let mut backend = LlamaCppBackend::new(testing::manager(tmp.path()));
        let err = backend
            .load(&ModelInfo::new("Qwen", "org/qwen"), &RecipeOptions::new(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidModel(_)));
    }
}
