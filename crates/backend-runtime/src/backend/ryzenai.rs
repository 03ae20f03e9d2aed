//! Ryzen AI NPU backend
//!
//! Wraps `ryzenai-server`. The model is not taken from [`ModelInfo`]: callers
//! hand a single model file over with [`RyzenAiBackend::set_model_path`]
//! before calling `load`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{check_model_file, install_and_locate, Backend};
use crate::capabilities::{CompletionBackend, Operation};
use crate::constants::{defaults, probes};
use crate::error::{BackendError, Result};
use crate::manager::BackendManager;
use crate::platform::{Os, Platform};
use crate::process::LaunchOptions;
use crate::registry::{ArtifactParams, BackendSpec};
use crate::server::{ByteSink, LaunchSpec, SubprocessServer};
use crate::types::{ModelInfo, RecipeOptions};

pub const RECIPE: &str = "ryzenai-llm";

pub const SPEC: BackendSpec = BackendSpec {
    recipe: RECIPE,
    executable: "ryzenai-server",
    backends: &["npu"],
    resolver: Some(resolve_artifact),
};

pub fn resolve_artifact(platform: &Platform, backend: &str, _version: &str) -> Result<ArtifactParams> {
    if backend != "npu" {
        return Err(BackendError::unsupported_backend(RECIPE, backend, "Ryzen AI runs on the NPU only"));
    }
    if platform.os != Os::Windows {
        return Err(BackendError::unsupported_backend(
            RECIPE,
            backend,
            "Ryzen AI requires Windows with an NPU",
        ));
    }
    Ok(ArtifactParams::new("lemonade-sdk/ryzenai-server", "ryzenai-server.zip"))
}

pub struct RyzenAiBackend {
    manager: Arc<BackendManager>,
    server: SubprocessServer,
    model_path: Option<PathBuf>,
}

impl RyzenAiBackend {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        let server = SubprocessServer::new("ryzenai-server", manager.config());
        Self {
            manager,
            server,
            model_path: None,
        }
    }

    pub fn set_model_path(&mut self, path: impl Into<PathBuf>) {
        self.model_path = Some(path.into());
    }

    pub fn model_path(&self) -> Option<&Path> {
        self.model_path.as_deref()
    }

    fn resolve_model_path(&self) -> Result<PathBuf> {
        let path = self.model_path.clone().ok_or_else(|| {
            BackendError::InvalidModel(
                "Model path is required for RyzenAI-Server. Call set_model_path() before load()"
                    .to_string(),
            )
        })?;
        check_model_file(&path)?;
        Ok(path)
    }
}

fn build_args(model: &Path, port: u16, ctx_size: i64, debug: bool) -> Vec<String> {
    let mut args = vec![
        "-m".to_string(),
        model.to_string_lossy().to_string(),
        "--port".to_string(),
        port.to_string(),
        "--ctx-size".to_string(),
        ctx_size.to_string(),
    ];
    if debug {
        args.push("--verbose".to_string());
    }
    args
}

#[async_trait]
impl Backend for RyzenAiBackend {
    fn recipe(&self) -> &'static str {
        RECIPE
    }

    fn display_name(&self) -> &str {
        "RyzenAI-Server"
    }

    async fn load(
        &mut self,
        model: &ModelInfo,
        options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        log::info!("Loading {} with Ryzen AI", model.name);

        let model_path = self.resolve_model_path()?;
        log::info!("Model path: {:?}", model_path);

        let (executable, _) = install_and_locate(&self.manager, &SPEC, "npu", do_not_upgrade).await?;

        let port = self.server.choose_port()?;
        let ctx_size = options.get_i64("ctx_size").unwrap_or(defaults::CONTEXT_SIZE);

        let launch = LaunchSpec {
            args: build_args(&model_path, port, ctx_size, self.server.debug()),
            options: LaunchOptions {
                inherit_output: self.server.debug(),
                filter_health_logs: true,
                ..Default::default()
            },
            executable,
            probe_path: probes::HEALTH,
        };

        self.model_path = Some(model_path);
        self.server.launch(launch).await
    }

    fn unload(&mut self) {
        self.server.unload();
        self.model_path = None;
    }

    fn server(&self) -> &SubprocessServer {
        &self.server
    }

    fn as_completion(&self) -> Option<&dyn CompletionBackend> {
        Some(self)
    }
}

#[async_trait]
impl CompletionBackend for RyzenAiBackend {
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
