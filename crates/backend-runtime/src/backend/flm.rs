//! FastFlowLM backend
//!
//! FastFlowLM ships as a system-wide Windows installer rather than a release
//! archive, so installation goes through [`crate::installer::flm`] and the
//! executable is looked up on `PATH`. `flm serve` identifies models by
//! checkpoint, so the `model` field of every request is rewritten to it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::Backend;
use crate::capabilities::{CompletionBackend, EmbeddingsBackend, Operation, RerankingBackend};
use crate::constants::{defaults, flm as flm_constants, probes};
use crate::error::{BackendError, Result};
use crate::manager::BackendManager;
use crate::process::LaunchOptions;
use crate::registry::BackendSpec;
use crate::server::{ByteSink, LaunchSpec, SubprocessServer};
use crate::types::{ModelInfo, RecipeOptions};

pub const RECIPE: &str = flm_constants::RECIPE;

pub const SPEC: BackendSpec = BackendSpec {
    recipe: RECIPE,
    executable: "flm",
    backends: &[flm_constants::BACKEND],
    resolver: None,
};

pub struct FlmBackend {
    manager: Arc<BackendManager>,
    server: SubprocessServer,
    checkpoint: String,
}

impl FlmBackend {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        let server = SubprocessServer::new("flm", manager.config());
        Self {
            manager,
            server,
            checkpoint: String::new(),
        }
    }

    pub fn checkpoint(&self) -> &str {
        &self.checkpoint
    }

    fn with_checkpoint(&self, request: &Value) -> Value {
        let mut request = request.clone();
        if let Some(obj) = request.as_object_mut() {
            obj.insert("model".to_string(), Value::String(self.checkpoint.clone()));
        }
        request
    }

    async fn forward(&self, operation: Operation, request: &Value) -> Result<Value> {
        self.server
            .forward_request(operation.endpoint(), &self.with_checkpoint(request), None)
            .await
    }
}

fn build_args(checkpoint: &str, ctx_size: i64, port: u16) -> Vec<String> {
    vec![
        "serve".to_string(),
        checkpoint.to_string(),
        "--ctx-len".to_string(),
        ctx_size.to_string(),
        "--port".to_string(),
        port.to_string(),
    ]
}

#[async_trait]
impl Backend for FlmBackend {
    fn recipe(&self) -> &'static str {
        RECIPE
    }

    fn display_name(&self) -> &str {
        "FastFlowLM"
    }

    async fn load(
        &mut self,
        model: &ModelInfo,
        options: &RecipeOptions,
        _do_not_upgrade: bool,
    ) -> Result<()> {
        log::info!("Loading {} with FastFlowLM", model.name);

        if model.checkpoint.is_empty() {
            return Err(BackendError::InvalidModel(format!(
                "{} has no FastFlowLM checkpoint",
                model.name
            )));
        }

        let outcome = self
            .manager
            .ensure_installed(RECIPE, flm_constants::BACKEND, false, None)
            .await?;
        if outcome.was_upgraded {
            log::info!("FastFlowLM upgraded to {}", outcome.version);
        }
        let executable = self.manager.backend_binary_path(&SPEC, flm_constants::BACKEND)?;

        let port = self.server.choose_port()?;
        let ctx_size = options.get_i64("ctx_size").unwrap_or(defaults::CONTEXT_SIZE);

        let launch = LaunchSpec {
            args: build_args(&model.checkpoint, ctx_size, port),
            options: LaunchOptions {
                inherit_output: self.server.debug(),
                filter_health_logs: true,
                ..Default::default()
            },
            executable,
            probe_path: probes::MODEL_TAGS,
        };

        self.checkpoint = model.checkpoint.clone();
        self.server.launch(launch).await
    }

    fn unload(&mut self) {
        self.server.unload();
        self.checkpoint.clear();
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
impl CompletionBackend for FlmBackend {
    async fn chat_completion(&self, request: &Value) -> Result<Value> {
        self.forward(Operation::ChatCompletion, request).await
    }

    async fn completion(&self, request: &Value) -> Result<Value> {
        self.forward(Operation::Completion, request).await
    }

    async fn responses(&self, request: &Value) -> Result<Value> {
        self.forward(Operation::Responses, request).await
    }

    async fn stream_completion(
        &self,
        operation: Operation,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.server
            .forward_streaming_request(
                operation.endpoint(),
                &self.with_checkpoint(request),
                sink,
                true,
                cancel,
            )
            .await
    }
}

#[async_trait]
impl EmbeddingsBackend for FlmBackend {
    async fn embeddings(&self, request: &Value) -> Result<Value> {
        self.forward(Operation::Embeddings, request).await
    }
}

#[async_trait]
impl RerankingBackend for FlmBackend {
    async fn reranking(&self, request: &Value) -> Result<Value> {
        self.forward(Operation::Reranking, request).await
    }
}
