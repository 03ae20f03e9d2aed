//! Kokoro text-to-speech backend
//!
//! Wraps the `koko` binary from Kokoros in its OpenAI-compatible server mode.
//! Speech is streamed back as raw audio bytes, not server-sent events.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{install_and_locate, loader_env, require_model_file, Backend};
use crate::capabilities::{Operation, TextToSpeechBackend};
use crate::constants::{hosts, probes};
use crate::error::{BackendError, Result};
use crate::manager::BackendManager;
use crate::platform::{Arch, Os, Platform};
use crate::process::LaunchOptions;
use crate::registry::{ArtifactParams, BackendSpec};
use crate::server::{ByteSink, LaunchSpec, SubprocessServer};
use crate::types::{ModelInfo, RecipeOptions};

pub const RECIPE: &str = "kokoro";

const REPO: &str = "lucasjinreal/Kokoros";

pub const SPEC: BackendSpec = BackendSpec {
    recipe: RECIPE,
    executable: "koko",
    backends: &["cpu"],
    resolver: Some(resolve_artifact),
};

pub fn resolve_artifact(platform: &Platform, backend: &str, _version: &str) -> Result<ArtifactParams> {
    if backend != "cpu" {
        return Err(BackendError::unsupported_backend(
            RECIPE,
            backend,
            "Kokoro only ships CPU builds",
        ));
    }

    let filename = match (platform.os, platform.arch) {
        (Os::Windows, Arch::X86_64) => "kokoros-windows-x86_64.zip",
        (Os::Linux, Arch::X86_64) => "kokoros-linux-x86_64.tar.gz",
        (Os::MacOs, Arch::Aarch64) => "kokoros-macos-aarch64.tar.gz",
        _ => {
            return Err(BackendError::unsupported_backend(
                RECIPE,
                backend,
                "Unsupported platform for Kokoro",
            ))
        }
    };

    Ok(ArtifactParams::new(REPO, filename))
}

pub struct KokoroBackend {
    manager: Arc<BackendManager>,
    server: SubprocessServer,
}

impl KokoroBackend {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        let server = SubprocessServer::new("koko", manager.config());
        Self { manager, server }
    }
}

fn build_args(model: &Path, voices: Option<&Path>, port: u16) -> Vec<String> {
    let mut args = vec!["--model".to_string(), model.to_string_lossy().to_string()];
    if let Some(voices) = voices {
        args.push("--data".to_string());
        args.push(voices.to_string_lossy().to_string());
    }
    args.extend([
        "openai".to_string(),
        "--ip".to_string(),
        hosts::LOCAL.to_string(),
        "--port".to_string(),
        port.to_string(),
    ]);
    args
}

#[async_trait]
impl Backend for KokoroBackend {
    fn recipe(&self) -> &'static str {
        RECIPE
    }

    fn display_name(&self) -> &str {
        "kokoro (text-to-speech model)"
    }

    async fn load(
        &mut self,
        model: &ModelInfo,
        _options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        log::info!("Loading {} with Kokoro", model.name);

        let model_path = require_model_file(model, "main")?;
        let voices = match model.resolved_path("voices") {
            Some(path) => {
                super::check_model_file(path)?;
                Some(path.clone())
            }
            None => None,
        };

        let platform = self.manager.platform().clone();
        let (executable, _) = install_and_locate(&self.manager, &SPEC, "cpu", do_not_upgrade).await?;

        let port = self.server.choose_port()?;
        let launch = LaunchSpec {
            args: build_args(&model_path, voices.as_deref(), port),
            options: LaunchOptions {
                inherit_output: self.server.debug(),
                filter_health_logs: true,
                env: loader_env(&platform, "cpu", &executable),
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

    fn as_speech(&self) -> Option<&dyn TextToSpeechBackend> {
        Some(self)
    }
}

#[async_trait]
impl TextToSpeechBackend for KokoroBackend {
    async fn audio_speech(
        &self,
        request: &Value,
        sink: &ByteSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.server
            .forward_streaming_request(Operation::AudioSpeech.endpoint(), request, sink, false, cancel)
            .await
    }
}
