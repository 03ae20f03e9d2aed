//! stable-diffusion.cpp backend
//!
//! Wraps `sd-server`. It has no request fields for sampling steps, guidance
//! scale or seed; those ride along inside the prompt as
//! `<sd_cpp_extra_args>{...}</sd_cpp_extra_args>`. Edits and variations go
//! to `/v1/images/edits` as multipart uploads.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Map, Value};

use super::{install_and_locate, loader_env, require_model_file, Backend};
use crate::capabilities::{ImageBackend, Operation};
use crate::constants::{defaults, probes, timeouts};
use crate::error::{BackendError, Result};
use crate::manager::BackendManager;
use crate::platform::{Arch, Os, Platform};
use crate::process::LaunchOptions;
use crate::registry::{ArtifactParams, BackendSpec};
use crate::server::{LaunchSpec, SubprocessServer};
use crate::types::{ModelInfo, MultipartField, RecipeOptions};

pub const RECIPE: &str = "sd-cpp";

const REPO: &str = "superm1/stable-diffusion.cpp";

pub const SPEC: BackendSpec = BackendSpec {
    recipe: RECIPE,
    executable: "sd-server",
    backends: &["cpu", "rocm"],
    resolver: Some(resolve_artifact),
};

/// `master-NNN-HASH` release tags name their assets `master-HASH`
pub fn short_version(version: &str) -> String {
    let mut parts = version.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(branch), Some(_), Some(hash)) => format!("{}-{}", branch, hash),
        _ => version.to_string(),
    }
}

pub fn resolve_artifact(platform: &Platform, backend: &str, version: &str) -> Result<ArtifactParams> {
    let unsupported = |reason: &str| BackendError::unsupported_backend(RECIPE, backend, reason);
    let v = short_version(version);

    let filename = match (backend, platform.os, platform.arch) {
        ("rocm", os, _) => {
            if platform.rocm_arch.is_none() {
                return Err(unsupported("No ROCm-capable AMD GPU was detected"));
            }
            match os {
                Os::Windows => format!("sd-{}-bin-win-rocm-x64.zip", v),
                Os::Linux => format!("sd-{}-bin-Linux-Ubuntu-24.04-x86_64-rocm.zip", v),
                _ => return Err(unsupported("ROCm sd.cpp only supported on Windows and Linux")),
            }
        }
        ("cpu", Os::Windows, _) => format!("sd-{}-bin-win-avx2-x64.zip", v),
        ("cpu", Os::Linux, _) => format!("sd-{}-bin-Linux-Ubuntu-24.04-x86_64.zip", v),
        ("cpu", Os::MacOs, Arch::Aarch64) => format!("sd-{}-bin-Darwin-macOS-15.7.2-arm64.zip", v),
        ("cpu", ..) => return Err(unsupported("Unsupported platform for stable-diffusion.cpp")),
        _ => return Err(unsupported("Unknown stable-diffusion.cpp backend")),
    };

    Ok(ArtifactParams::new(REPO, filename))
}

pub struct SdBackend {
    manager: Arc<BackendManager>,
    server: SubprocessServer,
    options: RecipeOptions,
}

impl SdBackend {
    pub fn new(manager: Arc<BackendManager>) -> Self {
        let server = SubprocessServer::new("sd-server", manager.config());
        Self {
            manager,
            server,
            options: RecipeOptions::new(),
        }
    }

    /// Request values win over per-model defaults
    fn extra_args(&self, request: &Value) -> Value {
        let mut extra = Map::new();
        let steps = request
            .get("steps")
            .and_then(Value::as_i64)
            .or_else(|| self.options.get_i64("steps"))
            .unwrap_or(defaults::SD_STEPS);
        let cfg_scale = request
            .get("cfg_scale")
            .and_then(Value::as_f64)
            .or_else(|| self.options.get_f64("cfg_scale"))
            .unwrap_or(defaults::SD_CFG_SCALE);

        extra.insert("steps".to_string(), json!(steps));
        extra.insert("cfg_scale".to_string(), json!(cfg_scale));
        if let Some(seed) = request.get("seed").and_then(Value::as_i64) {
            extra.insert("seed".to_string(), json!(seed));
        }
        Value::Object(extra)
    }

    fn prompt_with_extra_args(&self, request: &Value) -> String {
        let prompt = request.get("prompt").and_then(Value::as_str).unwrap_or_default();
        format!(
            "{} <sd_cpp_extra_args>{}</sd_cpp_extra_args>",
            prompt,
            self.extra_args(request)
        )
    }

    fn image_timeout() -> Option<Duration> {
        Some(Duration::from_secs(timeouts::IMAGE_REQUEST_SECS))
    }
}

fn count_and_size(request: &Value, fields: &mut Vec<MultipartField>) {
    let n = request.get("n").and_then(Value::as_i64).unwrap_or(1);
    fields.push(MultipartField::text("n", n.to_string()));
    if let Some(size) = request.get("size").and_then(Value::as_str) {
        fields.push(MultipartField::text("size", size));
    }
}

fn decode_image(request: &Value, key: &str) -> Result<Option<Vec<u8>>> {
    let Some(encoded) = request.get(key).and_then(Value::as_str) else {
        return Ok(None);
    };
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map(Some)
        .map_err(|e| BackendError::InvalidRequest(format!("{} is not valid base64: {}", key, e)))
}

fn build_args(
    port: u16,
    model: &std::path::Path,
    text_encoder: Option<&std::path::Path>,
    vae: Option<&std::path::Path>,
    debug: bool,
) -> Vec<String> {
    let mut args = vec!["--listen-port".to_string(), port.to_string()];

    match (text_encoder, vae) {
        (Some(llm), Some(vae)) => {
            args.push("--diffusion-model".to_string());
            args.push(model.to_string_lossy().to_string());
            args.push("--llm".to_string());
            args.push(llm.to_string_lossy().to_string());
            args.push("--vae".to_string());
            args.push(vae.to_string_lossy().to_string());
        }
        _ => {
            args.push("-m".to_string());
            args.push(model.to_string_lossy().to_string());
        }
    }

    if debug {
        args.push("-v".to_string());
    }
    args
}

#[async_trait]
impl Backend for SdBackend {
    fn recipe(&self) -> &'static str {
        RECIPE
    }

    fn display_name(&self) -> &str {
        "sd-cpp (image generation model)"
    }

    async fn load(
        &mut self,
        model: &ModelInfo,
        options: &RecipeOptions,
        do_not_upgrade: bool,
    ) -> Result<()> {
        log::info!("Loading model: {}", model.name);
        log::info!("Per-model settings: {}", options.to_log_string());

        let platform = self.manager.platform().clone();
        let backend = options.backend_for(RECIPE, "cpu");
        let (executable, _) =
            install_and_locate(&self.manager, &SPEC, &backend, do_not_upgrade).await?;

        let model_path = require_model_file(model, "main")?;
        log::info!("Using model: {:?}", model_path);

        let port = self.server.choose_port()?;
        let args = build_args(
            port,
            &model_path,
            model.resolved_path("text_encoder").map(|p| p.as_path()),
            model.resolved_path("vae").map(|p| p.as_path()),
            self.server.debug(),
        );

        let launch = LaunchSpec {
            args,
            options: LaunchOptions {
                inherit_output: self.server.debug(),
                env: loader_env(&platform, &backend, &executable),
                ..Default::default()
            },
            executable,
            probe_path: probes::ROOT,
        };

        self.options = options.clone();
        self.server.launch(launch).await
    }

    fn unload(&mut self) {
        self.server.unload();
    }

    fn server(&self) -> &SubprocessServer {
        &self.server
    }

    fn as_image(&self) -> Option<&dyn ImageBackend> {
        Some(self)
    }
}

#[async_trait]
impl ImageBackend for SdBackend {
    async fn image_generations(&self, request: &Value) -> Result<Value> {
        let mut sd_request = request.clone();
        sd_request["prompt"] = Value::String(self.prompt_with_extra_args(request));

        log::debug!("Forwarding request to sd-server: {}", sd_request);
        self.server
            .forward_request(
                Operation::ImageGenerations.endpoint(),
                &sd_request,
                Self::image_timeout(),
            )
            .await
    }

    async fn image_edits(&self, request: &Value) -> Result<Value> {
        let prompt = self.prompt_with_extra_args(request);
        let mut fields = vec![MultipartField::text("prompt", prompt)];
        count_and_size(request, &mut fields);

        if let Some(image) = decode_image(request, "image_data")? {
            fields.push(MultipartField::file("image[]", image, "image.png", "image/png"));
        }
        if let Some(mask) = decode_image(request, "mask_data")? {
            fields.push(MultipartField::file("mask", mask, "mask.png", "image/png"));
        }

        log::debug!("Forwarding image edits to {} (multipart)", Operation::ImageEdits.endpoint());
        self.server
            .forward_multipart_request(Operation::ImageEdits.endpoint(), fields, Self::image_timeout())
            .await
    }

    async fn image_variations(&self, request: &Value) -> Result<Value> {
        // sd-server rejects an empty prompt; variations have none
        let mut fields = vec![MultipartField::text("prompt", "variation")];
        count_and_size(request, &mut fields);

        if let Some(image) = decode_image(request, "image_data")? {
            fields.push(MultipartField::file("image[]", image, "image.png", "image/png"));
        }

        log::debug!(
            "Forwarding image variations to {} (multipart)",
            Operation::ImageVariations.endpoint()
        );
        self.server
            .forward_multipart_request(
                Operation::ImageVariations.endpoint(),
                fields,
                Self::image_timeout(),
            )
            .await
    }
}
