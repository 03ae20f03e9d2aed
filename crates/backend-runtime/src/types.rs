//! Common types shared by the installer, the server core and the adapters

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Download/install progress update
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DownloadProgress {
    pub status: String,
    pub current: u64,
    pub total: u64,
    pub done: bool,
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            current: 0,
            total: 0,
            done: false,
            error: None,
        }
    }
}

/// Receives progress updates during a download
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

pub(crate) fn report(progress: Option<&ProgressCallback>, update: DownloadProgress) {
    if let Some(cb) = progress {
        cb(update);
    }
}

/// What the model manager knows about a model
///
/// Resolution of checkpoints to files happens outside this crate; adapters
/// only see the resolved paths keyed by role (`main`, `mmproj`,
/// `text_encoder`, `vae`, `voices`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub checkpoint: String,
    #[serde(default)]
    pub files: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, checkpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            checkpoint: checkpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_file(mut self, role: &str, path: impl Into<PathBuf>) -> Self {
        self.files.insert(role.to_string(), path.into());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.labels.push(label.to_string());
        self
    }

    pub fn resolved_path(&self, role: &str) -> Option<&PathBuf> {
        self.files.get(role)
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Per-model options (`ctx_size`, `steps`, `cfg_scale`, `<recipe>_backend`, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeOptions(serde_json::Map<String, serde_json::Value>);

impl RecipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// The backend variant selected for `recipe`, e.g. `llamacpp_backend`
    pub fn backend_for(&self, recipe: &str, default: &str) -> String {
        self.get_str(&format!("{}_backend", recipe))
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    pub fn to_log_string(&self) -> String {
        serde_json::Value::Object(self.0.clone()).to_string()
    }
}

/// One field of a multipart/form-data body
#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub data: Vec<u8>,
    /// Set for file parts
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

impl MultipartField {
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            data: value.into().into_bytes(),
            filename: None,
            content_type: None,
        }
    }

    pub fn file(name: &str, data: Vec<u8>, filename: &str, content_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data,
            filename: Some(filename.to_string()),
            content_type: Some(content_type.to_string()),
        }
    }

    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Backend server status for status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: String,
    pub ready: bool,
    pub url: Option<String>,
    pub pid: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipe_options_backend_lookup() {
        let options = RecipeOptions::new()
            .with("sd-cpp_backend", "rocm")
            .with("ctx_size", 8192);
        assert_eq!(options.backend_for("sd-cpp", "cpu"), "rocm");
        assert_eq!(options.backend_for("llamacpp", "vulkan"), "vulkan");
        assert_eq!(options.get_i64("ctx_size"), Some(8192));
        assert_eq!(options.get_f64("cfg_scale"), None);
    }

    #[test]
    fn test_model_info_paths() {
        let info = ModelInfo::new("SD-Turbo", "stabilityai/sd-turbo")
            .with_file("main", "/models/sd.safetensors")
            .with_label("image");
        assert!(info.resolved_path("main").is_some());
        assert!(info.resolved_path("vae").is_none());
        assert!(info.has_label("image"));
    }
}
