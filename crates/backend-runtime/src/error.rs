//! Error types shared by the installer, the process supervisor and the adapters

use std::path::PathBuf;

use serde_json::json;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BackendError>;

/// Error types for backend lifecycle and proxy operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown recipe: {0}")]
    UnknownRecipe(String),

    #[error("Version configuration is missing an entry for {recipe}:{backend}")]
    MissingVersionConfig { recipe: String, backend: String },

    #[error("{0} uses a dedicated installer and has no artifact install path")]
    UnsupportedInstallPath(String),

    #[error("{recipe}:{backend} is not supported on this system: {reason}")]
    UnsupportedBackend {
        recipe: String,
        backend: String,
        reason: String,
    },

    #[error("Install failed: {0}")]
    Install(String),

    #[error(
        "NPU driver version {found} is older than the required {required}. Update your driver: {update_url}"
    )]
    NpuDriverTooOld {
        found: String,
        required: String,
        update_url: String,
    },

    #[error("Failed to remove {}: {source}", path.display())]
    UninstallLocked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    UninstallNotSupported(String),

    #[error("Failed to start process: {0}")]
    ProcessSpawn(String),

    #[error("{backend} failed to become ready on port {port}")]
    BackendNotReady { backend: String, port: u16 },

    #[error("No model is loaded in {0}")]
    ModelNotLoaded(String),

    #[error("{operation} is not supported by {backend}")]
    UnsupportedOperation { operation: String, backend: String },

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backend returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by callers deciding how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Unknown recipe or missing version entry; never retried
    Configuration,
    /// Download, extract, driver or validation failure
    Install,
    UninstallLocked,
    /// Spawn failure or readiness timeout
    Process,
    NotLoaded,
    UnsupportedOperation,
    /// Anything that went wrong while relaying a request
    Request,
}

impl BackendError {
    pub fn unsupported_backend(
        recipe: &str,
        backend: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedBackend {
            recipe: recipe.to_string(),
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unsupported_operation(operation: &str, backend: &str) -> Self {
        Self::UnsupportedOperation {
            operation: operation.to_string(),
            backend: backend.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownRecipe(_)
            | Self::MissingVersionConfig { .. }
            | Self::UnsupportedInstallPath(_) => ErrorKind::Configuration,
            Self::UnsupportedBackend { .. }
            | Self::Install(_)
            | Self::NpuDriverTooOld { .. }
            | Self::UninstallNotSupported(_) => ErrorKind::Install,
            Self::UninstallLocked { .. } => ErrorKind::UninstallLocked,
            Self::ProcessSpawn(_) | Self::BackendNotReady { .. } | Self::InvalidModel(_) => {
                ErrorKind::Process
            }
            Self::ModelNotLoaded(_) => ErrorKind::NotLoaded,
            Self::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
            Self::InvalidRequest(_)
            | Self::Upstream { .. }
            | Self::Cancelled
            | Self::Http(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Request,
        }
    }

    pub fn is_configuration_error(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    /// Render as an OpenAI-style error body for the API boundary
    pub fn to_error_response(&self) -> serde_json::Value {
        let error_type = match self.kind() {
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Install => "install_error",
            ErrorKind::UninstallLocked => "uninstall_error",
            ErrorKind::Process => "backend_error",
            ErrorKind::NotLoaded => "model_not_loaded",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::Request => match self {
                Self::InvalidRequest(_) => "invalid_request_error",
                _ => "server_error",
            },
        };

        let mut error = json!({
            "message": self.to_string(),
            "type": error_type,
        });
        if let Self::Upstream { status, .. } = self {
            error["code"] = json!(status);
        }

        json!({ "error": error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_classified() {
        assert!(BackendError::UnknownRecipe("x".into()).is_configuration_error());
        assert!(BackendError::MissingVersionConfig {
            recipe: "llamacpp".into(),
            backend: "cpu".into(),
        }
        .is_configuration_error());
        assert!(!BackendError::Install("boom".into()).is_configuration_error());
    }

    #[test]
    fn test_unsupported_operation_response_shape() {
        let err = BackendError::unsupported_operation(
            "Chat completion",
            "sd-cpp (image generation model)",
        );
        let body = err.to_error_response();
        assert_eq!(body["error"]["type"], "unsupported_operation");
        assert_eq!(
            body["error"]["message"],
            "Chat completion is not supported by sd-cpp (image generation model)"
        );
    }

    #[test]
    fn test_upstream_error_carries_status_code() {
        let err = BackendError::Upstream {
            status: 503,
            body: "busy".into(),
        };
        assert_eq!(err.to_error_response()["error"]["code"], 503);
    }
}
