//! Shared constants for backend installation and supervision

/// Host names and addresses
pub mod hosts {
    /// Loopback address every wrapped backend binds to
    pub const LOCAL: &str = "127.0.0.1";
}

/// Readiness probe paths
pub mod probes {
    /// Default health endpoint exposed by most wrapped servers
    pub const HEALTH: &str = "/health";
    /// FastFlowLM has no health endpoint; its model listing doubles as one
    pub const MODEL_TAGS: &str = "/api/tags";
    /// sd-server only answers on the document root
    pub const ROOT: &str = "/";
}

/// Timeouts, in seconds unless noted
pub mod timeouts {
    /// Default timeout for unary proxied requests
    pub const REQUEST_SECS: u64 = 300;
    /// Image generation/edit requests can take minutes on CPU
    pub const IMAGE_REQUEST_SECS: u64 = 600;
    /// Per-attempt timeout of a readiness probe (ms)
    pub const PROBE_MS: u64 = 1000;
    /// Grace period between SIGTERM and SIGKILL when stopping a process (ms)
    pub const STOP_GRACE_MS: u64 = 500;
}

/// Defaults for retry budgets and per-model options
pub mod defaults {
    /// Directory removal attempts on uninstall
    pub const UNINSTALL_ATTEMPTS: u32 = 5;
    /// Backoff between directory removal attempts (ms)
    pub const UNINSTALL_BACKOFF_MS: u64 = 500;
    /// Readiness probe attempts before a load is abandoned
    pub const READY_MAX_RETRIES: u32 = 1200;
    /// Interval between readiness probes (ms)
    pub const READY_INTERVAL_MS: u64 = 100;
    /// Context size used when the per-model options do not set one
    pub const CONTEXT_SIZE: i64 = 4096;
    /// Sampling steps for image generation
    pub const SD_STEPS: i64 = 20;
    /// Classifier-free guidance scale for image generation
    pub const SD_CFG_SCALE: f64 = 7.0;
    /// Prefix of the machine-actionable install hint shown in status output
    pub const INSTALL_COMMAND: &str = "backend-runtime recipes --install";
}

/// Release hosting
pub mod github {
    /// Release page for a repository and tag
    pub fn release_url(repo: &str, version: &str) -> String {
        format!("https://github.com/{}/releases/tag/{}", repo, version)
    }

    /// Direct download URL for a release asset
    pub fn download_url(repo: &str, version: &str, filename: &str) -> String {
        format!(
            "https://github.com/{}/releases/download/{}/{}",
            repo, version, filename
        )
    }
}

/// FastFlowLM (full-product NPU installer) constants
pub mod flm {
    pub const RECIPE: &str = "flm";
    pub const BACKEND: &str = "npu";
    pub const REPO: &str = "FastFlowLM/FastFlowLM";
    pub const INSTALLER_FILENAME: &str = "flm-setup.exe";
    /// Oldest NPU driver FastFlowLM runs on
    pub const MIN_NPU_DRIVER_VERSION: &str = "32.0.203.311";
    pub const DRIVER_UPDATE_URL: &str =
        "https://www.amd.com/en/support/download/drivers.html";
    /// Verification polls after running the installer
    pub const VERIFY_MAX_RETRIES: u32 = 10;
    pub const VERIFY_INTERVAL_MS: u64 = 1000;
}

/// Name of the marker file recording the installed artifact version
pub const VERSION_MARKER: &str = "version.txt";
