//! Host platform description used to pick release artifacts
//!
//! Artifact selection is a pure function of [`Platform`], so every
//! (os, accelerator) pair can be exercised from tests on any host.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Windows,
    Linux,
    #[serde(rename = "macos")]
    MacOs,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: Os,
    pub arch: Arch,
    /// ROCm GPU family (e.g. `gfx110X`), reported by the hardware probe.
    /// `None` means no supported AMD GPU was detected.
    #[serde(default)]
    pub rocm_arch: Option<String>,
}

impl Platform {
    pub fn new(os: Os, arch: Arch) -> Self {
        Self {
            os,
            arch,
            rocm_arch: None,
        }
    }

    /// The platform this binary was compiled for
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => Os::Windows,
            "linux" => Os::Linux,
            "macos" => Os::MacOs,
            _ => Os::Other,
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => Arch::X86_64,
            "aarch64" => Arch::Aarch64,
            _ => Arch::Other,
        };
        Self::new(os, arch)
    }

    pub fn with_rocm_arch(mut self, arch: impl Into<String>) -> Self {
        self.rocm_arch = Some(arch.into());
        self
    }

    /// Executable name for `base` on this platform
    pub fn executable_name(&self, base: &str) -> String {
        match self.os {
            Os::Windows => format!("{}.exe", base),
            _ => base.to_string(),
        }
    }

    /// Environment variable the dynamic loader searches for shared libraries
    pub fn library_path_var(&self) -> &'static str {
        match self.os {
            Os::Windows => "PATH",
            Os::MacOs => "DYLD_LIBRARY_PATH",
            _ => "LD_LIBRARY_PATH",
        }
    }

    fn path_separator(&self) -> char {
        match self.os {
            Os::Windows => ';',
            _ => ':',
        }
    }

    /// Build an env override that puts `dir` in front of the loader search path,
    /// keeping whatever the current process already has there.
    pub fn library_path_env(&self, dir: &std::path::Path) -> (String, String) {
        let var = self.library_path_var();
        let mut value = dir.to_string_lossy().to_string();
        if let Ok(existing) = std::env::var(var) {
            if !existing.is_empty() {
                value.push(self.path_separator());
                value.push_str(&existing);
            }
        }
        (var.to_string(), value)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::current()
    }
}
