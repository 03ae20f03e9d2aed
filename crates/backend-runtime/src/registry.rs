//! Static table of known recipes
//!
//! Every recipe is described by a [`BackendSpec`]: the executable it ships,
//! the backend variants it can be built for, and the function that maps
//! (platform, backend, version) to a release artifact. The table is built
//! eagerly in [`BackendRegistry::new`]; adding a backend means adding its
//! spec there.

use serde::Serialize;

use crate::backend::{flm, kokoro, llamacpp, ryzenai, sd};
use crate::error::{BackendError, Result};
use crate::platform::Platform;

/// Repository and asset name of a release artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactParams {
    pub repo: String,
    pub filename: String,
}

impl ArtifactParams {
    pub fn new(repo: &str, filename: impl Into<String>) -> Self {
        Self {
            repo: repo.to_string(),
            filename: filename.into(),
        }
    }
}

/// Maps (platform, backend, version) to the artifact to download
pub type ArtifactResolver = fn(&Platform, &str, &str) -> Result<ArtifactParams>;

/// Immutable description of a recipe
#[derive(Debug, Clone, Copy)]
pub struct BackendSpec {
    pub recipe: &'static str,
    /// Executable base name, without platform suffix
    pub executable: &'static str,
    /// Backend variants this recipe can be built for
    pub backends: &'static [&'static str],
    /// `None` for recipes installed through a dedicated installer
    pub resolver: Option<ArtifactResolver>,
}

impl BackendSpec {
    pub fn executable_name(&self, platform: &Platform) -> String {
        platform.executable_name(self.executable)
    }

    pub fn supports(&self, backend: &str) -> bool {
        self.backends.contains(&backend)
    }

    pub fn resolve(
        &self,
        platform: &Platform,
        backend: &str,
        version: &str,
    ) -> Result<ArtifactParams> {
        let resolver = self
            .resolver
            .ok_or_else(|| BackendError::UnsupportedInstallPath(self.recipe.to_string()))?;
        resolver(platform, backend, version)
    }
}

/// Registry of known recipes, in display order
pub struct BackendRegistry {
    specs: Vec<BackendSpec>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        let mut registry = Self { specs: Vec::new() };

        registry.register(llamacpp::SPEC);
        registry.register(flm::SPEC);
        registry.register(sd::SPEC);
        registry.register(kokoro::SPEC);
        registry.register(ryzenai::SPEC);

        registry
    }

    /// Register a spec, replacing any existing spec for the same recipe
    pub fn register(&mut self, spec: BackendSpec) {
        if let Some(existing) = self.specs.iter_mut().find(|s| s.recipe == spec.recipe) {
            *existing = spec;
        } else {
            self.specs.push(spec);
        }
    }

    pub fn try_get(&self, recipe: &str) -> Option<&BackendSpec> {
        self.specs.iter().find(|s| s.recipe == recipe)
    }

    pub fn get(&self, recipe: &str) -> Result<&BackendSpec> {
        self.try_get(recipe)
            .ok_or_else(|| BackendError::UnknownRecipe(recipe.to_string()))
    }

    pub fn recipes(&self) -> impl Iterator<Item = &BackendSpec> {
        self.specs.iter()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
