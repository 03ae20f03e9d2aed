//! Cached recipe/backend status
//!
//! The cache mirrors what a `system-info` style endpoint reports for every
//! recipe. It is populated wholesale by the caller and afterwards kept
//! current by targeted patches on install/uninstall, so a status request
//! never needs to rescan the filesystem.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Install state of one backend variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Cannot run on this system; never changed by install/uninstall
    #[default]
    Unsupported,
    Installable,
    Installed,
}

/// Status of one backend variant within a recipe
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendStatusEntry {
    #[serde(default)]
    pub state: BackendState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_filename: Option<String>,
    /// Fields owned by the producer of the cache; preserved untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecipeEntry {
    #[serde(default)]
    pub backends: BTreeMap<String, BackendStatusEntry>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

pub type RecipeMap = BTreeMap<String, RecipeEntry>;

/// Release metadata for a recipe/backend; empty strings mean "unknown"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackendEnrichment {
    pub release_url: String,
    pub download_filename: String,
    pub version: String,
}

/// Mutex-guarded recipe status cache
#[derive(Debug, Default)]
pub struct RecipeStatusCache {
    recipes: Mutex<Option<RecipeMap>>,
}

impl RecipeStatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole cache
    pub fn set(&self, recipes: RecipeMap) {
        *self.recipes.lock() = Some(recipes);
    }

    pub fn set_from_json(&self, recipes: serde_json::Value) -> Result<()> {
        let recipes: RecipeMap = serde_json::from_value(recipes)?;
        self.set(recipes);
        Ok(())
    }

    /// Copy of the current cache, `None` until populated
    pub fn snapshot(&self) -> Option<RecipeMap> {
        self.recipes.lock().clone()
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self.snapshot() {
            Some(recipes) => serde_json::to_value(recipes).unwrap_or_default(),
            None => serde_json::Value::Null,
        }
    }

    /// Update a single entry after an install (`installed = true`) or an
    /// uninstall.
    ///
    /// Does nothing when the cache is empty or the entry does not exist.
    /// `Unsupported` entries keep their state and message; only their action
    /// is cleared. Returns whether an entry was touched.
    pub fn patch(
        &self,
        recipe: &str,
        backend: &str,
        installed: bool,
        install_action: &str,
        enrichment: &BackendEnrichment,
    ) -> bool {
        let mut guard = self.recipes.lock();
        let Some(info) = guard
            .as_mut()
            .and_then(|recipes| recipes.get_mut(recipe))
            .and_then(|entry| entry.backends.get_mut(backend))
        else {
            return false;
        };

        match (info.state, installed) {
            (BackendState::Unsupported, _) => info.action.clear(),
            (_, true) => {
                info.state = BackendState::Installed;
                info.message.clear();
                info.action.clear();
            }
            (_, false) => {
                info.state = BackendState::Installable;
                info.message = "Backend is supported but not installed.".to_string();
                info.action = install_action.to_string();
            }
        }

        // Version stays visible for uninstalled backends too
        info.version = non_empty(&enrichment.version);
        if let Some(url) = non_empty(&enrichment.release_url) {
            info.release_url = Some(url);
        }
        if let Some(filename) = non_empty(&enrichment.download_filename) {
            info.download_filename = Some(filename);
        }

        true
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// One backend in a status report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    #[serde(flatten)]
    pub entry: BackendStatusEntry,
}

/// One recipe in a status report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecipeStatus {
    pub recipe: String,
    pub backends: Vec<BackendStatus>,
}

/// Convert an ordered status report into the cache's keyed layout
pub fn to_recipe_map(statuses: &[RecipeStatus]) -> RecipeMap {
    statuses
        .iter()
        .map(|recipe| {
            let backends = recipe
                .backends
                .iter()
                .map(|b| (b.name.clone(), b.entry.clone()))
                .collect();
            (
                recipe.recipe.clone(),
                RecipeEntry {
                    backends,
                    extra: Default::default(),
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ACTION: &str = "backend-runtime recipes --install llamacpp:vulkan";

    fn enrichment(version: &str) -> BackendEnrichment {
        BackendEnrichment {
            release_url: format!("https://github.com/ggml-org/llama.cpp/releases/tag/{}", version),
            download_filename: format!("llama-{}-bin-ubuntu-vulkan-x64.zip", version),
            version: version.to_string(),
        }
    }

    fn seeded() -> RecipeStatusCache {
        let cache = RecipeStatusCache::new();
        cache
            .set_from_json(json!({
                "llamacpp": {
                    "default_backend": "vulkan",
                    "backends": {
                        "vulkan": {"state": "installable", "message": "Backend is supported but not installed.", "action": ACTION, "devices": ["gpu0"]},
                        "cpu": {"state": "installed", "message": "", "action": "", "version": "b1"},
                        "metal": {"state": "unsupported", "message": "Requires macOS", "action": "something"}
                    }
                }
            }))
            .unwrap();
        cache
    }

    fn entry(cache: &RecipeStatusCache, backend: &str) -> BackendStatusEntry {
        cache.snapshot().unwrap()["llamacpp"].backends[backend].clone()
    }

    #[test]
    fn test_empty_cache_is_not_patched() {
        let cache = RecipeStatusCache::new();
        assert!(!cache.patch("llamacpp", "vulkan", true, ACTION, &enrichment("b2")));
        assert!(cache.snapshot().is_none());
    }

    #[test]
    fn test_missing_entry_is_not_patched() {
        let cache = seeded();
        let before = cache.snapshot();
        assert!(!cache.patch("llamacpp", "rocm", true, ACTION, &enrichment("b2")));
        assert!(!cache.patch("kokoro", "cpu", true, ACTION, &enrichment("b2")));
        assert_eq!(cache.snapshot(), before);
    }

    #[test]
    fn test_install_marks_entry_installed() {
        let cache = seeded();
        assert!(cache.patch("llamacpp", "vulkan", true, ACTION, &enrichment("b2")));

        let vulkan = entry(&cache, "vulkan");
        assert_eq!(vulkan.state, BackendState::Installed);
        assert_eq!(vulkan.message, "");
        assert_eq!(vulkan.action, "");
        assert_eq!(vulkan.version.as_deref(), Some("b2"));
        assert_eq!(
            vulkan.download_filename.as_deref(),
            Some("llama-b2-bin-ubuntu-vulkan-x64.zip")
        );
        assert_eq!(vulkan.extra["devices"], json!(["gpu0"]));

        // Siblings are untouched
        assert_eq!(entry(&cache, "cpu").version.as_deref(), Some("b1"));
        assert_eq!(
            cache.snapshot().unwrap()["llamacpp"].extra["default_backend"],
            "vulkan"
        );
    }

    #[test]
    fn test_uninstall_marks_entry_installable() {
        let cache = seeded();
        assert!(cache.patch("llamacpp", "cpu", false, "backend-runtime recipes --install llamacpp:cpu", &enrichment("b2")));

        let cpu = entry(&cache, "cpu");
        assert_eq!(cpu.state, BackendState::Installable);
        assert_eq!(cpu.message, "Backend is supported but not installed.");
        assert_eq!(cpu.action, "backend-runtime recipes --install llamacpp:cpu");
        assert_eq!(cpu.version.as_deref(), Some("b2"));
    }

    #[test]
    fn test_unsupported_only_clears_action() {
        let cache = seeded();
        assert!(cache.patch("llamacpp", "metal", true, ACTION, &BackendEnrichment::default()));

        let metal = entry(&cache, "metal");
        assert_eq!(metal.state, BackendState::Unsupported);
        assert_eq!(metal.message, "Requires macOS");
        assert_eq!(metal.action, "");
        assert!(metal.version.is_none());
        assert!(metal.release_url.is_none());
    }

    #[test]
    fn test_empty_enrichment_erases_version_only() {
        let cache = seeded();
        cache.patch("llamacpp", "vulkan", true, ACTION, &enrichment("b2"));
        cache.patch("llamacpp", "vulkan", true, ACTION, &BackendEnrichment::default());

        let vulkan = entry(&cache, "vulkan");
        assert!(vulkan.version.is_none());
        assert!(vulkan.release_url.is_some());
        assert!(vulkan.download_filename.is_some());
    }

    #[test]
    fn test_serialized_shape() {
        let cache = seeded();
        let value = cache.to_json();
        assert_eq!(value["llamacpp"]["backends"]["cpu"]["state"], "installed");
        assert!(value["llamacpp"]["backends"]["vulkan"].get("version").is_none());
    }
}
