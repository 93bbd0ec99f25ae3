//! Static model catalog
//!
//! Descriptors for every model the engine knows about. Loaded once from a
//! JSON file at process start and read-only afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Descriptor for a single model
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub name: String,

    /// Required file names, in fetch order
    pub files: Vec<String>,

    /// Total expected size of all files in bytes
    pub total_size: u64,

    /// Ascending priority: lower value downloads first
    pub priority: u32,

    /// A missing required model aborts the startup sequence
    #[serde(default)]
    pub required: bool,
}

impl ModelDescriptor {
    /// Cache directory name for this model
    ///
    /// Path separators in model names are flattened the same way the hub
    /// cache does it, e.g. "org/name" -> "org--name".
    pub fn cache_dir_name(&self) -> String {
        self.name.replace('/', "--")
    }
}

/// The model catalog, loaded once at start
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: Vec<ModelDescriptor>,
}

impl Catalog {
    /// Load and validate a catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;
        let models: Vec<ModelDescriptor> =
            serde_json::from_str(&content).context("Failed to parse catalog JSON")?;

        let catalog = Self { models };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Build a catalog from descriptors already in memory
    pub fn from_descriptors(models: Vec<ModelDescriptor>) -> Result<Self> {
        let catalog = Self { models };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Validate catalog contents
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();

        for model in &self.models {
            if model.name.is_empty() {
                anyhow::bail!("Catalog entry with empty model name");
            }
            if !names.insert(&model.name) {
                anyhow::bail!("Duplicate model name in catalog: {}", model.name);
            }
            if model.files.is_empty() {
                anyhow::bail!("Model '{}' declares no files", model.name);
            }
            if model.total_size == 0 {
                anyhow::bail!("Model '{}' declares zero total size", model.name);
            }

            let mut files = HashSet::new();
            for file in &model.files {
                if file.is_empty() || file.contains("..") || file.starts_with('/') {
                    anyhow::bail!("Model '{}' declares invalid file name '{}'", model.name, file);
                }
                if !files.insert(file) {
                    anyhow::bail!("Model '{}' declares duplicate file '{}'", model.name, file);
                }
            }
        }

        Ok(())
    }

    /// Look up a descriptor by model name
    pub fn lookup(&self, name: &str) -> Option<&ModelDescriptor> {
        self.models.iter().find(|m| m.name == name)
    }

    /// All descriptors sorted by ascending priority
    ///
    /// The sort is stable, so equal priorities keep catalog order.
    pub fn by_priority(&self) -> Vec<&ModelDescriptor> {
        let mut sorted: Vec<_> = self.models.iter().collect();
        sorted.sort_by_key(|m| m.priority);
        sorted
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
