//! Durable cache manifest
//!
//! Maps model name -> cache entry and persists across restarts. The manifest
//! is an optimization of validated state, not ground truth: entries are
//! re-validated against the filesystem before being trusted.

use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// One fully-validated cached model
///
/// Created only on full success; in-flight downloads never appear here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Model name; carried by the surrounding map key on disk
    #[serde(skip_serializing, default)]
    pub model: String,

    pub downloaded_at: DateTime<Utc>,

    /// Version tag reported by the backend that served the download
    pub version: String,

    pub files: Vec<String>,

    /// Correlation id of the attempt that produced this entry
    pub correlation_id: String,
}

// ============================================================================
// Storage trait
// ============================================================================

/// Persistence seam for the manifest file
#[async_trait]
pub trait ManifestStorage: Send + Sync {
    /// Save content to a path atomically
    async fn save(&self, path: &Path, content: &str) -> VaultResult<()>;

    /// Load content from a path, `None` if the file doesn't exist
    async fn load(&self, path: &Path) -> VaultResult<Option<String>>;
}

/// Production storage using tokio::fs
pub struct FileSystemStorage;

#[async_trait]
impl ManifestStorage for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> VaultResult<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await?;
        }

        // Atomic write: write to temp file, then rename
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_file, path).await?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> VaultResult<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path).await?))
    }
}

// ============================================================================
// Manifest store
// ============================================================================

/// Handle to the durable manifest, passed into every component that needs it
pub struct ManifestStore {
    path: PathBuf,
    storage: Arc<dyn ManifestStorage>,
    entries: RwLock<BTreeMap<String, CacheEntry>>,
}

impl ManifestStore {
    /// Load the manifest from disk with the default filesystem storage
    ///
    /// An unreadable or unparsable manifest is treated as empty and logged as
    /// a warning; entries will be rebuilt as models re-validate.
    pub async fn load(path: PathBuf) -> Self {
        Self::load_with_storage(path, Arc::new(FileSystemStorage)).await
    }

    /// Load the manifest through a custom storage backend
    pub async fn load_with_storage(path: PathBuf, storage: Arc<dyn ManifestStorage>) -> Self {
        let entries = match storage.load(&path).await {
            Ok(Some(content)) => match serde_json::from_str::<BTreeMap<String, CacheEntry>>(&content)
            {
                Ok(mut map) => {
                    for (name, entry) in map.iter_mut() {
                        entry.model = name.clone();
                    }
                    tracing::info!(path = ?path, entries = map.len(), "Manifest loaded");
                    map
                }
                Err(e) => {
                    tracing::warn!(
                        path = ?path,
                        error = %e,
                        "Manifest unparsable, starting with empty manifest"
                    );
                    BTreeMap::new()
                }
            },
            Ok(None) => {
                tracing::info!(path = ?path, "No manifest file found, starting fresh");
                BTreeMap::new()
            }
            Err(e) => {
                tracing::warn!(
                    path = ?path,
                    error = %e,
                    "Manifest unreadable, starting with empty manifest"
                );
                BTreeMap::new()
            }
        };

        Self {
            path,
            storage,
            entries: RwLock::new(entries),
        }
    }

    /// Get a model's entry
    pub async fn get(&self, name: &str) -> Option<CacheEntry> {
        self.entries.read().await.get(name).cloned()
    }

    /// Insert or replace an entry and flush to disk
    pub async fn upsert(&self, entry: CacheEntry) -> VaultResult<()> {
        {
            let mut entries = self.entries.write().await;
            entries.insert(entry.model.clone(), entry);
        }
        self.flush().await
    }

    /// Remove an entry and flush to disk; returns the removed entry
    pub async fn remove(&self, name: &str) -> VaultResult<Option<CacheEntry>> {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(name)
        };
        if removed.is_some() {
            self.flush().await?;
        }
        Ok(removed)
    }

    /// All entries, sorted by model name
    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Serialize the current map and write it atomically
    ///
    /// All writers funnel through here while holding no lock across the
    /// rename, so concurrent model downloads cannot corrupt the file.
    async fn flush(&self) -> VaultResult<()> {
        let content = {
            let entries = self.entries.read().await;
            serde_json::to_string_pretty(&*entries)
                .map_err(|e| std::io::Error::other(e.to_string()))?
        };

        self.storage.save(&self.path, &content).await?;

        tracing::debug!(path = ?self.path, "Manifest flushed");
        Ok(())
    }
}

// ============================================================================
// Mock storage for testing
// ============================================================================
