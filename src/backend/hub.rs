//! Model-hub snapshot store
//!
//! Fetches through the native hf-hub client into a staging cache, then
//! copies into the model's destination directory. An optional format filter
//! (extension allow-list) narrows which catalog files this variant will
//! serve; a model whose required files don't all pass the filter is refused
//! so the orchestrator falls through to the next backend.

use super::{ArtifactBackend, CancelFlag, DownloadTask, ModelListing, ProgressFn, RemoteObject};
use crate::catalog::ModelDescriptor;
use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use hf_hub::api::tokio::{Api, ApiBuilder};
use std::path::Path;

const BACKEND_NAME: &str = "hub";

pub struct HubBackend {
    api: Api,
    /// Lowercase extension allow-list; `None` serves every file
    formats: Option<Vec<String>>,
    revision: String,
}

impl HubBackend {
    /// Build from `MODELVAULT_HUB_*` environment variables
    ///
    /// `HF_TOKEN` for gated models is honored by the hf-hub client itself.
    pub fn from_env(default_staging: &Path) -> VaultResult<Self> {
        let staging = std::env::var("MODELVAULT_HUB_CACHE")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| default_staging.to_path_buf());

        let formats = std::env::var("MODELVAULT_HUB_FORMATS").ok().map(|raw| {
            raw.split(',')
                .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        });

        let revision =
            std::env::var("MODELVAULT_HUB_REVISION").unwrap_or_else(|_| "main".to_string());

        Self::new(&staging, formats, revision)
    }

    pub fn new(
        staging_dir: &Path,
        formats: Option<Vec<String>>,
        revision: String,
    ) -> VaultResult<Self> {
        let api = ApiBuilder::new()
            .with_cache_dir(staging_dir.to_path_buf())
            .build()
            .map_err(|e| VaultError::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("hub client build failed: {}", e),
            })?;

        Ok(Self {
            api,
            formats,
            revision,
        })
    }

    fn passes_filter(&self, file_name: &str) -> bool {
        let Some(formats) = &self.formats else {
            return true;
        };
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        formats.iter().any(|f| f == &extension)
    }
}

#[async_trait]
impl ArtifactBackend for HubBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn list_files(&self, model: &ModelDescriptor) -> VaultResult<ModelListing> {
        // The snapshot key space is the file name itself; a filtered-out
        // required file means this variant cannot produce a complete model.
        let excluded: Vec<_> = model
            .files
            .iter()
            .filter(|f| !self.passes_filter(f))
            .collect();
        if !excluded.is_empty() {
            return Err(VaultError::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!(
                    "format filter excludes {} required file(s) of '{}'",
                    excluded.len(),
                    model.name
                ),
            });
        }

        let files = model
            .files
            .iter()
            .map(|name| RemoteObject {
                file_name: name.clone(),
                key: name.clone(),
                size: None,
                sha256: None,
            })
            .collect();

        Ok(ModelListing {
            version: Some(self.revision.clone()),
            files,
        })
    }

    async fn fetch_file(
        &self,
        task: &DownloadTask,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> VaultResult<()> {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        on_progress(0, task.expected_size);

        let repo = self.api.model(task.model.clone());
        let staged = repo
            .get(&task.key)
            .await
            .map_err(|e| VaultError::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("hub fetch of '{}' failed: {}", task.key, e),
            })?;

        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        if let Some(parent) = task.destination.parent()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let copied = tokio::fs::copy(&staged, &task.destination).await?;
        on_progress(copied, Some(copied));

        tracing::debug!(
            model = %task.model,
            file = %task.key,
            bytes = copied,
            "Staged hub file copied to destination"
        );

        Ok(())
    }
}
