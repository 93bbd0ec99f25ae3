//! Download orchestrator
//!
//! Drives each model through catalog lookup -> preflight -> per-backend
//! fetch -> validation -> manifest update. Any abort at any point removes
//! the model's destination directory, so a partially-downloaded model can
//! never be mistaken for a valid one.

use crate::backend::{ArtifactBackend, CancelFlag, DownloadTask, ModelListing};
use crate::catalog::{Catalog, ModelDescriptor};
use crate::error::{VaultError, VaultResult};
use crate::manifest::{CacheEntry, ManifestStore};
use crate::resources::{SystemResources, padded_bytes};
use crate::validate;
use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Lifecycle of one model inside the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadPhase {
    NotStarted,
    Checking,
    Fetching,
    Validating,
    /// Terminal success
    Cached,
    /// Terminal failure, destination cleaned up
    Failed,
}

impl std::fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Checking => write!(f, "checking"),
            Self::Fetching => write!(f, "fetching"),
            Self::Validating => write!(f, "validating"),
            Self::Cached => write!(f, "cached"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    /// Concurrent model downloads
    pub max_parallel_models: usize,
    /// Attempts per file against one backend before giving up on it
    pub file_attempts: u32,
    /// First retry delay; doubles per attempt
    pub retry_base_delay: Duration,
    /// Disk headroom multiplier for preflight
    pub buffer_ratio: f64,
}

impl Default for DownloadPolicy {
    fn default() -> Self {
        Self {
            max_parallel_models: 4,
            file_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            buffer_ratio: crate::resources::DEFAULT_BUFFER_RATIO,
        }
    }
}

/// Outcome of a catalog sync run
#[derive(Debug, Default)]
pub struct SyncReport {
    pub cached: Vec<String>,
    pub failed_required: Vec<String>,
    pub failed_optional: Vec<String>,
    /// Optional models deferred because the budget ran out
    pub skipped: Vec<String>,
}

impl SyncReport {
    /// The startup sequence may proceed iff no required model failed
    pub fn success(&self) -> bool {
        self.failed_required.is_empty()
    }
}

/// Per-model validation outcome for the read-only validate pass
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub model: String,
    pub ok: bool,
}

/// The download orchestrator
pub struct Downloader {
    catalog: Catalog,
    manifest: Arc<ManifestStore>,
    backends: Vec<Arc<dyn ArtifactBackend>>,
    policy: DownloadPolicy,
    cache_dir: PathBuf,
    phases: DashMap<String, DownloadPhase>,
    cancel: Arc<CancelFlag>,
}

impl Downloader {
    pub fn new(
        catalog: Catalog,
        manifest: Arc<ManifestStore>,
        backends: Vec<Arc<dyn ArtifactBackend>>,
        policy: DownloadPolicy,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            catalog,
            manifest,
            backends,
            policy,
            cache_dir,
            phases: DashMap::new(),
            cancel: Arc::new(CancelFlag::default()),
        }
    }

    /// Shared cancellation flag, wired to Ctrl-C by the CLI
    pub fn cancel_flag(&self) -> Arc<CancelFlag> {
        self.cancel.clone()
    }

    /// Current phase of a model, if it has been touched this run
    pub fn phase(&self, name: &str) -> Option<DownloadPhase> {
        self.phases.get(name).map(|p| *p)
    }

    fn set_phase(&self, name: &str, phase: DownloadPhase) {
        self.phases.insert(name.to_string(), phase);
    }

    fn model_dir(&self, model: &ModelDescriptor) -> PathBuf {
        self.cache_dir.join(model.cache_dir_name())
    }

    /// Force one model through the state machine
    pub async fn download(&self, name: &str) -> VaultResult<()> {
        let model = self
            .catalog
            .lookup(name)
            .ok_or_else(|| VaultError::ModelNotFound(name.to_string()))?;
        self.download_model(model).await
    }

    /// Sync the catalog: every required model, plus affordable optional ones
    ///
    /// Preflight runs before any network or filesystem write. Models start
    /// strictly in ascending priority order; the semaphore bounds how many
    /// run at once.
    pub async fn sync(
        self: &Arc<Self>,
        resources: &SystemResources,
        required_only: bool,
    ) -> VaultResult<SyncReport> {
        let models = self.catalog.by_priority();

        // Bytes the required batch still needs; already-valid models are free
        let mut required_bytes = 0u64;
        for model in models.iter().filter(|m| m.required) {
            if !self.verify_cached(model).await {
                required_bytes += model.total_size;
            }
        }

        let padded = padded_bytes(required_bytes, self.policy.buffer_ratio);
        if !resources.can_afford(required_bytes, self.policy.buffer_ratio) {
            tracing::error!(
                required = padded,
                available = resources.free_disk,
                "Preflight refused required-model batch"
            );
            return Err(VaultError::ResourceInsufficient {
                required: padded,
                available: resources.free_disk,
            });
        }

        tracing::info!(
            models = models.len(),
            required_bytes = required_bytes,
            free_disk = resources.free_disk,
            required_only = required_only,
            "Preflight passed, starting sync"
        );

        let semaphore = Arc::new(Semaphore::new(self.policy.max_parallel_models.max(1)));
        let mut tasks: JoinSet<(String, bool, bool)> = JoinSet::new();
        let mut report = SyncReport::default();
        let mut committed = required_bytes;

        for model in models {
            if !model.required {
                if required_only {
                    continue;
                }
                // Optional models are budgeted incrementally against what
                // this batch has already committed to disk.
                if !self.verify_cached(model).await {
                    let wanted = committed + model.total_size;
                    if !resources.can_afford(wanted, self.policy.buffer_ratio) {
                        tracing::warn!(
                            model = %model.name,
                            needed = model.total_size,
                            "Deferring optional model, budget exhausted"
                        );
                        report.skipped.push(model.name.clone());
                        continue;
                    }
                    committed = wanted;
                }
            }

            // Acquiring the permit here, not inside the task, keeps start
            // order strictly by priority.
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| VaultError::Io(std::io::Error::other(e.to_string())))?;

            let downloader = Arc::clone(self);
            let name = model.name.clone();
            let required = model.required;
            tasks.spawn(async move {
                let _permit = permit;
                let ok = downloader.download(&name).await.is_ok();
                (name, required, ok)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, _, true)) => report.cached.push(name),
                Ok((name, true, false)) => report.failed_required.push(name),
                Ok((name, false, false)) => report.failed_optional.push(name),
                Err(e) => {
                    tracing::error!(error = %e, "Download task panicked");
                }
            }
        }

        tracing::info!(
            cached = report.cached.len(),
            failed_required = report.failed_required.len(),
            failed_optional = report.failed_optional.len(),
            skipped = report.skipped.len(),
            "Sync complete"
        );

        Ok(report)
    }

    /// Re-run integrity validation on every manifest entry, read-only
    pub async fn validate_all(&self) -> Vec<ValidationOutcome> {
        let mut outcomes = Vec::new();

        for entry in self.manifest.entries().await {
            let ok = match self.catalog.lookup(&entry.model) {
                Some(model) => self.verify_cached(model).await,
                None => {
                    // Model left the catalog; judge it by its recorded files
                    let dir = self.cache_dir.join(entry.model.replace('/', "--"));
                    entry
                        .files
                        .iter()
                        .all(|f| validate::validate_file(&dir.join(f), None, None).is_ok())
                }
            };

            tracing::info!(model = %entry.model, ok = ok, "Validation result");
            outcomes.push(ValidationOutcome {
                model: entry.model,
                ok,
            });
        }

        outcomes
    }

    // ------------------------------------------------------------------
    // State machine internals
    // ------------------------------------------------------------------

    async fn download_model(&self, model: &ModelDescriptor) -> VaultResult<()> {
        let cid = uuid::Uuid::new_v4().to_string();

        self.set_phase(&model.name, DownloadPhase::Checking);
        if self.verify_cached(model).await {
            self.set_phase(&model.name, DownloadPhase::Cached);
            tracing::info!(model = %model.name, cid = %cid, "Already cached and valid, skipping");
            return Ok(());
        }

        self.set_phase(&model.name, DownloadPhase::Fetching);
        tracing::info!(
            model = %model.name,
            files = model.files.len(),
            total_size = model.total_size,
            cid = %cid,
            "Download start"
        );

        // A stale partial directory from a crashed run is dead weight
        self.cleanup_model_dir(model, &cid).await;

        let mut last_error: Option<VaultError> = None;

        for backend in &self.backends {
            let listing = match backend.list_files(model).await {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::warn!(
                        model = %model.name,
                        backend = backend.name(),
                        error = %e,
                        cid = %cid,
                        "Backend cannot serve model, falling back"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            match self.fetch_all(model, backend.as_ref(), &listing, &cid).await {
                Ok(()) => {
                    self.set_phase(&model.name, DownloadPhase::Validating);
                    if let Err(e) = self.verify_complete(model, &listing) {
                        tracing::warn!(
                            model = %model.name,
                            backend = backend.name(),
                            error = %e,
                            cid = %cid,
                            "Post-fetch validation failed, falling back"
                        );
                        self.cleanup_model_dir(model, &cid).await;
                        last_error = Some(e);
                        self.set_phase(&model.name, DownloadPhase::Fetching);
                        continue;
                    }

                    let entry = CacheEntry {
                        model: model.name.clone(),
                        downloaded_at: Utc::now(),
                        version: listing.version.unwrap_or_else(|| "unversioned".to_string()),
                        files: model.files.clone(),
                        correlation_id: cid.clone(),
                    };
                    self.manifest.upsert(entry).await?;

                    self.set_phase(&model.name, DownloadPhase::Cached);
                    tracing::info!(
                        model = %model.name,
                        backend = backend.name(),
                        cid = %cid,
                        "Download complete"
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.cleanup_model_dir(model, &cid).await;

                    if matches!(e, VaultError::Cancelled) {
                        self.set_phase(&model.name, DownloadPhase::Failed);
                        tracing::warn!(model = %model.name, cid = %cid, "Download cancelled");
                        return Err(e);
                    }

                    tracing::warn!(
                        model = %model.name,
                        backend = backend.name(),
                        error = %e,
                        cid = %cid,
                        "Backend failed mid-model, falling back"
                    );
                    last_error = Some(e);
                }
            }
        }

        self.set_phase(&model.name, DownloadPhase::Failed);
        let error = last_error.unwrap_or_else(|| VaultError::BackendUnavailable {
            backend: "none".to_string(),
            reason: "no backends configured".to_string(),
        });
        tracing::error!(model = %model.name, error = %error, cid = %cid, "Download failed");
        Err(error)
    }

    /// Fetch and validate every file sequentially against one backend
    async fn fetch_all(
        &self,
        model: &ModelDescriptor,
        backend: &dyn ArtifactBackend,
        listing: &ModelListing,
        cid: &str,
    ) -> VaultResult<()> {
        let dir = self.model_dir(model);
        tokio::fs::create_dir_all(&dir).await?;

        for object in &listing.files {
            let task = DownloadTask {
                model: model.name.clone(),
                key: object.key.clone(),
                destination: dir.join(&object.file_name),
                expected_size: object.size,
                expected_sha256: object.sha256.clone(),
            };
            self.fetch_with_retries(backend, &task, cid).await?;
        }

        Ok(())
    }

    /// Retry transient failures with exponential backoff
    ///
    /// Integrity failures pass straight through: repeatable corruption means
    /// a bad source, and the caller falls back to the next backend.
    async fn fetch_with_retries(
        &self,
        backend: &dyn ArtifactBackend,
        task: &DownloadTask,
        cid: &str,
    ) -> VaultResult<()> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if self.cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }

            match self.fetch_once(backend, task, cid).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.policy.file_attempts => {
                    let delay = self.policy.retry_base_delay * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        model = %task.model,
                        file = %task.key,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        cid = %cid,
                        "Transient failure, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(
        &self,
        backend: &dyn ArtifactBackend,
        task: &DownloadTask,
        cid: &str,
    ) -> VaultResult<()> {
        let model = task.model.as_str();
        let key = task.key.as_str();
        let backend_name = backend.name();

        let on_progress = move |downloaded: u64, total: Option<u64>| {
            let pct = total.filter(|t| *t > 0).map(|t| downloaded.min(t) * 100 / t);
            tracing::info!(
                model = model,
                backend = backend_name,
                file = key,
                downloaded = downloaded,
                total = total,
                pct = pct,
                cid = cid,
                "Download progress"
            );
        };

        backend.fetch_file(task, &on_progress, &self.cancel).await?;

        let destination = task.destination.clone();
        let expected_size = task.expected_size;
        let expected_sha256 = task.expected_sha256.clone();
        let validated = tokio::task::spawn_blocking(move || {
            validate::validate_file(&destination, expected_size, expected_sha256.as_deref())
        })
        .await
        .map_err(|e| VaultError::Io(std::io::Error::other(e.to_string())))?;

        match validated {
            Ok(()) => {
                tracing::debug!(
                    model = model,
                    file = key,
                    cid = cid,
                    "File validated"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    model = model,
                    file = key,
                    error = %e,
                    cid = cid,
                    "File failed validation"
                );
                Err(e)
            }
        }
    }

    /// Whether a manifest entry exists and the model fully re-validates on
    /// disk; the manifest is never trusted on its own
    async fn verify_cached(&self, model: &ModelDescriptor) -> bool {
        let Some(_entry) = self.manifest.get(&model.name).await else {
            return false;
        };

        let dir = self.model_dir(model);
        for file in &model.files {
            if let Err(e) = validate::validate_file(&dir.join(file), None, None) {
                tracing::warn!(
                    model = %model.name,
                    file = %file,
                    error = %e,
                    "Manifest entry stale, treating as cache miss"
                );
                return false;
            }
        }

        true
    }

    /// Final sweep before the manifest update: every catalog file is present
    /// and structurally sound
    ///
    /// Checksums were already enforced per file during Fetching; re-hashing
    /// multi-gigabyte artifacts here would double the validation cost.
    fn verify_complete(&self, model: &ModelDescriptor, listing: &ModelListing) -> VaultResult<()> {
        let dir = self.model_dir(model);

        for object in &listing.files {
            validate::validate_file(&dir.join(&object.file_name), object.size, None)?;
        }
        if listing.files.len() != model.files.len() {
            return Err(VaultError::PartialModel {
                model: model.name.clone(),
            });
        }

        Ok(())
    }

    /// Remove everything written for a model; called on every abort path
    async fn cleanup_model_dir(&self, model: &ModelDescriptor, cid: &str) {
        let dir = self.model_dir(model);
        if !dir.exists() {
            return;
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(model = %model.name, dir = ?dir, cid = %cid, "Cleanup: removed model directory");
            }
            Err(e) => {
                tracing::warn!(
                    model = %model.name,
                    dir = ?dir,
                    error = %e,
                    cid = %cid,
                    "Cleanup failed to remove model directory"
                );
            }
        }
    }
}
