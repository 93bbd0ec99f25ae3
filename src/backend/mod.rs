//! Remote artifact backends
//!
//! Each backend can list a model's files and fetch one file to a local
//! destination. The orchestrator iterates backends in a fixed priority
//! order: bucket store first, hub snapshot store second, mirror bucket last.

pub mod bucket;
pub mod hub;
pub mod mirror;

use crate::catalog::ModelDescriptor;
use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub use bucket::ObjectBucketBackend;
pub use hub::HubBackend;
pub use mirror::MirrorBackend;

/// One remote object a backend can serve for a model
#[derive(Debug, Clone)]
pub struct RemoteObject {
    /// Catalog file name; also the destination file name
    pub file_name: String,
    /// Backend-specific remote key
    pub key: String,
    pub size: Option<u64>,
    pub sha256: Option<String>,
}

/// Result of listing a model against one backend
#[derive(Debug, Clone)]
pub struct ModelListing {
    /// Version tag the backend reports for this model, if any
    pub version: Option<String>,
    /// Remote objects in catalog-declared file order
    pub files: Vec<RemoteObject>,
}

/// A single fetch attempt; exists only for the duration of one transfer
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub model: String,
    pub key: String,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_sha256: Option<String>,
}

/// Cooperative cancellation flag shared between the CLI and transfers
///
/// Checked at every chunk boundary, which bounds cancellation latency to one
/// chunk read.
#[derive(Debug, Default)]
pub struct CancelFlag(AtomicBool);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callback: (bytes downloaded, total bytes when known)
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Capability interface over remote artifact sources
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// List the remote objects backing `model`, in catalog file order
    async fn list_files(&self, model: &ModelDescriptor) -> VaultResult<ModelListing>;

    /// Stream one file to its destination with coarse progress emission
    async fn fetch_file(
        &self,
        task: &DownloadTask,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> VaultResult<()>;
}

/// Assemble the backend priority list from process environment
///
/// Unconfigured variants are skipped; the hub variant only needs a staging
/// directory and is always present.
pub fn build_backends(
    staging_dir: &Path,
    request_timeout: Duration,
    stall_timeout: Duration,
) -> Vec<Arc<dyn ArtifactBackend>> {
    let mut backends: Vec<Arc<dyn ArtifactBackend>> = Vec::new();

    match ObjectBucketBackend::from_env(request_timeout, stall_timeout) {
        Ok(Some(bucket)) => backends.push(Arc::new(bucket)),
        Ok(None) => tracing::debug!("Bucket backend not configured"),
        Err(e) => tracing::warn!(error = %e, "Bucket backend misconfigured, skipping"),
    }

    match HubBackend::from_env(staging_dir) {
        Ok(hub) => backends.push(Arc::new(hub)),
        Err(e) => tracing::warn!(error = %e, "Hub backend unavailable, skipping"),
    }

    match MirrorBackend::from_env(request_timeout, stall_timeout) {
        Ok(Some(mirror)) => backends.push(Arc::new(mirror)),
        Ok(None) => tracing::debug!("Mirror backend not configured"),
        Err(e) => tracing::warn!(error = %e, "Mirror backend misconfigured, skipping"),
    }

    tracing::info!(
        backends = ?backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
        "Backend priority order assembled"
    );

    backends
}

// ============================================================================
// Shared streaming machinery for the HTTP backends
// ============================================================================

/// Gate that turns a byte counter into coarse (>=10% delta) progress ticks
pub(crate) struct CoarseProgress {
    total: Option<u64>,
    last_emitted: i64,
}

impl CoarseProgress {
    pub(crate) fn new(total: Option<u64>) -> Self {
        Self {
            total,
            last_emitted: -10,
        }
    }

    /// Percentage to emit now, or `None` while inside the last 10% band
    pub(crate) fn update(&mut self, downloaded: u64) -> Option<u8> {
        let total = self.total?;
        if total == 0 {
            return None;
        }
        let pct = (downloaded.min(total) * 100 / total) as i64;
        if pct >= self.last_emitted + 10 || (pct == 100 && self.last_emitted != 100) {
            self.last_emitted = pct;
            Some(pct as u8)
        } else {
            None
        }
    }
}

/// Stream an HTTP response body to `task.destination`
///
/// Cancellation is checked and the stall timeout re-armed at every chunk.
pub(crate) async fn stream_to_file(
    backend: &'static str,
    response: reqwest::Response,
    task: &DownloadTask,
    on_progress: ProgressFn<'_>,
    cancel: &CancelFlag,
    stall_timeout: Duration,
) -> VaultResult<()> {
    let total = task.expected_size.or(response.content_length());
    let mut gate = CoarseProgress::new(total);

    if let Some(parent) = task.destination.parent()
        && !parent.exists()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&task.destination).await?;
    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;

    on_progress(0, total);
    let _ = gate.update(0);

    loop {
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        let chunk = match tokio::time::timeout(stall_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => {
                return Err(VaultError::TransferInterrupted {
                    key: task.key.clone(),
                    reason: format!("stream error from {}: {}", backend, e),
                });
            }
            Ok(None) => break,
            Err(_) => {
                return Err(VaultError::TransferInterrupted {
                    key: task.key.clone(),
                    reason: format!("stalled for {:?}", stall_timeout),
                });
            }
        };

        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;

        if gate.update(downloaded).is_some() {
            on_progress(downloaded, total);
        }
    }

    file.sync_all().await?;
    if gate.update(downloaded).is_some() || total.is_none() {
        on_progress(downloaded, total);
    }
    Ok(())
}

/// Map a reqwest failure onto the engine taxonomy
pub(crate) fn classify_http_error(
    backend: &'static str,
    key: &str,
    error: reqwest::Error,
) -> VaultError {
    if error.is_timeout() {
        VaultError::TransferInterrupted {
            key: key.to_string(),
            reason: format!("request timeout against {}", backend),
        }
    } else if error.is_connect() || error.status().is_some() {
        VaultError::BackendUnavailable {
            backend: backend.to_string(),
            reason: error.to_string(),
        }
    } else {
        VaultError::TransferInterrupted {
            key: key.to_string(),
            reason: error.to_string(),
        }
    }
}
