//! Age-based cache eviction
//!
//! Runs independently of the orchestrator: in-flight downloads have no
//! manifest entry until they succeed, so the janitor can never collide with
//! an active fetch.

use crate::error::VaultResult;
use crate::manifest::ManifestStore;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

/// Outcome of one cleanup pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub retained: usize,
}

pub struct Janitor {
    manifest: Arc<ManifestStore>,
    cache_dir: PathBuf,
}

impl Janitor {
    pub fn new(manifest: Arc<ManifestStore>, cache_dir: PathBuf) -> Self {
        Self {
            manifest,
            cache_dir,
        }
    }

    /// Evict every manifest entry older than `max_age_days`, removing its
    /// on-disk data along with the entry
    pub async fn cleanup(&self, max_age_days: i64) -> VaultResult<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for entry in self.manifest.entries().await {
            let age_days = (now - entry.downloaded_at).num_days();
            if age_days <= max_age_days {
                report.retained += 1;
                continue;
            }

            let dir = self.cache_dir.join(entry.model.replace('/', "--"));
            if dir.exists() {
                if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                    tracing::warn!(
                        model = %entry.model,
                        dir = ?dir,
                        error = %e,
                        "Cleanup: failed to remove model directory, keeping manifest entry"
                    );
                    report.retained += 1;
                    continue;
                }
            }

            self.manifest.remove(&entry.model).await?;
            tracing::info!(
                model = %entry.model,
                age_days = age_days,
                cid = %entry.correlation_id,
                "Cleanup: evicted stale model"
            );
            report.removed.push(entry.model);
        }

        tracing::info!(
            removed = report.removed.len(),
            retained = report.retained,
            max_age_days = max_age_days,
            "Cleanup pass complete"
        );

        Ok(report)
    }
}
