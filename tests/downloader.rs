//! End-to-end orchestrator tests against an in-process mock backend

use async_trait::async_trait;
use modelvault::backend::{
    ArtifactBackend, CancelFlag, DownloadTask, ModelListing, ProgressFn, RemoteObject,
};
use modelvault::{
    Catalog, DownloadPhase, DownloadPolicy, Downloader, ManifestStore, ModelDescriptor,
    SystemResources, VaultError,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Mock backend
// ============================================================================

struct MockBackend {
    label: &'static str,
    models: HashMap<String, Vec<(String, Vec<u8>)>>,
    unreachable: bool,
    /// Fail fetches of the file at this index with a transient error
    fail_at: Option<usize>,
    /// Declare wrong checksums so every fetched file fails validation
    corrupt: bool,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    listed: Mutex<Vec<String>>,
}

impl MockBackend {
    fn new(label: &'static str) -> Self {
        Self {
            label,
            models: HashMap::new(),
            unreachable: false,
            fail_at: None,
            corrupt: false,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            listed: Mutex::new(Vec::new()),
        }
    }

    fn with_model(mut self, name: &str, files: Vec<(&str, Vec<u8>)>) -> Self {
        self.models.insert(
            name.to_string(),
            files
                .into_iter()
                .map(|(n, c)| (n.to_string(), c))
                .collect(),
        );
        self
    }

    fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    fn corrupt(mut self) -> Self {
        self.corrupt = true;
        self
    }

    fn list_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn listed_models(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactBackend for MockBackend {
    fn name(&self) -> &'static str {
        self.label
    }

    async fn list_files(&self, model: &ModelDescriptor) -> Result<ModelListing, VaultError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        if self.unreachable {
            return Err(VaultError::BackendUnavailable {
                backend: self.label.to_string(),
                reason: "connect refused".to_string(),
            });
        }

        let files = self.models.get(&model.name).ok_or_else(|| {
            VaultError::BackendUnavailable {
                backend: self.label.to_string(),
                reason: format!("model '{}' not hosted", model.name),
            }
        })?;

        self.listed.lock().unwrap().push(model.name.clone());

        let listing = model
            .files
            .iter()
            .map(|name| {
                let (_, content) = files
                    .iter()
                    .find(|(n, _)| n == name)
                    .expect("catalog file missing from mock");
                let digest = if self.corrupt {
                    sha_hex(b"not the real content")
                } else {
                    sha_hex(content)
                };
                RemoteObject {
                    file_name: name.clone(),
                    key: name.clone(),
                    size: Some(content.len() as u64),
                    sha256: Some(digest),
                }
            })
            .collect();

        Ok(ModelListing {
            version: Some("mock-v1".to_string()),
            files: listing,
        })
    }

    async fn fetch_file(
        &self,
        task: &DownloadTask,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> Result<(), VaultError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        if self.unreachable {
            return Err(VaultError::BackendUnavailable {
                backend: self.label.to_string(),
                reason: "connect refused".to_string(),
            });
        }

        let files = self.models.get(&task.model).unwrap();
        let index = files.iter().position(|(n, _)| n == &task.key).unwrap();

        if self.fail_at == Some(index) {
            return Err(VaultError::TransferInterrupted {
                key: task.key.clone(),
                reason: "connection reset".to_string(),
            });
        }

        let content = &files[index].1;
        on_progress(0, Some(content.len() as u64));

        if let Some(parent) = task.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&task.destination, content).await?;

        on_progress(content.len() as u64, Some(content.len() as u64));
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn sha_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content that passes the legacy-archive structural check
fn pickle_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x80u8, 0x02];
    bytes.resize(len, b'x');
    bytes
}

fn json_bytes() -> Vec<u8> {
    br#"{"format": "test", "dims": 512}"#.to_vec()
}

fn descriptor(name: &str, files: &[&str], size: u64, priority: u32, required: bool) -> ModelDescriptor {
    ModelDescriptor {
        name: name.to_string(),
        files: files.iter().map(|s| s.to_string()).collect(),
        total_size: size,
        priority,
        required,
    }
}

fn test_policy() -> DownloadPolicy {
    DownloadPolicy {
        max_parallel_models: 1,
        file_attempts: 2,
        retry_base_delay: Duration::from_millis(1),
        buffer_ratio: 1.2,
    }
}

fn resources(free_disk: u64) -> SystemResources {
    SystemResources {
        available_memory: 8 << 30,
        free_disk,
        gpu_count: 0,
    }
}

struct Harness {
    _tmp: TempDir,
    manifest: Arc<ManifestStore>,
    downloader: Arc<Downloader>,
    cache_dir: std::path::PathBuf,
}

async fn harness(catalog: Catalog, backends: Vec<Arc<MockBackend>>) -> Harness {
    let tmp = TempDir::new().unwrap();
    harness_at(tmp, catalog, backends).await
}

async fn harness_at(tmp: TempDir, catalog: Catalog, backends: Vec<Arc<MockBackend>>) -> Harness {
    let manifest = Arc::new(ManifestStore::load(tmp.path().join("manifest.json")).await);
    let cache_dir = tmp.path().join("models");
    let backends = backends
        .into_iter()
        .map(|b| b as Arc<dyn ArtifactBackend>)
        .collect();
    let downloader = Arc::new(Downloader::new(
        catalog,
        manifest.clone(),
        backends,
        test_policy(),
        cache_dir.clone(),
    ));
    Harness {
        _tmp: tmp,
        manifest,
        downloader,
        cache_dir,
    }
}

fn model_dir(cache_dir: &Path, name: &str) -> std::path::PathBuf {
    cache_dir.join(name.replace('/', "--"))
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn test_idempotent_download_makes_zero_backend_calls_once_cached() {
    let catalog = Catalog::from_descriptors(vec![descriptor(
        "sd-base",
        &["a.bin", "b.json"],
        100,
        1,
        true,
    )])
    .unwrap();

    let backend = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(90)), ("b.json", json_bytes())]),
    );
    let h = harness(catalog, vec![backend.clone()]).await;

    h.downloader.download("sd-base").await.unwrap();
    assert_eq!(backend.list_count(), 1);
    assert_eq!(backend.fetch_count(), 2);

    // Cached and valid: subsequent runs never touch the network
    h.downloader.download("sd-base").await.unwrap();
    h.downloader.download("sd-base").await.unwrap();
    assert_eq!(backend.list_count(), 1);
    assert_eq!(backend.fetch_count(), 2);
    assert_eq!(h.downloader.phase("sd-base"), Some(DownloadPhase::Cached));
}

#[tokio::test]
async fn test_failure_at_any_file_index_leaves_no_partial_state() {
    for fail_index in 0..3 {
        let catalog = Catalog::from_descriptors(vec![descriptor(
            "sd-base",
            &["a.bin", "b.bin", "c.json"],
            120,
            1,
            true,
        )])
        .unwrap();

        let backend = Arc::new(
            MockBackend::new("bucket")
                .with_model(
                    "sd-base",
                    vec![
                        ("a.bin", pickle_bytes(50)),
                        ("b.bin", pickle_bytes(40)),
                        ("c.json", json_bytes()),
                    ],
                )
                .fail_at(fail_index),
        );
        let h = harness(catalog, vec![backend]).await;

        let result = h.downloader.download("sd-base").await;
        assert!(result.is_err(), "fail_at={} should fail", fail_index);
        assert_eq!(h.downloader.phase("sd-base"), Some(DownloadPhase::Failed));

        // Invariant: nothing on disk, nothing in the manifest
        assert!(
            !model_dir(&h.cache_dir, "sd-base").exists(),
            "fail_at={} left a partial directory",
            fail_index
        );
        assert!(h.manifest.get("sd-base").await.is_none());
    }
}

#[tokio::test]
async fn test_mutated_file_fails_validation_and_is_refetched() {
    let catalog = Catalog::from_descriptors(vec![descriptor(
        "sd-base",
        &["a.bin", "b.json"],
        100,
        1,
        true,
    )])
    .unwrap();

    let backend = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(90)), ("b.json", json_bytes())]),
    );
    let h = harness(catalog, vec![backend.clone()]).await;

    h.downloader.download("sd-base").await.unwrap();

    // Corrupt the cached artifact in place
    let target = model_dir(&h.cache_dir, "sd-base").join("a.bin");
    std::fs::write(&target, vec![0xFFu8; 90]).unwrap();

    let outcomes = h.downloader.validate_all().await;
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].ok, "mutated file must fail validation");

    // Re-download detects the stale entry and fetches again
    h.downloader.download("sd-base").await.unwrap();
    assert_eq!(backend.fetch_count(), 4);
    let outcomes = h.downloader.validate_all().await;
    assert!(outcomes[0].ok);
}

#[tokio::test]
async fn test_priority_order_and_optional_budgeting() {
    let catalog = Catalog::from_descriptors(vec![
        descriptor("model-c", &["c.json"], 40, 3, false),
        descriptor("model-a", &["a.json"], 40, 1, true),
        descriptor("model-b", &["b.json"], 40, 2, true),
    ])
    .unwrap();

    let backend = Arc::new(
        MockBackend::new("bucket")
            .with_model("model-a", vec![("a.json", json_bytes())])
            .with_model("model-b", vec![("b.json", json_bytes())])
            .with_model("model-c", vec![("c.json", json_bytes())]),
    );
    let h = harness(catalog, vec![backend.clone()]).await;

    // Disk affords exactly the required pair: 1.2 * (40 + 40)
    let report = h.downloader.sync(&resources(96), false).await.unwrap();

    assert!(report.success());
    assert_eq!(report.cached.len(), 2);
    assert_eq!(report.skipped, vec!["model-c".to_string()]);

    // Strict ascending priority, optional never attempted
    assert_eq!(backend.listed_models(), vec!["model-a", "model-b"]);
    assert!(h.downloader.phase("model-c").is_none());
}

#[tokio::test]
async fn test_preflight_refuses_without_touching_disk_or_network() {
    let catalog = Catalog::from_descriptors(vec![
        descriptor("model-a", &["a.json"], 40, 1, true),
        descriptor("model-b", &["b.json"], 40, 2, true),
    ])
    .unwrap();

    let backend = Arc::new(
        MockBackend::new("bucket")
            .with_model("model-a", vec![("a.json", json_bytes())])
            .with_model("model-b", vec![("b.json", json_bytes())]),
    );
    let h = harness(catalog, vec![backend.clone()]).await;

    // 1.2 * 80 = 96 > 90
    let result = h.downloader.sync(&resources(90), true).await;
    match result {
        Err(VaultError::ResourceInsufficient { required, available }) => {
            assert_eq!(required, 96);
            assert_eq!(available, 90);
        }
        other => panic!("expected ResourceInsufficient, got {:?}", other),
    }

    assert_eq!(backend.list_count(), 0);
    assert_eq!(backend.fetch_count(), 0);
    assert!(!h.cache_dir.exists(), "preflight refusal must not create the cache dir");
}

#[tokio::test]
async fn test_scenario_unreachable_then_recovered() {
    let files: &[&str] = &["a.bin", "b.json"];
    let catalog = || {
        Catalog::from_descriptors(vec![descriptor("sd-base", files, 100, 1, true)]).unwrap()
    };

    let tmp = TempDir::new().unwrap();
    let manifest_path = tmp.path().join("manifest.json");

    // Run 1: every backend unreachable
    let dead_primary = Arc::new(MockBackend::new("bucket").unreachable());
    let dead_mirror = Arc::new(MockBackend::new("mirror").unreachable());
    let h1 = harness_at(tmp, catalog(), vec![dead_primary, dead_mirror]).await;

    let result = h1.downloader.download("sd-base").await;
    assert!(result.is_err());
    assert_eq!(h1.downloader.phase("sd-base"), Some(DownloadPhase::Failed));
    assert!(!model_dir(&h1.cache_dir, "sd-base").exists());
    assert!(h1.manifest.get("sd-base").await.is_none());

    // Run 2: a fresh process with a reachable backend and the same manifest
    let good: Arc<dyn ArtifactBackend> = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(80)), ("b.json", json_bytes())]),
    );
    let manifest2 = Arc::new(ManifestStore::load(manifest_path).await);
    let downloader2 = Arc::new(Downloader::new(
        catalog(),
        manifest2.clone(),
        vec![good],
        test_policy(),
        h1.cache_dir.clone(),
    ));

    downloader2.download("sd-base").await.unwrap();
    assert_eq!(downloader2.phase("sd-base"), Some(DownloadPhase::Cached));

    let entry = manifest2.get("sd-base").await.unwrap();
    assert_eq!(entry.files, vec!["a.bin".to_string(), "b.json".to_string()]);
    assert_eq!(entry.version, "mock-v1");
    assert!(model_dir(&h1.cache_dir, "sd-base").join("a.bin").exists());
    assert!(model_dir(&h1.cache_dir, "sd-base").join("b.json").exists());
}

#[tokio::test]
async fn test_fallback_skips_unreachable_primary() {
    let catalog = Catalog::from_descriptors(vec![descriptor(
        "sd-base",
        &["a.bin", "b.json"],
        100,
        1,
        true,
    )])
    .unwrap();

    let primary = Arc::new(MockBackend::new("bucket").unreachable());
    let secondary = Arc::new(
        MockBackend::new("mirror")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(80)), ("b.json", json_bytes())]),
    );
    let h = harness(catalog, vec![primary.clone(), secondary.clone()]).await;

    h.downloader.download("sd-base").await.unwrap();

    assert_eq!(primary.fetch_count(), 0);
    assert_eq!(secondary.fetch_count(), 2);
    assert_eq!(h.downloader.phase("sd-base"), Some(DownloadPhase::Cached));
}

#[tokio::test]
async fn test_integrity_failure_falls_back_without_retrying_same_backend() {
    let catalog = Catalog::from_descriptors(vec![descriptor(
        "sd-base",
        &["a.bin", "b.json"],
        100,
        1,
        true,
    )])
    .unwrap();

    let content = vec![("a.bin", pickle_bytes(80)), ("b.json", json_bytes())];
    let corrupted = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", content.clone())
            .corrupt(),
    );
    let clean = Arc::new(MockBackend::new("mirror").with_model("sd-base", content));
    let h = harness(catalog, vec![corrupted.clone(), clean.clone()]).await;

    h.downloader.download("sd-base").await.unwrap();

    // Checksum mismatch on the first file: exactly one fetch against the
    // corrupt source, then straight to the fallback
    assert_eq!(corrupted.fetch_count(), 1);
    assert_eq!(clean.fetch_count(), 2);
    assert_eq!(h.downloader.phase("sd-base"), Some(DownloadPhase::Cached));
}

#[tokio::test]
async fn test_transient_failure_retries_before_giving_up() {
    let catalog =
        Catalog::from_descriptors(vec![descriptor("sd-base", &["a.bin"], 100, 1, true)]).unwrap();

    let flaky = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(80))])
            .fail_at(0),
    );
    let h = harness(catalog, vec![flaky.clone()]).await;

    let result = h.downloader.download("sd-base").await;
    assert!(result.is_err());

    // file_attempts = 2: the transient error was retried once
    assert_eq!(flaky.fetch_count(), 2);
    assert!(!model_dir(&h.cache_dir, "sd-base").exists());
}

#[tokio::test]
async fn test_required_failure_fails_sync_while_optional_does_not() {
    let catalog = Catalog::from_descriptors(vec![
        descriptor("critical", &["a.json"], 40, 1, true),
        descriptor("extra", &["b.json"], 40, 2, false),
    ])
    .unwrap();

    // Only the optional model is hosted
    let backend = Arc::new(MockBackend::new("bucket").with_model("extra", vec![("b.json", json_bytes())]));
    let h = harness(catalog, vec![backend]).await;

    let report = h.downloader.sync(&resources(1 << 30), false).await.unwrap();
    assert!(!report.success());
    assert_eq!(report.failed_required, vec!["critical".to_string()]);
    assert_eq!(report.cached, vec!["extra".to_string()]);
    assert!(report.failed_optional.is_empty());
}

#[tokio::test]
async fn test_unknown_model_is_catalog_miss() {
    let catalog =
        Catalog::from_descriptors(vec![descriptor("sd-base", &["a.json"], 10, 1, true)]).unwrap();
    let h = harness(catalog, vec![Arc::new(MockBackend::new("bucket"))]).await;

    match h.downloader.download("no-such-model").await {
        Err(VaultError::ModelNotFound(name)) => assert_eq!(name, "no-such-model"),
        other => panic!("expected ModelNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_cancelled_download_cleans_up_like_a_failure() {
    let catalog = Catalog::from_descriptors(vec![descriptor(
        "sd-base",
        &["a.bin", "b.json"],
        100,
        1,
        true,
    )])
    .unwrap();

    let backend = Arc::new(
        MockBackend::new("bucket")
            .with_model("sd-base", vec![("a.bin", pickle_bytes(80)), ("b.json", json_bytes())]),
    );
    let h = harness(catalog, vec![backend]).await;

    h.downloader.cancel_flag().cancel();
    let result = h.downloader.download("sd-base").await;

    assert!(matches!(result, Err(VaultError::Cancelled)));
    assert!(!model_dir(&h.cache_dir, "sd-base").exists());
    assert!(h.manifest.get("sd-base").await.is_none());
}
