//! Primary content-addressable bucket store
//!
//! Layout: `<endpoint>/<namespace>/<model>/index.json` maps catalog file
//! names to content-addressed object keys with sizes and sha256 digests;
//! objects live under `<endpoint>/<namespace>/objects/<digest>`. Because the
//! index carries digests, every fetch from this backend is checksum-checked.

use super::{
    ArtifactBackend, CancelFlag, DownloadTask, ModelListing, ProgressFn, RemoteObject,
    classify_http_error, stream_to_file,
};
use crate::catalog::ModelDescriptor;
use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const BACKEND_NAME: &str = "bucket";

/// `index.json` schema served by the bucket store
#[derive(Debug, Deserialize)]
struct BucketIndex {
    version: Option<String>,
    files: Vec<BucketIndexFile>,
}

#[derive(Debug, Deserialize)]
struct BucketIndexFile {
    name: String,
    key: String,
    size: Option<u64>,
    sha256: Option<String>,
}

pub struct ObjectBucketBackend {
    endpoint: String,
    namespace: String,
    token: Option<String>,
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl ObjectBucketBackend {
    /// Build from `MODELVAULT_BUCKET_*` environment variables
    ///
    /// Returns `Ok(None)` when no endpoint is configured.
    pub fn from_env(
        request_timeout: Duration,
        stall_timeout: Duration,
    ) -> VaultResult<Option<Self>> {
        let Ok(endpoint) = std::env::var("MODELVAULT_BUCKET_ENDPOINT") else {
            return Ok(None);
        };
        let namespace =
            std::env::var("MODELVAULT_BUCKET_NAMESPACE").unwrap_or_else(|_| "models".to_string());
        let token = std::env::var("MODELVAULT_BUCKET_TOKEN").ok();

        Ok(Some(Self::new(
            endpoint,
            namespace,
            token,
            request_timeout,
            stall_timeout,
        )?))
    }

    pub fn new(
        endpoint: String,
        namespace: String,
        token: Option<String>,
        request_timeout: Duration,
        stall_timeout: Duration,
    ) -> VaultResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| VaultError::BackendUnavailable {
                backend: BACKEND_NAME.to_string(),
                reason: format!("client build failed: {}", e),
            })?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            namespace,
            token,
            client,
            stall_timeout,
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.namespace, suffix)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }
}

#[async_trait]
impl ArtifactBackend for ObjectBucketBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn list_files(&self, model: &ModelDescriptor) -> VaultResult<ModelListing> {
        let url = self.url(&format!("{}/index.json", model.name));

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| classify_http_error(BACKEND_NAME, &url, e))?
            .error_for_status()
            .map_err(|e| classify_http_error(BACKEND_NAME, &url, e))?;

        let index: BucketIndex =
            response
                .json()
                .await
                .map_err(|e| VaultError::BackendUnavailable {
                    backend: BACKEND_NAME.to_string(),
                    reason: format!("malformed index for '{}': {}", model.name, e),
                })?;

        // Project the index onto the catalog-declared order; a hole means
        // this backend cannot serve the whole model.
        let mut files = Vec::with_capacity(model.files.len());
        for name in &model.files {
            let entry = index.files.iter().find(|f| &f.name == name).ok_or_else(|| {
                VaultError::BackendUnavailable {
                    backend: BACKEND_NAME.to_string(),
                    reason: format!("index for '{}' is missing file '{}'", model.name, name),
                }
            })?;

            files.push(RemoteObject {
                file_name: entry.name.clone(),
                key: format!("objects/{}", entry.key),
                size: entry.size,
                sha256: entry.sha256.clone(),
            });
        }

        Ok(ModelListing {
            version: index.version,
            files,
        })
    }

    async fn fetch_file(
        &self,
        task: &DownloadTask,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> VaultResult<()> {
        let url = self.url(&task.key);

        let response = self
            .request(&url)
            .send()
            .await
            .map_err(|e| classify_http_error(BACKEND_NAME, &task.key, e))?
            .error_for_status()
            .map_err(|e| classify_http_error(BACKEND_NAME, &task.key, e))?;

        stream_to_file(
            BACKEND_NAME,
            response,
            task,
            on_progress,
            cancel,
            self.stall_timeout,
        )
        .await
    }
}
