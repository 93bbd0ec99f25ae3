//! Secondary cloud bucket store
//!
//! Last-resort mirror with a plain `<endpoint>/<model>/<file>` layout and no
//! checksum metadata; downloads from here rely on the validator's size and
//! structural checks.

use super::{
    ArtifactBackend, CancelFlag, DownloadTask, ModelListing, ProgressFn, RemoteObject,
    classify_http_error, stream_to_file,
};
use crate::catalog::ModelDescriptor;
use crate::error::{VaultError, VaultResult};
use async_trait::async_trait;
use std::time::Duration;

const BACKEND_NAME: &str = "mirror";

pub struct MirrorBackend {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
    stall_timeout: Duration,
}

impl MirrorBackend {
    /// Build from `MODELVAULT_MIRROR_*` environment variables
    ///
    /// Returns `Ok(None)` when no endpoint is configured.
    pub fn from_env(
        request_timeout: Duration,
        stall_timeout: Duration,
    ) -> VaultResult<Option<Self>> {
        let Ok(endpoint) = std::env::var("MODELVAULT_MIRROR_ENDPOINT") else {
            return Ok(None);
        };
        let token = std::env::var("MODELVAULT_MIRROR_TOKEN").ok();

        Ok(Some(Self::new(
            endpoint,
            token,
            request_timeout,
            stall_timeout,
        )?))
    }

    pub fn new(
        endpoint: String,
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
            token,
            client,
            stall_timeout,
        })
    }
}

#[async_trait]
impl ArtifactBackend for MirrorBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn list_files(&self, model: &ModelDescriptor) -> VaultResult<ModelListing> {
        // No remote index; the mirror mirrors the catalog layout directly.
        let files = model
            .files
            .iter()
            .map(|name| RemoteObject {
                file_name: name.clone(),
                key: format!("{}/{}", model.name, name),
                size: None,
                sha256: None,
            })
            .collect();

        Ok(ModelListing {
            version: None,
            files,
        })
    }

    async fn fetch_file(
        &self,
        task: &DownloadTask,
        on_progress: ProgressFn<'_>,
        cancel: &CancelFlag,
    ) -> VaultResult<()> {
        let url = format!("{}/{}", self.endpoint, task.key);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
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
