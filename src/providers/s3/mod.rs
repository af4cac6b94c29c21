//! S3-compatible providers (AWS, Cloudflare R2, MinIO) through aws-sdk-s3

mod list;
mod objects;
mod transfer;

use super::s3_client::{create_s3_client, S3ClientConfig};
use super::{ObjectEntry, ProgressFn, StorageBackend};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub endpoint_scheme: Option<String>,
    pub endpoint_host: Option<String>,
    pub force_path_style: bool,
    /// Public domains serving the buckets of this account.
    #[serde(default)]
    pub domains: Vec<String>,
}

impl S3Config {
    /// Cloudflare R2 account endpoint.
    pub fn r2(account_id: &str, access_key_id: &str, secret_access_key: &str) -> Self {
        S3Config {
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            region: "auto".to_string(),
            endpoint_scheme: Some("https".to_string()),
            endpoint_host: Some(format!("{}.r2.cloudflarestorage.com", account_id)),
            force_path_style: true,
            domains: Vec::new(),
        }
    }

    pub fn endpoint_url(&self) -> Option<String> {
        let host = self.endpoint_host.as_ref()?.trim();
        if host.is_empty() {
            return None;
        }
        let scheme = self.endpoint_scheme.as_deref().unwrap_or("https");
        Some(format!("{}://{}", scheme, host))
    }
}

/// One SDK client per connection, reused by every task.
pub struct S3Backend {
    config: S3Config,
    client: Client,
}

impl S3Backend {
    pub fn new(config: S3Config) -> Self {
        let endpoint_url = config.endpoint_url();
        let client = create_s3_client(&S3ClientConfig {
            access_key_id: &config.access_key_id,
            secret_access_key: &config.secret_access_key,
            region: &config.region,
            endpoint_url: endpoint_url.as_deref(),
            force_path_style: config.force_path_style,
        });
        Self { config, client }
    }

    pub fn config(&self) -> &S3Config {
        &self.config
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn provider(&self) -> &str {
        "s3"
    }

    async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        list::list_buckets(&self.client)
            .await
            .map_err(|e| EngineError::backend(format!("Failed to list buckets: {}", e)))
    }

    async fn list_objects(&self, bucket: &str) -> EngineResult<Vec<ObjectEntry>> {
        list::list_all_objects(&self.client, bucket)
            .await
            .map_err(|e| EngineError::backend(format!("Failed to list objects: {}", e)))
    }

    async fn domains(&self, _bucket: &str) -> EngineResult<Vec<String>> {
        Ok(self.config.domains.clone())
    }

    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        remote_key: &str,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        transfer::upload_file(&self.client, bucket, remote_key, local_path, on_progress)
            .await
            .map_err(|e| EngineError::backend(format!("Upload of {} failed: {}", remote_key, e)))
    }

    async fn download(
        &self,
        bucket: &str,
        remote_key: &str,
        local_path: &Path,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        transfer::download_file(&self.client, bucket, remote_key, local_path, on_progress)
            .await
            .map_err(|e| EngineError::backend(format!("Download of {} failed: {}", remote_key, e)))
    }

    async fn delete(&self, bucket: &str, remote_key: &str) -> EngineResult<()> {
        objects::delete_object(&self.client, bucket, remote_key)
            .await
            .map_err(|e| EngineError::backend(format!("Failed to delete object: {}", e)))
    }
}
