//! Storage backend adapters
//!
//! The engine only talks to `StorageBackend`; the active adapter lives in a
//! `BackendSlot` that is swapped when the user changes storage app.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};

pub mod local;
pub mod s3;
mod s3_client;

#[cfg(test)]
pub(crate) mod stub;

pub use local::LocalBackend;
pub use s3::{S3Backend, S3Config};

/// Receives transfer progress as a percentage in `0..=100`.
pub type ProgressFn = Arc<dyn Fn(u32) + Send + Sync>;

/// One object from a flat bucket listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    /// Unix timestamp in seconds.
    pub last_modified: i64,
    /// Provider-specific metadata (etag, storage class, ...).
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: u64, last_modified: i64) -> Self {
        Self {
            key: key.into(),
            size,
            last_modified,
            meta: serde_json::Value::Null,
        }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Percentage of `done` over `total`, clamped to 100. An empty transfer is complete.
pub fn percent_of(done: u64, total: u64) -> u32 {
    if total == 0 {
        100
    } else {
        std::cmp::min(((done as f64 / total as f64) * 100.0) as u32, 100)
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short provider label used in logs.
    fn provider(&self) -> &str;

    async fn list_buckets(&self) -> EngineResult<Vec<String>>;

    /// Every object in `bucket` as a flat key list.
    async fn list_objects(&self, bucket: &str) -> EngineResult<Vec<ObjectEntry>>;

    /// Public domains serving `bucket`.
    async fn domains(&self, _bucket: &str) -> EngineResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        remote_key: &str,
        on_progress: ProgressFn,
    ) -> EngineResult<()>;

    async fn download(
        &self,
        bucket: &str,
        remote_key: &str,
        local_path: &Path,
        on_progress: ProgressFn,
    ) -> EngineResult<()>;

    async fn delete(&self, bucket: &str, remote_key: &str) -> EngineResult<()>;
}

lazy_static::lazy_static! {
    static ref ACTIVE_BACKEND: BackendSlot = BackendSlot::new();
}

/// Swappable handle to the active storage connection. Clones share the slot.
#[derive(Clone, Default)]
pub struct BackendSlot {
    inner: Arc<RwLock<Option<Arc<dyn StorageBackend>>>>,
}

impl std::fmt::Debug for BackendSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let provider = self.current().map(|b| b.provider().to_string());
        f.debug_struct("BackendSlot")
            .field("provider", &provider)
            .finish()
    }
}

impl BackendSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        let slot = Self::new();
        slot.swap(backend);
        slot
    }

    /// The slot shared by the whole process.
    pub fn global() -> BackendSlot {
        ACTIVE_BACKEND.clone()
    }

    /// Install the first connection. Fails if one is already active.
    pub fn init(&self, backend: Arc<dyn StorageBackend>) -> EngineResult<()> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(EngineError::invalid("a storage connection is already active"));
        }
        log::info!("backend: init {}", backend.provider());
        *guard = Some(backend);
        Ok(())
    }

    /// Replace the active connection, returning the previous one. Tasks
    /// already running keep the adapter they started with.
    pub fn swap(&self, backend: Arc<dyn StorageBackend>) -> Option<Arc<dyn StorageBackend>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        log::info!("backend: swap to {}", backend.provider());
        guard.replace(backend)
    }

    pub fn clear(&self) -> Option<Arc<dyn StorageBackend>> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    pub fn current(&self) -> Option<Arc<dyn StorageBackend>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_active(&self) -> bool {
        self.current().is_some()
    }

    /// The active connection, or `BackendFailure` when there is none.
    pub fn require(&self) -> EngineResult<Arc<dyn StorageBackend>> {
        self.current()
            .ok_or_else(|| EngineError::backend("no active storage connection"))
    }
}
