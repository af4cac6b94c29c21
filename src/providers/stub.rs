//! In-memory backend for tests: configurable latency, failures and hangs,
//! and a record of how many calls overlapped.

use super::{ObjectEntry, ProgressFn, StorageBackend};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct StubBackend {
    delay: Duration,
    fail_keys: HashSet<String>,
    hang_keys: HashSet<String>,
    panic_keys: HashSet<String>,
    objects: Vec<ObjectEntry>,
    /// Named buckets with their own listing and listing latency.
    buckets: HashMap<String, (Vec<ObjectEntry>, Duration)>,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing(mut self, key: &str) -> Self {
        self.fail_keys.insert(key.to_string());
        self
    }

    pub(crate) fn hanging(mut self, key: &str) -> Self {
        self.hang_keys.insert(key.to_string());
        self
    }

    pub(crate) fn panicking(mut self, key: &str) -> Self {
        self.panic_keys.insert(key.to_string());
        self
    }

    pub(crate) fn with_objects(mut self, objects: Vec<ObjectEntry>) -> Self {
        self.objects = objects;
        self
    }

    pub(crate) fn with_bucket(mut self, name: &str, objects: Vec<ObjectEntry>, list_delay: Duration) -> Self {
        self.buckets.insert(name.to_string(), (objects, list_delay));
        self
    }

    /// Highest number of calls observed in flight at once.
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Keys in the order their calls started.
    pub(crate) fn started_keys(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    async fn run(&self, key: &str, on_progress: Option<ProgressFn>) -> EngineResult<()> {
        self.started.lock().unwrap().push(key.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if let Some(cb) = &on_progress {
            cb(0);
        }
        if self.panic_keys.contains(key) {
            panic!("stub backend panicked on {}", key);
        }
        if self.hang_keys.contains(key) {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        if self.fail_keys.contains(key) {
            return Err(EngineError::backend(format!("stub failure for {}", key)));
        }
        if let Some(cb) = &on_progress {
            cb(100);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for StubBackend {
    fn provider(&self) -> &str {
        "stub"
    }

    async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        let mut names: Vec<String> = self.buckets.keys().cloned().collect();
        names.sort();
        names.insert(0, "stub-bucket".to_string());
        Ok(names)
    }

    async fn list_objects(&self, bucket: &str) -> EngineResult<Vec<ObjectEntry>> {
        match self.buckets.get(bucket) {
            Some((objects, delay)) => {
                tokio::time::sleep(*delay).await;
                Ok(objects.clone())
            }
            None => Ok(self.objects.clone()),
        }
    }

    async fn domains(&self, bucket: &str) -> EngineResult<Vec<String>> {
        if self.buckets.contains_key(bucket) {
            Ok(vec![format!("{}.stub.test", bucket)])
        } else {
            Ok(vec!["cdn.stub.test".to_string()])
        }
    }

    async fn upload(
        &self,
        _bucket: &str,
        _local_path: &Path,
        remote_key: &str,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        self.run(remote_key, Some(on_progress)).await
    }

    async fn download(
        &self,
        _bucket: &str,
        remote_key: &str,
        _local_path: &Path,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        self.run(remote_key, Some(on_progress)).await
    }

    async fn delete(&self, _bucket: &str, remote_key: &str) -> EngineResult<()> {
        self.run(remote_key, None).await
    }
}
