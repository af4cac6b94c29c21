//! Directory-backed storage: bucket `b`, key `k` lives at `<root>/b/k`.

use super::{percent_of, ObjectEntry, ProgressFn, StorageBackend};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Copy buffer size (256 KB)
const COPY_BUFFER_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_path(&self, bucket: &str) -> EngineResult<PathBuf> {
        if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
            return Err(EngineError::invalid(format!("invalid bucket name '{}'", bucket)));
        }
        Ok(self.root.join(bucket))
    }

    /// Map a key onto the bucket directory, refusing anything that would
    /// escape it.
    fn object_path(&self, bucket: &str, key: &str) -> EngineResult<PathBuf> {
        let mut path = self.bucket_path(bucket)?;
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                _ => {
                    return Err(EngineError::invalid(format!(
                        "remote key '{}' is not a plain relative path",
                        key
                    )))
                }
            }
        }
        Ok(path)
    }
}

fn modified_secs(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stream `source` into `destination`, reporting percent progress whenever
/// it changes.
async fn copy_with_progress(
    source: &Path,
    destination: &Path,
    on_progress: &ProgressFn,
) -> Result<(), String> {
    let mut input = File::open(source)
        .await
        .map_err(|e| format!("Failed to open {}: {}", source.display(), e))?;
    let total_bytes = input
        .metadata()
        .await
        .map_err(|e| format!("Failed to stat {}: {}", source.display(), e))?
        .len();

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("Failed to create directory: {}", e))?;
    }
    let mut output = File::create(destination)
        .await
        .map_err(|e| format!("Failed to create {}: {}", destination.display(), e))?;

    on_progress(0);
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied: u64 = 0;
    let mut last_percent = 0;
    loop {
        let read = input
            .read(&mut buffer)
            .await
            .map_err(|e| format!("Failed to read chunk: {}", e))?;
        if read == 0 {
            break;
        }
        output
            .write_all(&buffer[..read])
            .await
            .map_err(|e| format!("Failed to write chunk: {}", e))?;
        copied += read as u64;

        let percent = percent_of(copied, total_bytes);
        if percent != last_percent && percent < 100 {
            last_percent = percent;
            on_progress(percent);
        }
    }

    output
        .flush()
        .await
        .map_err(|e| format!("Failed to flush file: {}", e))?;
    on_progress(100);
    Ok(())
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn provider(&self) -> &str {
        "local"
    }

    async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| EngineError::backend(format!("Failed to list buckets: {}", e)))?;

        let mut buckets = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::backend(format!("Failed to list buckets: {}", e)))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                buckets.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        buckets.sort();
        Ok(buckets)
    }

    async fn list_objects(&self, bucket: &str) -> EngineResult<Vec<ObjectEntry>> {
        let bucket_root = self.bucket_path(bucket)?;
        if !tokio::fs::try_exists(&bucket_root).await.unwrap_or(false) {
            return Err(EngineError::backend(format!("bucket '{}' does not exist", bucket)));
        }

        let list_err = |e: std::io::Error| EngineError::backend(format!("Failed to list objects: {}", e));
        let mut objects = Vec::new();
        let mut pending: Vec<(PathBuf, String)> = vec![(bucket_root, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(list_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}{}", prefix, name);
                let metadata = entry.metadata().await.map_err(list_err)?;
                if metadata.is_dir() {
                    pending.push((entry.path(), format!("{}/", key)));
                } else {
                    objects.push(ObjectEntry::new(key, metadata.len(), modified_secs(&metadata)));
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn upload(
        &self,
        bucket: &str,
        local_path: &Path,
        remote_key: &str,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        let destination = self.object_path(bucket, remote_key)?;
        copy_with_progress(local_path, &destination, &on_progress)
            .await
            .map_err(EngineError::backend)
    }

    async fn download(
        &self,
        bucket: &str,
        remote_key: &str,
        local_path: &Path,
        on_progress: ProgressFn,
    ) -> EngineResult<()> {
        let source = self.object_path(bucket, remote_key)?;
        copy_with_progress(&source, local_path, &on_progress)
            .await
            .map_err(EngineError::backend)
    }

    async fn delete(&self, bucket: &str, remote_key: &str) -> EngineResult<()> {
        let path = self.object_path(bucket, remote_key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| EngineError::backend(format!("Failed to delete {}: {}", remote_key, e)))
    }
}
