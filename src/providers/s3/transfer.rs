//! Object upload (simple PUT or multipart) and streaming download

use crate::providers::s3_client::S3Result;
use crate::providers::{percent_of, ProgressFn};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024; // 100MB
const PART_SIZE: u64 = 20 * 1024 * 1024; // 20MB per part
const PART_CONCURRENCY: usize = 6;

/// Write buffer size (256 KB)
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

pub async fn upload_file(
    client: &Client,
    bucket: &str,
    key: &str,
    file_path: &Path,
    on_progress: ProgressFn,
) -> S3Result<()> {
    let file_size = tokio::fs::metadata(file_path).await?.len();
    on_progress(0);

    if file_size < MULTIPART_THRESHOLD {
        let body = ByteStream::from_path(file_path).await?;
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await?;
    } else {
        upload_multipart(client, bucket, key, file_path, file_size, on_progress.clone()).await?;
    }

    on_progress(100);
    Ok(())
}

/// Calls `on_drop` unless disarmed first.
struct AbortOnDrop<F: FnOnce()> {
    on_drop: Option<F>,
}

impl<F: FnOnce()> AbortOnDrop<F> {
    fn new(on_drop: F) -> Self {
        Self {
            on_drop: Some(on_drop),
        }
    }

    fn disarm(mut self) {
        self.on_drop = None;
    }
}

impl<F: FnOnce()> Drop for AbortOnDrop<F> {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Run `part(n)` for every part number with at most `concurrency` in
/// flight. The first failure stops new parts from starting; parts still in
/// flight are dropped with the returned future.
async fn run_parts<F, Fut, T>(total_parts: i32, concurrency: usize, part: F) -> S3Result<Vec<T>>
where
    F: FnMut(i32) -> Fut,
    Fut: Future<Output = S3Result<T>>,
{
    stream::iter(1..=total_parts)
        .map(part)
        .buffer_unordered(concurrency.max(1))
        .try_collect()
        .await
}

struct MultipartUpload<'a> {
    client: &'a Client,
    bucket: &'a str,
    key: &'a str,
    upload_id: String,
}

impl MultipartUpload<'_> {
    async fn send_part(&self, file_path: &Path, part_number: i32, start: u64, len: u64) -> S3Result<CompletedPart> {
        let mut file = File::open(file_path).await?;
        file.seek(SeekFrom::Start(start)).await?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer).await?;

        let response = self
            .client
            .upload_part()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(buffer))
            .send()
            .await?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(response.e_tag().unwrap_or_default())
            .build())
    }

    async fn complete(&self, mut parts: Vec<CompletedPart>) -> S3Result<()> {
        parts.sort_by_key(|p| p.part_number());
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(self.bucket)
            .key(self.key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await?;
        Ok(())
    }

    /// Abort on a cloned client from a spawned task. Used when the upload
    /// future is dropped and cannot await anything itself.
    fn abort_in_background(&self) -> impl FnOnce() {
        let client = self.client.clone();
        let bucket = self.bucket.to_string();
        let key = self.key.to_string();
        let upload_id = self.upload_id.clone();
        move || match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    abort_upload(&client, &bucket, &key, &upload_id).await;
                });
            }
            Err(_) => log::warn!("s3: no runtime left to abort multipart upload of {}", key),
        }
    }
}

async fn abort_upload(client: &Client, bucket: &str, key: &str, upload_id: &str) {
    let result = client
        .abort_multipart_upload()
        .bucket(bucket)
        .key(key)
        .upload_id(upload_id)
        .send()
        .await;
    match result {
        Ok(_) => log::info!("s3: aborted multipart upload of {}", key),
        Err(e) => log::warn!(
            "s3: failed to abort multipart upload {} of {}: {}",
            upload_id,
            key,
            e
        ),
    }
}

async fn upload_multipart(
    client: &Client,
    bucket: &str,
    key: &str,
    file_path: &Path,
    file_size: u64,
    on_progress: ProgressFn,
) -> S3Result<()> {
    let upload_id = client
        .create_multipart_upload()
        .bucket(bucket)
        .key(key)
        .send()
        .await?
        .upload_id()
        .ok_or("No upload ID returned")?
        .to_string();
    let upload = MultipartUpload {
        client,
        bucket,
        key,
        upload_id,
    };
    // A cancelled transfer drops this future; the guard still aborts the upload.
    let guard = AbortOnDrop::new(upload.abort_in_background());

    let total_parts = file_size.div_ceil(PART_SIZE) as i32;
    log::info!(
        "s3: multipart upload of {} ({} bytes, {} parts)",
        key,
        file_size,
        total_parts
    );

    let uploaded_bytes = AtomicU64::new(0);
    let upload_ref = &upload;
    let uploaded_ref = &uploaded_bytes;
    let on_progress_ref = &on_progress;
    let result = async {
        let parts = run_parts(total_parts, PART_CONCURRENCY, |part_number| async move {
            let start = (part_number as u64 - 1) * PART_SIZE;
            let len = std::cmp::min(start + PART_SIZE, file_size) - start;
            let part = upload_ref.send_part(file_path, part_number, start, len).await?;

            let done = uploaded_ref.fetch_add(len, Ordering::SeqCst) + len;
            // 100 is reserved for completion of the whole upload
            on_progress_ref(percent_of(done, file_size).min(99));
            Ok::<CompletedPart, Box<dyn std::error::Error + Send + Sync>>(part)
        })
        .await?;
        upload_ref.complete(parts).await
    }
    .await;

    if let Err(e) = &result {
        log::warn!("s3: aborting multipart upload of {}: {}", key, e);
        abort_upload(client, bucket, key, &upload.upload_id).await;
    }
    guard.disarm();
    result
}

pub async fn download_file(
    client: &Client,
    bucket: &str,
    key: &str,
    destination: &Path,
    on_progress: ProgressFn,
) -> S3Result<()> {
    let response = client.get_object().bucket(bucket).key(key).send().await?;
    let total_bytes = response.content_length().unwrap_or(0).max(0) as u64;

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(destination).await?;

    on_progress(0);
    let mut body = response.body;
    let mut write_buffer = Vec::with_capacity(WRITE_BUFFER_SIZE);
    let mut downloaded: u64 = 0;
    let mut last_percent = 0;

    while let Some(chunk) = body.try_next().await? {
        downloaded += chunk.len() as u64;
        write_buffer.extend_from_slice(&chunk);

        if write_buffer.len() >= WRITE_BUFFER_SIZE {
            file.write_all(&write_buffer).await?;
            write_buffer.clear();
        }

        let percent = percent_of(downloaded, total_bytes);
        if percent != last_percent && percent < 100 {
            last_percent = percent;
            on_progress(percent);
        }
    }

    if !write_buffer.is_empty() {
        file.write_all(&write_buffer).await?;
    }
    file.flush().await?;

    on_progress(100);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Arc;
    use std::time::Duration;

    struct CountDrop(Arc<AtomicUsize>);

    impl Drop for CountDrop {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn parts_run_with_bounded_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut parts = run_parts(7, 2, |n| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                S3Result::<i32>::Ok(n)
            }
        })
        .await
        .unwrap();

        parts.sort();
        assert_eq!(parts, (1..=7).collect::<Vec<_>>());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_failure_stops_new_parts_and_drops_running_ones() {
        let started = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicUsize::new(0));

        let result = run_parts(10, 3, |n| {
            started.fetch_add(1, Ordering::SeqCst);
            let guard = CountDrop(dropped.clone());
            async move {
                let _guard = guard;
                if n == 1 {
                    return S3Result::<i32>::Err("part 1 rejected".into());
                }
                std::future::pending::<()>().await;
                S3Result::<i32>::Ok(n)
            }
        })
        .await;

        assert_eq!(result.unwrap_err().to_string(), "part 1 rejected");
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dropping_the_upload_drops_parts_in_flight() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let parts = run_parts(4, 4, |n| {
            let guard = CountDrop(dropped.clone());
            async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                S3Result::<i32>::Ok(n)
            }
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(10), parts).await;
        assert!(timed_out.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn abort_guard_fires_unless_disarmed() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        drop(AbortOnDrop::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(fired.load(Ordering::SeqCst));

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        AbortOnDrop::new(move || flag.store(true, Ordering::SeqCst)).disarm();
        assert!(!fired.load(Ordering::SeqCst));
    }
}
