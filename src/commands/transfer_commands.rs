use super::{AppCore, Browsing};
use crate::db::{TransferRecord, TransferView};
use crate::error::{EngineError, EngineResult};
use crate::local_files::collect_local_files;
use crate::task::{TaskDescriptor, TaskId, TaskSnapshot, TaskStatus};
use crate::vdir::NodeId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A remote object picked for download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub key: String,
    pub size: u64,
}

/// `"a/c"`, `"/a/c/"` and `"a/c/"` all become `"a/c/"`; empty stays empty.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Where a downloaded object lands: the key below `prefix`, under `download_dir`.
fn download_target(download_dir: &Path, prefix: &str, key: &str) -> PathBuf {
    let relative = key.strip_prefix(prefix).unwrap_or(key);
    let mut target = download_dir.to_path_buf();
    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        target.push(segment);
    }
    target
}

fn selected_bucket(browsing: &Browsing) -> EngineResult<String> {
    browsing
        .bucket
        .as_ref()
        .map(|b| b.name.clone())
        .ok_or_else(|| EngineError::invalid("no bucket selected"))
}

impl AppCore {
    async fn current_bucket_name(&self) -> EngineResult<String> {
        selected_bucket(&*self.browsing.read().await)
    }

    /// Record the task, then hand it to the runner. The record goes first so
    /// the record sync always finds a row for the runner's events.
    /// `invalidates` names the cached listing to drop once the task ends.
    async fn admit(&self, task: TaskDescriptor, invalidates: Option<&str>) -> EngineResult<TaskId> {
        if self.runner.is_closed() {
            return Err(EngineError::RunnerClosed);
        }
        let id = task.id.clone();
        self.transfers.insert(&TransferRecord::from(&task)).await?;
        if let Some(cache_key) = invalidates {
            self.listings.track(&id, cache_key);
        }

        match self.runner.submit(task) {
            Ok(id) => Ok(id),
            Err(e) => {
                self.listings.forget(&id);
                let message = e.to_string();
                if let Err(db_err) = self
                    .transfers
                    .update_status(&id, TaskStatus::Failed, Some(&message))
                    .await
                {
                    log::error!("transfers: could not mark {} failed: {}", id, db_err);
                }
                Err(e)
            }
        }
    }

    /// Admit a whole batch or none of it: when one task is refused, the
    /// ones admitted before it are cancelled and the error is returned.
    async fn admit_all(
        &self,
        tasks: Vec<TaskDescriptor>,
        invalidates: Option<&str>,
    ) -> EngineResult<Vec<TaskId>> {
        if self.runner.is_closed() {
            return Err(EngineError::RunnerClosed);
        }
        self.backend.require()?;

        let mut ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            match self.admit(task, invalidates).await {
                Ok(id) => ids.push(id),
                Err(e) => {
                    log::warn!(
                        "transfers: batch refused after {} admitted tasks: {}",
                        ids.len(),
                        e
                    );
                    for id in &ids {
                        if let Err(cancel_err) = self.runner.cancel(id) {
                            log::error!("transfers: could not cancel {}: {}", id, cancel_err);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(ids)
    }

    /// Upload files and directories into `remote_dir_prefix` of the current
    /// bucket. Directories are expanded recursively.
    pub async fn submit_upload(
        &self,
        remote_dir_prefix: &str,
        local_paths: &[PathBuf],
    ) -> EngineResult<Vec<TaskId>> {
        self.backend.require()?;
        let bucket = self.current_bucket_name().await?;
        let prefix = normalize_prefix(remote_dir_prefix);

        let files = collect_local_files(local_paths).await?;
        if files.is_empty() {
            return Err(EngineError::invalid("no files to upload"));
        }

        let tasks = files
            .into_iter()
            .map(|file| {
                let key = format!("{}{}", prefix, file.relative);
                TaskDescriptor::upload(bucket.clone(), file.path, key, file.size)
            })
            .collect::<EngineResult<Vec<_>>>()?;

        log::info!("transfers: uploading {} files to {}/{}", tasks.len(), bucket, prefix);
        let cache_key = self.cache_key(&bucket).await;
        self.admit_all(tasks, Some(&cache_key)).await
    }

    /// Download objects into the configured download directory, keeping
    /// their layout below `remote_dir_prefix`.
    pub async fn submit_download(
        &self,
        remote_dir_prefix: &str,
        files: &[RemoteFile],
    ) -> EngineResult<Vec<TaskId>> {
        self.backend.require()?;
        let bucket = self.current_bucket_name().await?;
        self.download_from(&bucket, remote_dir_prefix, files).await
    }

    async fn download_from(
        &self,
        bucket: &str,
        remote_dir_prefix: &str,
        files: &[RemoteFile],
    ) -> EngineResult<Vec<TaskId>> {
        if files.is_empty() {
            return Err(EngineError::invalid("no files to download"));
        }
        let prefix = normalize_prefix(remote_dir_prefix);
        let download_dir = self.settings.read().await.download_dir.clone();

        let tasks = files
            .iter()
            .map(|file| {
                let target = download_target(&download_dir, &prefix, &file.key);
                TaskDescriptor::download(bucket, file.key.clone(), target, file.size)
            })
            .collect::<EngineResult<Vec<_>>>()?;

        log::info!(
            "transfers: downloading {} files from {} to {}",
            tasks.len(),
            bucket,
            download_dir.display()
        );
        self.admit_all(tasks, None).await
    }

    pub async fn submit_delete(&self, remote_keys: &[String]) -> EngineResult<Vec<TaskId>> {
        self.backend.require()?;
        if remote_keys.is_empty() {
            return Err(EngineError::invalid("no objects to delete"));
        }
        let bucket = self.current_bucket_name().await?;
        self.delete_from(&bucket, remote_keys).await
    }

    async fn delete_from(&self, bucket: &str, remote_keys: &[String]) -> EngineResult<Vec<TaskId>> {
        if remote_keys.is_empty() {
            return Err(EngineError::invalid("no objects to delete"));
        }
        let tasks = remote_keys
            .iter()
            .map(|key| TaskDescriptor::delete(bucket, key.clone()))
            .collect::<EngineResult<Vec<_>>>()?;

        log::info!("transfers: deleting {} objects from {}", tasks.len(), bucket);
        let cache_key = self.cache_key(bucket).await;
        self.admit_all(tasks, Some(&cache_key)).await
    }

    /// Download the selection, or everything under `context` when nothing
    /// is selected. Bucket, files and prefix come from one view of the tree.
    pub async fn download_selection(&self, context: Option<NodeId>) -> EngineResult<Vec<TaskId>> {
        self.backend.require()?;
        let (bucket, prefix, files) = {
            let browsing = self.browsing.read().await;
            let files: Vec<RemoteFile> = browsing
                .view
                .operation_files(context)?
                .map(|f| RemoteFile {
                    key: f.key.clone(),
                    size: f.size,
                })
                .collect();
            (selected_bucket(&browsing)?, browsing.view.path_prefix(), files)
        };
        self.download_from(&bucket, &prefix, &files).await
    }

    /// Delete the selection, or everything under `context`. The selection is
    /// cleared unless the tree was replaced in the meantime.
    pub async fn delete_selection(&self, context: Option<NodeId>) -> EngineResult<Vec<TaskId>> {
        self.backend.require()?;
        let (bucket, tree, keys) = {
            let browsing = self.browsing.read().await;
            let keys: Vec<String> = browsing
                .view
                .operation_files(context)?
                .map(|f| f.key.clone())
                .collect();
            (selected_bucket(&browsing)?, browsing.view.tree().clone(), keys)
        };
        let ids = self.delete_from(&bucket, &keys).await?;

        let mut browsing = self.browsing.write().await;
        if Arc::ptr_eq(browsing.view.tree(), &tree) {
            browsing.view.clear_selection();
        }
        Ok(ids)
    }

    /// `completed = true` lists finished transfers, otherwise the ones still
    /// pending or running. Failed transfers have their own view.
    pub async fn query_transfers(&self, completed: bool) -> EngineResult<Vec<TransferRecord>> {
        let view = if completed {
            TransferView::Completed
        } else {
            TransferView::InProgress
        };
        Ok(self.transfers.query_view(view).await?)
    }

    pub async fn query_failed_transfers(&self) -> EngineResult<Vec<TransferRecord>> {
        Ok(self.transfers.query_view(TransferView::Failed).await?)
    }

    pub fn cancel_transfer(&self, id: &str) -> EngineResult<bool> {
        self.runner.cancel(id)
    }

    /// Delete finished records from history. In-progress records cannot be
    /// cleared while their tasks still report to them.
    pub async fn clear_transfers(&self, view: TransferView) -> EngineResult<i64> {
        if view == TransferView::InProgress {
            return Err(EngineError::invalid("in-progress transfers cannot be cleared"));
        }
        let removed = self.transfers.clear_view(view).await?;
        let pruned = self.runner.prune(view.statuses());
        log::info!("transfers: cleared {} records, pruned {} tasks", removed, pruned);
        Ok(removed)
    }

    /// Live state of every task the runner still holds.
    pub fn task_snapshots(&self) -> Vec<TaskSnapshot> {
        self.runner.snapshots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::test_support::{local_fixture, Fixture};
    use crate::events::{FailureCause, TaskEvent};

    /// Fixture whose runner holds submitted work until `start()`.
    async fn held_fixture() -> Fixture {
        let fx = local_fixture().await;
        let mut settings = fx.core.settings().await;
        settings.runner.auto_start = false;
        fx.core.update_settings(settings).await.unwrap();
        fx.reopen().await
    }

    #[test]
    fn prefixes_are_normalized() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("a/c"), "a/c/");
        assert_eq!(normalize_prefix("/a/c/"), "a/c/");
    }

    #[test]
    fn download_targets_keep_layout_below_prefix() {
        let base = Path::new("/dl");
        assert_eq!(download_target(base, "a/", "a/b/c.txt"), base.join("b").join("c.txt"));
        assert_eq!(download_target(base, "", "x.txt"), base.join("x.txt"));
        assert_eq!(download_target(base, "zzz/", "a/../b.txt"), base.join("a").join("b.txt"));
    }

    #[tokio::test]
    async fn bulk_operations_reject_empty_lists() {
        let fx = local_fixture().await;
        fx.core.switch_bucket("photos", false).await.unwrap();

        assert!(matches!(
            fx.core.submit_delete(&[]).await,
            Err(EngineError::ValidationFailure(_))
        ));
        assert!(matches!(
            fx.core.submit_download("", &[]).await,
            Err(EngineError::ValidationFailure(_))
        ));
        assert!(matches!(
            fx.core.submit_upload("", &[]).await,
            Err(EngineError::ValidationFailure(_))
        ));
        assert!(matches!(
            fx.core.download_selection(None).await,
            Err(EngineError::ValidationFailure(_))
        ));
        assert!(fx.core.query_transfers(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submissions_need_a_bucket() {
        let fx = local_fixture().await;
        assert!(matches!(
            fx.core.submit_delete(&["a.txt".to_string()]).await,
            Err(EngineError::ValidationFailure(_))
        ));
    }

    #[tokio::test]
    async fn directory_upload_keeps_structure() {
        let mut fx = local_fixture().await;
        let album = fx.dir.path().join("album");
        std::fs::create_dir_all(album.join("day1")).unwrap();
        std::fs::write(album.join("cover.png"), b"c").unwrap();
        std::fs::write(album.join("day1/beach.png"), b"b").unwrap();

        fx.core.switch_bucket("photos", false).await.unwrap();
        fx.core.submit_upload("2024", &[album]).await.unwrap();
        let terminal = fx.settle(2).await;
        assert!(terminal.iter().all(|e| matches!(e, TaskEvent::Done { .. })));

        let root = fx.storage_root().join("photos/2024/album");
        assert!(root.join("cover.png").exists());
        assert!(root.join("day1/beach.png").exists());
    }

    #[tokio::test]
    async fn delete_selection_removes_folder_contents() {
        let mut fx = local_fixture().await;
        fx.write_object("photos", "old/a.txt", b"a");
        fx.write_object("photos", "old/deep/b.txt", b"b");
        fx.write_object("photos", "keep.txt", b"k");

        fx.core.switch_bucket("photos", false).await.unwrap();
        let old = fx
            .core
            .list_current_folder()
            .await
            .into_iter()
            .find(|n| n.name() == "old")
            .unwrap()
            .id();
        let ids = fx.core.delete_selection(Some(old)).await.unwrap();
        assert_eq!(ids.len(), 2);
        fx.settle(2).await;

        let listing = fx.core.switch_bucket("photos", true).await.unwrap();
        let keys: Vec<&str> = listing.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["keep.txt"]);
    }

    #[tokio::test]
    async fn clearing_history_only_touches_finished_views() {
        let mut fx = local_fixture().await;
        fx.write_object("photos", "x.txt", b"x");
        fx.core.switch_bucket("photos", false).await.unwrap();
        fx.core.submit_delete(&["x.txt".to_string()]).await.unwrap();
        fx.settle(1).await;
        fx.core.shutdown().await;

        assert!(matches!(
            fx.core.clear_transfers(TransferView::InProgress).await,
            Err(EngineError::ValidationFailure(_))
        ));
        assert_eq!(fx.core.clear_transfers(TransferView::Completed).await.unwrap(), 1);
        assert!(fx.core.query_transfers(true).await.unwrap().is_empty());
        assert!(fx.core.task_snapshots().is_empty());
    }

    #[tokio::test]
    async fn clearing_completed_keeps_failed_tasks() {
        let mut fx = local_fixture().await;
        fx.write_object("photos", "x.txt", b"x");
        fx.core.switch_bucket("photos", false).await.unwrap();
        fx.core.submit_delete(&["x.txt".to_string()]).await.unwrap();
        let failed = fx
            .core
            .submit_download(
                "",
                &[RemoteFile {
                    key: "missing.bin".to_string(),
                    size: 1,
                }],
            )
            .await
            .unwrap();
        fx.settle(2).await;
        fx.core.shutdown().await;

        assert_eq!(fx.core.clear_transfers(TransferView::Completed).await.unwrap(), 1);
        let left: Vec<TaskId> = fx
            .core
            .task_snapshots()
            .into_iter()
            .map(|s| s.descriptor.id)
            .collect();
        assert_eq!(left, failed);
        assert_eq!(fx.core.query_failed_transfers().await.unwrap().len(), 1);

        assert_eq!(fx.core.clear_transfers(TransferView::Failed).await.unwrap(), 1);
        assert!(fx.core.task_snapshots().is_empty());
    }

    #[tokio::test]
    async fn cached_listing_is_dropped_when_a_delete_finishes() {
        let fx = held_fixture().await;
        fx.write_object("photos", "x.txt", b"x");

        fx.core.switch_bucket("photos", false).await.unwrap();
        fx.core.submit_delete(&["x.txt".to_string()]).await.unwrap();

        // Still queued: the object exists and the cached listing stays valid.
        let during = fx.core.switch_bucket("photos", false).await.unwrap();
        assert!(during.from_cache);
        assert_eq!(during.objects[0].key, "x.txt");
        let refreshed = fx.core.switch_bucket("photos", true).await.unwrap();
        assert_eq!(refreshed.objects.len(), 1);

        fx.core.runner().start();
        fx.core.shutdown().await;

        let after = fx.core.switch_bucket("photos", false).await.unwrap();
        assert!(!after.from_cache);
        assert!(after.objects.is_empty());
    }

    #[tokio::test]
    async fn refused_batch_cancels_what_it_admitted() {
        let mut fx = held_fixture().await;
        let a = TaskDescriptor::delete("photos", "a.txt").unwrap();
        let b = TaskDescriptor::delete("photos", "b.txt").unwrap();

        let result = fx
            .core
            .admit_all(vec![a.clone(), b.clone(), a.clone()], Some("photos"))
            .await;
        assert!(result.is_err());

        let terminal = fx.settle(2).await;
        for (event, id) in terminal.iter().zip([&a.id, &b.id]) {
            assert_eq!(
                event,
                &TaskEvent::Failed {
                    id: id.clone(),
                    cause: FailureCause::Cancelled,
                }
            );
        }

        fx.core.runner().start();
        fx.core.shutdown().await;
        assert_eq!(fx.core.query_failed_transfers().await.unwrap().len(), 2);
        assert_eq!(fx.core.listings.tracked_count(), 0);
    }
}
