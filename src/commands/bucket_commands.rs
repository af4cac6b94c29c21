use super::{ActiveBucket, AppCore};
use crate::error::{EngineError, EngineResult};
use crate::providers::ObjectEntry;
use crate::vdir::{FileNode, Node, NodeId, VirtualTree};
use serde::Serialize;
use std::sync::Arc;

/// Result of switching to a bucket.
#[derive(Debug, Clone, Serialize)]
pub struct BucketListing {
    pub bucket: String,
    pub objects: Vec<ObjectEntry>,
    pub domains: Vec<String>,
    /// True when the listing came from the local cache.
    pub from_cache: bool,
}

impl AppCore {
    /// Cached listings are kept per storage app, so two apps with a bucket
    /// of the same name never share entries.
    pub(super) async fn cache_key(&self, bucket: &str) -> String {
        match &self.settings.read().await.current_app {
            Some(app_id) => format!("{}/{}", app_id, bucket),
            None => bucket.to_string(),
        }
    }

    pub async fn list_buckets(&self) -> EngineResult<Vec<String>> {
        self.backend.require()?.list_buckets().await
    }

    /// Show `name`: load its listing (from cache unless `force_refresh`),
    /// rebuild the tree and reset navigation to its root.
    pub async fn switch_bucket(&self, name: &str, force_refresh: bool) -> EngineResult<BucketListing> {
        if name.trim().is_empty() {
            return Err(EngineError::invalid("bucket name is empty"));
        }
        let backend = self.backend.require()?;
        let cache_key = self.cache_key(name).await;

        let cached = if force_refresh {
            None
        } else {
            self.db.cached_bucket_listing(&cache_key).await?
        };
        let from_cache = cached.is_some();
        let objects = match cached {
            Some(objects) => objects,
            None => {
                let seen = self.listings.generation().await;
                let objects = backend.list_objects(name).await?;
                self.listings.store_listing(&cache_key, &objects, seen).await?;
                objects
            }
        };

        let domains = match backend.domains(name).await {
            Ok(domains) => domains,
            Err(e) => {
                log::warn!("bucket: no domains for {}: {}", name, e);
                Vec::new()
            }
        };

        // Build before taking the lock; readers see the old tree or the new one.
        let tree = Arc::new(VirtualTree::build_from(&objects));
        {
            let mut browsing = self.browsing.write().await;
            browsing.view.replace_tree(tree);
            browsing.bucket = Some(ActiveBucket {
                name: name.to_string(),
                domains: domains.clone(),
            });
        }

        log::info!(
            "bucket: switched to {} ({} objects, cached: {})",
            name,
            objects.len(),
            from_cache
        );
        Ok(BucketListing {
            bucket: name.to_string(),
            objects,
            domains,
            from_cache,
        })
    }

    /// Name of the bucket the directory view was built from.
    pub async fn current_bucket(&self) -> Option<String> {
        self.browsing.read().await.bucket.as_ref().map(|b| b.name.clone())
    }

    pub async fn refresh_bucket(&self) -> EngineResult<BucketListing> {
        let name = self
            .current_bucket()
            .await
            .ok_or_else(|| EngineError::invalid("no bucket selected"))?;
        self.switch_bucket(&name, true).await
    }

    /// Descend into `name` and return the new listing.
    pub async fn change_directory(&self, name: &str) -> EngineResult<Vec<Node>> {
        let mut browsing = self.browsing.write().await;
        let view = &mut browsing.view;
        view.change_dir(name)?;
        Ok(view.visible_items().into_iter().cloned().collect())
    }

    pub async fn navigate_back(&self) -> Vec<Node> {
        let mut browsing = self.browsing.write().await;
        let view = &mut browsing.view;
        view.back();
        view.visible_items().into_iter().cloned().collect()
    }

    pub async fn list_current_folder(&self) -> Vec<Node> {
        let browsing = self.browsing.read().await;
        let view = &browsing.view;
        view.visible_items().into_iter().cloned().collect()
    }

    /// Destination prefix for uploads into the current folder.
    pub async fn path_prefix(&self) -> String {
        self.browsing.read().await.view.path_prefix()
    }

    pub async fn breadcrumbs(&self) -> Vec<String> {
        self.browsing.read().await.view.nav()
    }

    pub async fn search(&self, query: &str) -> Vec<Node> {
        let mut browsing = self.browsing.write().await;
        let view = &mut browsing.view;
        view.search(query);
        view.visible_items().into_iter().cloned().collect()
    }

    pub async fn select(&self, id: NodeId) -> EngineResult<()> {
        self.browsing.write().await.view.select(id)
    }

    pub async fn deselect(&self, id: NodeId) -> bool {
        self.browsing.write().await.view.deselect(id)
    }

    pub async fn select_all(&self) -> Vec<NodeId> {
        let mut browsing = self.browsing.write().await;
        let view = &mut browsing.view;
        view.select_all();
        view.selection()
    }

    pub async fn clear_selection(&self) {
        self.browsing.write().await.view.clear_selection();
    }

    /// Files a download or delete would act on right now.
    pub async fn selected_files(&self, context: Option<NodeId>) -> EngineResult<Vec<FileNode>> {
        let browsing = self.browsing.read().await;
        let view = &browsing.view;
        let files = view.operation_files(context)?.cloned().collect();
        Ok(files)
    }

    /// Public URL of `key` on the first domain of the current bucket.
    pub async fn file_url(&self, key: &str) -> EngineResult<String> {
        let browsing = self.browsing.read().await;
        let active = browsing
            .bucket
            .as_ref()
            .ok_or_else(|| EngineError::invalid("no bucket selected"))?;
        let domain = active
            .domains
            .first()
            .ok_or_else(|| EngineError::not_found(format!("public domain for {}", active.name)))?;

        let domain = domain.trim_end_matches('/');
        let key = key.trim_start_matches('/');
        if domain.starts_with("http://") || domain.starts_with("https://") {
            Ok(format!("{}/{}", domain, key))
        } else {
            Ok(format!("https://{}/{}", domain, key))
        }
    }
}
