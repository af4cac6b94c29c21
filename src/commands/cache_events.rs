//! Listing cache invalidation driven by transfer outcomes
//!
//! Uploads and deletes change a bucket only when they finish, so the cached
//! listing is dropped on the task's terminal event rather than at submission.
//! A generation counter stops a listing fetched before that event from being
//! written back afterwards.

use crate::db::{Database, DbResult};
use crate::events::TaskEvent;
use crate::providers::ObjectEntry;
use crate::task::TaskId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct ListingInvalidator {
    db: Arc<Database>,
    /// Bumped on every invalidation; held while a listing is stored.
    generation: tokio::sync::Mutex<u64>,
    /// Cache key each tracked task invalidates when it ends.
    tracked: Mutex<HashMap<TaskId, String>>,
}

impl ListingInvalidator {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            generation: tokio::sync::Mutex::new(0),
            tracked: Mutex::new(HashMap::new()),
        }
    }

    fn tracked(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, String>> {
        self.tracked.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `id` before it is submitted, so its terminal event is never missed.
    pub(crate) fn track(&self, id: &str, cache_key: &str) {
        self.tracked().insert(id.to_string(), cache_key.to_string());
    }

    pub(crate) fn forget(&self, id: &str) {
        self.tracked().remove(id);
    }

    #[cfg(test)]
    pub(crate) fn tracked_count(&self) -> usize {
        self.tracked().len()
    }

    pub(crate) async fn generation(&self) -> u64 {
        *self.generation.lock().await
    }

    /// Cache `objects` unless an invalidation happened since `seen` was read.
    /// Returns whether the listing was stored.
    pub(crate) async fn store_listing(
        &self,
        cache_key: &str,
        objects: &[ObjectEntry],
        seen: u64,
    ) -> DbResult<bool> {
        let generation = self.generation.lock().await;
        if *generation != seen {
            log::debug!("cache: not storing stale listing for {}", cache_key);
            return Ok(false);
        }
        self.db.store_bucket_listing(cache_key, objects).await?;
        Ok(true)
    }

    /// Failed transfers can leave partial objects behind, so any terminal
    /// event of a tracked task clears its bucket listing.
    pub(crate) async fn apply_event(&self, event: &TaskEvent) -> DbResult<()> {
        if !event.is_terminal() {
            return Ok(());
        }
        let Some(cache_key) = self.tracked().remove(event.task_id()) else {
            return Ok(());
        };

        let mut generation = self.generation.lock().await;
        *generation += 1;
        self.db.clear_bucket_listing(&cache_key).await?;
        log::debug!(
            "cache: cleared listing {} after task {}",
            cache_key,
            event.task_id()
        );
        Ok(())
    }
}

/// Consume bus events and invalidate listings as tracked tasks finish. Stops
/// like the record sync: when the bus goes away, or on `stop` after draining.
pub(crate) fn spawn_listing_sync(
    invalidator: Arc<ListingInvalidator>,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => invalidate(&invalidator, &event).await,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        invalidate(&invalidator, &event).await;
                    }
                    break;
                }
            }
        }
        log::debug!("cache: listing sync stopped");
    })
}

async fn invalidate(invalidator: &ListingInvalidator, event: &TaskEvent) {
    if let Err(e) = invalidator.apply_event(event).await {
        log::warn!(
            "cache: failed to invalidate listing for {}: {}",
            event.task_id(),
            e
        );
    }
}
