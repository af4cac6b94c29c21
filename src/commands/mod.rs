//! Command surface consumed by the UI layer
//!
//! `AppCore` wires the pieces together and exposes one method per command:
//! - `transfer_commands`: submit, cancel and query transfers
//! - `bucket_commands`: bucket listing, navigation and selection
//! - `app_commands`: saved storage connections

mod app_commands;
mod bucket_commands;
mod cache_events;
mod transfer_commands;

pub use bucket_commands::BucketListing;
pub use transfer_commands::RemoteFile;

use crate::config::AppSettings;
use crate::db::{spawn_record_sync, Database, TransferStore};
use crate::error::EngineResult;
use crate::events::{EventBus, TaskEvent};
use crate::providers::BackendSlot;
use crate::task::TaskRunner;
use crate::vdir::DirectoryView;
use cache_events::{spawn_listing_sync, ListingInvalidator};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Bucket currently shown in the directory view.
#[derive(Debug, Clone)]
struct ActiveBucket {
    name: String,
    domains: Vec<String>,
}

/// What the user is browsing. The tree and the bucket it was listed from
/// always change together.
#[derive(Debug, Default)]
struct Browsing {
    view: DirectoryView,
    bucket: Option<ActiveBucket>,
}

pub struct AppCore {
    db: Arc<Database>,
    transfers: TransferStore,
    settings: RwLock<AppSettings>,
    backend: BackendSlot,
    bus: EventBus,
    runner: TaskRunner,
    browsing: RwLock<Browsing>,
    listings: Arc<ListingInvalidator>,
    record_sync: Mutex<Option<JoinHandle<()>>>,
    listing_sync: Mutex<Option<JoinHandle<()>>>,
    sync_stop: CancellationToken,
}

impl AppCore {
    /// Open against the process-wide backend slot and event bus.
    pub async fn open(db_path: &Path) -> EngineResult<Self> {
        Self::open_with(db_path, BackendSlot::global(), EventBus::global()).await
    }

    pub async fn open_with(db_path: &Path, backend: BackendSlot, bus: EventBus) -> EngineResult<Self> {
        let db = Arc::new(Database::open(db_path).await?);
        let settings = AppSettings::load(&db).await?;

        let transfers = TransferStore::new(db.clone());
        let interrupted = transfers.fail_interrupted().await?;
        if interrupted > 0 {
            log::warn!("app: marked {} interrupted transfers as failed", interrupted);
        }

        let sync_stop = CancellationToken::new();
        let record_sync = spawn_record_sync(transfers.clone(), bus.subscribe(), sync_stop.clone());
        let listings = Arc::new(ListingInvalidator::new(db.clone()));
        let listing_sync = spawn_listing_sync(listings.clone(), bus.subscribe(), sync_stop.clone());
        let runner = TaskRunner::new(settings.runner.clone(), backend.clone(), bus.clone());
        let current_app = settings.current_app.clone();

        let core = AppCore {
            db,
            transfers,
            settings: RwLock::new(settings),
            backend,
            bus,
            runner,
            browsing: RwLock::new(Browsing::default()),
            listings,
            record_sync: Mutex::new(Some(record_sync)),
            listing_sync: Mutex::new(Some(listing_sync)),
            sync_stop,
        };

        if let Some(app_id) = current_app {
            if let Err(e) = core.change_app(&app_id).await {
                log::warn!("app: could not restore storage app {}: {}", app_id, e);
            }
        }

        log::info!("app: ready ({})", db_path.display());
        Ok(core)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        self.bus.subscribe()
    }

    pub fn runner(&self) -> &TaskRunner {
        &self.runner
    }

    pub fn transfers(&self) -> &TransferStore {
        &self.transfers
    }

    pub async fn settings(&self) -> AppSettings {
        self.settings.read().await.clone()
    }

    /// Persist new settings. Runner settings take effect on the next open.
    pub async fn update_settings(&self, settings: AppSettings) -> EngineResult<()> {
        settings.save(&self.db).await?;
        *self.settings.write().await = settings;
        Ok(())
    }

    /// Finish admitted transfers, then stop persisting events.
    pub async fn shutdown(&self) {
        self.runner.shutdown().await;
        self.sync_stop.cancel();

        for (name, slot) in [("record", &self.record_sync), ("listing", &self.listing_sync)] {
            let handle = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                if let Err(e) = handle.await {
                    log::error!("app: {} sync ended abnormally: {}", name, e);
                }
            }
        }
        log::info!("app: shut down");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::NewStorageApp;
    use std::path::PathBuf;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub(crate) dir: tempfile::TempDir,
        pub(crate) core: AppCore,
        pub(crate) events: mpsc::UnboundedReceiver<TaskEvent>,
    }

    impl Fixture {
        pub(crate) fn db_path(&self) -> PathBuf {
            self.dir.path().join("app.db")
        }

        pub(crate) fn storage_root(&self) -> PathBuf {
            self.dir.path().join("storage")
        }

        pub(crate) fn downloads(&self) -> PathBuf {
            self.dir.path().join("downloads")
        }

        pub(crate) fn write_object(&self, bucket: &str, key: &str, body: &[u8]) {
            let path = self.storage_root().join(bucket).join(key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }

        /// Wait until `count` tasks reach a terminal event.
        pub(crate) async fn settle(&mut self, count: usize) -> Vec<TaskEvent> {
            let mut terminal = Vec::new();
            while terminal.len() < count {
                let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                    .await
                    .expect("timed out waiting for transfers")
                    .expect("bus closed");
                if event.is_terminal() {
                    terminal.push(event);
                }
            }
            terminal
        }

        /// Shut down and open the same database again with fresh state.
        pub(crate) async fn reopen(self) -> Fixture {
            let Fixture { dir, core, .. } = self;
            core.shutdown().await;
            drop(core);

            let bus = EventBus::new();
            let events = bus.subscribe();
            let core = AppCore::open_with(&dir.path().join("app.db"), BackendSlot::new(), bus)
                .await
                .unwrap();
            Fixture { dir, core, events }
        }
    }

    /// Core backed by a local-directory storage app with bucket `photos`.
    pub(crate) async fn local_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let events = bus.subscribe();
        let core = AppCore::open_with(&dir.path().join("app.db"), BackendSlot::new(), bus)
            .await
            .unwrap();

        let root = dir.path().join("storage");
        std::fs::create_dir_all(root.join("photos")).unwrap();
        let app = core
            .add_app(NewStorageApp {
                name: Some("disk".to_string()),
                provider: "local".to_string(),
                endpoint_host: Some(root.to_string_lossy().into_owned()),
                ..NewStorageApp::default()
            })
            .await
            .unwrap();
        core.change_app(&app.id).await.unwrap();

        let mut settings = core.settings().await;
        settings.download_dir = dir.path().join("downloads");
        core.update_settings(settings).await.unwrap();

        Fixture { dir, core, events }
    }
}
