//! Transfer task engine and virtual directory model for an object-storage
//! file manager.
//!
//! - `task`: bounded-concurrency runner for upload/download/delete tasks
//! - `events`: bus carrying task notifications to the UI and the record store
//! - `db`: local database (transfer history, settings, listing cache, apps)
//! - `vdir`: folder tree and navigation state over flat bucket listings
//! - `providers`: storage backends (S3-compatible and local directory)
//! - `commands`: `AppCore`, the command surface used by the UI

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod local_files;
pub mod providers;
pub mod task;
pub mod vdir;

pub use commands::{AppCore, BucketListing, RemoteFile};
pub use config::{AppSettings, RunnerConfig};
pub use error::{EngineError, EngineResult};
pub use events::{EventBus, FailureCause, TaskEvent};
pub use providers::{BackendSlot, ObjectEntry, StorageBackend};
pub use task::{TaskDescriptor, TaskId, TaskKind, TaskRunner, TaskStatus};
