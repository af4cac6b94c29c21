//! Runner configuration and persisted application settings

use crate::db::{Database, DbResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum number of tasks running their backend call at the same time
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

const KEY_DOWNLOAD_DIR: &str = "download_dir";
const KEY_CONFIRM_DELETE: &str = "confirm_delete";
const KEY_CURRENT_APP: &str = "current_app";
const KEY_RUNNER: &str = "runner";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub max_concurrency: usize,
    /// When false, queued tasks wait for an explicit `TaskRunner::start`.
    pub auto_start: bool,
    /// Per-task deadline for the backend call; `None` waits indefinitely.
    pub task_timeout_secs: Option<u64>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            auto_start: true,
            task_timeout_secs: None,
        }
    }
}

impl RunnerConfig {
    pub fn with_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::default()
        }
    }

    /// A zero bound would never dispatch anything, so it counts as one.
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }
}

/// User-facing settings, one `app_state` row per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub download_dir: PathBuf,
    pub confirm_delete: bool,
    pub current_app: Option<String>,
    pub runner: RunnerConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            confirm_delete: true,
            current_app: None,
            runner: RunnerConfig::default(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| std::env::temp_dir().join("bucketfm"))
}

impl AppSettings {
    /// Load settings, falling back to defaults for keys never written
    /// or holding values that no longer parse.
    pub async fn load(db: &Database) -> DbResult<Self> {
        let mut settings = AppSettings::default();

        if let Some(dir) = db.get_app_state(KEY_DOWNLOAD_DIR).await? {
            settings.download_dir = PathBuf::from(dir);
        }
        if let Some(flag) = db.get_app_state(KEY_CONFIRM_DELETE).await? {
            settings.confirm_delete = flag != "false";
        }
        settings.current_app = db.get_app_state(KEY_CURRENT_APP).await?;
        if let Some(raw) = db.get_app_state(KEY_RUNNER).await? {
            match serde_json::from_str(&raw) {
                Ok(runner) => settings.runner = runner,
                Err(e) => log::warn!("settings: ignoring unreadable runner config: {}", e),
            }
        }

        Ok(settings)
    }

    pub async fn save(&self, db: &Database) -> DbResult<()> {
        db.set_app_state(KEY_DOWNLOAD_DIR, &self.download_dir.to_string_lossy())
            .await?;
        db.set_app_state(KEY_CONFIRM_DELETE, if self.confirm_delete { "true" } else { "false" })
            .await?;
        match &self.current_app {
            Some(id) => db.set_app_state(KEY_CURRENT_APP, id).await?,
            None => db.delete_app_state(KEY_CURRENT_APP).await?,
        }
        db.set_app_state(KEY_RUNNER, &serde_json::to_string(&self.runner)?)
            .await?;
        Ok(())
    }
}
