//! Task descriptor and lifecycle types

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Process-unique task identifier (UUID v4), never reused.
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Upload,
    Download,
    Delete,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Upload => write!(f, "upload"),
            TaskKind::Download => write!(f, "download"),
            TaskKind::Delete => write!(f, "delete"),
        }
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(TaskKind::Upload),
            "download" => Ok(TaskKind::Download),
            "delete" => Ok(TaskKind::Delete),
            other => Err(format!("Unknown task kind: {}", other)),
        }
    }
}

/// `Pending -> Running -> {Done | Failed}`; Done and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TaskStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => TaskStatus::Running,
            "done" => TaskStatus::Done,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// A unit of requested work. Everything except `status` is fixed at creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: TaskId,
    pub kind: TaskKind,
    pub name: String,
    pub size: u64,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    pub status: TaskStatus,
    pub bucket: String,
    pub local_path: Option<PathBuf>,
    pub remote_key: String,
}

impl TaskDescriptor {
    pub fn upload(
        bucket: impl Into<String>,
        local_path: impl Into<PathBuf>,
        remote_key: impl Into<String>,
        size: u64,
    ) -> EngineResult<Self> {
        Self::new(
            TaskKind::Upload,
            bucket.into(),
            remote_key.into(),
            Some(local_path.into()),
            size,
        )
    }

    pub fn download(
        bucket: impl Into<String>,
        remote_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
        size: u64,
    ) -> EngineResult<Self> {
        Self::new(
            TaskKind::Download,
            bucket.into(),
            remote_key.into(),
            Some(local_path.into()),
            size,
        )
    }

    pub fn delete(bucket: impl Into<String>, remote_key: impl Into<String>) -> EngineResult<Self> {
        Self::new(TaskKind::Delete, bucket.into(), remote_key.into(), None, 0)
    }

    fn new(
        kind: TaskKind,
        bucket: String,
        remote_key: String,
        local_path: Option<PathBuf>,
        size: u64,
    ) -> EngineResult<Self> {
        if bucket.trim().is_empty() {
            return Err(EngineError::invalid("bucket name is empty"));
        }
        if remote_key.trim().is_empty() {
            return Err(EngineError::invalid("remote key is empty"));
        }
        if remote_key.ends_with('/') {
            return Err(EngineError::invalid(format!(
                "remote key '{}' names a folder, not an object",
                remote_key
            )));
        }
        if kind != TaskKind::Delete
            && local_path
                .as_ref()
                .map_or(true, |p| p.as_os_str().is_empty())
        {
            return Err(EngineError::invalid(format!("{} task needs a local path", kind)));
        }

        let name = remote_key
            .rsplit('/')
            .next()
            .unwrap_or(remote_key.as_str())
            .to_string();

        Ok(TaskDescriptor {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            name,
            size: if kind == TaskKind::Delete { 0 } else { size },
            created_at: chrono::Utc::now().timestamp_millis(),
            status: TaskStatus::Pending,
            bucket,
            local_path,
            remote_key,
        })
    }
}
