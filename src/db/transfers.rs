//! Transfer record store: durable history of every submitted task

use super::{changes, Database, DbResult};
use crate::events::TaskEvent;
use crate::task::{TaskDescriptor, TaskKind, TaskStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SELECT_COLUMNS: &str = "SELECT id, kind, name, size, created_at, status, bucket,
        remote_key, local_path, error, updated_at
     FROM transfers";

/// Persisted projection of a task descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: String,
    pub kind: TaskKind,
    pub name: String,
    pub size: u64,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
    pub status: TaskStatus,
    pub bucket: String,
    pub remote_key: String,
    pub local_path: Option<String>,
    pub error: Option<String>,
    pub updated_at: i64,
}

impl From<&TaskDescriptor> for TransferRecord {
    fn from(task: &TaskDescriptor) -> Self {
        TransferRecord {
            id: task.id.clone(),
            kind: task.kind,
            name: task.name.clone(),
            size: task.size,
            created_at: task.created_at,
            status: task.status,
            bucket: task.bucket.clone(),
            remote_key: task.remote_key.clone(),
            local_path: task
                .local_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            error: None,
            updated_at: task.created_at,
        }
    }
}

/// The transfer lists the UI shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferView {
    /// Pending or Running.
    InProgress,
    /// Done.
    Completed,
    /// Failed, including cancelled and timed-out tasks.
    Failed,
}

impl TransferView {
    /// Task statuses whose records this view shows.
    pub fn statuses(self) -> &'static [TaskStatus] {
        match self {
            TransferView::InProgress => &[TaskStatus::Pending, TaskStatus::Running],
            TransferView::Completed => &[TaskStatus::Done],
            TransferView::Failed => &[TaskStatus::Failed],
        }
    }
}

/// Get SQL for creating the transfers table
pub fn get_table_sql() -> &'static str {
    "
    CREATE TABLE IF NOT EXISTS transfers (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        bucket TEXT NOT NULL,
        remote_key TEXT NOT NULL,
        local_path TEXT,
        error TEXT,
        updated_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_transfers_status ON transfers(status);
    CREATE INDEX IF NOT EXISTS idx_transfers_created ON transfers(created_at);
    "
}

fn record_from_row(row: &turso::Row) -> DbResult<TransferRecord> {
    let kind: String = row.get(1)?;
    let size: i64 = row.get(3)?;
    let status: String = row.get(5)?;
    Ok(TransferRecord {
        id: row.get(0)?,
        kind: kind.parse::<TaskKind>()?,
        name: row.get(2)?,
        size: size.max(0) as u64,
        created_at: row.get(4)?,
        status: status.into(),
        bucket: row.get(6)?,
        remote_key: row.get(7)?,
        local_path: row.get(8)?,
        error: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Cheap to clone; all clones share one database connection.
#[derive(Clone)]
pub struct TransferStore {
    db: Arc<Database>,
}

impl TransferStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, record: &TransferRecord) -> DbResult<()> {
        let conn = self.db.connection().lock().await;
        conn.execute(
            "INSERT INTO transfers
             (id, kind, name, size, created_at, status, bucket, remote_key,
              local_path, error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            turso::params![
                record.id.clone(),
                record.kind.to_string(),
                record.name.clone(),
                record.size as i64,
                record.created_at,
                record.status.as_str(),
                record.bucket.clone(),
                record.remote_key.clone(),
                record.local_path.clone(),
                record.error.clone(),
                record.updated_at,
            ],
        )
        .await?;
        Ok(())
    }

    /// Last write wins on the status column. Returns false when no row has `id`.
    pub async fn update_status(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> DbResult<bool> {
        let conn = self.db.connection().lock().await;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE transfers SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            turso::params![status.as_str(), error, now, id],
        )
        .await?;
        Ok(changes(&conn).await? > 0)
    }

    pub async fn get(&self, id: &str) -> DbResult<Option<TransferRecord>> {
        let conn = self.db.connection().lock().await;
        let mut rows = conn
            .query(
                &format!("{} WHERE id = ?1", SELECT_COLUMNS),
                turso::params![id],
            )
            .await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(record_from_row(&row)?))
        } else {
            Ok(None)
        }
    }

    /// Records with `status`, oldest first.
    pub async fn query_by_status(&self, status: TaskStatus) -> DbResult<Vec<TransferRecord>> {
        self.query_where("status = ?1", status).await
    }

    /// Records whose status is anything but `status`, oldest first.
    pub async fn query_not_status(&self, status: TaskStatus) -> DbResult<Vec<TransferRecord>> {
        self.query_where("status != ?1", status).await
    }

    pub async fn query_view(&self, view: TransferView) -> DbResult<Vec<TransferRecord>> {
        let mut records = Vec::new();
        for status in view.statuses() {
            records.extend(self.query_by_status(*status).await?);
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(records)
    }

    /// Delete every record in `view`. Only called on explicit user request.
    pub async fn clear_view(&self, view: TransferView) -> DbResult<i64> {
        let conn = self.db.connection().lock().await;
        let mut removed = 0;
        for status in view.statuses() {
            conn.execute(
                "DELETE FROM transfers WHERE status = ?1",
                turso::params![status.as_str()],
            )
            .await?;
            removed += changes(&conn).await?;
        }
        Ok(removed)
    }

    /// Rows still Pending or Running when the store is opened belong to a
    /// previous process that exited mid-transfer; nothing will ever finish
    /// them, so they are marked Failed.
    pub async fn fail_interrupted(&self) -> DbResult<i64> {
        let conn = self.db.connection().lock().await;
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE transfers SET status = 'failed', error = 'interrupted', updated_at = ?1
             WHERE status IN ('pending', 'running')",
            turso::params![now],
        )
        .await?;
        changes(&conn).await
    }

    /// Apply one bus event to the matching record.
    pub async fn apply_event(&self, event: &TaskEvent) -> DbResult<()> {
        let updated = match event {
            TaskEvent::Started { id } => self.update_status(id, TaskStatus::Running, None).await?,
            TaskEvent::Done { id } => self.update_status(id, TaskStatus::Done, None).await?,
            TaskEvent::Failed { id, cause } => {
                self.update_status(id, TaskStatus::Failed, Some(&cause.to_string()))
                    .await?
            }
            TaskEvent::Queued { .. } | TaskEvent::Progress { .. } => return Ok(()),
        };
        if !updated {
            log::warn!("transfers: no record for task {}", event.task_id());
        }
        Ok(())
    }

    async fn query_where(&self, clause: &str, status: TaskStatus) -> DbResult<Vec<TransferRecord>> {
        let conn = self.db.connection().lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "{} WHERE {} ORDER BY created_at ASC, id ASC",
                    SELECT_COLUMNS, clause
                ),
                turso::params![status.as_str()],
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }
}

/// Keep the store in step with the runner: consume bus events and persist
/// every status transition. Runs until the bus side of `events` is dropped or
/// `stop` fires; on stop, events already queued are still applied.
pub fn spawn_record_sync(
    store: TransferStore,
    mut events: mpsc::UnboundedReceiver<TaskEvent>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => persist(&store, &event).await,
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        persist(&store, &event).await;
                    }
                    break;
                }
            }
        }
        log::debug!("transfers: record sync stopped");
    })
}

async fn persist(store: &TransferStore, event: &TaskEvent) {
    if let Err(e) = store.apply_event(event).await {
        log::error!(
            "transfers: failed to persist {:?} for {}: {}",
            event,
            event.task_id(),
            e
        );
    }
}
