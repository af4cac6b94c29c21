//! Process-wide publish/subscribe channel for task notifications
//!
//! The runner publishes here and never calls the record store directly;
//! persistence and the UI are just subscribers.

use crate::task::TaskId;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

lazy_static::lazy_static! {
    static ref GLOBAL_BUS: EventBus = EventBus::new();
}

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureCause {
    Backend(String),
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Backend(msg) => write!(f, "{}", msg),
            FailureCause::Cancelled => write!(f, "cancelled"),
            FailureCause::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued { id: TaskId },
    Started { id: TaskId },
    Progress { id: TaskId, percent: u32 },
    Done { id: TaskId },
    Failed { id: TaskId, cause: FailureCause },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Queued { id }
            | TaskEvent::Started { id }
            | TaskEvent::Progress { id, .. }
            | TaskEvent::Done { id }
            | TaskEvent::Failed { id, .. } => id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Done { .. } | TaskEvent::Failed { .. })
    }
}

/// Observer list of unbounded channels: publishing never blocks and no
/// subscriber misses an event. Clones share the same subscriber list.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<TaskEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus shared by the whole process.
    pub fn global() -> EventBus {
        GLOBAL_BUS.clone()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber; closed receivers are dropped.
    pub fn publish(&self, event: TaskEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<TaskEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
