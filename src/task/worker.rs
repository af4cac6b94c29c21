//! Executes one dispatched task against the backend

use super::runner::RunnerShared;
use super::types::{TaskDescriptor, TaskKind};
use crate::error::{EngineError, EngineResult};
use crate::events::FailureCause;
use crate::providers::{ProgressFn, StorageBackend};
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

pub(crate) struct Job {
    pub(crate) descriptor: TaskDescriptor,
    pub(crate) cancel: CancellationToken,
    /// Adapter captured at dispatch; a later connection swap does not affect it.
    pub(crate) backend: Arc<dyn StorageBackend>,
}

/// Run `job` to completion and publish its outcome. The slot is released
/// when `permit` drops, after the outcome is recorded.
pub(crate) async fn run(shared: Arc<RunnerShared>, job: Job, permit: OwnedSemaphorePermit) {
    let _permit = permit;
    let id = job.descriptor.id.clone();

    let on_progress: ProgressFn = {
        let shared = shared.clone();
        let id = id.clone();
        Arc::new(move |percent| shared.report_progress(&id, percent))
    };

    let call = AssertUnwindSafe(execute(job.backend.as_ref(), &job.descriptor, on_progress))
        .catch_unwind();

    let outcome = tokio::select! {
        _ = job.cancel.cancelled() => Err(FailureCause::Cancelled),
        result = with_deadline(call, shared.config().task_timeout()) => result,
    };

    shared.finish(&id, outcome);
}

async fn execute(
    backend: &dyn StorageBackend,
    task: &TaskDescriptor,
    on_progress: ProgressFn,
) -> EngineResult<()> {
    match task.kind {
        TaskKind::Upload => {
            let local = local_path(task)?;
            backend
                .upload(&task.bucket, local, &task.remote_key, on_progress)
                .await
        }
        TaskKind::Download => {
            let local = local_path(task)?;
            backend
                .download(&task.bucket, &task.remote_key, local, on_progress)
                .await
        }
        TaskKind::Delete => backend.delete(&task.bucket, &task.remote_key).await,
    }
}

fn local_path(task: &TaskDescriptor) -> EngineResult<&Path> {
    task.local_path
        .as_deref()
        .ok_or_else(|| EngineError::invalid(format!("{} task {} has no local path", task.kind, task.id)))
}

async fn with_deadline<F>(call: F, deadline: Option<Duration>) -> Result<(), FailureCause>
where
    F: Future<Output = std::thread::Result<EngineResult<()>>>,
{
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => return Err(FailureCause::TimedOut),
        },
        None => call.await,
    };

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(EngineError::BackendFailure(msg))) => Err(FailureCause::Backend(msg)),
        Ok(Err(e)) => Err(FailureCause::Backend(e.to_string())),
        Err(panic) => Err(FailureCause::Backend(format!(
            "backend panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
