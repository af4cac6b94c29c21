//! Bounded-concurrency task runner
//!
//! Submissions go onto one FIFO queue. A single dispatcher pulls ids off it,
//! waits for a free slot on the semaphore and hands the task to a worker.
//! Everything observable about a task leaves the runner as an `EventBus`
//! message; the runner never writes transfer records itself.

use super::types::{TaskDescriptor, TaskId, TaskStatus};
use super::worker::{self, Job};
use crate::config::RunnerConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, FailureCause, TaskEvent};
use crate::providers::BackendSlot;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Point-in-time view of one task held by the runner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub descriptor: TaskDescriptor,
    /// Last percentage reported by the backend.
    pub progress: u32,
}

struct TaskEntry {
    descriptor: TaskDescriptor,
    progress: u32,
    cancel: CancellationToken,
}

/// State shared between the runner handle, the dispatcher and the workers.
pub(crate) struct RunnerShared {
    backend: BackendSlot,
    bus: EventBus,
    config: RunnerConfig,
    tasks: Mutex<HashMap<TaskId, TaskEntry>>,
}

impl RunnerShared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, TaskEntry>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Pending -> Running. Returns the job to execute, or `None` when the
    /// task was cancelled while queued.
    fn begin(&self, id: &str) -> Option<Job> {
        let mut tasks = self.tasks();
        let entry = tasks.get_mut(id)?;
        if entry.descriptor.status != TaskStatus::Pending {
            log::debug!("runner: skipping task {} ({})", id, entry.descriptor.status);
            return None;
        }

        let Some(backend) = self.backend.current() else {
            entry.descriptor.status = TaskStatus::Failed;
            log::warn!("runner: no active storage connection for task {}", id);
            self.bus.publish(TaskEvent::Failed {
                id: id.to_string(),
                cause: FailureCause::Backend("no active storage connection".to_string()),
            });
            return None;
        };

        entry.descriptor.status = TaskStatus::Running;
        log::info!(
            "runner: starting {} task {} ({})",
            entry.descriptor.kind,
            id,
            entry.descriptor.remote_key
        );
        self.bus.publish(TaskEvent::Started { id: id.to_string() });

        Some(Job {
            descriptor: entry.descriptor.clone(),
            cancel: entry.cancel.clone(),
            backend,
        })
    }

    /// Forward a backend progress report while the task is still running.
    pub(crate) fn report_progress(&self, id: &str, percent: u32) {
        let mut tasks = self.tasks();
        if let Some(entry) = tasks.get_mut(id) {
            if entry.descriptor.status == TaskStatus::Running {
                entry.progress = percent;
                self.bus.publish(TaskEvent::Progress {
                    id: id.to_string(),
                    percent,
                });
            }
        }
    }

    /// Move a task to its terminal state. Only the first call for a task
    /// publishes; later calls are ignored.
    pub(crate) fn finish(&self, id: &str, outcome: Result<(), FailureCause>) {
        let mut tasks = self.tasks();
        let Some(entry) = tasks.get_mut(id) else {
            return;
        };
        if entry.descriptor.status.is_terminal() {
            return;
        }

        let event = match outcome {
            Ok(()) => {
                entry.descriptor.status = TaskStatus::Done;
                entry.progress = 100;
                log::info!("runner: task {} done", id);
                TaskEvent::Done { id: id.to_string() }
            }
            Err(cause) => {
                entry.descriptor.status = TaskStatus::Failed;
                log::warn!("runner: task {} failed: {}", id, cause);
                TaskEvent::Failed {
                    id: id.to_string(),
                    cause,
                }
            }
        };
        self.bus.publish(event);
    }
}

async fn dispatch_loop(
    shared: Arc<RunnerShared>,
    mut queue: mpsc::UnboundedReceiver<TaskId>,
    mut started: watch::Receiver<bool>,
    tracker: TaskTracker,
) {
    if started.wait_for(|started| *started).await.is_err() {
        return;
    }

    let slots = Arc::new(Semaphore::new(shared.config.effective_concurrency()));
    while let Some(id) = queue.recv().await {
        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        if let Some(job) = shared.begin(&id) {
            tracker.spawn(worker::run(shared.clone(), job, permit));
        }
    }
    log::debug!("runner: queue closed, dispatcher exiting");
}

/// Accepts task descriptors and runs them against the active backend with at
/// most `max_concurrency` backend calls in flight.
///
/// Must be created inside a tokio runtime.
pub struct TaskRunner {
    shared: Arc<RunnerShared>,
    queue: Mutex<Option<mpsc::UnboundedSender<TaskId>>>,
    started: watch::Sender<bool>,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl TaskRunner {
    pub fn new(config: RunnerConfig, backend: BackendSlot, bus: EventBus) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = watch::channel(config.auto_start);
        let tracker = TaskTracker::new();

        log::info!(
            "runner: max_concurrency={} auto_start={} timeout={:?}",
            config.effective_concurrency(),
            config.auto_start,
            config.task_timeout()
        );

        let shared = Arc::new(RunnerShared {
            backend,
            bus,
            config,
            tasks: Mutex::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(dispatch_loop(
            shared.clone(),
            queue_rx,
            started_rx,
            tracker.clone(),
        ));

        Self {
            shared,
            queue: Mutex::new(Some(queue_tx)),
            started: started_tx,
            tracker,
            dispatcher: Mutex::new(Some(dispatcher)),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.shared.config
    }

    /// Admit a task. Returns immediately; the outcome arrives on the bus.
    pub fn submit(&self, mut descriptor: TaskDescriptor) -> EngineResult<TaskId> {
        self.shared.backend.require()?;

        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let sender = queue.as_ref().ok_or(EngineError::RunnerClosed)?;

        let id = descriptor.id.clone();
        {
            let mut tasks = self.shared.tasks();
            if tasks.contains_key(&id) {
                return Err(EngineError::invalid(format!("task {} was already submitted", id)));
            }
            descriptor.status = TaskStatus::Pending;
            tasks.insert(
                id.clone(),
                TaskEntry {
                    descriptor,
                    progress: 0,
                    cancel: CancellationToken::new(),
                },
            );
            self.shared.bus.publish(TaskEvent::Queued { id: id.clone() });
        }

        if sender.send(id.clone()).is_err() {
            self.shared.tasks().remove(&id);
            return Err(EngineError::RunnerClosed);
        }
        Ok(id)
    }

    /// Release the queue when the runner was built with `auto_start = false`.
    pub fn start(&self) {
        if !self.started.send_replace(true) {
            log::info!("runner: started");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Cancel a task. A queued task never reaches the backend; a running one
    /// has its backend call dropped. Returns false if the task had already
    /// finished.
    pub fn cancel(&self, id: &str) -> EngineResult<bool> {
        let mut tasks = self.shared.tasks();
        let entry = tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(format!("task {}", id)))?;

        match entry.descriptor.status {
            TaskStatus::Pending => {
                entry.descriptor.status = TaskStatus::Failed;
                entry.cancel.cancel();
                log::info!("runner: cancelled queued task {}", id);
                self.shared.bus.publish(TaskEvent::Failed {
                    id: id.to_string(),
                    cause: FailureCause::Cancelled,
                });
                Ok(true)
            }
            TaskStatus::Running => {
                // The worker observes the token and publishes the failure.
                entry.cancel.cancel();
                log::info!("runner: cancelling running task {}", id);
                Ok(true)
            }
            TaskStatus::Done | TaskStatus::Failed => Ok(false),
        }
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.shared.tasks().get(id).map(|e| e.descriptor.status)
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.shared.tasks().get(id).map(|e| TaskSnapshot {
            descriptor: e.descriptor.clone(),
            progress: e.progress,
        })
    }

    /// All tasks known to the runner in admission order.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let mut all: Vec<TaskSnapshot> = self
            .shared
            .tasks()
            .values()
            .map(|e| TaskSnapshot {
                descriptor: e.descriptor.clone(),
                progress: e.progress,
            })
            .collect();
        all.sort_by(|a, b| {
            a.descriptor
                .created_at
                .cmp(&b.descriptor.created_at)
                .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
        });
        all
    }

    pub fn running_count(&self) -> usize {
        self.count(TaskStatus::Running)
    }

    pub fn pending_count(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.shared
            .tasks()
            .values()
            .filter(|e| e.descriptor.status == status)
            .count()
    }

    /// Drop finished tasks from memory. Their history lives in the record
    /// store. Returns how many were removed.
    /// Forget finished tasks whose status is one of `statuses`. Pending and
    /// running tasks are never removed.
    pub fn prune(&self, statuses: &[TaskStatus]) -> usize {
        let mut tasks = self.shared.tasks();
        let before = tasks.len();
        tasks.retain(|_, e| {
            let status = e.descriptor.status;
            !(status.is_terminal() && statuses.contains(&status))
        });
        before - tasks.len()
    }

    pub fn is_closed(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Stop accepting work, run what was already admitted and wait for every
    /// worker to finish.
    pub async fn shutdown(&self) {
        let sender = self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_none() {
            log::debug!("runner: shutdown called twice");
        }
        drop(sender);

        // A runner that was never started still drains its queue.
        self.started.send_replace(true);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                log::error!("runner: dispatcher ended abnormally: {}", e);
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        log::info!("runner: shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::stub::StubBackend;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn runner_with(stub: Arc<StubBackend>, config: RunnerConfig) -> (TaskRunner, UnboundedReceiver<TaskEvent>) {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let runner = TaskRunner::new(config, BackendSlot::with_backend(stub), bus);
        (runner, events)
    }

    fn upload(key: &str) -> TaskDescriptor {
        TaskDescriptor::upload("bucket", format!("/tmp/{}", key), key, 10).unwrap()
    }

    /// Collect events until `count` tasks have reached a terminal event.
    async fn until_terminal(events: &mut UnboundedReceiver<TaskEvent>, count: usize) -> Vec<TaskEvent> {
        let mut seen = Vec::new();
        let mut terminal = 0;
        while terminal < count {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for task events")
                .expect("bus closed");
            if event.is_terminal() {
                terminal += 1;
            }
            seen.push(event);
        }
        seen
    }

    fn terminal_for<'a>(events: &'a [TaskEvent], id: &str) -> Vec<&'a TaskEvent> {
        events
            .iter()
            .filter(|e| e.task_id() == id && e.is_terminal())
            .collect()
    }

    #[tokio::test]
    async fn eight_uploads_never_exceed_five_running() {
        let stub = Arc::new(StubBackend::new().with_delay(Duration::from_millis(30)));
        let (runner, mut events) = runner_with(stub.clone(), RunnerConfig::default());

        let ids: Vec<TaskId> = (0..8)
            .map(|i| runner.submit(upload(&format!("file-{}.bin", i))).unwrap())
            .collect();

        let mut terminal = 0;
        while terminal < ids.len() {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(runner.running_count() <= 5);
            if event.is_terminal() {
                assert!(matches!(event, TaskEvent::Done { .. }));
                terminal += 1;
            }
        }

        assert!(stub.peak() <= 5);
        assert_eq!(stub.peak(), 5);
        for id in &ids {
            assert_eq!(runner.status(id), Some(TaskStatus::Done));
        }
        assert_eq!(runner.running_count(), 0);
        assert_eq!(runner.pending_count(), 0);
    }

    #[tokio::test]
    async fn failed_download_publishes_failed_once_and_pipeline_continues() {
        let stub = Arc::new(StubBackend::new().failing("broken.bin"));
        let (runner, mut events) = runner_with(stub, RunnerConfig::default());

        let bad = runner
            .submit(TaskDescriptor::download("bucket", "broken.bin", "/tmp/broken.bin", 5).unwrap())
            .unwrap();
        let good = runner.submit(upload("fine.bin")).unwrap();

        let seen = until_terminal(&mut events, 2).await;
        runner.shutdown().await;

        let bad_terminal = terminal_for(&seen, &bad);
        assert_eq!(bad_terminal.len(), 1);
        match bad_terminal[0] {
            TaskEvent::Failed {
                cause: FailureCause::Backend(msg),
                ..
            } => assert!(msg.contains("broken.bin")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(runner.status(&bad), Some(TaskStatus::Failed));
        assert_eq!(runner.status(&good), Some(TaskStatus::Done));

        // Nothing else for the failed task after shutdown.
        while let Ok(event) = events.try_recv() {
            assert!(!(event.task_id() == bad && event.is_terminal()));
        }
    }

    #[tokio::test]
    async fn dispatch_is_fifo_with_single_slot() {
        let stub = Arc::new(StubBackend::new().with_delay(Duration::from_millis(5)));
        let (runner, mut events) = runner_with(stub.clone(), RunnerConfig::with_concurrency(1));

        let keys = ["one", "two", "three", "four"];
        for key in keys {
            runner.submit(upload(key)).unwrap();
        }
        until_terminal(&mut events, keys.len()).await;

        assert_eq!(stub.started_keys(), keys.to_vec());
        assert_eq!(stub.peak(), 1);
    }

    #[tokio::test]
    async fn events_follow_the_state_machine() {
        let stub = Arc::new(StubBackend::new());
        let (runner, mut events) = runner_with(stub, RunnerConfig::default());

        let id = runner.submit(upload("a.txt")).unwrap();
        let seen = until_terminal(&mut events, 1).await;

        assert_eq!(seen.first(), Some(&TaskEvent::Queued { id: id.clone() }));
        assert_eq!(seen.get(1), Some(&TaskEvent::Started { id: id.clone() }));
        assert!(seen.contains(&TaskEvent::Progress {
            id: id.clone(),
            percent: 100
        }));
        assert_eq!(seen.last(), Some(&TaskEvent::Done { id: id.clone() }));
        assert_eq!(runner.snapshot(&id).unwrap().progress, 100);
    }

    #[tokio::test]
    async fn manual_start_holds_the_queue() {
        let stub = Arc::new(StubBackend::new());
        let config = RunnerConfig {
            auto_start: false,
            ..RunnerConfig::default()
        };
        let (runner, mut events) = runner_with(stub.clone(), config);

        let id = runner.submit(upload("later.txt")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!runner.is_started());
        assert_eq!(runner.status(&id), Some(TaskStatus::Pending));
        assert!(stub.started_keys().is_empty());

        runner.start();
        until_terminal(&mut events, 1).await;
        assert_eq!(runner.status(&id), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn cancelling_queued_task_skips_backend() {
        let stub = Arc::new(StubBackend::new().hanging("blocker"));
        let (runner, mut events) = runner_with(stub.clone(), RunnerConfig::with_concurrency(1));

        let blocker = runner.submit(upload("blocker")).unwrap();
        let queued = runner.submit(upload("queued")).unwrap();

        assert!(runner.cancel(&queued).unwrap());
        assert!(!runner.cancel(&queued).unwrap());
        assert!(runner.cancel(&blocker).unwrap());

        let seen = until_terminal(&mut events, 2).await;
        assert_eq!(
            terminal_for(&seen, &queued),
            vec![&TaskEvent::Failed {
                id: queued.clone(),
                cause: FailureCause::Cancelled
            }]
        );
        assert_eq!(
            terminal_for(&seen, &blocker),
            vec![&TaskEvent::Failed {
                id: blocker.clone(),
                cause: FailureCause::Cancelled
            }]
        );

        runner.shutdown().await;
        assert!(!stub.started_keys().contains(&"queued".to_string()));
        assert_eq!(stub.active(), 0);
    }

    #[tokio::test]
    async fn cancelling_running_task_frees_its_slot() {
        let stub = Arc::new(StubBackend::new().hanging("stuck"));
        let (runner, mut events) = runner_with(stub.clone(), RunnerConfig::with_concurrency(1));

        let stuck = runner.submit(upload("stuck")).unwrap();
        let next = runner.submit(upload("next")).unwrap();

        // Wait until the hanging call is in flight.
        loop {
            let event = events.recv().await.unwrap();
            if event == (TaskEvent::Started { id: stuck.clone() }) {
                break;
            }
        }
        runner.cancel(&stuck).unwrap();

        let seen = until_terminal(&mut events, 2).await;
        assert_eq!(terminal_for(&seen, &stuck).len(), 1);
        assert_eq!(runner.status(&stuck), Some(TaskStatus::Failed));
        assert_eq!(runner.status(&next), Some(TaskStatus::Done));
        assert!(matches!(runner.cancel("nope"), Err(EngineError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_stuck_task() {
        let stub = Arc::new(StubBackend::new().hanging("slow"));
        let config = RunnerConfig {
            task_timeout_secs: Some(2),
            ..RunnerConfig::default()
        };
        let (runner, mut events) = runner_with(stub, config);

        let id = runner.submit(upload("slow")).unwrap();
        let seen = until_terminal(&mut events, 1).await;
        assert_eq!(
            terminal_for(&seen, &id),
            vec![&TaskEvent::Failed {
                id: id.clone(),
                cause: FailureCause::TimedOut
            }]
        );
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test]
    async fn panicking_backend_becomes_failed() {
        let stub = Arc::new(StubBackend::new().panicking("boom"));
        let (runner, mut events) = runner_with(stub, RunnerConfig::default());

        let boom = runner.submit(upload("boom")).unwrap();
        let fine = runner.submit(upload("fine")).unwrap();
        let seen = until_terminal(&mut events, 2).await;

        let boom_terminal = terminal_for(&seen, &boom);
        assert_eq!(boom_terminal.len(), 1);
        match boom_terminal[0] {
            TaskEvent::Failed {
                cause: FailureCause::Backend(msg),
                ..
            } => assert!(msg.contains("panicked")),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(runner.status(&fine), Some(TaskStatus::Done));
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_rejects_new_work() {
        let stub = Arc::new(StubBackend::new().with_delay(Duration::from_millis(10)));
        let config = RunnerConfig {
            max_concurrency: 2,
            auto_start: false,
            task_timeout_secs: None,
        };
        let (runner, _events) = runner_with(stub.clone(), config);

        let ids: Vec<TaskId> = (0..4)
            .map(|i| runner.submit(upload(&format!("f{}", i))).unwrap())
            .collect();
        runner.shutdown().await;

        for id in &ids {
            assert_eq!(runner.status(id), Some(TaskStatus::Done));
        }
        assert!(runner.is_closed());
        assert_eq!(runner.submit(upload("late")), Err(EngineError::RunnerClosed));
        assert_eq!(runner.prune(&[TaskStatus::Failed]), 0);
        assert_eq!(runner.prune(&[TaskStatus::Pending, TaskStatus::Done]), 4);
        assert!(runner.snapshots().is_empty());
        assert!(runner.snapshots().is_empty());
    }

    #[tokio::test]
    async fn submit_without_backend_fails_fast() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let runner = TaskRunner::new(RunnerConfig::default(), BackendSlot::new(), bus);

        let err = runner.submit(upload("a.txt")).unwrap_err();
        assert!(matches!(err, EngineError::BackendFailure(_)));
        assert!(events.try_recv().is_err());
        assert_eq!(runner.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let stub = Arc::new(StubBackend::new());
        let (runner, _events) = runner_with(stub, RunnerConfig::default());
        let task = upload("twice.txt");

        runner.submit(task.clone()).unwrap();
        assert!(matches!(
            runner.submit(task),
            Err(EngineError::ValidationFailure(_))
        ));
    }
}
