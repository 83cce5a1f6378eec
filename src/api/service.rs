//! The caller-facing task operations.
//!
//! Thin orchestration over the store, the queue and the session slot. None
//! of these operations waits on task execution.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::artifacts::{Artifact, ArtifactStore};
use crate::error::{ArtifactError, SessionError, TaskError};
use crate::session::{SessionInfo, SessionSlot, SessionState};
use crate::tasks::model::{
    TaskEvent, TaskRecord, TaskRequest, TaskResult, TaskSnapshot, TaskStatus, TaskSummary,
};
use crate::tasks::store::TaskStore;
use crate::worker::queue::ExecutionQueue;
use crate::worker::runner::{RunnerStats, StatsSnapshot};

/// Listing filter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

/// What a cancel request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task had not started and is now `cancelled`.
    Cancelled,
    /// The task is running; the request is recorded and the task runs to
    /// completion.
    Requested,
}

/// Liveness summary for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub tasks: usize,
    pub queued: usize,
    pub session: SessionState,
    pub runner: StatsSnapshot,
}

/// One item from a `TaskWatch`.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchItem {
    Event(TaskEvent),
    /// Events were dropped; re-read the snapshot.
    Lagged(u64),
}

/// Event stream for a single task.
pub struct TaskWatch {
    task_id: Uuid,
    rx: broadcast::Receiver<TaskEvent>,
}

impl TaskWatch {
    /// Next event for this task. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchItem> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.task_id() == self.task_id => {
                    return Some(WatchItem::Event(event));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(WatchItem::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Entry point for submitting, polling, listing and cancelling tasks.
pub struct TaskService {
    store: Arc<TaskStore>,
    queue: Arc<ExecutionQueue>,
    slot: Arc<SessionSlot>,
    artifacts: Arc<dyn ArtifactStore>,
    stats: Arc<RunnerStats>,
}

impl TaskService {
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<ExecutionQueue>,
        slot: Arc<SessionSlot>,
        artifacts: Arc<dyn ArtifactStore>,
        stats: Arc<RunnerStats>,
    ) -> Self {
        Self {
            store,
            queue,
            slot,
            artifacts,
            stats,
        }
    }

    /// Validate and enqueue a request. Returns as soon as the task is queued.
    pub async fn submit(&self, request: TaskRequest) -> Result<Uuid, TaskError> {
        request.validate()?;
        let id = self.store.create(TaskRecord::new(request)).await?;
        if let Err(e) = self.queue.push(id).await {
            self.store.delete(id).await;
            return Err(e);
        }
        info!(task_id = %id, "Task submitted");
        Ok(id)
    }

    /// Current state of a task.
    pub async fn poll(&self, id: Uuid) -> Result<TaskSnapshot, TaskError> {
        let record = self.store.get(id).await.ok_or(TaskError::NotFound { id })?;
        let queued = record.status == TaskStatus::Queued;
        let mut snapshot = TaskSnapshot::from(record);
        if queued {
            snapshot.queue_position = self.queue.position(id).await;
        }
        Ok(snapshot)
    }

    /// Summaries of live tasks, oldest first.
    pub async fn list(&self, filter: TaskFilter) -> Vec<TaskSummary> {
        self.store
            .list()
            .await
            .iter()
            .filter(|r| filter.status.is_none_or(|s| r.status == s))
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(TaskSummary::from)
            .collect()
    }

    /// Cancel a task. Queued tasks are cancelled outright; running tasks
    /// only get `cancel_requested` set, because a step against the shared
    /// browser cannot be interrupted safely.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, TaskError> {
        let record = self.store.get(id).await.ok_or(TaskError::NotFound { id })?;
        if record.status.is_terminal() {
            return Err(TaskError::AlreadyTerminal {
                id,
                status: record.status,
            });
        }

        if record.status == TaskStatus::Queued {
            self.queue.remove(id).await;
            match self
                .store
                .finish(id, TaskStatus::Cancelled, TaskResult::cancelled())
                .await
            {
                Ok(_) => {
                    info!(task_id = %id, "Queued task cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                // The runner picked it up in the meantime.
                Err(TaskError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let first = self
            .store
            .update(id, |r| {
                if r.status.is_terminal() {
                    return Err(r.status);
                }
                let first = !r.cancel_requested;
                r.cancel_requested = true;
                Ok(first)
            })
            .await?
            .map_err(|status| TaskError::AlreadyTerminal { id, status })?;

        if first {
            self.store
                .append_progress(id, "Cancellation requested; the task will run to completion")
                .await?;
            info!(task_id = %id, "Cancellation requested for running task");
        } else {
            debug!(task_id = %id, "Repeated cancellation request");
        }
        Ok(CancelOutcome::Requested)
    }

    /// Current snapshot plus a stream of this task's later events.
    pub async fn subscribe(&self, id: Uuid) -> Result<(TaskSnapshot, TaskWatch), TaskError> {
        // Subscribe before reading so nothing falls between the two.
        let rx = self.store.subscribe();
        let snapshot = self.poll(id).await?;
        Ok((snapshot, TaskWatch { task_id: id, rx }))
    }

    pub fn session_status(&self) -> SessionInfo {
        self.slot.info()
    }

    /// Launch the session ahead of the first task.
    pub async fn start_session(&self) -> Result<SessionInfo, SessionError> {
        self.slot.start().await
    }

    pub async fn artifact(&self, id: Uuid) -> Result<Artifact, ArtifactError> {
        self.artifacts.get(id).await
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            tasks: self.store.list().await.len(),
            queued: self.queue.len().await,
            session: self.slot.info().state,
            runner: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::session::{Action, MockDriver};

    fn service() -> (TaskService, Arc<TaskStore>, Arc<ExecutionQueue>) {
        let store = Arc::new(TaskStore::new(Duration::from_secs(3600)));
        let queue = Arc::new(ExecutionQueue::new());
        let slot = Arc::new(SessionSlot::new(
            Arc::new(MockDriver::new()),
            Duration::from_secs(5),
        ));
        let service = TaskService::new(
            store.clone(),
            queue.clone(),
            slot,
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(RunnerStats::default()),
        );
        (service, store, queue)
    }

    fn request() -> TaskRequest {
        TaskRequest::new("open the page").with_url("https://example.com")
    }

    #[tokio::test]
    async fn submit_returns_queued_task() {
        let (service, _, queue) = service();
        let id = service.submit(request()).await.unwrap();

        let snapshot = service.poll(id).await.unwrap();
        assert_eq!(snapshot.task_id, id);
        assert_eq!(snapshot.status, TaskStatus::Queued);
        assert!(snapshot.result.is_none());
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn queued_snapshot_reports_position() {
        let (service, store, queue) = service();
        let first = service.submit(request()).await.unwrap();
        let second = service.submit(request()).await.unwrap();

        assert_eq!(service.poll(first).await.unwrap().queue_position, Some(0));
        assert_eq!(service.poll(second).await.unwrap().queue_position, Some(1));

        assert_eq!(queue.pop().await, Some(first));
        store.transition(first, TaskStatus::Running).await.unwrap();
        assert_eq!(service.poll(first).await.unwrap().queue_position, None);
        assert_eq!(service.poll(second).await.unwrap().queue_position, Some(0));
    }

    #[tokio::test]
    async fn submit_rejects_invalid_request() {
        let (service, store, queue) = service();
        let err = service.submit(TaskRequest::new("")).await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidRequest(_)));
        assert!(store.is_empty().await);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn submit_after_close_leaves_nothing_behind() {
        let (service, store, queue) = service();
        queue.close().await;
        let err = service.submit(request()).await.unwrap_err();
        assert!(matches!(err, TaskError::QueueClosed));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn poll_unknown_is_not_found() {
        let (service, _, _) = service();
        assert!(matches!(
            service.poll(Uuid::new_v4()).await,
            Err(TaskError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_and_limits() {
        let (service, store, _) = service();
        let a = service.submit(request()).await.unwrap();
        let b = service.submit(request()).await.unwrap();
        let c = service.submit(request()).await.unwrap();
        store.transition(b, TaskStatus::Running).await.unwrap();

        let all = service.list(TaskFilter::default()).await;
        assert_eq!(all.len(), 3);

        let queued = service
            .list(TaskFilter {
                status: Some(TaskStatus::Queued),
                limit: None,
            })
            .await;
        let ids: Vec<_> = queued.iter().map(|s| s.task_id).collect();
        assert!(ids.contains(&a) && ids.contains(&c) && !ids.contains(&b));

        let limited = service
            .list(TaskFilter {
                status: None,
                limit: Some(1),
            })
            .await;
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn cancel_queued_is_authoritative() {
        let (service, _, queue) = service();
        let id = service.submit(request()).await.unwrap();

        assert_eq!(service.cancel(id).await.unwrap(), CancelOutcome::Cancelled);
        let snapshot = service.poll(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert!(snapshot.result.is_some());
        assert!(queue.is_empty().await);

        let err = service.cancel(id).await.unwrap_err();
        assert!(matches!(err, TaskError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn cancel_running_is_advisory() {
        let (service, store, _) = service();
        let id = service.submit(request()).await.unwrap();
        store.transition(id, TaskStatus::Running).await.unwrap();

        assert_eq!(service.cancel(id).await.unwrap(), CancelOutcome::Requested);
        assert_eq!(service.cancel(id).await.unwrap(), CancelOutcome::Requested);

        let snapshot = service.poll(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Running);
        assert!(snapshot.cancel_requested);
        let notes = snapshot
            .progress
            .iter()
            .filter(|p| p.message.starts_with("Cancellation requested"))
            .count();
        assert_eq!(notes, 1);
    }

    #[tokio::test]
    async fn watch_sees_only_its_task() {
        let (service, store, _) = service();
        let id = service.submit(request()).await.unwrap();
        let other = service.submit(request()).await.unwrap();

        let (snapshot, mut watch) = service.subscribe(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Queued);

        store.append_progress(other, "noise").await.unwrap();
        store.transition(id, TaskStatus::Running).await.unwrap();

        assert_eq!(
            watch.next().await,
            Some(WatchItem::Event(TaskEvent::StatusChanged {
                task_id: id,
                status: TaskStatus::Running
            }))
        );
    }

    #[tokio::test]
    async fn start_session_and_health() {
        let (service, _, _) = service();
        assert_eq!(service.session_status().state, SessionState::Absent);
        let info = service.start_session().await.unwrap();
        assert_eq!(info.state, SessionState::Idle);

        service
            .submit(request().with_steps(vec![Action::Screenshot]))
            .await
            .unwrap();
        let health = service.health().await;
        assert_eq!(health.tasks, 1);
        assert_eq!(health.queued, 1);
        assert_eq!(health.session, SessionState::Idle);
    }
}
