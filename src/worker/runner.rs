//! Sequential task execution against the shared automation session.
//!
//! One runner drains the queue. For each task it takes the session guard,
//! runs the planned steps one at a time under a per-step timeout, records a
//! step log, and finishes the task with exactly one terminal result. A
//! session that turns out to be broken is discarded through the guard so the
//! next task launches a fresh one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::plan::{DirectPlanner, StepPlanner};
use super::queue::ExecutionQueue;
use crate::artifacts::{ArtifactRef, ArtifactStore};
use crate::config::EngineConfig;
use crate::error::{Error, SessionError, TaskError};
use crate::session::{Action, SessionGuard, SessionSlot, StepOutput};
use crate::tasks::model::{StepRecord, TaskResult, TaskStatus};
use crate::tasks::store::TaskStore;

const SCREENSHOT_CONTENT_TYPE: &str = "image/png";

/// Execution knobs taken from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    /// Upper bound on any single session call.
    pub step_timeout: Duration,
    /// Capture a screenshot after every successful step.
    pub capture_each_step: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            capture_each_step: true,
        }
    }
}

impl From<&EngineConfig> for RunnerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            step_timeout: config.step_timeout,
            capture_each_step: config.capture_each_step,
        }
    }
}

/// Counters describing what the runner has done.
#[derive(Debug, Default)]
pub struct RunnerStats {
    running: AtomicUsize,
    max_concurrent: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    session_resets: AtomicU64,
}

/// Point-in-time copy of `RunnerStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub running: usize,
    pub max_concurrent: usize,
    pub completed: u64,
    pub failed: u64,
    pub session_resets: u64,
}

impl RunnerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running: self.running.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            session_resets: self.session_resets.load(Ordering::SeqCst),
        }
    }

    fn enter(&self) -> RunningGuard<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        RunningGuard(self)
    }
}

struct RunningGuard<'a>(&'a RunnerStats);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct StepsOutcome {
    steps: Vec<StepRecord>,
    artifacts: Vec<ArtifactRef>,
    failure: Option<SessionError>,
}

/// Drains the execution queue one task at a time.
pub struct TaskRunner {
    store: Arc<TaskStore>,
    queue: Arc<ExecutionQueue>,
    slot: Arc<SessionSlot>,
    artifacts: Arc<dyn ArtifactStore>,
    planner: Arc<dyn StepPlanner>,
    stats: Arc<RunnerStats>,
    settings: RunnerSettings,
}

impl TaskRunner {
    pub fn new(
        store: Arc<TaskStore>,
        queue: Arc<ExecutionQueue>,
        slot: Arc<SessionSlot>,
        artifacts: Arc<dyn ArtifactStore>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            slot,
            artifacts,
            planner: Arc::new(DirectPlanner::new()),
            stats: Arc::new(RunnerStats::default()),
            settings,
        }
    }

    /// Replace the default planner.
    pub fn with_planner(mut self, planner: Arc<dyn StepPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        Arc::clone(&self.stats)
    }

    /// Execute queued tasks until `shutdown` fires or the queue closes.
    ///
    /// Returns an error only for internal faults (the store rejecting a
    /// transition the runner itself made valid).
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<(), Error> {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                id = self.queue.pop() => id,
            };
            let Some(id) = next else {
                debug!("Runner loop exiting");
                return Ok(());
            };
            self.execute(id).await?;
        }
    }

    /// Run one task to its terminal state. Returns `None` if the task was
    /// no longer queued (cancelled or evicted).
    pub async fn execute(&self, id: Uuid) -> Result<Option<TaskStatus>, Error> {
        let record = match self.store.transition(id, TaskStatus::Running).await {
            Ok(record) => record,
            Err(
                e @ (TaskError::NotFound { .. }
                | TaskError::AlreadyTerminal { .. }
                | TaskError::InvalidTransition { .. }),
            ) => {
                debug!(task_id = %id, reason = %e, "Skipping task that is no longer queued");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let _running = self.stats.enter();
        info!(task_id = %id, "Task started");
        self.progress(id, "Task started").await;

        let plan = match self.planner.plan(&record.request).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(task_id = %id, error = %e, "Planning failed");
                let result = TaskResult::failed(Vec::new(), Vec::new(), e.to_string());
                return self.finish(id, TaskStatus::Error, result).await;
            }
        };
        self.progress(id, format!("Planned {} step(s)", plan.len()))
            .await;

        let mut guard = match self.slot.acquire(id).await {
            Ok(guard) => guard,
            Err(e) => {
                let result = TaskResult::failed(Vec::new(), Vec::new(), e.to_string());
                return self.finish(id, TaskStatus::Error, result).await;
            }
        };

        let mut outcome = self.run_steps(id, &plan, &mut guard).await;
        let (status, result) = match outcome.failure.take() {
            None => (
                TaskStatus::Completed,
                TaskResult::completed(outcome.steps, outcome.artifacts),
            ),
            Some(err) => {
                if err.is_fatal() || !self.probe(&mut guard).await {
                    error!(task_id = %id, error = %err, "Automation session lost; resetting");
                    guard.discard(&err.to_string()).await;
                    self.stats.session_resets.fetch_add(1, Ordering::SeqCst);
                    self.progress(id, "Automation session reset").await;
                } else if let Some(last) = outcome.steps.last_mut()
                    && let Ok(Some(artifact)) = self.capture(id, last.index, &mut guard).await
                {
                    last.artifact = Some(artifact.clone());
                    outcome.artifacts.push(artifact);
                }
                (
                    TaskStatus::Error,
                    TaskResult::failed(outcome.steps, outcome.artifacts, err.to_string()),
                )
            }
        };
        drop(guard);

        self.finish(id, status, result).await
    }

    /// Drop the session so the next task starts from a fresh one.
    pub async fn reset_session(&self, reason: &str) {
        self.slot.reset(reason).await;
    }

    /// Finish every task left `running` by a runner that died mid-task.
    /// Only one runner exists, so between runs nothing is legitimately running.
    pub async fn fail_interrupted(&self) -> usize {
        let mut failed = 0;
        for record in self.store.list().await {
            if record.status != TaskStatus::Running {
                continue;
            }
            let result = TaskResult::failed(Vec::new(), Vec::new(), "task runner restarted");
            match self.store.finish(record.id, TaskStatus::Error, result).await {
                Ok(_) => {
                    warn!(task_id = %record.id, "Failed task interrupted by runner restart");
                    self.stats.failed.fetch_add(1, Ordering::SeqCst);
                    failed += 1;
                }
                Err(e) => debug!(task_id = %record.id, error = %e, "Interrupted task already gone"),
            }
        }
        failed
    }

    async fn run_steps(
        &self,
        id: Uuid,
        plan: &[Action],
        guard: &mut SessionGuard<'_>,
    ) -> StepsOutcome {
        let total = plan.len();
        let mut outcome = StepsOutcome::default();

        for (index, action) in plan.iter().enumerate() {
            let record = StepRecord::new(index, action);
            let started = Instant::now();
            debug!(task_id = %id, step = index, action = action.label(), "Running step");

            match self.perform(guard, action).await {
                Ok((output, shot)) => {
                    let mut step = record.succeed(output.message, started.elapsed());
                    self.progress(
                        id,
                        format!("Step {}/{total}: {} succeeded", index + 1, action.describe()),
                    )
                    .await;

                    let artifact = match shot {
                        Some(bytes) => self.store_screenshot(id, index, bytes).await,
                        None if self.settings.capture_each_step => {
                            match self.capture(id, index, guard).await {
                                Ok(artifact) => artifact,
                                Err(e) => {
                                    outcome.steps.push(step);
                                    outcome.failure = Some(e);
                                    return outcome;
                                }
                            }
                        }
                        None => None,
                    };
                    if let Some(artifact) = artifact {
                        step.artifact = Some(artifact.clone());
                        outcome.artifacts.push(artifact);
                    }
                    outcome.steps.push(step);
                }
                Err(e) => {
                    warn!(task_id = %id, step = index, error = %e, "Step failed");
                    outcome
                        .steps
                        .push(record.fail(e.to_string(), started.elapsed()));
                    self.progress(
                        id,
                        format!("Step {}/{total}: {} failed: {e}", index + 1, action.describe()),
                    )
                    .await;
                    outcome.failure = Some(e);
                    return outcome;
                }
            }
        }
        outcome
    }

    /// Run one action under the step timeout. Screenshot actions hand back
    /// the captured bytes.
    async fn perform(
        &self,
        guard: &mut SessionGuard<'_>,
        action: &Action,
    ) -> Result<(StepOutput, Option<Vec<u8>>), SessionError> {
        let timeout = self.settings.step_timeout;
        let session = guard.session()?;

        let call = async {
            match action {
                Action::Navigate { url } => session.navigate(url).await.map(|out| (out, None)),
                Action::Screenshot => session.screenshot().await.map(|bytes| {
                    let out = StepOutput::new(format!("Captured {} bytes", bytes.len()));
                    (out, Some(bytes))
                }),
                other => session.act(other).await.map(|out| (out, None)),
            }
        };

        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout {
                action: action.label().to_string(),
                timeout,
            }),
        }
    }

    /// Best-effort screenshot. Only a fatal session error is returned.
    async fn capture(
        &self,
        id: Uuid,
        step: usize,
        guard: &mut SessionGuard<'_>,
    ) -> Result<Option<ArtifactRef>, SessionError> {
        let session = guard.session()?;
        match tokio::time::timeout(self.settings.step_timeout, session.screenshot()).await {
            Ok(Ok(bytes)) => Ok(self.store_screenshot(id, step, bytes).await),
            Ok(Err(e)) if e.is_fatal() => Err(e),
            Ok(Err(e)) => {
                warn!(task_id = %id, error = %e, "Screenshot capture failed");
                Ok(None)
            }
            Err(_) => {
                warn!(task_id = %id, "Screenshot capture timed out");
                Ok(None)
            }
        }
    }

    async fn store_screenshot(
        &self,
        id: Uuid,
        step: usize,
        bytes: Vec<u8>,
    ) -> Option<ArtifactRef> {
        match self.artifacts.put(SCREENSHOT_CONTENT_TYPE, bytes).await {
            Ok(artifact) => Some(artifact.for_step(step)),
            Err(e) => {
                warn!(task_id = %id, error = %e, "Failed to store screenshot");
                None
            }
        }
    }

    /// Ask the session whether it is still usable after a failed step.
    async fn probe(&self, guard: &mut SessionGuard<'_>) -> bool {
        let Ok(session) = guard.session() else {
            return false;
        };
        matches!(
            tokio::time::timeout(self.settings.step_timeout, session.status()).await,
            Ok(Ok(status)) if status.healthy
        )
    }

    async fn progress(&self, id: Uuid, message: impl Into<String>) {
        if let Err(e) = self.store.append_progress(id, message).await {
            debug!(task_id = %id, error = %e, "Progress not recorded");
        }
    }

    async fn finish(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: TaskResult,
    ) -> Result<Option<TaskStatus>, Error> {
        match status {
            TaskStatus::Completed => self.stats.completed.fetch_add(1, Ordering::SeqCst),
            _ => self.stats.failed.fetch_add(1, Ordering::SeqCst),
        };
        let summary = match &result.error {
            Some(error) => format!("{}: {error}", result.summary),
            None => result.summary.clone(),
        };
        self.progress(id, format!("Task {status}: {summary}")).await;

        let artifacts: Vec<Uuid> = result.artifacts.iter().map(|a| a.id).collect();
        match self.store.finish(id, status, result).await {
            Ok(_) => {
                info!(task_id = %id, status = %status, "Task finished");
                Ok(Some(status))
            }
            Err(TaskError::NotFound { .. }) => {
                // No record will ever point at these screenshots again.
                warn!(
                    task_id = %id,
                    artifacts = artifacts.len(),
                    "Task evicted before it finished"
                );
                for artifact in artifacts {
                    if let Err(e) = self.artifacts.delete(artifact).await {
                        warn!(
                            task_id = %id,
                            artifact_id = %artifact,
                            error = %e,
                            "Failed to delete orphaned artifact"
                        );
                    }
                }
                Ok(Some(status))
            }
            Err(e) => Err(e.into()),
        }
    }
}
