//! Keeps the task runner alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::runner::TaskRunner;

/// Runs the runner loop in its own task and restarts it after a panic or an
/// internal error, until stopped.
pub struct Supervisor {
    runner: Arc<TaskRunner>,
    restart_delay: Duration,
}

impl Supervisor {
    pub fn new(runner: Arc<TaskRunner>) -> Self {
        Self {
            runner,
            restart_delay: Duration::from_secs(1),
        }
    }

    /// Pause between a crash and the restart.
    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn start(self) -> SupervisorHandle {
        let token = CancellationToken::new();
        let restarts = Arc::new(AtomicU64::new(0));

        let join = {
            let token = token.clone();
            let restarts = Arc::clone(&restarts);
            tokio::spawn(async move {
                info!("Task runner started");
                loop {
                    let runner = Arc::clone(&self.runner);
                    let run_token = token.clone();
                    let outcome =
                        tokio::spawn(async move { runner.run(&run_token).await }).await;

                    match outcome {
                        Ok(Ok(())) => break,
                        Ok(Err(e)) => error!(error = %e, "Task runner failed"),
                        Err(e) if e.is_panic() => error!("Task runner panicked"),
                        Err(e) => {
                            warn!(error = %e, "Task runner aborted");
                            break;
                        }
                    }

                    // The crash may have left the browser mid-step.
                    self.runner.reset_session("task runner restarted").await;
                    let interrupted = self.runner.fail_interrupted().await;
                    if token.is_cancelled() {
                        break;
                    }
                    restarts.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        interrupted,
                        delay_ms = self.restart_delay.as_millis() as u64,
                        "Restarting task runner"
                    );
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.restart_delay) => {}
                    }
                }
                info!("Task runner stopped");
            })
        };

        SupervisorHandle {
            token,
            join,
            restarts,
        }
    }
}

/// Owned handle to the supervised runner.
pub struct SupervisorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
    restarts: Arc<AtomicU64>,
}

impl SupervisorHandle {
    /// How many times the runner has been restarted.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Stop after the current task finishes and wait for the loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Supervisor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::artifacts::MemoryArtifactStore;
    use crate::error::PlanError;
    use crate::session::{Action, MockDriver, SessionSlot};
    use crate::tasks::model::{TaskRecord, TaskRequest, TaskStatus};
    use crate::tasks::store::TaskStore;
    use crate::worker::plan::{DirectPlanner, StepPlanner};
    use crate::worker::queue::ExecutionQueue;
    use crate::worker::runner::RunnerSettings;

    /// Panics on instructions that ask for it, otherwise plans directly.
    struct FragilePlanner(DirectPlanner);

    #[async_trait]
    impl StepPlanner for FragilePlanner {
        async fn plan(&self, request: &TaskRequest) -> Result<Vec<Action>, PlanError> {
            if request.instruction == "explode" {
                panic!("planner exploded");
            }
            self.0.plan(request).await
        }
    }

    async fn wait_terminal(store: &TaskStore, id: uuid::Uuid) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !store.get(id).await.unwrap().status.is_terminal() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("task should finish");
    }

    #[tokio::test]
    async fn restarts_after_panic() {
        let store = Arc::new(TaskStore::new(Duration::from_secs(3600)));
        let queue = Arc::new(ExecutionQueue::new());
        let driver = MockDriver::new();
        let slot = Arc::new(SessionSlot::new(
            Arc::new(driver.clone()),
            Duration::from_secs(5),
        ));
        let runner = TaskRunner::new(
            store.clone(),
            queue.clone(),
            slot.clone(),
            Arc::new(MemoryArtifactStore::new()),
            RunnerSettings::default(),
        )
        .with_planner(Arc::new(FragilePlanner(DirectPlanner::new())));

        let handle = Supervisor::new(Arc::new(runner))
            .with_restart_delay(Duration::from_millis(10))
            .start();

        let warmup = store
            .create(TaskRecord::new(
                TaskRequest::new("warm up").with_url("https://example.com"),
            ))
            .await
            .unwrap();
        queue.push(warmup).await.unwrap();
        wait_terminal(&store, warmup).await;
        assert_eq!(driver.launches(), 1);

        let boom = store
            .create(TaskRecord::new(TaskRequest::new("explode")))
            .await
            .unwrap();
        queue.push(boom).await.unwrap();
        let fine = store
            .create(TaskRecord::new(
                TaskRequest::new("open it").with_url("https://example.com"),
            ))
            .await
            .unwrap();
        queue.push(fine).await.unwrap();

        wait_terminal(&store, fine).await;

        let crashed = store.get(boom).await.unwrap();
        assert_eq!(crashed.status, TaskStatus::Error);
        assert!(
            crashed
                .result
                .unwrap()
                .error
                .unwrap()
                .contains("restarted")
        );
        assert_eq!(store.get(fine).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(handle.restarts(), 1);
        // The session in use before the crash was replaced.
        assert_eq!(slot.info().resets, 1);
        assert_eq!(driver.launches(), 2);
        assert_eq!(driver.quits(), 1);

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("supervisor should stop");
    }

    #[tokio::test]
    async fn exits_when_queue_closes() {
        let store = Arc::new(TaskStore::new(Duration::from_secs(3600)));
        let queue = Arc::new(ExecutionQueue::new());
        let slot = Arc::new(SessionSlot::new(
            Arc::new(MockDriver::new()),
            Duration::from_secs(5),
        ));
        let runner = TaskRunner::new(
            store,
            queue.clone(),
            slot,
            Arc::new(MemoryArtifactStore::new()),
            RunnerSettings::default(),
        );
        let handle = Supervisor::new(Arc::new(runner)).start();

        queue.close().await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("supervisor should exit");
    }
}
