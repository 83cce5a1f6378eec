//! Periodic eviction of old tasks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::store::TaskStore;
use crate::artifacts::ArtifactStore;

/// Outcome of one eviction cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub evicted: usize,
    pub artifacts_deleted: usize,
    pub artifact_failures: usize,
}

/// Evicts every task older than `max_age` once per `interval`.
pub struct Reaper {
    store: Arc<TaskStore>,
    artifacts: Arc<dyn ArtifactStore>,
    interval: Duration,
    max_age: Duration,
}

impl Reaper {
    pub fn new(
        store: Arc<TaskStore>,
        artifacts: Arc<dyn ArtifactStore>,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            interval,
            max_age,
        }
    }

    /// Run one eviction cycle now.
    pub async fn run_cycle(&self) -> ReapReport {
        let evicted = self.store.evict_older_than(self.max_age).await;
        let mut report = ReapReport {
            evicted: evicted.len(),
            ..Default::default()
        };

        for record in &evicted {
            let Some(result) = &record.result else {
                continue;
            };
            for artifact in &result.artifacts {
                match self.artifacts.delete(artifact.id).await {
                    Ok(()) => report.artifacts_deleted += 1,
                    Err(e) => {
                        report.artifact_failures += 1;
                        warn!(
                            task_id = %record.id,
                            artifact_id = %artifact.id,
                            error = %e,
                            "Failed to delete artifact of evicted task"
                        );
                    }
                }
            }
        }
        report
    }

    /// Start the background loop. The first cycle runs one `interval` from now.
    pub fn start(self) -> ReaperHandle {
        let token = CancellationToken::new();
        let child = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            info!(
                interval_secs = self.interval.as_secs(),
                max_age_secs = self.max_age.as_secs(),
                "Reaper started"
            );
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                    Ok(report) if report.artifact_failures > 0 => {
                        warn!(
                            failures = report.artifact_failures,
                            "Reaper cycle finished with errors"
                        );
                    }
                    Ok(_) => {}
                    Err(_) => error!("Reaper cycle panicked; continuing"),
                }
            }
            info!("Reaper stopped");
        });

        ReaperHandle { token, join }
    }
}

/// Owned handle to a running reaper.
pub struct ReaperHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Reaper task ended abnormally");
        }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }
}
