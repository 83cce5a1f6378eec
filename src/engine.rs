//! Wiring: builds the store, queue, session slot, runner and service from an
//! `EngineConfig`, and owns the background tasks once started.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{TaskService, task_routes};
use crate::artifacts::{ArtifactStore, FsArtifactStore, MemoryArtifactStore};
use crate::config::EngineConfig;
use crate::error::ArtifactError;
use crate::session::{SessionDriver, SessionSlot};
use crate::tasks::{Reaper, ReaperHandle, TaskStore};
use crate::worker::{
    ExecutionQueue, RunnerSettings, StepPlanner, Supervisor, SupervisorHandle, TaskRunner,
};

/// How long a session launch may take before it counts as failed.
const SESSION_LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// All engine components, not yet running.
pub struct Engine {
    config: EngineConfig,
    store: Arc<TaskStore>,
    queue: Arc<ExecutionQueue>,
    slot: Arc<SessionSlot>,
    artifacts: Arc<dyn ArtifactStore>,
    runner: Arc<TaskRunner>,
    service: Arc<TaskService>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        driver: Arc<dyn SessionDriver>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self::build(config, driver, artifacts, None)
    }

    /// Same as `new`, with a custom step planner.
    pub fn with_planner(
        config: EngineConfig,
        driver: Arc<dyn SessionDriver>,
        artifacts: Arc<dyn ArtifactStore>,
        planner: Arc<dyn StepPlanner>,
    ) -> Self {
        Self::build(config, driver, artifacts, Some(planner))
    }

    fn build(
        config: EngineConfig,
        driver: Arc<dyn SessionDriver>,
        artifacts: Arc<dyn ArtifactStore>,
        planner: Option<Arc<dyn StepPlanner>>,
    ) -> Self {
        let store = Arc::new(TaskStore::new(config.max_task_age));
        let queue = Arc::new(ExecutionQueue::new());
        let slot = Arc::new(SessionSlot::new(driver, SESSION_LAUNCH_TIMEOUT));

        let mut runner = TaskRunner::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&slot),
            Arc::clone(&artifacts),
            RunnerSettings::from(&config),
        );
        if let Some(planner) = planner {
            runner = runner.with_planner(planner);
        }
        let runner = Arc::new(runner);

        let service = Arc::new(TaskService::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&slot),
            Arc::clone(&artifacts),
            runner.stats(),
        ));

        Self {
            config,
            store,
            queue,
            slot,
            artifacts,
            runner,
            service,
        }
    }

    /// Artifact store chosen by `artifact_dir`: a directory if set, memory
    /// otherwise.
    pub async fn artifacts_from_config(
        config: &EngineConfig,
    ) -> Result<Arc<dyn ArtifactStore>, ArtifactError> {
        match &config.artifact_dir {
            Some(dir) => Ok(Arc::new(FsArtifactStore::open(dir).await?)),
            None => Ok(Arc::new(MemoryArtifactStore::new())),
        }
    }

    pub fn service(&self) -> Arc<TaskService> {
        Arc::clone(&self.service)
    }

    pub fn store(&self) -> Arc<TaskStore> {
        Arc::clone(&self.store)
    }

    /// HTTP router over the service, with permissive CORS.
    pub fn router(&self) -> Router {
        task_routes(self.service()).layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
    }

    /// Start the runner and the reaper.
    pub fn start(&self) -> EngineHandle {
        let supervisor = Supervisor::new(Arc::clone(&self.runner)).start();
        let reaper = Reaper::new(
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            self.config.reaper_interval,
            self.config.max_task_age,
        )
        .start();

        EngineHandle {
            queue: Arc::clone(&self.queue),
            slot: Arc::clone(&self.slot),
            supervisor,
            reaper,
        }
    }
}

/// Background tasks of a started engine.
pub struct EngineHandle {
    queue: Arc<ExecutionQueue>,
    slot: Arc<SessionSlot>,
    supervisor: SupervisorHandle,
    reaper: ReaperHandle,
}

impl EngineHandle {
    /// Stop accepting tasks, let the current one finish, stop the reaper and
    /// close the session.
    pub async fn shutdown(self) {
        self.queue.close().await;
        self.supervisor.stop().await;
        self.reaper.stop().await;
        self.slot.shutdown().await;
        info!("Engine stopped");
    }
}
