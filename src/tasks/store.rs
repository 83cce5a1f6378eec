//! Task store: the only owner of task records.
//!
//! Every operation is one short critical section on a single `RwLock`; no
//! lock is ever held across a session call. Callers get cloned snapshots,
//! never references into the map. Mutations are broadcast as `TaskEvent`s.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::{ProgressEntry, TaskEvent, TaskRecord, TaskResult, TaskStatus};
use crate::error::TaskError;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// In-memory task records keyed by id.
pub struct TaskStore {
    tasks: RwLock<HashMap<Uuid, TaskRecord>>,
    /// Records older than this read as absent even before the reaper runs.
    max_age: chrono::Duration,
    tx: broadcast::Sender<TaskEvent>,
}

impl TaskStore {
    /// Create an empty store whose records expire after `max_age`.
    pub fn new(max_age: Duration) -> Self {
        Self::with_capacity(max_age, DEFAULT_BROADCAST_CAPACITY)
    }

    /// Same as `new`, buffering at most `capacity` undelivered events per
    /// subscriber.
    pub fn with_capacity(max_age: Duration, capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tasks: RwLock::new(HashMap::new()),
            max_age: to_chrono(max_age),
            tx,
        }
    }

    /// Subscribe to change notifications for every task.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Insert a new record.
    pub async fn create(&self, record: TaskRecord) -> Result<Uuid, TaskError> {
        let id = record.id;
        let status = record.status;
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&id) {
                return Err(TaskError::Duplicate { id });
            }
            tasks.insert(id, record);
            let _ = self.tx.send(TaskEvent::StatusChanged {
                task_id: id,
                status,
            });
        }
        debug!(task_id = %id, "Task record created");
        Ok(id)
    }

    /// Mutate a live record in place and bump `updated_at`.
    pub async fn update<F, R>(&self, id: Uuid, f: F) -> Result<R, TaskError>
    where
        F: FnOnce(&mut TaskRecord) -> R,
    {
        let mut tasks = self.tasks.write().await;
        let record = self.live_mut(&mut tasks, id)?;
        let out = f(&mut *record);
        record.updated_at = Utc::now();
        Ok(out)
    }

    /// Append a progress message to a task.
    pub async fn append_progress(
        &self,
        id: Uuid,
        message: impl Into<String>,
    ) -> Result<ProgressEntry, TaskError> {
        let mut tasks = self.tasks.write().await;
        let record = self.live_mut(&mut tasks, id)?;
        let entry = record.push_progress(message);
        record.updated_at = entry.timestamp.max(Utc::now());
        let _ = self.tx.send(TaskEvent::Progress {
            task_id: id,
            entry: entry.clone(),
        });
        Ok(entry)
    }

    /// Move a task to a non-terminal status. Returns the updated snapshot.
    pub async fn transition(&self, id: Uuid, status: TaskStatus) -> Result<TaskRecord, TaskError> {
        let mut tasks = self.tasks.write().await;
        let record = self.live_mut(&mut tasks, id)?;
        record.transition_to(status)?;
        record.updated_at = Utc::now();
        let _ = self.tx.send(TaskEvent::StatusChanged {
            task_id: id,
            status,
        });
        Ok(record.clone())
    }

    /// Move a task to a terminal status and set its result in one step.
    pub async fn finish(
        &self,
        id: Uuid,
        status: TaskStatus,
        result: TaskResult,
    ) -> Result<TaskRecord, TaskError> {
        let mut tasks = self.tasks.write().await;
        let record = self.live_mut(&mut tasks, id)?;
        record.finish(status, result)?;
        record.updated_at = Utc::now();
        let _ = self.tx.send(TaskEvent::StatusChanged {
            task_id: id,
            status,
        });
        Ok(record.clone())
    }

    /// Snapshot of one task. Expired records read as absent.
    pub async fn get(&self, id: Uuid) -> Option<TaskRecord> {
        let now = Utc::now();
        self.tasks
            .read()
            .await
            .get(&id)
            .filter(|r| !r.is_expired(now, self.max_age))
            .cloned()
    }

    /// Snapshots of every live task, oldest first.
    pub async fn list(&self) -> Vec<TaskRecord> {
        let now = Utc::now();
        let mut records: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|r| !r.is_expired(now, self.max_age))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Remove a task outright.
    pub async fn delete(&self, id: Uuid) -> Option<TaskRecord> {
        let removed = self.tasks.write().await.remove(&id);
        if removed.is_some() {
            let _ = self.tx.send(TaskEvent::Evicted { task_id: id });
        }
        removed
    }

    /// Remove and return every record older than `max_age`, whatever its
    /// status.
    pub async fn evict_older_than(&self, max_age: Duration) -> Vec<TaskRecord> {
        let now = Utc::now();
        let max_age = to_chrono(max_age);

        let evicted: Vec<TaskRecord> = {
            let mut tasks = self.tasks.write().await;
            let expired: Vec<Uuid> = tasks
                .values()
                .filter(|r| r.is_expired(now, max_age))
                .map(|r| r.id)
                .collect();
            expired
                .into_iter()
                .filter_map(|id| tasks.remove(&id))
                .collect()
        };

        for record in &evicted {
            debug!(task_id = %record.id, status = %record.status, "Task evicted");
            let _ = self.tx.send(TaskEvent::Evicted { task_id: record.id });
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted expired tasks");
        }
        evicted
    }

    /// Number of records held, expired or not.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    fn live_mut<'a>(
        &self,
        tasks: &'a mut HashMap<Uuid, TaskRecord>,
        id: Uuid,
    ) -> Result<&'a mut TaskRecord, TaskError> {
        let now = Utc::now();
        tasks
            .get_mut(&id)
            .filter(|r| !r.is_expired(now, self.max_age))
            .ok_or(TaskError::NotFound { id })
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
