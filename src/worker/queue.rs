//! FIFO execution queue of task ids.
//!
//! Submitters push without waiting on execution; the runner pops, waiting
//! while the queue is empty.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::TaskError;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Uuid>,
    closed: bool,
}

/// Pending task ids in submission order.
#[derive(Default)]
pub struct ExecutionQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task id. Fails once the queue has been closed.
    pub async fn push(&self, id: Uuid) -> Result<(), TaskError> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(TaskError::QueueClosed);
            }
            state.items.push_back(id);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drop a task id that has not been popped yet. Returns whether it was
    /// still queued.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        match state.items.iter().position(|queued| *queued == id) {
            Some(index) => {
                state.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Take the oldest id, waiting until one is available. Returns `None`
    /// once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Uuid> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if let Some(id) = state.items.pop_front() {
                    return Some(id);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Refuse further pushes and wake every waiting `pop`.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Zero-based position of a queued id.
    pub async fn position(&self, id: Uuid) -> Option<usize> {
        self.state
            .lock()
            .await
            .items
            .iter()
            .position(|queued| *queued == id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.items.is_empty()
    }
}
