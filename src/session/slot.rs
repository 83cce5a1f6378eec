//! Guarded singleton around the one automation session.
//!
//! The session is only reachable through a `SessionGuard`, which holds the
//! slot's mutex for as long as one task runs. The guard is released on every
//! path when it is dropped. A broken session is discarded through the guard
//! and the next `acquire` launches a fresh one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{AutomationSession, SessionDriver};
use crate::error::SessionError;

/// Whether a session exists and whether a task holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No live session; one is launched on next use.
    Absent,
    /// Live and unused.
    Idle,
    /// Held by a running task.
    Busy,
}

/// Point-in-time description of the slot, readable without waiting on the
/// running task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub state: SessionState,
    pub driver: String,
    pub current_task: Option<Uuid>,
    pub launched_at: Option<DateTime<Utc>>,
    /// Sessions launched since startup.
    pub launches: u64,
    /// Sessions discarded after failing.
    pub resets: u64,
    pub last_error: Option<String>,
}

/// Owner of the single automation session.
pub struct SessionSlot {
    driver: Arc<dyn SessionDriver>,
    session: Mutex<Option<Box<dyn AutomationSession>>>,
    info: watch::Sender<SessionInfo>,
    launch_timeout: Duration,
}

impl SessionSlot {
    /// Create an empty slot. No session is launched until first use.
    pub fn new(driver: Arc<dyn SessionDriver>, launch_timeout: Duration) -> Self {
        let (info, _rx) = watch::channel(SessionInfo {
            state: SessionState::Absent,
            driver: driver.name().to_string(),
            current_task: None,
            launched_at: None,
            launches: 0,
            resets: 0,
            last_error: None,
        });
        Self {
            driver,
            session: Mutex::new(None),
            info,
            launch_timeout,
        }
    }

    /// Current slot state.
    pub fn info(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    /// Take exclusive use of the session for `task_id`, launching one if
    /// none is live. Waits while another task holds the slot.
    pub async fn acquire(&self, task_id: Uuid) -> Result<SessionGuard<'_>, SessionError> {
        let mut lock = self.session.lock().await;
        if lock.is_none() {
            *lock = Some(self.launch().await?);
        }
        self.info.send_modify(|info| {
            info.state = SessionState::Busy;
            info.current_task = Some(task_id);
        });
        Ok(SessionGuard { slot: self, lock })
    }

    /// Make sure a session is live. Returns the current info without waiting
    /// if a task is holding the slot.
    pub async fn start(&self) -> Result<SessionInfo, SessionError> {
        let Ok(mut lock) = self.session.try_lock() else {
            return Ok(self.info());
        };
        if lock.is_none() {
            *lock = Some(self.launch().await?);
            self.info.send_modify(|info| info.state = SessionState::Idle);
        }
        Ok(self.info())
    }

    /// Close the live session, if any. Waits for the running task to finish.
    pub async fn shutdown(&self) {
        let mut lock = self.session.lock().await;
        if let Some(session) = lock.take() {
            self.quit(session, "shutdown").await;
            info!("Automation session closed");
        }
        self.info.send_modify(|info| {
            info.state = SessionState::Absent;
            info.current_task = None;
        });
    }

    /// Throw away the idle session, if any, so the next task launches a
    /// fresh one. Waits for the running task to release the slot.
    pub async fn reset(&self, reason: &str) {
        let mut lock = self.session.lock().await;
        if let Some(session) = lock.take() {
            self.quit(session, "reset").await;
            self.discarded(reason);
        }
    }

    /// Quit a session that is being dropped. Bounded by the launch timeout;
    /// a session that does not answer is abandoned.
    async fn quit(&self, mut session: Box<dyn AutomationSession>, context: &str) {
        match tokio::time::timeout(self.launch_timeout, session.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(context, error = %e, "Failed to quit automation session"),
            Err(_) => warn!(
                context,
                timeout_ms = self.launch_timeout.as_millis() as u64,
                "Automation session did not quit in time; abandoning it"
            ),
        }
    }

    fn discarded(&self, reason: &str) {
        error!(reason = %reason, "Automation session discarded");
        self.info.send_modify(|info| {
            info.resets += 1;
            info.launched_at = None;
            info.last_error = Some(reason.to_string());
        });
    }

    async fn launch(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        info!(driver = %self.driver.name(), "Launching automation session");
        let result = match tokio::time::timeout(self.launch_timeout, self.driver.launch()).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Launch(format!(
                "launch timed out after {:?}",
                self.launch_timeout
            ))),
        };

        match result {
            Ok(session) => {
                self.info.send_modify(|info| {
                    info.launches += 1;
                    info.launched_at = Some(Utc::now());
                    info.last_error = None;
                });
                Ok(session)
            }
            Err(e) => {
                error!(
                    driver = %self.driver.name(),
                    error = %e,
                    "Automation session launch failed"
                );
                self.info.send_modify(|info| {
                    info.state = SessionState::Absent;
                    info.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }
}

/// Exclusive handle to the live session, held for the duration of one task.
pub struct SessionGuard<'a> {
    slot: &'a SessionSlot,
    lock: MutexGuard<'a, Option<Box<dyn AutomationSession>>>,
}

impl SessionGuard<'_> {
    /// The live session. Fails once the session has been discarded.
    pub fn session(&mut self) -> Result<&mut (dyn AutomationSession + 'static), SessionError> {
        self.lock
            .as_deref_mut()
            .ok_or_else(|| SessionError::Disconnected("session was discarded".to_string()))
    }

    /// Throw away a broken session so the next task launches a fresh one.
    pub async fn discard(&mut self, reason: &str) {
        if let Some(session) = self.lock.take() {
            self.slot.quit(session, "discard").await;
        }
        self.slot.discarded(reason);
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let state = if self.lock.is_some() {
            SessionState::Idle
        } else {
            SessionState::Absent
        };
        self.slot.info.send_modify(|info| {
            info.state = state;
            info.current_task = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockDriver;

    fn slot(driver: MockDriver) -> SessionSlot {
        SessionSlot::new(Arc::new(driver), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn launches_lazily_on_first_acquire() {
        let driver = MockDriver::new();
        let slot = slot(driver.clone());
        assert_eq!(slot.info().state, SessionState::Absent);
        assert_eq!(driver.launches(), 0);

        let task = Uuid::new_v4();
        {
            let guard = slot.acquire(task).await.unwrap();
            assert_eq!(slot.info().state, SessionState::Busy);
            assert_eq!(slot.info().current_task, Some(task));
            drop(guard);
        }
        assert_eq!(slot.info().state, SessionState::Idle);
        assert_eq!(slot.info().current_task, None);

        // Reused, not relaunched.
        let _guard = slot.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn discarded_session_is_relaunched() {
        let driver = MockDriver::new();
        let slot = slot(driver.clone());

        {
            let mut guard = slot.acquire(Uuid::new_v4()).await.unwrap();
            guard.discard("browser crashed").await;
            assert!(guard.session().is_err());
        }
        let info = slot.info();
        assert_eq!(info.state, SessionState::Absent);
        assert_eq!(info.resets, 1);
        assert_eq!(info.last_error.as_deref(), Some("browser crashed"));
        assert_eq!(driver.quits(), 1);

        let mut guard = slot.acquire(Uuid::new_v4()).await.unwrap();
        assert!(guard.session().is_ok());
        assert_eq!(driver.launches(), 2);
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let slot = Arc::new(slot(MockDriver::new()));
        let guard = slot.acquire(Uuid::new_v4()).await.unwrap();

        let waiter = {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let _guard = slot.acquire(Uuid::new_v4()).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after release")
            .unwrap();
    }

    #[tokio::test]
    async fn launch_failure_is_reported() {
        let slot = slot(MockDriver::new().failing_launches(1));
        let err = slot.acquire(Uuid::new_v4()).await.err().unwrap();
        assert!(err.is_fatal());
        assert_eq!(slot.info().state, SessionState::Absent);
        assert!(slot.info().last_error.is_some());

        // Next attempt succeeds.
        assert!(slot.acquire(Uuid::new_v4()).await.is_ok());
    }

    #[tokio::test]
    async fn start_does_not_wait_for_busy_slot() {
        let driver = MockDriver::new();
        let slot = slot(driver.clone());

        let info = slot.start().await.unwrap();
        assert_eq!(info.state, SessionState::Idle);
        assert_eq!(info.launches, 1);

        let _guard = slot.acquire(Uuid::new_v4()).await.unwrap();
        let info = tokio::time::timeout(Duration::from_millis(200), slot.start())
            .await
            .expect("start must not block")
            .unwrap();
        assert_eq!(info.state, SessionState::Busy);
        assert_eq!(driver.launches(), 1);
    }

    #[tokio::test]
    async fn unresponsive_session_is_abandoned() {
        let driver = MockDriver::new().unresponsive();
        let slot = SessionSlot::new(Arc::new(driver.clone()), Duration::from_millis(100));

        let mut guard = slot.acquire(Uuid::new_v4()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), guard.discard("hung"))
            .await
            .expect("discard must not wait on a hung quit");
        drop(guard);
        assert_eq!(slot.info().resets, 1);
        assert_eq!(slot.info().state, SessionState::Absent);

        slot.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), slot.shutdown())
            .await
            .expect("shutdown must not wait on a hung quit");
        assert_eq!(driver.launches(), 2);
    }

    #[tokio::test]
    async fn reset_drops_idle_session() {
        let driver = MockDriver::new();
        let slot = slot(driver.clone());

        slot.reset("nothing to drop").await;
        assert_eq!(slot.info().resets, 0);

        slot.start().await.unwrap();
        slot.reset("runner restarted").await;
        assert_eq!(driver.quits(), 1);
        assert_eq!(slot.info().resets, 1);
        assert_eq!(slot.info().last_error.as_deref(), Some("runner restarted"));

        drop(slot.acquire(Uuid::new_v4()).await.unwrap());
        assert_eq!(driver.launches(), 2);
    }

    #[tokio::test]
    async fn shutdown_quits_session() {
        let driver = MockDriver::new();
        let slot = slot(driver.clone());
        slot.start().await.unwrap();
        slot.shutdown().await;
        assert_eq!(driver.quits(), 1);
        assert_eq!(slot.info().state, SessionState::Absent);
    }
}
