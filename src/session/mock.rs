//! Scriptable in-process driver.
//!
//! Behaves like a browser that always succeeds, except where the script says
//! otherwise: selectors can be made to fail, hang, block on a semaphore, or
//! kill the session outright, and a session can stop answering `status`
//! and `quit` altogether. Counters record launches, quits and how many
//! calls were ever in flight at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use super::{Action, AutomationSession, SessionDriver, SessionStatus, StepOutput};
use crate::error::SessionError;

/// Eight-byte PNG signature, enough for an artifact round trip.
pub const FAKE_PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

#[derive(Clone, Default)]
struct MockScript {
    missing: Vec<String>,
    disconnect: Vec<String>,
    crash: Vec<String>,
    hang: Vec<String>,
    gates: Vec<(String, Arc<Semaphore>)>,
    step_delay: Duration,
    launch_failures: usize,
    screenshot_fails: bool,
    unresponsive: bool,
}

#[derive(Default)]
struct MockCounters {
    launch_attempts: AtomicUsize,
    launches: AtomicUsize,
    quits: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

/// Driver whose sessions follow a fixed script.
#[derive(Clone, Default)]
pub struct MockDriver {
    script: MockScript,
    counters: Arc<MockCounters>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actions on `selector` fail with `ElementNotFound`.
    pub fn missing(mut self, selector: impl Into<String>) -> Self {
        self.script.missing.push(selector.into());
        self
    }

    /// Actions on `selector` kill the session (`Disconnected`).
    pub fn disconnect_on(mut self, selector: impl Into<String>) -> Self {
        self.script.disconnect.push(selector.into());
        self
    }

    /// Actions on `selector` fail and leave the session unhealthy.
    pub fn crash_on(mut self, selector: impl Into<String>) -> Self {
        self.script.crash.push(selector.into());
        self
    }

    /// Actions on `selector` never return.
    pub fn hang_on(mut self, selector: impl Into<String>) -> Self {
        self.script.hang.push(selector.into());
        self
    }

    /// Actions on `selector` wait for a permit from `gate`.
    pub fn gated(mut self, selector: impl Into<String>, gate: Arc<Semaphore>) -> Self {
        self.script.gates.push((selector.into(), gate));
        self
    }

    /// Every call sleeps this long first.
    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.script.step_delay = delay;
        self
    }

    /// The first `n` launches fail.
    pub fn failing_launches(mut self, n: usize) -> Self {
        self.script.launch_failures = n;
        self
    }

    /// Screenshots fail with a non-fatal error.
    pub fn failing_screenshots(mut self) -> Self {
        self.script.screenshot_fails = true;
        self
    }

    /// `status` and `quit` never return.
    pub fn unresponsive(mut self) -> Self {
        self.script.unresponsive = true;
        self
    }

    /// Sessions successfully launched.
    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    /// Sessions quit.
    pub fn quits(&self) -> usize {
        self.counters.quits.load(Ordering::SeqCst)
    }

    /// Highest number of session calls ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.counters.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every call made so far, as `s<session>:<call>` strings.
    pub async fn calls(&self) -> Vec<String> {
        self.counters.calls.lock().await.clone()
    }
}

#[async_trait]
impl SessionDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn launch(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        let attempt = self.counters.launch_attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.script.launch_failures {
            return Err(SessionError::Launch(format!(
                "scripted launch failure {}",
                attempt + 1
            )));
        }
        let id = self.counters.launches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockSession {
            id,
            script: self.script.clone(),
            counters: Arc::clone(&self.counters),
            url: None,
            dead: false,
        }))
    }
}

struct MockSession {
    id: usize,
    script: MockScript,
    counters: Arc<MockCounters>,
    url: Option<String>,
    dead: bool,
}

impl MockSession {
    async fn enter(&self, call: String) -> Result<InFlight, SessionError> {
        self.counters
            .calls
            .lock()
            .await
            .push(format!("s{}:{call}", self.id));
        if self.dead {
            return Err(SessionError::Disconnected(
                "browser process exited".to_string(),
            ));
        }
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.counters));
        if !self.script.step_delay.is_zero() {
            tokio::time::sleep(self.script.step_delay).await;
        }
        Ok(guard)
    }

    fn matches(list: &[String], selector: Option<&str>) -> bool {
        selector.is_some_and(|s| list.iter().any(|l| l == s))
    }
}

struct InFlight(Arc<MockCounters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AutomationSession for MockSession {
    async fn navigate(&mut self, url: &str) -> Result<StepOutput, SessionError> {
        let _in_flight = self.enter(format!("navigate {url}")).await?;
        if url.contains("unreachable") {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                reason: "net::ERR_NAME_NOT_RESOLVED".to_string(),
            });
        }
        self.url = Some(url.to_string());
        Ok(StepOutput::new(format!("Loaded {url}")))
    }

    async fn act(&mut self, action: &Action) -> Result<StepOutput, SessionError> {
        let _in_flight = self.enter(action.describe()).await?;
        let selector = action.selector();

        if let Some(selector) = selector
            && let Some((_, gate)) = self.script.gates.iter().find(|(s, _)| s == selector)
        {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SessionError::Disconnected("gate closed".to_string()))?;
            permit.forget();
        }
        if Self::matches(&self.script.hang, selector) {
            futures::future::pending::<()>().await;
        }
        if Self::matches(&self.script.disconnect, selector) {
            self.dead = true;
            return Err(SessionError::Disconnected(
                "browser process exited".to_string(),
            ));
        }
        if Self::matches(&self.script.crash, selector) {
            self.dead = true;
            return Err(SessionError::ActionFailed {
                action: action.label().to_string(),
                reason: "renderer crashed".to_string(),
            });
        }
        if Self::matches(&self.script.missing, selector) {
            return Err(SessionError::ElementNotFound {
                selector: selector.unwrap_or_default().to_string(),
            });
        }

        let message = match action {
            Action::Extract { selector } => format!("Extracted text from {selector}"),
            other => format!("Performed {}", other.describe()),
        };
        Ok(StepOutput::new(message))
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, SessionError> {
        let _in_flight = self.enter("screenshot".to_string()).await?;
        if self.script.screenshot_fails {
            return Err(SessionError::ActionFailed {
                action: "screenshot".to_string(),
                reason: "rasterizer unavailable".to_string(),
            });
        }
        Ok(FAKE_PNG.to_vec())
    }

    async fn status(&mut self) -> Result<SessionStatus, SessionError> {
        self.counters
            .calls
            .lock()
            .await
            .push(format!("s{}:status", self.id));
        if self.script.unresponsive {
            futures::future::pending::<()>().await;
        }
        Ok(SessionStatus {
            healthy: !self.dead,
            url: self.url.clone(),
            title: None,
        })
    }

    async fn quit(&mut self) -> Result<(), SessionError> {
        if self.script.unresponsive {
            futures::future::pending::<()>().await;
        }
        self.counters.quits.fetch_add(1, Ordering::SeqCst);
        self.dead = true;
        Ok(())
    }
}
