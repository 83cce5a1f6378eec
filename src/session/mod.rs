//! Automation session: the single stateful browser the worker drives.
//!
//! The concrete driver is an external collaborator. This module defines the
//! narrow capability interface the engine consumes:
//! - `AutomationSession`: one live browser handle (navigate/act/screenshot/status/quit)
//! - `SessionDriver`: launches fresh sessions on demand
//! - `SessionSlot`: the guarded singleton that hands out exclusive access
//!
//! Two drivers ship with the crate: `HttpDriver` for a remote automation
//! agent and `MockDriver`, a scriptable in-process driver.

pub mod http;
pub mod mock;
pub mod slot;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

pub use http::HttpDriver;
pub use mock::MockDriver;
pub use slot::{SessionGuard, SessionInfo, SessionSlot, SessionState};

/// One discrete browser step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Navigate { url: String },
    Click { selector: String },
    Type { selector: String, text: String },
    Press { key: String },
    WaitFor { selector: String },
    Scroll { dy: i32 },
    Extract { selector: String },
    Screenshot,
}

impl Action {
    /// Short name used in step logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Press { .. } => "press",
            Self::WaitFor { .. } => "wait_for",
            Self::Scroll { .. } => "scroll",
            Self::Extract { .. } => "extract",
            Self::Screenshot => "screenshot",
        }
    }

    /// The selector this action targets, if any.
    pub fn selector(&self) -> Option<&str> {
        match self {
            Self::Click { selector }
            | Self::Type { selector, .. }
            | Self::WaitFor { selector }
            | Self::Extract { selector } => Some(selector),
            _ => None,
        }
    }

    /// Human-readable one-liner for progress messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Navigate { url } => format!("navigate to {url}"),
            Self::Click { selector } => format!("click {selector}"),
            Self::Type { selector, text } => {
                format!("type {} chars into {selector}", text.chars().count())
            }
            Self::Press { key } => format!("press {key}"),
            Self::WaitFor { selector } => format!("wait for {selector}"),
            Self::Scroll { dy } => format!("scroll by {dy}"),
            Self::Extract { selector } => format!("extract {selector}"),
            Self::Screenshot => "capture screenshot".to_string(),
        }
    }

    /// Check the action's own fields.
    pub fn validate(&self) -> Result<(), String> {
        if let Self::Navigate { url } = self
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(format!("navigate url must be http(s), got '{url}'"));
        }
        if let Self::Press { key } = self
            && key.trim().is_empty()
        {
            return Err("press key must not be empty".to_string());
        }
        if let Some(selector) = self.selector()
            && selector.trim().is_empty()
        {
            return Err(format!("{} selector must not be empty", self.label()));
        }
        Ok(())
    }
}

/// What the driver reports after a step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Human-readable outcome (extracted text, landed URL, ...).
    pub message: String,
}

impl StepOutput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Health of a live session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A single live browser handle.
///
/// Implementations are used by exactly one task at a time; the slot
/// guarantees exclusivity, so methods take `&mut self`.
#[async_trait]
pub trait AutomationSession: Send {
    /// Load a page.
    async fn navigate(&mut self, url: &str) -> Result<StepOutput, SessionError>;

    /// Perform a non-navigation action (click, type, ...).
    async fn act(&mut self, action: &Action) -> Result<StepOutput, SessionError>;

    /// Rasterize the current viewport as PNG bytes.
    async fn screenshot(&mut self) -> Result<Vec<u8>, SessionError>;

    /// Report whether the session is still usable.
    async fn status(&mut self) -> Result<SessionStatus, SessionError>;

    /// Close the session. Called at most once.
    async fn quit(&mut self) -> Result<(), SessionError>;
}

/// Launches automation sessions.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Driver name for logs and status output.
    fn name(&self) -> &str;

    /// Open a fresh session.
    async fn launch(&self) -> Result<Box<dyn AutomationSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serde_shape() {
        let action: Action =
            serde_json::from_str(r##"{"action": "type", "selector": "#q", "text": "rust"}"##)
                .unwrap();
        assert_eq!(
            action,
            Action::Type {
                selector: "#q".into(),
                text: "rust".into()
            }
        );
        let json = serde_json::to_value(Action::WaitFor {
            selector: ".ready".into(),
        })
        .unwrap();
        assert_eq!(json["action"], "wait_for");
        let json = serde_json::to_value(Action::Screenshot).unwrap();
        assert_eq!(json, serde_json::json!({"action": "screenshot"}));
    }

    #[test]
    fn action_validation() {
        assert!(
            Action::Navigate {
                url: "https://example.com".into()
            }
            .validate()
            .is_ok()
        );
        assert!(
            Action::Navigate {
                url: "example.com".into()
            }
            .validate()
            .is_err()
        );
        assert!(Action::Click { selector: " ".into() }.validate().is_err());
        assert!(Action::Press { key: "".into() }.validate().is_err());
        assert!(Action::Scroll { dy: -200 }.validate().is_ok());
    }

    #[test]
    fn describe_hides_typed_text() {
        let action = Action::Type {
            selector: "#password".into(),
            text: "hunter2".into(),
        };
        assert_eq!(action.describe(), "type 7 chars into #password");
        assert_eq!(action.label(), "type");
    }
}
