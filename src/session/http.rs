//! Remote automation agent reached over HTTP.
//!
//! Wire contract (JSON unless noted):
//! - `POST   /session`                  → `{"session_id": "..."}`
//! - `POST   /session/{sid}/navigate`   `{"url": "..."}` → `{"message": "..."}`
//! - `POST   /session/{sid}/act`        `Action` → `{"message": "..."}`
//! - `GET    /session/{sid}/screenshot` → raw PNG bytes
//! - `GET    /session/{sid}/status`     → `SessionStatus`
//! - `DELETE /session/{sid}`
//!
//! Failures come back as non-2xx with `{"error": "<kind>", "message": "..."}`.
//! `410 Gone`, a `session_gone` kind, or a broken connection mean the
//! session is dead.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use super::{Action, AutomationSession, SessionDriver, SessionStatus, StepOutput};
use crate::config::DriverConfig;
use crate::error::SessionError;

/// Driver that launches sessions on a remote automation agent.
pub struct HttpDriver {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
}

impl HttpDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }
}

#[derive(Deserialize)]
struct LaunchReply {
    session_id: String,
}

#[derive(Deserialize)]
struct StepReply {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorReply {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

fn authorize(request: RequestBuilder, token: Option<&SecretString>) -> RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token.expose_secret()),
        None => request,
    }
}

/// The agent's own timeouts are reported as step failures with its message;
/// the engine's step timeout is the only one that carries a duration.
fn transport_error(action: &str, e: reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::ActionFailed {
            action: action.to_string(),
            reason: format!("request timed out: {e}"),
        }
    } else if e.is_connect() || e.is_request() {
        SessionError::Disconnected(format!("{action}: {e}"))
    } else {
        SessionError::ActionFailed {
            action: action.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Turn a non-2xx response into the matching `SessionError`.
async fn failure(action: &str, target: Option<&str>, response: Response) -> SessionError {
    let status = response.status();
    let body: ErrorReply = response.json().await.unwrap_or(ErrorReply {
        error: String::new(),
        message: format!("HTTP {status}"),
    });

    if status == StatusCode::GONE || body.error == "session_gone" {
        return SessionError::Disconnected(body.message);
    }
    match body.error.as_str() {
        "element_not_found" => SessionError::ElementNotFound {
            selector: target.unwrap_or_default().to_string(),
        },
        "navigation" => SessionError::Navigation {
            url: target.unwrap_or_default().to_string(),
            reason: body.message,
        },
        "timeout" => SessionError::ActionFailed {
            action: action.to_string(),
            reason: format!("timed out: {}", body.message),
        },
        _ => SessionError::ActionFailed {
            action: action.to_string(),
            reason: body.message,
        },
    }
}

#[async_trait]
impl SessionDriver for HttpDriver {
    fn name(&self) -> &str {
        "http"
    }

    async fn launch(&self) -> Result<Box<dyn AutomationSession>, SessionError> {
        let url = format!("{}/session", self.base_url);
        let response = authorize(self.client.post(&url), self.token.as_ref())
            .send()
            .await
            .map_err(|e| SessionError::Launch(e.to_string()))?;

        if !response.status().is_success() {
            let err = failure("launch", None, response).await;
            return Err(SessionError::Launch(err.to_string()));
        }
        let reply: LaunchReply = response
            .json()
            .await
            .map_err(|e| SessionError::Launch(format!("bad launch reply: {e}")))?;

        debug!(session_id = %reply.session_id, "Remote session launched");
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: format!("{}/session/{}", self.base_url, reply.session_id),
            token: self.token.clone(),
        }))
    }
}

/// One session on the remote agent.
struct HttpSession {
    client: Client,
    /// `{agent}/session/{sid}`
    base_url: String,
    token: Option<SecretString>,
}

impl HttpSession {
    async fn step(
        &self,
        action: &str,
        target: Option<&str>,
        request: RequestBuilder,
    ) -> Result<StepOutput, SessionError> {
        let response = authorize(request, self.token.as_ref())
            .send()
            .await
            .map_err(|e| transport_error(action, e))?;
        if !response.status().is_success() {
            return Err(failure(action, target, response).await);
        }
        let reply: StepReply = response
            .json()
            .await
            .map_err(|e| SessionError::ActionFailed {
                action: action.to_string(),
                reason: format!("bad reply: {e}"),
            })?;
        Ok(StepOutput::new(reply.message))
    }
}

#[async_trait]
impl AutomationSession for HttpSession {
    async fn navigate(&mut self, url: &str) -> Result<StepOutput, SessionError> {
        let request = self
            .client
            .post(format!("{}/navigate", self.base_url))
            .json(&serde_json::json!({ "url": url }));
        self.step("navigate", Some(url), request).await
    }

    async fn act(&mut self, action: &Action) -> Result<StepOutput, SessionError> {
        let request = self
            .client
            .post(format!("{}/act", self.base_url))
            .json(action);
        self.step(action.label(), action.selector(), request).await
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>, SessionError> {
        let request = self.client.get(format!("{}/screenshot", self.base_url));
        let response = authorize(request, self.token.as_ref())
            .send()
            .await
            .map_err(|e| transport_error("screenshot", e))?;
        if !response.status().is_success() {
            return Err(failure("screenshot", None, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error("screenshot", e))?;
        Ok(bytes.to_vec())
    }

    async fn status(&mut self) -> Result<SessionStatus, SessionError> {
        let request = self.client.get(format!("{}/status", self.base_url));
        let response = authorize(request, self.token.as_ref())
            .send()
            .await
            .map_err(|e| transport_error("status", e))?;
        if !response.status().is_success() {
            return Err(failure("status", None, response).await);
        }
        response
            .json()
            .await
            .map_err(|e| SessionError::ActionFailed {
                action: "status".to_string(),
                reason: format!("bad reply: {e}"),
            })
    }

    async fn quit(&mut self) -> Result<(), SessionError> {
        let request = self.client.delete(&self.base_url);
        let response = authorize(request, self.token.as_ref())
            .send()
            .await
            .map_err(|e| transport_error("quit", e))?;
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(failure("quit", None, response).await)
        }
    }
}
