//! HttpDriver against a stub automation agent served by Axum.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use browser_tasks::config::DriverConfig;
use browser_tasks::error::SessionError;
use browser_tasks::session::{Action, HttpDriver, SessionDriver};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const STUB_PNG: &[u8] = &[0x89, b'P', b'N', b'G'];

#[derive(Clone, Default)]
struct Agent {
    /// `(method path, authorization header)` per request.
    requests: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl Agent {
    async fn record(&self, call: String, headers: &HeaderMap) {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        self.requests.lock().await.push((call, auth));
    }
}

fn agent_error(status: StatusCode, kind: &str, message: &str) -> Response {
    (status, Json(json!({ "error": kind, "message": message }))).into_response()
}

async fn launch(State(agent): State<Agent>, headers: HeaderMap) -> Response {
    agent.record("POST /session".into(), &headers).await;
    Json(json!({ "session_id": "sess-1" })).into_response()
}

async fn navigate(
    State(agent): State<Agent>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    agent.record(format!("POST /session/{sid}/navigate"), &headers).await;
    let url = body["url"].as_str().unwrap_or_default();
    if url.contains("nowhere") {
        return agent_error(StatusCode::BAD_GATEWAY, "navigation", "dns lookup failed");
    }
    Json(json!({ "message": format!("Loaded {url}") })).into_response()
}

async fn act(
    State(agent): State<Agent>,
    Path(sid): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    agent.record(format!("POST /session/{sid}/act"), &headers).await;
    match body["selector"].as_str() {
        Some("#missing") => agent_error(StatusCode::NOT_FOUND, "element_not_found", "no match"),
        Some("#gone") => agent_error(StatusCode::GONE, "", "browser closed"),
        Some("#flaky") => agent_error(StatusCode::INTERNAL_SERVER_ERROR, "internal", "oops"),
        Some("#slow") => {
            agent_error(StatusCode::GATEWAY_TIMEOUT, "timeout", "waited 5s for #slow")
        }
        _ => Json(json!({ "message": format!("did {}", body["action"]) })).into_response(),
    }
}

async fn screenshot(
    State(agent): State<Agent>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Response {
    agent.record(format!("GET /session/{sid}/screenshot"), &headers).await;
    ([(header::CONTENT_TYPE, "image/png")], STUB_PNG.to_vec()).into_response()
}

async fn status(
    State(agent): State<Agent>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> Response {
    agent.record(format!("GET /session/{sid}/status"), &headers).await;
    Json(json!({ "healthy": true, "url": "https://example.com", "title": "Example" }))
        .into_response()
}

async fn quit(
    State(agent): State<Agent>,
    Path(sid): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    agent.record(format!("DELETE /session/{sid}"), &headers).await;
    StatusCode::NO_CONTENT
}

async fn start_agent() -> (String, Agent) {
    let agent = Agent::default();
    let app = Router::new()
        .route("/session", post(launch))
        .route("/session/{sid}", axum::routing::delete(quit))
        .route("/session/{sid}/navigate", post(navigate))
        .route("/session/{sid}/act", post(act))
        .route("/session/{sid}/screenshot", get(screenshot))
        .route("/session/{sid}/status", get(status))
        .with_state(agent.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), agent)
}

fn driver(base_url: &str, token: Option<&str>) -> HttpDriver {
    HttpDriver::new(&DriverConfig {
        base_url: base_url.to_string(),
        token: token.map(SecretString::from),
    })
}

#[tokio::test]
async fn full_session_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let (base, agent) = start_agent().await;
        let driver = driver(&base, Some("t0ken"));
        assert_eq!(driver.name(), "http");

        let mut session = driver.launch().await.unwrap();
        let out = session.navigate("https://example.com").await.unwrap();
        assert_eq!(out.message, "Loaded https://example.com");

        let out = session
            .act(&Action::Click {
                selector: "#go".into(),
            })
            .await
            .unwrap();
        assert_eq!(out.message, "did \"click\"");

        assert_eq!(session.screenshot().await.unwrap(), STUB_PNG);
        let status = session.status().await.unwrap();
        assert!(status.healthy);
        assert_eq!(status.url.as_deref(), Some("https://example.com"));
        session.quit().await.unwrap();

        let requests = agent.requests.lock().await.clone();
        let calls: Vec<&str> = requests.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(
            calls,
            vec![
                "POST /session",
                "POST /session/sess-1/navigate",
                "POST /session/sess-1/act",
                "GET /session/sess-1/screenshot",
                "GET /session/sess-1/status",
                "DELETE /session/sess-1",
            ]
        );
        assert!(
            requests
                .iter()
                .all(|(_, auth)| auth.as_deref() == Some("Bearer t0ken"))
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn no_token_sends_no_authorization() {
    timeout(TEST_TIMEOUT, async {
        let (base, agent) = start_agent().await;
        let mut session = driver(&base, None).launch().await.unwrap();
        session.status().await.unwrap();

        let requests = agent.requests.lock().await.clone();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|(_, auth)| auth.is_none()));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn agent_errors_map_to_session_errors() {
    timeout(TEST_TIMEOUT, async {
        let (base, _agent) = start_agent().await;
        let mut session = driver(&base, None).launch().await.unwrap();

        let err = session
            .act(&Action::Click {
                selector: "#missing".into(),
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, SessionError::ElementNotFound { ref selector } if selector == "#missing")
        );
        assert!(!err.is_fatal());

        let err = session.navigate("https://nowhere.example").await.unwrap_err();
        assert!(
            matches!(err, SessionError::Navigation { ref reason, .. } if reason == "dns lookup failed")
        );

        let err = session
            .act(&Action::Click {
                selector: "#flaky".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ActionFailed { .. }));
        assert!(!err.is_fatal());

        let err = session
            .act(&Action::WaitFor {
                selector: "#slow".into(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "wait_for failed: timed out: waited 5s for #slow");

        let err = session
            .act(&Action::Click {
                selector: "#gone".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Disconnected(_)));
        assert!(err.is_fatal());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unreachable_agent_fails_launch() {
    timeout(TEST_TIMEOUT, async {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = driver(&format!("http://127.0.0.1:{port}"), None).launch().await;
        assert!(matches!(result, Err(SessionError::Launch(_))));
    })
    .await
    .expect("test timed out");
}
