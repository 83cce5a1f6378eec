//! REST endpoints for the task engine.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use super::service::{TaskFilter, TaskService};
use super::ws::task_ws_handler;
use crate::error::{ArtifactError, TaskError};
use crate::tasks::model::{TaskRequest, TaskStatus};

/// State shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<TaskService>,
}

/// Build the router with task, artifact, session and WebSocket routes.
pub fn task_routes(service: Arc<TaskService>) -> Router {
    let state = ApiState { service };

    Router::new()
        .route("/health", get(health))
        .route("/tasks", post(submit_task).get(list_tasks))
        .route("/tasks/{id}", get(poll_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
        .route("/artifacts/{id}", get(get_artifact))
        .route("/session/start", post(start_session))
        .route("/session/status", get(session_status))
        .route("/ws/tasks/{id}", get(task_ws_handler))
        .with_state(state)
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let status = match &self {
            TaskError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
            TaskError::AlreadyTerminal { .. }
            | TaskError::InvalidTransition { .. }
            | TaskError::Duplicate { .. } => StatusCode::CONFLICT,
            TaskError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        };
        error_body(status, self.to_string())
    }
}

pub(crate) fn parse_id(raw: &str, kind: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, format!("Invalid {kind} ID")))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.health().await)
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn submit_task(
    State(state): State<ApiState>,
    body: Result<Json<TaskRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.service.submit(request).await {
        Ok(task_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "task_id": task_id })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn poll_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.service.poll(id).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_tasks(
    State(state): State<ApiState>,
    query: Result<Query<ListQuery>, axum::extract::rejection::QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let status = match query.status.as_deref().map(str::parse::<TaskStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return error_body(StatusCode::BAD_REQUEST, e),
    };

    let filter = TaskFilter {
        status,
        limit: query.limit,
    };
    Json(state.service.list(filter).await).into_response()
}

async fn cancel_task(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.service.cancel(id).await {
        Ok(outcome) => {
            Json(serde_json::json!({ "task_id": id, "outcome": outcome })).into_response()
        }
        Err(e) => e.into_response(),
    }
}

// ── Artifacts ───────────────────────────────────────────────────────────

async fn get_artifact(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "artifact") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.service.artifact(id).await {
        Ok(artifact) => (
            [(header::CONTENT_TYPE, artifact.content_type)],
            artifact.data,
        )
            .into_response(),
        Err(ArtifactError::NotFound { .. }) => {
            error_body(StatusCode::NOT_FOUND, "Artifact not found")
        }
        Err(e) => {
            warn!(artifact_id = %id, error = %e, "Failed to read artifact");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read artifact")
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────────

async fn start_session(State(state): State<ApiState>) -> Response {
    match state.service.start_session().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_body(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

async fn session_status(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.service.session_status())
}
