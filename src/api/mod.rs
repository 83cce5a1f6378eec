//! Caller-facing surface: the `TaskService` operations and the HTTP/WebSocket
//! routes over them.

pub mod routes;
pub mod service;
pub mod ws;

pub use routes::{ApiState, task_routes};
pub use service::{CancelOutcome, HealthReport, TaskFilter, TaskService, TaskWatch, WatchItem};
