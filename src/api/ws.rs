//! WebSocket push of a single task's progress.
//!
//! On connect the client gets a `snapshot` message, then every event for the
//! task as it happens. Once the task reaches a terminal status a final
//! snapshot (carrying the result) is sent and the socket is closed.

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::routes::{ApiState, parse_id};
use super::service::{TaskWatch, WatchItem};
use crate::tasks::model::{TaskEvent, TaskSnapshot};

/// Messages the server sends besides raw `TaskEvent`s.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage<'a> {
    Snapshot { task: &'a TaskSnapshot },
}

pub(super) async fn task_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id, "task") {
        Ok(id) => id,
        Err(response) => return response,
    };
    let (snapshot, watch) = match state.service.subscribe(id).await {
        Ok(subscription) => subscription,
        Err(e) => return e.into_response(),
    };
    info!(task_id = %id, "Task WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, id, snapshot, watch))
}

async fn send_json<T: Serialize>(socket: &mut WebSocket, value: &T) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize WS message");
            true
        }
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    state: ApiState,
    id: Uuid,
    snapshot: TaskSnapshot,
    mut watch: TaskWatch,
) {
    let done = snapshot.status.is_terminal();
    if !send_json(&mut socket, &WsMessage::Snapshot { task: &snapshot }).await {
        debug!(task_id = %id, "Client disconnected before snapshot");
        return;
    }
    if done {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    loop {
        tokio::select! {
            item = watch.next() => {
                match item {
                    Some(WatchItem::Event(event)) => {
                        if !send_json(&mut socket, &event).await {
                            debug!(task_id = %id, "Client disconnected during send");
                            break;
                        }
                        if event.is_final() {
                            if let TaskEvent::StatusChanged { .. } = event
                                && let Ok(last) = state.service.poll(id).await
                            {
                                send_json(&mut socket, &WsMessage::Snapshot { task: &last }).await;
                            }
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                    Some(WatchItem::Lagged(missed)) => {
                        warn!(task_id = %id, missed, "WS client lagged behind task events");
                        match state.service.poll(id).await {
                            Ok(current) => {
                                let snapshot = WsMessage::Snapshot { task: &current };
                                if !send_json(&mut socket, &snapshot).await {
                                    break;
                                }
                                // The terminal event may have been among the dropped ones.
                                if current.status.is_terminal() {
                                    let _ = socket.send(Message::Close(None)).await;
                                    break;
                                }
                            }
                            Err(_) => {
                                send_json(&mut socket, &TaskEvent::Evicted { task_id: id }).await;
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(task_id = %id, "Task WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(task_id = %id, error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    debug!(task_id = %id, "Task WebSocket closed");
}
