//! WebSocket bridge between a client connection and its session machine

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::ApiState;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::{SessionEvent, SessionHandle, SessionMachine};

/// How long a session that ended on its own may take to flush its last messages
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Build WebSocket router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one session for the lifetime of the connection
async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<SessionEvent>();

    let machine = SessionMachine::new(
        session_id.clone(),
        state.services.clone(),
        outbound_tx.clone(),
        events_tx.clone(),
    );
    state
        .registry
        .insert(SessionHandle::new(
            session_id.clone(),
            events_tx.clone(),
            machine.session().activity(),
        ))
        .await;
    let mut machine_task = tokio::spawn(machine.run(events_rx));

    let _ = outbound_tx.send(ServerMessage::SessionStarted {
        session_id: session_id.clone(),
    });
    tracing::info!(session_id = %session_id, "WebSocket connected");

    // Forward machine output to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode server message"),
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_events = events_tx.clone();
    let session_id_clone = session_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if recv_events.send(SessionEvent::Client(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(session_id = %session_id_clone, error = %e, "malformed client message");
                        let _ = outbound_tx.send(ServerMessage::Error {
                            message: "invalid message".to_string(),
                            details: Some(e.to_string()),
                        });
                    }
                },
                Message::Close(_) => {
                    tracing::info!(session_id = %session_id_clone, "WebSocket closed by client");
                    break;
                }
                _ => {}
            }
        }
    });

    let ended = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            None
        }
        _ = &mut recv_task => {
            send_task.abort();
            None
        }
        result = &mut machine_task => Some(result),
    };

    let result = match ended {
        // Evicted: deliver the notice, then close the socket
        Some(result) => {
            recv_task.abort();
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await.is_err() {
                send_task.abort();
            }
            result
        }
        None => {
            let _ = events_tx.send(SessionEvent::Disconnected);
            machine_task.await
        }
    };
    if let Err(e) = result {
        tracing::error!(session_id = %session_id, error = %e, "session task failed");
    }
    state.registry.remove(&session_id).await;

    tracing::info!(session_id = %session_id, "WebSocket disconnected");
}
