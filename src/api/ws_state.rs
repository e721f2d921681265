//! State WebSocket: pushes the full session list as JSON on every change.
//!
//! Text frames only. The message shape is
//! `{"sessions": {"sessions": [SessionInfo, ...]}}`. Bursts of changes are
//! collapsed with a short debounce; every connection gets the full list on
//! connect.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::AppState;

/// Burst-collapse window for state updates.
const DEBOUNCE: Duration = Duration::from_millis(25);

/// `GET /ws/state`.
pub async fn ws_state(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_state_ws(socket, state))
}

fn session_list_message(state: &AppState) -> String {
    let sessions = state.sessions.list_sessions();
    serde_json::json!({
        "sessions": { "sessions": sessions }
    })
    .to_string()
}

async fn handle_state_ws(mut socket: WebSocket, state: AppState) {
    let _guard = state.shutdown.client_guard();
    let shutdown = state.shutdown.token();
    let mut events = state.state_events.subscribe();

    // Full list up front so a fresh viewer can render immediately.
    if socket
        .send(Message::Text(session_list_message(&state).into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
                // Collapse bursts: wait briefly, drain whatever piled up,
                // then send one full list.
                tokio::time::sleep(DEBOUNCE).await;
                while events.try_recv().is_ok() {}
                if socket
                    .send(Message::Text(session_list_message(&state).into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    // This channel is push-only; inbound frames are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!("state viewer disconnected");
}
