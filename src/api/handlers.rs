//! REST handlers for session management plus the mux WebSocket upgrade.

use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use super::error::ApiError;
use super::AppState;
use crate::mux::client::{MuxClient, SessionOps};
use crate::sessions::{CreateSession, ShellKind};

/// `GET /health`: liveness probe, no auth.
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionBody {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    #[serde(default)]
    pub shell: ShellKind,
    pub cwd: Option<String>,
    pub name: Option<String>,
}

/// `POST /sessions`: spawn a host and return the new session. All body
/// fields are optional; an empty object uses the configured defaults.
pub async fn session_create(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let info = state
        .sessions
        .create_session(CreateSession {
            cols: body.cols,
            rows: body.rows,
            shell: body.shell,
            cwd: body.cwd,
            name: body.name,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// `GET /sessions`: list all sessions, oldest first.
pub async fn session_list(State(state): State<AppState>) -> Json<Vec<crate::SessionInfo>> {
    Json(state.sessions.list_sessions())
}

/// `GET /sessions/{id}`.
pub async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::SessionInfo>, ApiError> {
    state
        .sessions
        .get_session(&id)
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionBody {
    /// New display name; `null` clears it.
    pub name: Option<String>,
}

/// `PATCH /sessions/{id}`: rename.
pub async fn session_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateSessionBody>,
) -> Result<Json<crate::SessionInfo>, ApiError> {
    state.sessions.set_name(&id, body.name.as_deref()).await?;
    state
        .sessions
        .get_session(&id)
        .map(Json)
        .ok_or(ApiError::SessionNotFound(id))
}

/// `DELETE /sessions/{id}`: close the session.
pub async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sessions.close_session(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(id))
    }
}

#[derive(Debug, Deserialize)]
pub struct ResizeBody {
    pub cols: u16,
    pub rows: u16,
}

/// `POST /sessions/{id}/resize`: API resizes carry no viewer id and are
/// accepted unconditionally; `accepted: false` means the host refused.
pub async fn session_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let accepted = state
        .sessions
        .resize(&id, body.cols, body.rows, None)
        .await?;
    Ok(Json(json!({ "accepted": accepted })))
}

/// `GET /sessions/{id}/buffer`: raw scrollback snapshot.
pub async fn session_buffer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let snapshot = state.sessions.get_buffer(&id).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        snapshot,
    )
        .into_response())
}

/// `POST /auth/ws-ticket`: trade a bearer token for a single-use WS ticket.
pub async fn ws_ticket(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    match state.tickets.issue() {
        Some(ticket) => Ok(Json(json!({ "ticket": ticket }))),
        None => Err(ApiError::SessionUnavailable(
            "too many pending tickets".into(),
        )),
    }
}

/// `GET /ws/mux`: upgrade into the multiplexed terminal I/O plane.
pub async fn ws_mux(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| async move {
        let _guard = state.shutdown.client_guard();
        let client = MuxClient::new(
            Arc::new(state.sessions.clone()) as Arc<dyn SessionOps>,
            state.sessions.broadcaster(),
            state.mux_config.clone(),
        );
        client.run(socket, state.shutdown.token()).await;
    })
}
