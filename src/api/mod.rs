//! HTTP(S) and WebSocket surface of the web server.
//!
//! Two WebSocket endpoints carry the real traffic: `/ws/mux` (binary,
//! multiplexed terminal I/O) and `/ws/state` (JSON session list). The REST
//! routes are thin collaborators over the session manager for clients that
//! prefer plain HTTP.
//!
//! Everything except `/health` sits behind bearer-token auth with
//! single-use tickets for browser WebSocket upgrades; without a token the
//! WS endpoints are protected by an Origin allow-list instead.

pub mod auth;
pub mod error;
mod handlers;
mod ws_state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderName, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;

pub use auth::TicketStore;
pub use error::ApiError;

use crate::mux::client::MuxClientConfig;
use crate::sessions::{SessionEvent, SessionManager};
use crate::shutdown::ShutdownCoordinator;
use handlers::*;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub shutdown: ShutdownCoordinator,
    pub mux_config: MuxClientConfig,
    pub tickets: Arc<TicketStore>,
    /// Session lifecycle changes, feeding `/ws/state` connections.
    pub state_events: broadcast::Sender<SessionEvent>,
}

impl AppState {
    /// Build the state and wire the manager's listeners: lifecycle events
    /// flow to the state channel, and created/destroyed additionally become
    /// session-state frames on the mux plane.
    pub fn new(sessions: SessionManager, mux_config: MuxClientConfig) -> Self {
        let (state_events, _) = broadcast::channel(256);

        let events_tx = state_events.clone();
        let broadcaster = sessions.broadcaster();
        sessions.add_state_listener(move |event| {
            match event {
                SessionEvent::Created { id } => broadcaster.publish_session_state(id, true),
                SessionEvent::Destroyed { id } => broadcaster.publish_session_state(id, false),
                SessionEvent::Changed { .. } => {}
            }
            let _ = events_tx.send(event.clone());
        });

        Self {
            sessions,
            shutdown: ShutdownCoordinator::new(),
            mux_config,
            tickets: Arc::new(TicketStore::new()),
            state_events,
        }
    }
}

/// Router security/auth settings.
pub struct RouterConfig {
    pub token: Option<String>,
    pub bind: SocketAddr,
    pub cors_origins: Vec<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            token: None,
            bind: "127.0.0.1:8440".parse().expect("valid default bind"),
            cors_origins: Vec::new(),
        }
    }
}

pub fn router(state: AppState, config: RouterConfig) -> Router {
    let tickets = Arc::clone(&state.tickets);

    let protected = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route(
            "/sessions/{id}",
            get(session_get)
                .patch(session_update)
                .delete(session_delete),
        )
        .route("/sessions/{id}/resize", post(session_resize))
        .route("/sessions/{id}/buffer", get(session_buffer))
        .route("/ws/mux", get(ws_mux))
        .route("/ws/state", get(ws_state::ws_state))
        .route("/auth/ws-ticket", post(ws_ticket))
        .with_state(state);

    let protected = match config.token {
        Some(token) => protected.layer(middleware::from_fn(move |req, next| {
            let token = token.clone();
            let tickets = Arc::clone(&tickets);
            async move { auth::require_auth(token, tickets, req, next).await }
        })),
        None => {
            // Tokenless is loopback-only territory; still refuse WebSocket
            // upgrades from foreign browser origins.
            let port = config.bind.port();
            let mut allowed = vec![
                format!("http://127.0.0.1:{port}"),
                format!("http://localhost:{port}"),
                format!("http://[::1]:{port}"),
            ];
            allowed.extend(config.cors_origins.iter().cloned());
            protected.layer(middleware::from_fn(move |req, next| {
                let allowed = allowed.clone();
                auth::check_ws_origin(allowed, req, next)
            }))
        }
    };

    let router = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ));

    if config.cors_origins.is_empty() {
        router
    } else {
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        router.layer(
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
        )
    }
}
