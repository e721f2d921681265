//! Authentication for HTTP and WebSocket endpoints.
//!
//! Regular requests carry `Authorization: Bearer <token>`, compared in
//! constant time. Browser WebSocket upgrades cannot set headers, so the
//! client first trades its bearer token for a single-use, short-TTL ticket
//! (`POST /auth/ws-ticket`) and opens the socket with `?ticket=<nonce>`.
//!
//! When the server runs without a token (loopback), WebSocket upgrades are
//! still guarded by an Origin allow-list to stop cross-site WebSocket
//! hijacking from pages the browser happens to have open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{extract::Request, middleware::Next, response::Response};
use parking_lot::Mutex;
use rand::Rng;
use subtle::ConstantTimeEq;

use super::error::ApiError;

/// Time-to-live for an unconsumed ticket.
const TICKET_TTL: Duration = Duration::from_secs(30);

/// Cap on pending tickets so a client cannot grow the map without bound.
const MAX_PENDING_TICKETS: usize = 1024;

/// Single-use WebSocket auth tickets.
pub struct TicketStore {
    pending: Mutex<HashMap<String, Instant>>,
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketStore {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a ticket. `None` when the pending cap is reached.
    pub fn issue(&self) -> Option<String> {
        let mut pending = self.pending.lock();

        let now = Instant::now();
        pending.retain(|_, issued| now.duration_since(*issued) < TICKET_TTL);
        if pending.len() >= MAX_PENDING_TICKETS {
            return None;
        }

        let nonce: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        pending.insert(nonce.clone(), now);
        Some(nonce)
    }

    /// Consume a ticket. True only for a known, unexpired nonce; a second
    /// use of the same nonce fails.
    pub fn consume(&self, ticket: &str) -> bool {
        match self.pending.lock().remove(ticket) {
            Some(issued) => issued.elapsed() < TICKET_TTL,
            None => false,
        }
    }

    #[cfg(test)]
    fn backdate(&self, ticket: &str, age: Duration) {
        self.pending
            .lock()
            .insert(ticket.to_string(), Instant::now() - age);
    }
}

fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn query_ticket(req: &Request) -> Option<&str> {
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("ticket="))
}

fn is_ws_upgrade(req: &Request) -> bool {
    req.headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Middleware enforcing bearer-or-ticket auth.
pub async fn require_auth(
    expected_token: String,
    tickets: Arc<TicketStore>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(token) = bearer_token(&req) {
        if bool::from(token.as_bytes().ct_eq(expected_token.as_bytes())) {
            return Ok(next.run(req).await);
        }
        return Err(ApiError::AuthInvalid);
    }

    if is_ws_upgrade(&req) {
        if let Some(ticket) = query_ticket(&req) {
            if tickets.consume(ticket) {
                return Ok(next.run(req).await);
            }
        }
    }

    Err(ApiError::AuthRequired)
}

/// Middleware rejecting WebSocket upgrades from unexpected browser origins.
///
/// Requests without an `Origin` header (curl, native clients) pass through;
/// CORS covers plain HTTP.
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_ws_upgrade(&req) {
        return Ok(next.run(req).await);
    }
    let Some(origin) = req.headers().get("origin").and_then(|v| v.to_str().ok()) else {
        return Ok(next.run(req).await);
    };
    if allowed_origins.iter().any(|allowed| allowed == origin) {
        return Ok(next.run(req).await);
    }
    Err(ApiError::OriginNotAllowed)
}
