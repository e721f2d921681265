//! Web-server side of the host IPC link: one client per live session.
//!
//! The protocol is correlation-less: event frames (`Output`, `StateChange`,
//! `Ping`/`Pong`) are distinguishable by type, and at most one request is in
//! flight at a time, so the next non-event frame is always the response to
//! the pending request. Requests serialize over a single outbound lock.
//!
//! The link heartbeats with `Ping`/`Pong`; two missed pongs mark it
//! unhealthy, more force a reconnect. Reconnects back off exponentially from
//! 100 ms to 30 s, and a successful reconnect replays `GetInfo` +
//! `GetBuffer` to the resync callback so downstream viewers can be repainted.
//! If the link stays down past the recovery window the dead callback fires
//! and the session manager closes the session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{HostFrame, HostFrameType};
use crate::sessions::info::SessionInfo;

#[derive(Debug, Error)]
pub enum HostIpcError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("host link is down")]
    Disconnected,

    #[error("unexpected response frame: {0:?}")]
    UnexpectedResponse(HostFrameType),

    #[error("host reported: {0}")]
    Host(String),

    #[error("invalid session info payload: {0}")]
    BadInfo(#[from] serde_json::Error),
}

/// Health of the IPC link as seen by the heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkHealth {
    Healthy = 0,
    /// Pongs are being missed; a reconnect may follow.
    Unhealthy = 1,
    /// No connection and the recovery window has expired.
    Down = 2,
}

/// Timing knobs for the link.
#[derive(Debug, Clone)]
pub struct HostIpcConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    /// Outage longer than this kills the session.
    pub recover_window: Duration,
}

impl Default for HostIpcConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            reconnect_min: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
            recover_window: Duration::from_secs(30),
        }
    }
}

/// Callbacks into the session manager. All are invoked from link tasks and
/// must not block.
pub struct HostEvents {
    /// PTY output bytes arrived.
    pub on_output: Box<dyn Fn(Bytes) + Send + Sync>,
    /// The host's session record changed; re-fetch `Info`.
    pub on_state_change: Box<dyn Fn() + Send + Sync>,
    /// A reconnect succeeded; here is the fresh snapshot to replay.
    pub on_resync: Box<dyn Fn(SessionInfo, Bytes) + Send + Sync>,
    /// The link could not be recovered within the window.
    pub on_dead: Box<dyn Fn() + Send + Sync>,
}

/// The session manager's seam onto a host link, so tests can substitute a
/// recording fake.
#[async_trait]
pub trait HostLink: Send + Sync {
    async fn send_input(&self, data: Bytes) -> Result<(), HostIpcError>;
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), HostIpcError>;
    async fn get_buffer(&self) -> Result<Bytes, HostIpcError>;
    async fn set_name(&self, name: Option<&str>) -> Result<(), HostIpcError>;
    async fn get_info(&self) -> Result<SessionInfo, HostIpcError>;
    /// Request host termination. Also shuts this link down.
    async fn close(&self) -> Result<(), HostIpcError>;
    fn health(&self) -> LinkHealth;
    /// Stop all link tasks without touching the host process.
    fn shutdown(&self);
}

struct Inner {
    session_id: String,
    socket_path: PathBuf,
    config: HostIpcConfig,
    events: HostEvents,
    /// Single outbound lock: every frame written to the host goes through it.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// At most one request in flight.
    request_gate: Mutex<()>,
    /// Responses routed by the read loop. Replaced on reconnect.
    resp_rx: Mutex<Option<mpsc::Receiver<HostFrame>>>,
    health: AtomicU8,
    shutdown: CancellationToken,
}

impl Inner {
    fn set_health(&self, health: LinkHealth) {
        self.health.store(health as u8, Ordering::Release);
    }

    fn health(&self) -> LinkHealth {
        match self.health.load(Ordering::Acquire) {
            0 => LinkHealth::Healthy,
            1 => LinkHealth::Unhealthy,
            _ => LinkHealth::Down,
        }
    }

    /// Write a frame under the outbound lock. Clears the writer on failure.
    async fn write_frame(&self, frame: &HostFrame) -> Result<(), HostIpcError> {
        let mut slot = self.writer.lock().await;
        let Some(writer) = slot.as_mut() else {
            return Err(HostIpcError::Disconnected);
        };
        if let Err(e) = frame.write_to(writer).await {
            *slot = None;
            return Err(e.into());
        }
        Ok(())
    }

    /// Issue one request and await its response frame.
    async fn request(
        &self,
        request: HostFrame,
        expect: HostFrameType,
    ) -> Result<HostFrame, HostIpcError> {
        let _gate = self.request_gate.lock().await;

        // Discard responses orphaned by an earlier timeout.
        {
            let mut slot = self.resp_rx.lock().await;
            if let Some(rx) = slot.as_mut() {
                while rx.try_recv().is_ok() {}
            }
        }

        self.write_frame(&request).await?;

        let mut slot = self.resp_rx.lock().await;
        let Some(rx) = slot.as_mut() else {
            return Err(HostIpcError::Disconnected);
        };
        let frame = match timeout(self.config.request_timeout, rx.recv()).await {
            Err(_) => return Err(HostIpcError::RequestTimeout),
            Ok(None) => return Err(HostIpcError::Disconnected),
            Ok(Some(frame)) => frame,
        };
        if frame.frame_type == expect {
            Ok(frame)
        } else if frame.frame_type == HostFrameType::Error {
            Err(HostIpcError::Host(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            ))
        } else {
            Err(HostIpcError::UnexpectedResponse(frame.frame_type))
        }
    }

    async fn fetch_info(&self) -> Result<SessionInfo, HostIpcError> {
        let frame = self
            .request(
                HostFrame::empty(HostFrameType::InfoRequest),
                HostFrameType::Info,
            )
            .await?;
        Ok(serde_json::from_slice(&frame.payload)?)
    }
}

/// Live IPC connection to one `webmux-host`.
pub struct HostIpcClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HostIpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIpcClient").finish_non_exhaustive()
    }
}

impl HostIpcClient {
    /// Connect to a host endpoint and perform the `GetInfo` handshake.
    ///
    /// Fails if the socket cannot be reached or the handshake does not
    /// complete within the configured timeout.
    pub async fn connect(
        session_id: impl Into<String>,
        socket_path: PathBuf,
        config: HostIpcConfig,
        events: HostEvents,
    ) -> Result<(Self, SessionInfo), HostIpcError> {
        let inner = Arc::new(Inner {
            session_id: session_id.into(),
            socket_path,
            config,
            events,
            writer: Mutex::new(None),
            request_gate: Mutex::new(()),
            resp_rx: Mutex::new(None),
            health: AtomicU8::new(LinkHealth::Healthy as u8),
            shutdown: CancellationToken::new(),
        });

        let (read_half, resp_tx) =
            timeout(inner.config.handshake_timeout, open_connection(&inner))
                .await
                .map_err(|_| HostIpcError::HandshakeTimeout)??;
        spawn_connection(Arc::clone(&inner), read_half, resp_tx);

        let info = match timeout(inner.config.handshake_timeout, inner.fetch_info()).await {
            Err(_) => {
                inner.shutdown.cancel();
                return Err(HostIpcError::HandshakeTimeout);
            }
            Ok(Err(e)) => {
                inner.shutdown.cancel();
                return Err(e);
            }
            Ok(Ok(info)) => info,
        };

        Ok((Self { inner }, info))
    }
}

/// Establish the socket connection and install the writer and the response
/// channel, so requests can proceed before the connection task is polled.
/// Returns the read half and response sender for that task.
async fn open_connection(
    inner: &Arc<Inner>,
) -> Result<(OwnedReadHalf, mpsc::Sender<HostFrame>), HostIpcError> {
    let stream = UnixStream::connect(&inner.socket_path).await?;
    let (read_half, write_half) = stream.into_split();
    let (resp_tx, resp_rx) = mpsc::channel::<HostFrame>(4);
    *inner.resp_rx.lock().await = Some(resp_rx);
    *inner.writer.lock().await = Some(write_half);
    Ok((read_half, resp_tx))
}

/// Run one connection to completion, then hand off to the reconnect loop.
fn spawn_connection(
    inner: Arc<Inner>,
    read_half: OwnedReadHalf,
    resp_tx: mpsc::Sender<HostFrame>,
) {
    tokio::spawn(async move {
        run_connection(&inner, read_half, resp_tx).await;
        if inner.shutdown.is_cancelled() {
            return;
        }
        inner.set_health(LinkHealth::Unhealthy);
        *inner.writer.lock().await = None;
        debug!(session = %inner.session_id, "host link lost, reconnecting");
        reconnect_loop(inner).await;
    });
}

/// Read frames until the connection dies or shutdown. The heartbeat runs on
/// its own task so a timer tick can never cancel a half-read frame.
async fn run_connection(
    inner: &Arc<Inner>,
    mut read_half: OwnedReadHalf,
    resp_tx: mpsc::Sender<HostFrame>,
) {
    let conn_token = inner.shutdown.child_token();
    let last_pong = Arc::new(parking_lot::Mutex::new(Instant::now()));

    let hb_inner = Arc::clone(inner);
    let hb_token = conn_token.clone();
    let hb_pong = Arc::clone(&last_pong);
    let heartbeat = tokio::spawn(async move {
        // First ping after one full interval; the connect handshake is the
        // initial liveness proof.
        let mut ping_timer = interval_at(
            Instant::now() + hb_inner.config.ping_interval,
            hb_inner.config.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut missed_pongs: u32 = 0;
        loop {
            tokio::select! {
                _ = hb_token.cancelled() => return,
                _ = ping_timer.tick() => {}
            }
            if hb_inner
                .write_frame(&HostFrame::empty(HostFrameType::Ping))
                .await
                .is_err()
            {
                hb_token.cancel();
                return;
            }
            let stale = hb_pong.lock().elapsed()
                > hb_inner.config.ping_interval + hb_inner.config.pong_timeout;
            if stale {
                missed_pongs += 1;
                if missed_pongs == 2 {
                    warn!(session = %hb_inner.session_id, "two pongs missed, link unhealthy");
                    hb_inner.set_health(LinkHealth::Unhealthy);
                } else if missed_pongs > 2 {
                    warn!(session = %hb_inner.session_id, "pong timeout, dropping connection");
                    hb_token.cancel();
                    return;
                }
            } else {
                missed_pongs = 0;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = conn_token.cancelled() => break,
            frame = HostFrame::read_from(&mut read_half) => frame,
        };
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(session = %inner.session_id, ?e, "host read ended");
                break;
            }
        };
        match frame.frame_type {
            HostFrameType::Output => (inner.events.on_output)(frame.payload),
            HostFrameType::StateChange => (inner.events.on_state_change)(),
            HostFrameType::Ping => {
                let _ = inner
                    .write_frame(&HostFrame::empty(HostFrameType::Pong))
                    .await;
            }
            HostFrameType::Pong => {
                *last_pong.lock() = Instant::now();
                inner.set_health(LinkHealth::Healthy);
            }
            // Everything else answers the single in-flight request.
            _ => {
                let _ = resp_tx.try_send(frame);
            }
        }
    }
    conn_token.cancel();
    heartbeat.abort();
}

/// Reconnect with exponential backoff, resyncing state on success.
async fn reconnect_loop(inner: Arc<Inner>) {
    let started = Instant::now();
    let mut delay = inner.config.reconnect_min;

    loop {
        if inner.shutdown.is_cancelled() {
            return;
        }
        if started.elapsed() > inner.config.recover_window {
            warn!(session = %inner.session_id, "host link unrecoverable");
            inner.set_health(LinkHealth::Down);
            (inner.events.on_dead)();
            return;
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(inner.config.reconnect_max);

        match open_connection(&inner).await {
            Ok((read_half, resp_tx)) => {
                info!(session = %inner.session_id, "host link re-established");
                spawn_connection(Arc::clone(&inner), read_half, resp_tx);

                // Replay a fresh snapshot downstream before resuming.
                let replay = async {
                    let info = inner.fetch_info().await?;
                    let buffer = inner
                        .request(
                            HostFrame::empty(HostFrameType::GetBuffer),
                            HostFrameType::Buffer,
                        )
                        .await?
                        .payload;
                    Ok::<_, HostIpcError>((info, buffer))
                };
                match replay.await {
                    Ok((info, buffer)) => {
                        inner.set_health(LinkHealth::Healthy);
                        (inner.events.on_resync)(info, buffer);
                    }
                    Err(e) => {
                        // The fresh connection's own lifecycle will retry.
                        warn!(session = %inner.session_id, ?e, "post-reconnect resync failed");
                    }
                }
                return;
            }
            Err(e) => {
                debug!(session = %inner.session_id, ?e, "reconnect attempt failed");
            }
        }
    }
}

#[async_trait]
impl HostLink for HostIpcClient {
    async fn send_input(&self, data: Bytes) -> Result<(), HostIpcError> {
        self.inner
            .write_frame(&HostFrame::new(HostFrameType::Input, data))
            .await
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), HostIpcError> {
        self.inner
            .request(HostFrame::resize(cols, rows), HostFrameType::ResizeAck)
            .await
            .map(|_| ())
    }

    async fn get_buffer(&self) -> Result<Bytes, HostIpcError> {
        self.inner
            .request(
                HostFrame::empty(HostFrameType::GetBuffer),
                HostFrameType::Buffer,
            )
            .await
            .map(|frame| frame.payload)
    }

    async fn set_name(&self, name: Option<&str>) -> Result<(), HostIpcError> {
        let payload = name.map_or_else(Bytes::new, |n| Bytes::from(n.as_bytes().to_vec()));
        self.inner
            .request(
                HostFrame::new(HostFrameType::SetName, payload),
                HostFrameType::SetNameAck,
            )
            .await
            .map(|_| ())
    }

    async fn get_info(&self) -> Result<SessionInfo, HostIpcError> {
        self.inner.fetch_info().await
    }

    async fn close(&self) -> Result<(), HostIpcError> {
        let result = self
            .inner
            .request(
                HostFrame::empty(HostFrameType::Close),
                HostFrameType::CloseAck,
            )
            .await
            .map(|_| ());
        // Whatever the outcome, this link is done.
        self.inner.shutdown.cancel();
        result
    }

    fn health(&self) -> LinkHealth {
        self.inner.health()
    }

    fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl Drop for HostIpcClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
