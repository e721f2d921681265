//! Per-viewer mux client: the output scheduler and both WebSocket loops.
//!
//! Each viewer owns one WebSocket, one bounded frame queue, and one
//! scheduler task. Output for the viewer's active session is forwarded
//! immediately as plain `Output` frames; everything else accumulates per
//! session and is flushed as one gzip `CompressedOutput` frame once the
//! accumulator exceeds 2 KiB or 2 s has passed.
//!
//! Backpressure: the frame queue drops oldest on overflow. The first drop
//! flips the scheduler into resync mode: arriving output is accumulated
//! instead of enqueued until the send loop has drained the queue, then the
//! viewer gets a `Resync` frame and a fresh scrollback snapshot per session
//! before live output resumes. The scheduler task is the only enqueuer and
//! the send loop the only dequeuer, so the resync sequence can never
//! interleave with ordinary sends.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::broadcaster::{MuxBroadcaster, OutputEvent, ViewerEvent};
use super::protocol::MuxFrame;
use super::queue::FrameQueue;
use crate::sessions::{SessionError, SessionManager};

/// The slice of the session manager a viewer needs, behind a trait so the
/// scheduler is testable without host processes.
#[async_trait]
pub trait SessionOps: Send + Sync {
    async fn send_input(
        &self,
        id: &str,
        data: Bytes,
        viewer: Option<&str>,
    ) -> Result<(), SessionError>;
    async fn resize(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        viewer: Option<&str>,
    ) -> Result<bool, SessionError>;
    async fn get_buffer(&self, id: &str) -> Result<Bytes, SessionError>;
    fn session_ids(&self) -> Vec<String>;
    fn dimensions(&self, id: &str) -> Option<(u16, u16)>;
}

#[async_trait]
impl SessionOps for SessionManager {
    async fn send_input(
        &self,
        id: &str,
        data: Bytes,
        viewer: Option<&str>,
    ) -> Result<(), SessionError> {
        SessionManager::send_input(self, id, data, viewer).await
    }

    async fn resize(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        viewer: Option<&str>,
    ) -> Result<bool, SessionError> {
        SessionManager::resize(self, id, cols, rows, viewer).await
    }

    async fn get_buffer(&self, id: &str) -> Result<Bytes, SessionError> {
        SessionManager::get_buffer(self, id).await
    }

    fn session_ids(&self) -> Vec<String> {
        SessionManager::session_ids(self)
    }

    fn dimensions(&self, id: &str) -> Option<(u16, u16)> {
        SessionManager::dimensions(self, id)
    }
}

/// Tuning for one viewer.
#[derive(Debug, Clone)]
pub struct MuxClientConfig {
    /// Frame queue capacity (drop-oldest beyond this).
    pub queue_capacity: usize,
    /// Background accumulator flush threshold in bytes.
    pub batch_max_bytes: usize,
    /// Background accumulator flush deadline.
    pub batch_max_delay: Duration,
    /// Per-message WebSocket send timeout.
    pub send_timeout: Duration,
    /// Scrollback requests allowed in a burst, per session.
    pub buffer_request_burst: u32,
    /// Scrollback request refill rate per second, per session.
    pub buffer_request_per_sec: f64,
}

impl Default for MuxClientConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 500,
            batch_max_bytes: 2048,
            batch_max_delay: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
            buffer_request_burst: 5,
            buffer_request_per_sec: 1.0,
        }
    }
}

/// How often the scheduler wakes to flush aged accumulators and run a
/// pending resync.
const FLUSH_TICK: Duration = Duration::from_millis(250);

/// Gzip-compress with the fast profile; batches are small and latency wins
/// over ratio here.
fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4 + 32), Compression::fast());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Simple token bucket for scrollback-request rate limiting.
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_sec,
            last: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Pending background bytes for one session.
struct Accumulator {
    data: BytesMut,
    since: Instant,
    cols: u16,
    rows: u16,
}

/// Local commands from the receive loop into the scheduler, keeping the
/// scheduler the single enqueuer of the frame queue.
enum SchedulerCmd {
    Hint(Option<String>),
    BufferRequest(String),
}

/// Single-task output scheduler state.
struct Scheduler {
    ops: Arc<dyn SessionOps>,
    queue: Arc<FrameQueue>,
    config: MuxClientConfig,
    active: Option<String>,
    needs_resync: bool,
    accumulators: HashMap<String, Accumulator>,
    buckets: HashMap<String, TokenBucket>,
}

impl Scheduler {
    fn new(ops: Arc<dyn SessionOps>, queue: Arc<FrameQueue>, config: MuxClientConfig) -> Self {
        Self {
            ops,
            queue,
            config,
            active: None,
            needs_resync: false,
            accumulators: HashMap::new(),
            buckets: HashMap::new(),
        }
    }

    fn push(&mut self, frame: Bytes) {
        if self.queue.push(frame) {
            self.needs_resync = true;
        }
    }

    fn dims_for(&self, session_id: &str) -> (u16, u16) {
        self.ops.dimensions(session_id).unwrap_or((80, 24))
    }

    /// Output or CompressedOutput, depending on size.
    fn encode_output(&self, session_id: &str, cols: u16, rows: u16, data: &[u8]) -> Bytes {
        if data.len() > self.config.batch_max_bytes {
            MuxFrame::CompressedOutput {
                session_id: session_id.to_string(),
                cols,
                rows,
                uncompressed_len: data.len() as u32,
                data: Bytes::from(gzip(data)),
            }
            .encode()
        } else {
            MuxFrame::Output {
                session_id: session_id.to_string(),
                cols,
                rows,
                data: Bytes::copy_from_slice(data),
            }
            .encode()
        }
    }

    fn handle_viewer_event(&mut self, event: ViewerEvent) {
        match event {
            ViewerEvent::Output(ev) => self.handle_output(ev),
            ViewerEvent::Replay {
                session_id,
                cols,
                rows,
                snapshot,
            } => self.handle_replay(&session_id, cols, rows, &snapshot),
            ViewerEvent::SessionState {
                session_id,
                created,
            } => self.handle_session_state(&session_id, created),
        }
    }

    fn handle_output(&mut self, ev: OutputEvent) {
        if self.needs_resync {
            self.accumulate(ev);
            return;
        }
        if self.active.as_deref() == Some(ev.session_id.as_str()) {
            let frame = MuxFrame::Output {
                session_id: ev.session_id,
                cols: ev.cols,
                rows: ev.rows,
                data: ev.data,
            }
            .encode();
            self.push(frame);
            return;
        }
        let session_id = ev.session_id.clone();
        self.accumulate(ev);
        let over_threshold = self
            .accumulators
            .get(&session_id)
            .is_some_and(|acc| acc.data.len() > self.config.batch_max_bytes);
        if over_threshold {
            self.flush_session(&session_id);
        }
    }

    fn accumulate(&mut self, ev: OutputEvent) {
        let acc = self
            .accumulators
            .entry(ev.session_id)
            .or_insert_with(|| Accumulator {
                data: BytesMut::new(),
                since: Instant::now(),
                cols: ev.cols,
                rows: ev.rows,
            });
        acc.cols = ev.cols;
        acc.rows = ev.rows;
        acc.data.extend_from_slice(&ev.data);
    }

    /// Compress and enqueue one session's accumulated output.
    fn flush_session(&mut self, session_id: &str) {
        let Some(acc) = self.accumulators.remove(session_id) else {
            return;
        };
        if acc.data.is_empty() {
            return;
        }
        let frame = MuxFrame::CompressedOutput {
            session_id: session_id.to_string(),
            cols: acc.cols,
            rows: acc.rows,
            uncompressed_len: acc.data.len() as u32,
            data: Bytes::from(gzip(&acc.data)),
        }
        .encode();
        self.push(frame);
    }

    /// Flush accumulators older than the batch deadline.
    fn flush_expired(&mut self) {
        if self.needs_resync {
            return;
        }
        let deadline = self.config.batch_max_delay;
        let expired: Vec<String> = self
            .accumulators
            .iter()
            .filter(|(_, acc)| acc.since.elapsed() >= deadline)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.flush_session(&id);
        }
    }

    /// Post-overflow recovery: stale frames are discarded, every session
    /// gets a `Resync` marker, a fresh snapshot, and its accumulated bytes.
    async fn resync(&mut self) {
        self.queue.clear();
        let sessions = self.ops.session_ids();

        for id in &sessions {
            self.push(
                MuxFrame::Resync {
                    session_id: id.clone(),
                }
                .encode(),
            );
        }

        for id in &sessions {
            match self.ops.get_buffer(id).await {
                Ok(snapshot) if !snapshot.is_empty() => {
                    let (cols, rows) = self.dims_for(id);
                    let frame = self.encode_output(id, cols, rows, &snapshot);
                    self.push(frame);
                }
                Ok(_) => {}
                Err(e) => debug!(session = %id, ?e, "snapshot fetch failed during resync"),
            }
            if let Some(acc) = self.accumulators.remove(id) {
                if !acc.data.is_empty() {
                    let frame = self.encode_output(id, acc.cols, acc.rows, &acc.data);
                    self.push(frame);
                }
            }
        }

        // Whatever is left accumulated belongs to sessions that no longer
        // exist.
        self.accumulators.clear();
        self.needs_resync = false;
    }

    async fn maybe_resync(&mut self) {
        if self.needs_resync && self.queue.is_empty() {
            self.resync().await;
        }
    }

    /// Reconnect replay for one session: same clear-then-snapshot contract
    /// as a resync, scoped to that session.
    fn handle_replay(&mut self, session_id: &str, cols: u16, rows: u16, snapshot: &Bytes) {
        // The snapshot supersedes anything accumulated before the link
        // dropped.
        self.accumulators.remove(session_id);
        self.push(
            MuxFrame::Resync {
                session_id: session_id.to_string(),
            }
            .encode(),
        );
        if !snapshot.is_empty() {
            let frame = self.encode_output(session_id, cols, rows, snapshot);
            self.push(frame);
        }
    }

    fn handle_session_state(&mut self, session_id: &str, created: bool) {
        if !created {
            self.accumulators.remove(session_id);
            self.buckets.remove(session_id);
            if self.active.as_deref() == Some(session_id) {
                self.active = None;
            }
        }
        let frame = MuxFrame::SessionState {
            session_id: session_id.to_string(),
            created,
        }
        .encode();
        self.push(frame);
    }

    async fn handle_cmd(&mut self, cmd: SchedulerCmd) {
        match cmd {
            SchedulerCmd::Hint(session_id) => {
                // A freshly focused session should catch up right away.
                if let Some(id) = session_id.as_deref() {
                    if !self.needs_resync {
                        let id = id.to_string();
                        self.flush_session(&id);
                    }
                }
                self.active = session_id;
            }
            SchedulerCmd::BufferRequest(session_id) => {
                let config_burst = self.config.buffer_request_burst;
                let config_rate = self.config.buffer_request_per_sec;
                let bucket = self
                    .buckets
                    .entry(session_id.clone())
                    .or_insert_with(|| TokenBucket::new(config_burst, config_rate));
                if !bucket.try_take() {
                    debug!(session = %session_id, "scrollback request rate-limited");
                    return;
                }
                match self.ops.get_buffer(&session_id).await {
                    Ok(snapshot) => {
                        let (cols, rows) = self.dims_for(&session_id);
                        let frame = MuxFrame::Output {
                            session_id,
                            cols,
                            rows,
                            data: snapshot,
                        }
                        .encode();
                        self.push(frame);
                    }
                    Err(e) => debug!(session = %session_id, ?e, "scrollback request failed"),
                }
            }
        }
    }
}

/// One connected viewer.
pub struct MuxClient {
    viewer_id: String,
    ops: Arc<dyn SessionOps>,
    broadcaster: Arc<MuxBroadcaster>,
    config: MuxClientConfig,
}

impl MuxClient {
    pub fn new(
        ops: Arc<dyn SessionOps>,
        broadcaster: Arc<MuxBroadcaster>,
        config: MuxClientConfig,
    ) -> Self {
        Self {
            viewer_id: uuid::Uuid::new_v4().to_string(),
            ops,
            broadcaster,
            config,
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    /// Drive the connection until the viewer goes away or the server shuts
    /// down.
    pub async fn run(self, socket: WebSocket, shutdown: CancellationToken) {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let queue = Arc::new(FrameQueue::new(self.config.queue_capacity));
        let cancel = CancellationToken::new();

        // Ready marker, before anything else can be enqueued.
        queue.push(MuxFrame::Init.encode());

        // Broadcaster → scheduler.
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ViewerEvent>();
        self.broadcaster.register(&self.viewer_id, event_tx);

        // Receive loop → scheduler.
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<SchedulerCmd>();

        // Send loop: sole consumer of the queue.
        let send_timeout = self.config.send_timeout;
        let send_queue = Arc::clone(&queue);
        let send_cancel = cancel.clone();
        let send_task = tokio::spawn(async move {
            while let Some(frame) = send_queue.pop().await {
                match tokio::time::timeout(send_timeout, ws_tx.send(Message::Binary(frame))).await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(?e, "viewer send failed");
                        break;
                    }
                    Err(_) => {
                        warn!("viewer send timed out, disconnecting");
                        break;
                    }
                }
            }
            send_cancel.cancel();
            let _ = ws_tx.close().await;
        });

        // Scheduler task: sole producer of the queue.
        let mut scheduler = Scheduler::new(
            Arc::clone(&self.ops),
            Arc::clone(&queue),
            self.config.clone(),
        );
        let sched_cancel = cancel.clone();
        let sched_task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = sched_cancel.cancelled() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => scheduler.handle_viewer_event(event),
                        None => break,
                    },
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => scheduler.handle_cmd(cmd).await,
                        None => break,
                    },
                    _ = tick.tick() => {
                        scheduler.flush_expired();
                        scheduler.maybe_resync().await;
                    }
                }
            }
        });

        // Receive loop, on this task.
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = cancel.cancelled() => break,
                message = ws_rx.next() => message,
            };
            let Some(message) = message else { break };
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    debug!(?e, "viewer receive failed");
                    break;
                }
            };
            match message {
                Message::Binary(data) => self.handle_incoming(&data, &cmd_tx).await,
                Message::Close(_) => break,
                // Text and control frames are not part of the protocol.
                _ => {}
            }
        }

        // Teardown: stop loops, drop the viewer from fan-out.
        cancel.cancel();
        queue.close();
        self.broadcaster.unregister(&self.viewer_id);
        let _ = sched_task.await;
        let _ = send_task.await;
        debug!(viewer = %self.viewer_id, "viewer disconnected");
    }

    /// Dispatch one client frame. Malformed or unexpected frames are logged
    /// and ignored; they never terminate the connection.
    async fn handle_incoming(
        &self,
        data: &[u8],
        cmd_tx: &mpsc::UnboundedSender<SchedulerCmd>,
    ) {
        let frame = match MuxFrame::decode(data) {
            Ok(f) => f,
            Err(e) => {
                trace!(?e, len = data.len(), "ignoring malformed frame");
                return;
            }
        };
        match frame {
            MuxFrame::Input { session_id, data } => {
                if let Err(e) = self
                    .ops
                    .send_input(&session_id, data, Some(&self.viewer_id))
                    .await
                {
                    debug!(session = %session_id, ?e, "input dropped");
                }
            }
            MuxFrame::Resize {
                session_id,
                cols,
                rows,
            } => match self
                .ops
                .resize(&session_id, cols, rows, Some(&self.viewer_id))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    trace!(session = %session_id, "resize rejected (not the active viewer)");
                }
                Err(e) => debug!(session = %session_id, ?e, "resize failed"),
            },
            MuxFrame::BufferRequest { session_id } => {
                let _ = cmd_tx.send(SchedulerCmd::BufferRequest(session_id));
            }
            MuxFrame::ActiveSessionHint { session_id } => {
                let _ = cmd_tx.send(SchedulerCmd::Hint(session_id));
            }
            other => {
                trace!(frame_type = ?other.frame_type(), "ignoring unexpected frame type");
            }
        }
    }
}
