//! Session lifecycle management.
//!
//! [`SessionManager`] is the single authority for creating, accessing, and
//! destroying terminal sessions. Each session is backed by a separate
//! `webmux-host` process reached over [`crate::hostipc`]; the manager caches
//! the session record, enforces the active-viewer resize rule, fans output
//! into the [`MuxBroadcaster`] in arrival order, and notifies state
//! listeners on every lifecycle change.
//!
//! ## Concurrency
//!
//! The session map is behind a `parking_lot::RwLock`; entries are cheap
//! clones (`Arc`s) taken out of the map before any IPC await, so no lock is
//! ever held across I/O. Output ordering is preserved by an unbounded
//! single-reader channel drained by one task that publishes to the
//! broadcaster synchronously.

pub mod info;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info as tracing_info, warn};

use crate::hostipc::client::{
    HostEvents, HostIpcClient, HostIpcConfig, HostIpcError, HostLink,
};
use crate::hostipc::protocol as hostproto;
use crate::mux::broadcaster::{MuxBroadcaster, OutputEvent};

pub use info::{
    generate_session_id, is_valid_session_id, now_ms, valid_dimensions, SessionInfo, ShellKind,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session unavailable: {0}")]
    Unavailable(String),

    #[error("invalid dimensions {0}x{1}")]
    InvalidDimensions(u16, u16),

    #[error(transparent)]
    Ipc(#[from] HostIpcError),
}

/// Lifecycle notifications delivered to state listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    Changed { id: String },
    Destroyed { id: String },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Created { id } | Self::Changed { id } | Self::Destroyed { id } => id,
        }
    }
}

type StateListener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Knobs for the manager, fed from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub max_sessions: usize,
    pub scrollback_bytes: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub runtime_dir: PathBuf,
    /// Host executable. Defaults to `webmux-host` next to the current
    /// executable.
    pub host_binary: Option<PathBuf>,
    pub ipc: HostIpcConfig,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            scrollback_bytes: 128 * 1024,
            default_cols: 80,
            default_rows: 24,
            runtime_dir: hostproto::runtime_dir(),
            host_binary: None,
            ipc: HostIpcConfig::default(),
        }
    }
}

/// What to start a session with.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub cols: Option<u16>,
    pub rows: Option<u16>,
    pub shell: ShellKind,
    pub cwd: Option<String>,
    pub name: Option<String>,
}

#[derive(Clone)]
struct SessionEntry {
    state: Arc<Mutex<SessionInfo>>,
    link: Arc<dyn HostLink>,
}

/// How long an exited session stays listed so viewers can observe its exit
/// code before the record is removed.
const EXITED_CLEANUP_DELAY: std::time::Duration = std::time::Duration::from_millis(750);

/// Events arriving from per-session IPC links, funneled into one channel so
/// a single drain task publishes them in order.
enum LinkEvent {
    Output(String, Bytes),
    StateChange(String),
    Resync(String, SessionInfo, Bytes),
    Dead(String),
}

struct ManagerInner {
    config: SessionManagerConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    listeners: Mutex<HashMap<u64, StateListener>>,
    next_listener: AtomicU64,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    broadcaster: Arc<MuxBroadcaster>,
}

impl ManagerInner {
    fn entry(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.read().get(id).cloned()
    }

    fn dimensions(&self, id: &str) -> Option<(u16, u16)> {
        self.entry(id).map(|e| {
            let s = e.state.lock();
            (s.cols, s.rows)
        })
    }

    /// Deliver an event to every listener, isolating panics so one broken
    /// listener cannot starve the rest.
    fn notify(&self, event: &SessionEvent) {
        let listeners: Vec<StateListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(event);
            }));
            if result.is_err() {
                error!(?event, "state listener panicked");
            }
        }
    }
}

/// Registry and lifecycle authority for all sessions.
///
/// Cloneable; all clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, broadcaster: Arc<MuxBroadcaster>) -> Self {
        let (link_events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            config,
            sessions: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            link_events,
            broadcaster,
        });
        tokio::spawn(drain_link_events(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn broadcaster(&self) -> Arc<MuxBroadcaster> {
        Arc::clone(&self.inner.broadcaster)
    }

    /// Spawn a host process for a new session and wait for the IPC
    /// handshake. Fails with [`SessionError::Unavailable`] if the host
    /// cannot be spawned or does not answer within the handshake window.
    pub async fn create_session(
        &self,
        request: CreateSession,
    ) -> Result<SessionInfo, SessionError> {
        let cols = request.cols.unwrap_or(self.inner.config.default_cols);
        let rows = request.rows.unwrap_or(self.inner.config.default_rows);
        if !valid_dimensions(cols, rows) {
            return Err(SessionError::InvalidDimensions(cols, rows));
        }
        if self.inner.sessions.read().len() >= self.inner.config.max_sessions {
            return Err(SessionError::Unavailable(format!(
                "session limit reached (max {})",
                self.inner.config.max_sessions
            )));
        }

        let id = loop {
            let candidate = generate_session_id();
            if !self.inner.sessions.read().contains_key(&candidate) {
                break candidate;
            }
        };

        let runtime_dir = self.inner.config.runtime_dir.clone();
        if let Err(e) = std::fs::create_dir_all(&runtime_dir) {
            return Err(SessionError::Unavailable(format!(
                "cannot create runtime dir: {e}"
            )));
        }

        let host_binary = match &self.inner.config.host_binary {
            Some(path) => path.clone(),
            None => default_host_binary()
                .ok_or_else(|| SessionError::Unavailable("host binary not found".into()))?,
        };

        let mut cmd = tokio::process::Command::new(&host_binary);
        cmd.arg("--session-id")
            .arg(&id)
            .arg("--shell")
            .arg(request.shell.as_str())
            .arg("--cols")
            .arg(cols.to_string())
            .arg("--rows")
            .arg(rows.to_string())
            .arg("--scrollback")
            .arg(self.inner.config.scrollback_bytes.to_string())
            .arg("--runtime-dir")
            .arg(&runtime_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(cwd) = &request.cwd {
            cmd.arg("--cwd").arg(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SessionError::Unavailable(format!("host spawn failed: {e}")))?;

        let socket = hostproto::socket_path(&runtime_dir, &id);
        let deadline =
            tokio::time::Instant::now() + self.inner.config.ipc.handshake_timeout;
        loop {
            match self.attach_once(&id, socket.clone()).await {
                Ok(_) => break,
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        let _ = child.start_kill();
                        return Err(SessionError::Unavailable(format!(
                            "IPC handshake with host failed: {e}"
                        )));
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }
        }

        // The host outlives us by design; this task just reaps it if it
        // exits while we are still around.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        if let Some(name) = request.name.as_deref() {
            if let Err(e) = self.set_name(&id, Some(name)).await {
                warn!(session = %id, ?e, "failed to apply initial name");
            }
        }

        self.get_session(&id)
            .ok_or_else(|| SessionError::Unavailable("session vanished during setup".into()))
    }

    /// Connect to an existing host endpoint and register the session.
    async fn attach_once(
        &self,
        id: &str,
        socket: PathBuf,
    ) -> Result<SessionInfo, SessionError> {
        let events = self.events_for(id);
        let (client, info) = HostIpcClient::connect(
            id,
            socket,
            self.inner.config.ipc.clone(),
            events,
        )
        .await?;
        self.adopt_session(info.clone(), Arc::new(client));
        Ok(info)
    }

    /// Register an already-connected link under its session id. Used after
    /// spawn, on startup recovery, and by tests with fake links.
    pub fn adopt_session(&self, info: SessionInfo, link: Arc<dyn HostLink>) {
        let id = info.id.clone();
        let entry = SessionEntry {
            state: Arc::new(Mutex::new(info)),
            link,
        };
        let previous = self.inner.sessions.write().insert(id.clone(), entry);
        if previous.is_some() {
            warn!(session = %id, "replaced existing session entry");
        }
        self.inner.notify(&SessionEvent::Created { id });
    }

    /// Reattach sessions whose host processes survived a server restart.
    /// Returns the number of recovered sessions; stale socket files are
    /// cleaned up along the way.
    pub async fn recover(&self) -> usize {
        let dir = self.inner.config.runtime_dir.clone();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return 0,
        };
        let mut recovered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(id) = hostproto::session_id_from_socket(&path) else {
                continue;
            };
            if !is_valid_session_id(&id) || self.inner.sessions.read().contains_key(&id) {
                continue;
            }
            match self.attach_once(&id, path.clone()).await {
                Ok(_) => {
                    tracing_info!(session = %id, "reattached to running host");
                    recovered += 1;
                }
                Err(e) => {
                    debug!(session = %id, ?e, "removing stale host socket");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        recovered
    }

    fn events_for(&self, id: &str) -> HostEvents {
        let id = id.to_string();
        let tx = self.inner.link_events.clone();
        let out_id = id.clone();
        let out_tx = tx.clone();
        let state_id = id.clone();
        let state_tx = tx.clone();
        let resync_id = id.clone();
        let resync_tx = tx.clone();
        HostEvents {
            on_output: Box::new(move |data| {
                let _ = out_tx.send(LinkEvent::Output(out_id.clone(), data));
            }),
            on_state_change: Box::new(move || {
                let _ = state_tx.send(LinkEvent::StateChange(state_id.clone()));
            }),
            on_resync: Box::new(move |info, snapshot| {
                let _ = resync_tx.send(LinkEvent::Resync(resync_id.clone(), info, snapshot));
            }),
            on_dead: Box::new(move || {
                let _ = tx.send(LinkEvent::Dead(id.clone()));
            }),
        }
    }

    /// Pure lookup.
    pub fn get_session(&self, id: &str) -> Option<SessionInfo> {
        self.inner.entry(id).map(|e| e.state.lock().clone())
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|e| e.state.lock().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.inner.sessions.read().keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    pub fn dimensions(&self, id: &str) -> Option<(u16, u16)> {
        self.inner.dimensions(id)
    }

    /// Remove a session and ask its host to terminate. Idempotent: returns
    /// `false` when the session was already gone.
    pub fn close_session(&self, id: &str) -> bool {
        let entry = self.inner.sessions.write().remove(id);
        let Some(entry) = entry else {
            return false;
        };
        self.inner.notify(&SessionEvent::Destroyed { id: id.to_string() });
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = entry.link.close().await {
                debug!(session = %id, ?e, "close request failed (host may be gone)");
            }
        });
        true
    }

    /// Resize a session's terminal.
    ///
    /// When `viewer` is provided, the resize only wins if that viewer is the
    /// session's last-active viewer; otherwise it returns `Ok(false)` and the
    /// dimensions are untouched. Viewerless (API) resizes are unconditional.
    /// IPC failure also surfaces as `Ok(false)`.
    pub async fn resize(
        &self,
        id: &str,
        cols: u16,
        rows: u16,
        viewer: Option<&str>,
    ) -> Result<bool, SessionError> {
        if !valid_dimensions(cols, rows) {
            return Err(SessionError::InvalidDimensions(cols, rows));
        }
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if let Some(viewer) = viewer {
            let state = entry.state.lock();
            if let Some(active) = state.last_active_viewer_id.as_deref() {
                if active != viewer {
                    return Ok(false);
                }
            }
        }

        match entry.link.resize(cols, rows).await {
            Ok(()) => {
                {
                    let mut state = entry.state.lock();
                    state.cols = cols;
                    state.rows = rows;
                }
                self.inner
                    .notify(&SessionEvent::Changed { id: id.to_string() });
                Ok(true)
            }
            Err(e) => {
                warn!(session = %id, ?e, "resize failed over IPC");
                Ok(false)
            }
        }
    }

    /// Forward input bytes to the session's PTY. A provided `viewer`
    /// becomes the session's last-active viewer.
    pub async fn send_input(
        &self,
        id: &str,
        data: Bytes,
        viewer: Option<&str>,
    ) -> Result<(), SessionError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if let Some(viewer) = viewer {
            let changed = {
                let mut state = entry.state.lock();
                if state.last_active_viewer_id.as_deref() != Some(viewer) {
                    state.last_active_viewer_id = Some(viewer.to_string());
                    true
                } else {
                    false
                }
            };
            if changed {
                self.inner
                    .notify(&SessionEvent::Changed { id: id.to_string() });
            }
        }

        entry.link.send_input(data).await.map_err(SessionError::from)
    }

    /// Latest scrollback snapshot from the host.
    pub async fn get_buffer(&self, id: &str) -> Result<Bytes, SessionError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.link.get_buffer().await.map_err(SessionError::from)
    }

    /// Set or clear (`None`) the session's display name.
    pub async fn set_name(&self, id: &str, name: Option<&str>) -> Result<(), SessionError> {
        let entry = self
            .inner
            .entry(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        entry.link.set_name(name).await?;
        entry.state.lock().name = name.map(ToString::to_string);
        self.inner
            .notify(&SessionEvent::Changed { id: id.to_string() });
        Ok(())
    }

    /// Register a state listener; returns the id to remove it with.
    pub fn add_state_listener(
        &self,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn remove_state_listener(&self, listener_id: u64) -> bool {
        self.inner.listeners.lock().remove(&listener_id).is_some()
    }

    /// Stop the IPC links without touching the host processes, which keep
    /// running for reattachment after a restart.
    pub fn shutdown(&self) {
        for entry in self.inner.sessions.read().values() {
            entry.link.shutdown();
        }
    }
}

/// Locate `webmux-host` next to the running executable.
fn default_host_binary() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join("webmux-host");
    candidate.exists().then_some(candidate)
}

/// Single consumer of all link events; keeps per-session output ordering
/// intact on its way into the broadcaster.
async fn drain_link_events(
    mut rx: mpsc::UnboundedReceiver<LinkEvent>,
    inner: Weak<ManagerInner>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Output(id, data) => {
                if let Some((cols, rows)) = inner.dimensions(&id) {
                    inner.broadcaster.publish_output(OutputEvent {
                        session_id: id,
                        cols,
                        rows,
                        data,
                    });
                }
            }
            LinkEvent::StateChange(id) => {
                // Re-fetch off the drain so a slow host cannot stall output.
                let Some(entry) = inner.entry(&id) else {
                    continue;
                };
                let inner = Arc::downgrade(&inner);
                tokio::spawn(async move {
                    match entry.link.get_info().await {
                        Ok(fresh) => {
                            let Some(inner) = inner.upgrade() else { return };
                            let exited = !fresh.is_running;
                            {
                                let mut state = entry.state.lock();
                                let last_active = state.last_active_viewer_id.clone();
                                *state = fresh;
                                state.last_active_viewer_id = last_active;
                            }
                            inner.notify(&SessionEvent::Changed { id: id.clone() });
                            if exited {
                                // Let the exit state reach viewers before the
                                // record disappears.
                                tokio::time::sleep(EXITED_CLEANUP_DELAY).await;
                                let manager = SessionManager { inner };
                                manager.close_session(&id);
                            }
                        }
                        Err(e) => {
                            debug!(session = %id, ?e, "state re-fetch failed");
                        }
                    }
                });
            }
            LinkEvent::Resync(id, fresh, snapshot) => {
                if let Some(entry) = inner.entry(&id) {
                    let (cols, rows) = {
                        let mut state = entry.state.lock();
                        let last_active = state.last_active_viewer_id.clone();
                        *state = fresh;
                        state.last_active_viewer_id = last_active;
                        (state.cols, state.rows)
                    };
                    inner.notify(&SessionEvent::Changed { id: id.clone() });
                    inner.broadcaster.publish_replay(&id, cols, rows, snapshot);
                }
            }
            LinkEvent::Dead(id) => {
                warn!(session = %id, "host link unrecoverable, closing session");
                let manager = SessionManager {
                    inner: Arc::clone(&inner),
                };
                manager.close_session(&id);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording fake of [`HostLink`] for manager and mux tests.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LinkCall {
        Input(Bytes),
        Resize(u16, u16),
        GetBuffer,
        SetName(Option<String>),
        Close,
    }

    #[derive(Default)]
    pub struct FakeLink {
        pub calls: Mutex<Vec<LinkCall>>,
        pub buffer: Mutex<Bytes>,
        pub fail_resize: AtomicBool,
        pub info: Mutex<Option<SessionInfo>>,
    }

    impl FakeLink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn with_buffer(data: &'static [u8]) -> Arc<Self> {
            let link = Self::default();
            *link.buffer.lock() = Bytes::from_static(data);
            Arc::new(link)
        }

        pub fn calls(&self) -> Vec<LinkCall> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl HostLink for FakeLink {
        async fn send_input(&self, data: Bytes) -> Result<(), HostIpcError> {
            self.calls.lock().push(LinkCall::Input(data));
            Ok(())
        }

        async fn resize(&self, cols: u16, rows: u16) -> Result<(), HostIpcError> {
            self.calls.lock().push(LinkCall::Resize(cols, rows));
            if self.fail_resize.load(Ordering::SeqCst) {
                Err(HostIpcError::Disconnected)
            } else {
                Ok(())
            }
        }

        async fn get_buffer(&self) -> Result<Bytes, HostIpcError> {
            self.calls.lock().push(LinkCall::GetBuffer);
            Ok(self.buffer.lock().clone())
        }

        async fn set_name(&self, name: Option<&str>) -> Result<(), HostIpcError> {
            self.calls
                .lock()
                .push(LinkCall::SetName(name.map(ToString::to_string)));
            Ok(())
        }

        async fn get_info(&self) -> Result<SessionInfo, HostIpcError> {
            self.info
                .lock()
                .clone()
                .ok_or(HostIpcError::Disconnected)
        }

        async fn close(&self) -> Result<(), HostIpcError> {
            self.calls.lock().push(LinkCall::Close);
            Ok(())
        }

        fn health(&self) -> crate::hostipc::client::LinkHealth {
            crate::hostipc::client::LinkHealth::Healthy
        }

        fn shutdown(&self) {}
    }

    pub fn sample_info(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            pid: 100,
            created_at: now_ms(),
            is_running: true,
            exit_code: None,
            current_working_directory: Some("/".into()),
            cols: 80,
            rows: 24,
            shell_type: ShellKind::Default,
            name: None,
            last_active_viewer_id: None,
        }
    }

    pub fn manager_with_session(id: &str) -> (SessionManager, Arc<FakeLink>) {
        let broadcaster = Arc::new(MuxBroadcaster::new());
        let manager = SessionManager::new(SessionManagerConfig::default(), broadcaster);
        let link = FakeLink::with_buffer(b"scrollback bytes");
        manager.adopt_session(sample_info(id), link.clone() as Arc<dyn HostLink>);
        (manager, link)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn get_and_list_sessions() {
        let (manager, _link) = manager_with_session("abcd1234");
        assert!(manager.get_session("abcd1234").is_some());
        assert!(manager.get_session("missing1").is_none());
        assert_eq!(manager.list_sessions().len(), 1);
        assert_eq!(manager.dimensions("abcd1234"), Some((80, 24)));
    }

    #[tokio::test]
    async fn input_tracks_last_active_viewer() {
        let (manager, link) = manager_with_session("abcd1234");
        manager
            .send_input("abcd1234", Bytes::from_static(b"ls\n"), Some("viewer-1"))
            .await
            .unwrap();
        let info = manager.get_session("abcd1234").unwrap();
        assert_eq!(info.last_active_viewer_id.as_deref(), Some("viewer-1"));
        assert_eq!(
            link.calls(),
            vec![LinkCall::Input(Bytes::from_static(b"ls\n"))]
        );
    }

    #[tokio::test]
    async fn active_viewer_wins_resize() {
        let (manager, link) = manager_with_session("abcd1234");

        // viewer-1 establishes itself by typing.
        manager
            .send_input("abcd1234", Bytes::from_static(b"ls\n"), Some("viewer-1"))
            .await
            .unwrap();

        // A different viewer's resize is rejected and dims are untouched.
        let accepted = manager
            .resize("abcd1234", 132, 50, Some("viewer-2"))
            .await
            .unwrap();
        assert!(!accepted);
        assert_eq!(manager.dimensions("abcd1234"), Some((80, 24)));
        assert!(!link.calls().contains(&LinkCall::Resize(132, 50)));

        // The active viewer's resize is accepted.
        let accepted = manager
            .resize("abcd1234", 132, 50, Some("viewer-1"))
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(manager.dimensions("abcd1234"), Some((132, 50)));

        // viewer-2 becomes active by typing, then may resize.
        manager
            .send_input("abcd1234", Bytes::from_static(b"w\n"), Some("viewer-2"))
            .await
            .unwrap();
        let accepted = manager
            .resize("abcd1234", 100, 30, Some("viewer-2"))
            .await
            .unwrap();
        assert!(accepted);
    }

    #[tokio::test]
    async fn viewerless_resize_is_unconditional() {
        let (manager, _link) = manager_with_session("abcd1234");
        manager
            .send_input("abcd1234", Bytes::from_static(b"x"), Some("viewer-1"))
            .await
            .unwrap();
        let accepted = manager.resize("abcd1234", 90, 28, None).await.unwrap();
        assert!(accepted);
        assert_eq!(manager.dimensions("abcd1234"), Some((90, 28)));
    }

    #[tokio::test]
    async fn resize_ipc_failure_surfaces_as_false() {
        let (manager, link) = manager_with_session("abcd1234");
        link.fail_resize.store(true, Ordering::SeqCst);
        let accepted = manager.resize("abcd1234", 132, 50, None).await.unwrap();
        assert!(!accepted);
        assert_eq!(manager.dimensions("abcd1234"), Some((80, 24)));
    }

    #[tokio::test]
    async fn resize_rejects_invalid_dimensions() {
        let (manager, _link) = manager_with_session("abcd1234");
        assert!(matches!(
            manager.resize("abcd1234", 0, 24, None).await,
            Err(SessionError::InvalidDimensions(0, 24))
        ));
        assert!(matches!(
            manager.resize("abcd1234", 80, 10_000, None).await,
            Err(SessionError::InvalidDimensions(80, 10_000))
        ));
    }

    #[tokio::test]
    async fn close_session_is_idempotent() {
        let (manager, link) = manager_with_session("abcd1234");
        assert!(manager.close_session("abcd1234"));
        assert!(!manager.close_session("abcd1234"));
        assert!(manager.get_session("abcd1234").is_none());

        // The close request reaches the link exactly once.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let closes = link
            .calls()
            .iter()
            .filter(|c| **c == LinkCall::Close)
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn get_buffer_returns_host_snapshot() {
        let (manager, _link) = manager_with_session("abcd1234");
        let buf = manager.get_buffer("abcd1234").await.unwrap();
        assert_eq!(buf, Bytes::from_static(b"scrollback bytes"));
        assert!(matches!(
            manager.get_buffer("missing1").await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn set_name_updates_cache() {
        let (manager, link) = manager_with_session("abcd1234");
        manager.set_name("abcd1234", Some("build")).await.unwrap();
        assert_eq!(
            manager.get_session("abcd1234").unwrap().name.as_deref(),
            Some("build")
        );
        manager.set_name("abcd1234", None).await.unwrap();
        assert!(manager.get_session("abcd1234").unwrap().name.is_none());
        assert_eq!(
            link.calls()
                .iter()
                .filter(|c| matches!(c, LinkCall::SetName(_)))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn listeners_observe_lifecycle() {
        let broadcaster = Arc::new(MuxBroadcaster::new());
        let manager = SessionManager::new(SessionManagerConfig::default(), broadcaster);
        let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        manager.add_state_listener(move |ev| sink.lock().push(ev.clone()));

        let link = FakeLink::new();
        manager.adopt_session(sample_info("abcd1234"), link as Arc<dyn HostLink>);
        manager.close_session("abcd1234");

        let events = events.lock().clone();
        assert_eq!(
            events,
            vec![
                SessionEvent::Created {
                    id: "abcd1234".into()
                },
                SessionEvent::Destroyed {
                    id: "abcd1234".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn panicking_listener_does_not_starve_others() {
        let (manager, _link) = manager_with_session("abcd1234");

        let seen = Arc::new(AtomicUsize::new(0));
        manager.add_state_listener(|_| panic!("broken listener"));
        let counter = Arc::clone(&seen);
        manager.add_state_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Triggers Changed; both listeners get called, one panics.
        manager.set_name("abcd1234", Some("x")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_listener_stops_firing() {
        let (manager, _link) = manager_with_session("abcd1234");
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let listener_id = manager.add_state_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        manager.set_name("abcd1234", Some("a")).await.unwrap();
        assert!(manager.remove_state_listener(listener_id));
        manager.set_name("abcd1234", Some("b")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(!manager.remove_state_listener(listener_id));
    }

    #[tokio::test]
    async fn output_drain_publishes_in_order_with_dimensions() {
        let broadcaster = Arc::new(MuxBroadcaster::new());
        let manager =
            SessionManager::new(SessionManagerConfig::default(), Arc::clone(&broadcaster));
        let link = FakeLink::new();
        manager.adopt_session(sample_info("abcd1234"), link as Arc<dyn HostLink>);

        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.register("v1", tx);

        for chunk in [&b"a"[..], b"b", b"c"] {
            manager
                .inner
                .link_events
                .send(LinkEvent::Output(
                    "abcd1234".into(),
                    Bytes::copy_from_slice(chunk),
                ))
                .unwrap();
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                crate::mux::broadcaster::ViewerEvent::Output(ev) => {
                    assert_eq!((ev.cols, ev.rows), (80, 24));
                    got.push(ev.data);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(
            got,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    #[tokio::test]
    async fn dead_link_closes_session() {
        let (manager, _link) = manager_with_session("abcd1234");
        manager
            .inner
            .link_events
            .send(LinkEvent::Dead("abcd1234".into()))
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(manager.get_session("abcd1234").is_none());
    }
}
