#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use webmux::api::{router, AppState, RouterConfig};
use webmux::hostipc::client::{HostIpcError, HostLink, LinkHealth};
use webmux::mux::client::MuxClientConfig;
use webmux::mux::MuxBroadcaster;
use webmux::sessions::info::now_ms;
use webmux::sessions::{SessionInfo, SessionManager, SessionManagerConfig, ShellKind};

/// Recorded calls on a [`FakeLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    Input(Bytes),
    Resize(u16, u16),
    GetBuffer,
    SetName(Option<String>),
    Close,
}

/// In-memory stand-in for a host IPC link.
#[derive(Default)]
pub struct FakeLink {
    pub calls: Mutex<Vec<LinkCall>>,
    pub buffer: Mutex<Bytes>,
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
        Ok(())
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
        Err(HostIpcError::Disconnected)
    }

    async fn close(&self) -> Result<(), HostIpcError> {
        self.calls.lock().push(LinkCall::Close);
        Ok(())
    }

    fn health(&self) -> LinkHealth {
        LinkHealth::Healthy
    }

    fn shutdown(&self) {}
}

pub fn sample_info(id: &str) -> SessionInfo {
    SessionInfo {
        id: id.to_string(),
        pid: 4321,
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

/// App state over a manager with no real hosts.
pub fn test_state() -> AppState {
    let broadcaster = Arc::new(MuxBroadcaster::new());
    let manager = SessionManager::new(SessionManagerConfig::default(), broadcaster);
    AppState::new(manager, MuxClientConfig::default())
}

/// App state with one fake-linked session.
pub fn state_with_session(id: &str) -> (AppState, Arc<FakeLink>) {
    let state = test_state();
    let link = FakeLink::with_buffer(b"replayed scrollback");
    state
        .sessions
        .adopt_session(sample_info(id), link.clone() as Arc<dyn HostLink>);
    (state, link)
}

/// Serve the router on an ephemeral port; returns its address.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let app = router(state, RouterConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    addr
}
