//! webmux, a browser-accessible terminal multiplexer.
//!
//! One web server process (`webmux`) owns the lifecycle of many pseudo
//! terminals, each hosted by a dedicated `webmux-host` process, and
//! multiplexes their I/O to browsers over a single binary WebSocket.
//!
//! Data flow:
//!
//! ```text
//! PTY ─▶ host (scrollback) ─▶ IPC ─▶ SessionManager ─▶ MuxBroadcaster
//!                                                        │
//!                                      ┌─────────────────┴──────────┐
//!                                      ▼                            ▼
//!                                 MuxClient (viewer 1) ...  MuxClient (viewer N)
//!                                      │ bounded queue, batching, resync
//!                                      ▼
//!                                  WebSocket
//! ```
//!
//! Input flows the other way: `WebSocket → MuxClient → SessionManager →
//! IPC → host → PTY`. Session-list updates travel on a second WebSocket
//! (`/ws/state`) as JSON.

pub mod api;
pub mod buffer;
pub mod config;
pub mod host;
pub mod hostipc;
pub mod mux;
pub mod pty;
pub mod sessions;
pub mod shutdown;
pub mod tls;

pub use buffer::CircularByteBuffer;
pub use config::Config;
pub use sessions::{SessionInfo, SessionManager, ShellKind};
pub use shutdown::ShutdownCoordinator;
