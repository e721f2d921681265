//! IPC between the web server and per-session PTY host processes.
//!
//! [`protocol`] defines the framed wire format and endpoint naming;
//! [`client`] is the web-server side: one connection per live session with
//! heartbeating and automatic reconnect.

pub mod client;
pub mod protocol;

pub use client::{HostEvents, HostIpcClient, HostIpcConfig, HostIpcError, HostLink, LinkHealth};
pub use protocol::{HostFrame, HostFrameType};
