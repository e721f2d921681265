//! Configuration loading and defaults.
//!
//! Resolution order, highest wins:
//!
//! 1. Environment variables (`WEBMUX_LISTEN`, `WEBMUX_TOKEN`)
//! 2. TOML config file, path via `--config <path>`
//! 3. Compiled defaults, documented per field below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8440"
//! token = "pre-shared-secret"
//! tls_cert = "/etc/webmux/cert.pem"
//! tls_key = "/etc/webmux/key.pem"
//! cors_origins = ["https://mux.example.com"]
//!
//! [sessions]
//! max_sessions = 32
//! scrollback_bytes = 131072
//! default_cols = 80
//! default_rows = 24
//!
//! [mux]
//! queue_capacity = 500
//! batch_max_bytes = 2048
//! batch_max_delay_ms = 2000
//!
//! [ipc]
//! ping_interval_ms = 5000
//! pong_timeout_ms = 3000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::hostipc::client::HostIpcConfig;
use crate::mux::client::MuxClientConfig;
use crate::sessions::SessionManagerConfig;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub ipc: IpcConfig,
}

/// Listener and security settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:8440`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Pre-shared bearer token. When absent the server only protects itself
    /// with WebSocket Origin checks, which is acceptable on loopback only.
    pub token: Option<String>,
    /// PEM certificate chain; with `tls_key`, enables HTTPS.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key.
    pub tls_key: Option<PathBuf>,
    /// Extra allowed browser origins for CORS and WS origin checks.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            token: None,
            tls_cert: None,
            tls_key: None,
            cors_origins: Vec::new(),
        }
    }
}

/// Session/host settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Maximum concurrent sessions (default 32).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Scrollback retained per session in bytes (default 128 KiB).
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// Host executable override; defaults to `webmux-host` next to the
    /// server binary.
    pub host_binary: Option<PathBuf>,
    /// Per-user runtime directory override for host sockets.
    pub runtime_dir: Option<PathBuf>,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            scrollback_bytes: default_scrollback_bytes(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            host_binary: None,
            runtime_dir: None,
        }
    }
}

/// Per-viewer output plane settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MuxConfig {
    /// Frame queue capacity per viewer (default 500).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Background batch flush threshold in bytes (default 2048).
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    /// Background batch flush deadline in milliseconds (default 2000).
    #[serde(default = "default_batch_max_delay_ms")]
    pub batch_max_delay_ms: u64,
    /// Per-message WebSocket send timeout in milliseconds (default 5000).
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_max_bytes: default_batch_max_bytes(),
            batch_max_delay_ms: default_batch_max_delay_ms(),
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

/// Host IPC link settings.
#[derive(Debug, Clone, Deserialize)]
pub struct IpcConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_recover_window_ms")]
    pub recover_window_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            recover_window_ms: default_recover_window_ms(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8440".to_string()
}
fn default_max_sessions() -> usize {
    32
}
fn default_scrollback_bytes() -> usize {
    128 * 1024
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_queue_capacity() -> usize {
    500
}
fn default_batch_max_bytes() -> usize {
    2048
}
fn default_batch_max_delay_ms() -> u64 {
    2000
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_ping_interval_ms() -> u64 {
    5000
}
fn default_pong_timeout_ms() -> u64 {
    3000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_reconnect_min_ms() -> u64 {
    100
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}
fn default_recover_window_ms() -> u64 {
    30_000
}

impl Config {
    /// Load from an optional TOML file, then apply environment overrides.
    /// A missing or unreadable file falls back to defaults with a warning.
    pub fn load(path: Option<&Path>) -> Self {
        let mut config = match path {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<Self>(&contents) {
                    Ok(config) => {
                        check_permissions(path);
                        config
                    }
                    Err(e) => {
                        warn!("failed to parse {}: {e}; using defaults", path.display());
                        Self::default()
                    }
                },
                Err(e) => {
                    warn!("failed to read {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            None => Self::default(),
        };

        if let Ok(listen) = std::env::var("WEBMUX_LISTEN") {
            if !listen.is_empty() {
                config.server.listen = listen;
            }
        }
        if let Ok(token) = std::env::var("WEBMUX_TOKEN") {
            if !token.is_empty() {
                config.server.token = Some(token);
            }
        }

        config
    }

    /// TLS is on when both cert and key are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }

    pub fn manager_config(&self) -> SessionManagerConfig {
        SessionManagerConfig {
            max_sessions: self.sessions.max_sessions,
            scrollback_bytes: self.sessions.scrollback_bytes,
            default_cols: self.sessions.default_cols,
            default_rows: self.sessions.default_rows,
            runtime_dir: self
                .sessions
                .runtime_dir
                .clone()
                .unwrap_or_else(crate::hostipc::protocol::runtime_dir),
            host_binary: self.sessions.host_binary.clone(),
            ipc: self.ipc_config(),
        }
    }

    pub fn ipc_config(&self) -> HostIpcConfig {
        HostIpcConfig {
            ping_interval: Duration::from_millis(self.ipc.ping_interval_ms),
            pong_timeout: Duration::from_millis(self.ipc.pong_timeout_ms),
            handshake_timeout: Duration::from_millis(self.ipc.handshake_timeout_ms),
            request_timeout: Duration::from_millis(self.ipc.handshake_timeout_ms),
            reconnect_min: Duration::from_millis(self.ipc.reconnect_min_ms),
            reconnect_max: Duration::from_millis(self.ipc.reconnect_max_ms),
            recover_window: Duration::from_millis(self.ipc.recover_window_ms),
        }
    }

    pub fn mux_client_config(&self) -> MuxClientConfig {
        MuxClientConfig {
            queue_capacity: self.mux.queue_capacity,
            batch_max_bytes: self.mux.batch_max_bytes,
            batch_max_delay: Duration::from_millis(self.mux.batch_max_delay_ms),
            send_timeout: Duration::from_millis(self.mux.send_timeout_ms),
            ..MuxClientConfig::default()
        }
    }
}

/// Warn when a config file that may carry the token is world-readable.
#[cfg(unix)]
fn check_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode();
    if mode & 0o004 != 0 {
        warn!(
            "config file {} is world-readable (mode {:o}); it may contain the \
             auth token, consider chmod 600",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:8440");
        assert!(config.server.token.is_none());
        assert_eq!(config.sessions.max_sessions, 32);
        assert_eq!(config.sessions.scrollback_bytes, 128 * 1024);
        assert_eq!(config.mux.queue_capacity, 500);
        assert_eq!(config.mux.batch_max_bytes, 2048);
        assert_eq!(config.ipc.ping_interval_ms, 5000);
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn parse_partial_toml_keeps_defaults() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:9000"
            token = "secret"

            [mux]
            queue_capacity = 64
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.token.as_deref(), Some("secret"));
        assert_eq!(config.mux.queue_capacity, 64);
        // Untouched sections keep their defaults.
        assert_eq!(config.mux.batch_max_bytes, 2048);
        assert_eq!(config.sessions.default_cols, 80);
        assert_eq!(config.ipc.reconnect_min_ms, 100);
    }

    #[test]
    fn parse_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8440");
    }

    #[test]
    fn tls_requires_both_paths() {
        let toml = r#"
            [server]
            tls_cert = "/tmp/cert.pem"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.tls_paths().is_none());

        let toml = r#"
            [server]
            tls_cert = "/tmp/cert.pem"
            tls_key = "/tmp/key.pem"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let (cert, key) = config.tls_paths().unwrap();
        assert_eq!(cert, Path::new("/tmp/cert.pem"));
        assert_eq!(key, Path::new("/tmp/key.pem"));
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/webmux.toml")));
        assert_eq!(config.server.listen, "127.0.0.1:8440");
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webmux.toml");
        std::fs::write(&path, "[sessions]\nmax_sessions = 4\n").unwrap();
        let config = Config::load(Some(&path));
        assert_eq!(config.sessions.max_sessions, 4);
    }

    #[test]
    fn derived_configs_map_durations() {
        let toml = r#"
            [mux]
            batch_max_delay_ms = 500

            [ipc]
            reconnect_min_ms = 50
            recover_window_ms = 10000
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let mux = config.mux_client_config();
        assert_eq!(mux.batch_max_delay, Duration::from_millis(500));
        let ipc = config.ipc_config();
        assert_eq!(ipc.reconnect_min, Duration::from_millis(50));
        assert_eq!(ipc.recover_window, Duration::from_secs(10));

        let mgr = config.manager_config();
        assert_eq!(mgr.ipc.reconnect_min, Duration::from_millis(50));
    }
}
