//! The webmux web server binary.
//!
//! Owns the HTTP(S) listener and the session manager; spawns one
//! `webmux-host` process per terminal session and multiplexes their I/O to
//! browsers over `/ws/mux`, with session-list updates on `/ws/state`.
//!
//! On startup any host processes left over from a previous run are
//! reattached by scanning the per-user runtime directory. On SIGINT/SIGTERM
//! the server stops accepting, asks viewers to disconnect, and exits,
//! deliberately leaving the hosts (and their shells) running for the next
//! start to pick up.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webmux::api::{self, AppState, RouterConfig};
use webmux::mux::MuxBroadcaster;
use webmux::sessions::SessionManager;
use webmux::{tls, Config};

/// Browser-accessible terminal multiplexer.
#[derive(Parser, Debug)]
#[command(name = "webmux", version, about)]
struct Args {
    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind, overriding the config file.
    #[arg(long)]
    bind: Option<String>,

    /// Bearer token, overriding the config file.
    #[arg(long, env = "WEBMUX_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

/// Wait for drains after shutdown is signalled, then give up.
const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webmux=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::load(args.config.as_deref());
    if let Some(bind) = args.bind {
        config.server.listen = bind;
    }
    if let Some(token) = args.token {
        config.server.token = Some(token);
    }

    info!("webmux v{} starting", env!("CARGO_PKG_VERSION"));

    let bind: SocketAddr = match config.server.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("webmux: invalid listen address {}: {e}", config.server.listen);
            std::process::exit(2);
        }
    };
    if config.server.token.is_none() && !bind.ip().is_loopback() {
        warn!("binding a non-loopback address without a token; set one in [server] or WEBMUX_TOKEN");
    }

    let broadcaster = Arc::new(MuxBroadcaster::new());
    let manager = SessionManager::new(config.manager_config(), broadcaster);
    let state = AppState::new(manager.clone(), config.mux_client_config());

    // Pick up hosts that survived a previous server process.
    let recovered = manager.recover().await;
    if recovered > 0 {
        info!(recovered, "reattached running sessions");
    }

    let app = api::router(
        state.clone(),
        RouterConfig {
            token: config.server.token.clone(),
            bind,
            cors_origins: config.server.cors_origins.clone(),
        },
    );

    let listener = match tokio::net::TcpListener::bind(bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("webmux: failed to bind {bind}: {e}");
            std::process::exit(2);
        }
    };

    // Signal handling: first signal starts the graceful path.
    let shutdown_signal = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    match config.tls_paths() {
        Some((cert, key)) => {
            let acceptor = match tls::load_tls_config(cert, key) {
                Ok(a) => a,
                Err(e) => {
                    eprintln!("webmux: TLS setup failed: {e}");
                    std::process::exit(2);
                }
            };
            info!("listening on https://{bind}");
            let serve_token = state.shutdown.token();
            tokio::select! {
                () = tls::serve(listener, acceptor, app, serve_token) => {}
                () = shutdown_signal => {}
            }
        }
        None => {
            info!("listening on http://{bind}");
            let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);
            if let Err(e) = server.await {
                eprintln!("webmux: server error: {e}");
            }
        }
    }

    // Graceful teardown: viewers first, then the IPC links. Hosts stay up.
    info!("shutting down");
    state.shutdown.shutdown();
    let _ = tokio::time::timeout(DRAIN_DEADLINE, state.shutdown.wait_for_all_closed()).await;
    manager.shutdown();
    info!("goodbye");
}
