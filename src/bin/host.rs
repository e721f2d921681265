//! The webmux-host binary: one process per terminal session.
//!
//! Owns a PTY pair and a child shell, keeps the scrollback, and serves the
//! framed IPC protocol on a Unix socket named from the session id. Also
//! carries the `--pty-exec` child-helper subcommand used between fork and
//! exec on Unix; that path never returns on success.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webmux::host::{self, HostOptions};
use webmux::sessions::info::is_valid_session_id;
use webmux::sessions::ShellKind;

/// PTY host process for webmux sessions.
#[derive(Parser, Debug)]
#[command(name = "webmux-host", version, about)]
struct Args {
    /// Attach stdio to this slave PTY and exec the trailing command
    /// (internal child helper, Unix only).
    #[arg(long, value_name = "SLAVE_PATH")]
    pty_exec: Option<String>,

    /// Command for `--pty-exec`, after `--`.
    #[arg(last = true)]
    exec_argv: Vec<String>,

    /// 8-character session id this host serves.
    #[arg(long)]
    session_id: Option<String>,

    /// Shell to run.
    #[arg(long, default_value = "default")]
    shell: ShellKind,

    /// Working directory for the shell.
    #[arg(long)]
    cwd: Option<String>,

    #[arg(long, default_value_t = 80)]
    cols: u16,

    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Scrollback capacity in bytes.
    #[arg(long, default_value_t = 128 * 1024)]
    scrollback: usize,

    /// Run the shell as this uid (Unix only).
    #[arg(long)]
    uid: Option<u32>,

    /// Run the shell as this gid (Unix only).
    #[arg(long)]
    gid: Option<u32>,

    /// Directory for the IPC socket (defaults to the per-user runtime dir).
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // The exec helper replaces this process image; it must run before any
    // runtime threads exist.
    #[cfg(unix)]
    {
        if let Some(slave_path) = args.pty_exec.as_deref() {
            let code = webmux::pty::exec::pty_exec(slave_path, &args.exec_argv);
            return ExitCode::from(code as u8);
        }
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webmux=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(session_id) = args.session_id else {
        eprintln!("webmux-host: --session-id is required");
        return ExitCode::from(webmux::pty::exec::EXIT_BAD_ARGS as u8);
    };
    if !is_valid_session_id(&session_id) {
        eprintln!("webmux-host: invalid session id: {session_id}");
        return ExitCode::from(webmux::pty::exec::EXIT_BAD_ARGS as u8);
    }

    let options = HostOptions {
        session_id,
        shell: args.shell,
        cwd: args.cwd,
        cols: args.cols,
        rows: args.rows,
        scrollback_bytes: args.scrollback,
        uid: args.uid,
        gid: args.gid,
        runtime_dir: args.runtime_dir,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("webmux-host: failed to start runtime: {e}");
            return ExitCode::from(1);
        }
    };
    let code = runtime.block_on(host::run(options));
    ExitCode::from(code as u8)
}
