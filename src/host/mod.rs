//! The per-session PTY host process.
//!
//! One `webmux-host` process owns exactly one PTY and one child shell. It
//! binds a Unix socket named from the session id and serves the framed IPC
//! protocol to at most one client at a time, normally the web server's
//! [`crate::hostipc::client::HostIpcClient`].
//!
//! The host is deliberately orphan-tolerant: it keeps running across client
//! disconnects (buffering output to scrollback only) so the web server can
//! restart and reattach. Once the shell exits it lingers briefly for the
//! client to drain the exit notification, then exits 0.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::CircularByteBuffer;
use crate::hostipc::protocol::{self, HostFrame, HostFrameType};
use crate::pty::{PtyProcess, SpawnSpec};
use crate::sessions::info::{now_ms, valid_dimensions, SessionInfo, ShellKind};

/// Exit code: clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Exit code: could not bind the IPC endpoint.
pub const EXIT_BIND: i32 = 10;
/// Exit code: could not spawn the PTY/shell.
pub const EXIT_SPAWN: i32 = 11;

/// How long to keep serving after the shell exits so a client can drain.
const EXIT_LINGER: std::time::Duration = std::time::Duration::from_secs(10);

/// Options parsed from the `webmux-host` command line.
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub session_id: String,
    pub shell: ShellKind,
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_bytes: usize,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Override the per-user runtime directory (mainly for tests).
    pub runtime_dir: Option<PathBuf>,
}

struct HostState {
    info: SessionInfo,
    scrollback: CircularByteBuffer,
}

type SharedWriter = Arc<tokio::sync::Mutex<Option<OwnedWriteHalf>>>;

/// Write one frame to the current client, dropping the connection slot on
/// failure. No-op when no client is attached.
async fn send_to_client(writer: &SharedWriter, frame: &HostFrame) {
    let mut slot = writer.lock().await;
    if let Some(w) = slot.as_mut() {
        if let Err(e) = frame.write_to(w).await {
            debug!(?e, "client write failed, detaching");
            *slot = None;
        }
    }
}

/// Run the host until the shell exits or a close is requested. Returns the
/// process exit code.
pub async fn run(opts: HostOptions) -> i32 {
    let runtime_dir = opts
        .runtime_dir
        .clone()
        .unwrap_or_else(protocol::runtime_dir);
    if let Err(e) = std::fs::create_dir_all(&runtime_dir) {
        eprintln!(
            "webmux-host: cannot create runtime dir {}: {e}",
            runtime_dir.display()
        );
        return EXIT_BIND;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&runtime_dir, std::fs::Permissions::from_mode(0o700));
    }

    let socket_path = protocol::socket_path(&runtime_dir, &opts.session_id);

    // A socket file may be left over from a crashed host. If something is
    // actually listening there, refuse to double-bind.
    if socket_path.exists() {
        match std::os::unix::net::UnixStream::connect(&socket_path) {
            Ok(_) => {
                eprintln!(
                    "webmux-host: another host is listening on {}",
                    socket_path.display()
                );
                return EXIT_BIND;
            }
            Err(_) => {
                let _ = std::fs::remove_file(&socket_path);
            }
        }
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(l) => l,
        Err(e) => {
            eprintln!(
                "webmux-host: failed to bind {}: {e}",
                socket_path.display()
            );
            return EXIT_BIND;
        }
    };
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600));
    }

    let mut spec = SpawnSpec::new(opts.shell.program(), opts.cols, opts.rows);
    spec.cwd = opts.cwd.clone();
    spec.uid = opts.uid;
    spec.gid = opts.gid;

    let mut pty = match PtyProcess::spawn(&spec) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("webmux-host: failed to spawn shell: {e}");
            let _ = std::fs::remove_file(&socket_path);
            return EXIT_SPAWN;
        }
    };
    let mut output_rx = pty.take_output().expect("output stream taken once");
    let pty = Arc::new(pty);

    info!(
        session = %opts.session_id,
        pid = pty.pid(),
        shell = %opts.shell,
        "host ready on {}",
        socket_path.display()
    );

    let state = Arc::new(Mutex::new(HostState {
        info: SessionInfo {
            id: opts.session_id.clone(),
            pid: pty.pid(),
            created_at: now_ms(),
            is_running: true,
            exit_code: None,
            current_working_directory: opts.cwd.clone(),
            cols: opts.cols,
            rows: opts.rows,
            shell_type: opts.shell,
            name: None,
            last_active_viewer_id: None,
        },
        // Snapshots travel as one Buffer frame, so scrollback can never
        // exceed the IPC payload cap.
        scrollback: CircularByteBuffer::new(
            opts.scrollback_bytes.clamp(1, protocol::MAX_PAYLOAD as usize),
        ),
    }));

    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(None));
    let close_token = CancellationToken::new();
    // Signalled when a client fetches Info after the shell has exited.
    let drained = Arc::new(Notify::new());

    // PTY output: append to scrollback, forward to the attached client.
    let out_state = Arc::clone(&state);
    let out_writer = Arc::clone(&writer);
    let output_task = tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            out_state.lock().scrollback.write(&chunk);
            send_to_client(
                &out_writer,
                &HostFrame::new(HostFrameType::Output, chunk),
            )
            .await;
        }
    });

    let mut exit_watch = pty.exit_watch();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("webmux-host: cannot install SIGTERM handler: {e}");
            let _ = std::fs::remove_file(&socket_path);
            return EXIT_BIND;
        }
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        attach_client(
                            stream,
                            Arc::clone(&state),
                            Arc::clone(&writer),
                            Arc::clone(&pty),
                            close_token.clone(),
                            Arc::clone(&drained),
                        )
                        .await;
                    }
                    Err(e) => warn!(?e, "accept failed"),
                }
            }
            _ = exit_watch.changed() => {
                let code = *exit_watch.borrow();
                if let Some(code) = code {
                    info!(code, "shell exited");
                    {
                        let mut s = state.lock();
                        s.info.is_running = false;
                        s.info.exit_code = Some(code);
                    }
                    send_to_client(&writer, &HostFrame::empty(HostFrameType::StateChange)).await;
                    break;
                }
            }
            _ = close_token.cancelled() => {
                info!("close requested, terminating shell");
                pty.terminate();
                output_task.abort();
                let _ = std::fs::remove_file(&socket_path);
                return EXIT_OK;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM, terminating shell");
                pty.terminate();
                output_task.abort();
                let _ = std::fs::remove_file(&socket_path);
                return EXIT_OK;
            }
        }
    }

    // Shell has exited. Keep serving briefly so the client can observe the
    // exit code and final scrollback, then leave.
    let linger = async {
        tokio::select! {
            _ = drained.notified() => {
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
            _ = close_token.cancelled() => {}
            _ = tokio::time::sleep(EXIT_LINGER) => {}
        }
    };
    tokio::select! {
        () = linger => {}
        () = accept_during_linger(&listener, &state, &writer, &pty, &close_token, &drained) => {}
    }

    let _ = output_task.await;
    let _ = std::fs::remove_file(&socket_path);
    EXIT_OK
}

/// Keep accepting reconnects during the post-exit linger window.
async fn accept_during_linger(
    listener: &UnixListener,
    state: &Arc<Mutex<HostState>>,
    writer: &SharedWriter,
    pty: &Arc<PtyProcess>,
    close_token: &CancellationToken,
    drained: &Arc<Notify>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                attach_client(
                    stream,
                    Arc::clone(state),
                    Arc::clone(writer),
                    Arc::clone(pty),
                    close_token.clone(),
                    Arc::clone(drained),
                )
                .await;
            }
            Err(e) => {
                warn!(?e, "accept failed during linger");
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Install a newly accepted client: its write half becomes the current
/// output sink (replacing any previous client) and a task serves its
/// requests in arrival order.
async fn attach_client(
    stream: UnixStream,
    state: Arc<Mutex<HostState>>,
    writer: SharedWriter,
    pty: Arc<PtyProcess>,
    close_token: CancellationToken,
    drained: Arc<Notify>,
) {
    let (read_half, write_half) = stream.into_split();
    {
        let mut slot = writer.lock().await;
        if slot.is_some() {
            debug!("replacing previously attached client");
        }
        *slot = Some(write_half);
    }

    tokio::spawn(async move {
        let mut reader = read_half;
        loop {
            let frame = match HostFrame::read_from(&mut reader).await {
                Ok(f) => f,
                Err(e) => {
                    debug!(?e, "client disconnected");
                    break;
                }
            };
            match frame.frame_type {
                HostFrameType::InfoRequest => {
                    let (payload, running) = {
                        let s = state.lock();
                        (
                            serde_json::to_vec(&s.info).unwrap_or_default(),
                            s.info.is_running,
                        )
                    };
                    send_to_client(
                        &writer,
                        &HostFrame::new(HostFrameType::Info, Bytes::from(payload)),
                    )
                    .await;
                    if !running {
                        drained.notify_waiters();
                    }
                }
                HostFrameType::Input => {
                    if pty.input().send(frame.payload).await.is_err() {
                        debug!("input dropped, shell gone");
                    }
                }
                HostFrameType::Resize => match frame.parse_resize() {
                    Ok((cols, rows)) if valid_dimensions(cols, rows) => {
                        match pty.resize(cols, rows) {
                            Ok(()) => {
                                {
                                    let mut s = state.lock();
                                    s.info.cols = cols;
                                    s.info.rows = rows;
                                }
                                send_to_client(
                                    &writer,
                                    &HostFrame::empty(HostFrameType::ResizeAck),
                                )
                                .await;
                                send_to_client(
                                    &writer,
                                    &HostFrame::empty(HostFrameType::StateChange),
                                )
                                .await;
                            }
                            Err(e) => {
                                send_to_client(
                                    &writer,
                                    &HostFrame::new(
                                        HostFrameType::Error,
                                        Bytes::from(e.to_string()),
                                    ),
                                )
                                .await;
                            }
                        }
                    }
                    _ => {
                        send_to_client(
                            &writer,
                            &HostFrame::new(
                                HostFrameType::Error,
                                Bytes::from_static(b"invalid resize dimensions"),
                            ),
                        )
                        .await;
                    }
                },
                HostFrameType::GetBuffer => {
                    let snapshot = state.lock().scrollback.snapshot();
                    send_to_client(
                        &writer,
                        &HostFrame::new(HostFrameType::Buffer, Bytes::from(snapshot)),
                    )
                    .await;
                }
                HostFrameType::SetName => {
                    let name = if frame.payload.is_empty() {
                        None
                    } else {
                        Some(String::from_utf8_lossy(&frame.payload).into_owned())
                    };
                    state.lock().info.name = name;
                    send_to_client(&writer, &HostFrame::empty(HostFrameType::SetNameAck))
                        .await;
                    send_to_client(&writer, &HostFrame::empty(HostFrameType::StateChange))
                        .await;
                }
                HostFrameType::Close => {
                    send_to_client(&writer, &HostFrame::empty(HostFrameType::CloseAck)).await;
                    close_token.cancel();
                    break;
                }
                HostFrameType::Ping => {
                    send_to_client(&writer, &HostFrame::empty(HostFrameType::Pong)).await;
                }
                HostFrameType::Pong => {}
                other => {
                    send_to_client(
                        &writer,
                        &HostFrame::new(
                            HostFrameType::Error,
                            Bytes::from(format!("unexpected frame: {other:?}")),
                        ),
                    )
                    .await;
                }
            }
        }
    });
}
