//! Unix PTY backend: `openpty`, spawn through the `--pty-exec` helper,
//! non-blocking master I/O, `TIOCSWINSZ` resize.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;

use bytes::Bytes;
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use super::{PtyError, SpawnSpec};

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Resolve the slave device path for a master fd.
fn slave_name(master: &OwnedFd) -> std::io::Result<String> {
    let mut buf = [0u8; 128];
    let rc = unsafe {
        libc::ptsname_r(
            master.as_raw_fd(),
            buf.as_mut_ptr().cast::<libc::c_char>(),
            buf.len(),
        )
    };
    if rc != 0 {
        return Err(std::io::Error::from_raw_os_error(rc));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// A running shell attached to a PTY this process controls.
#[derive(Debug)]
pub struct PtyProcess {
    pid: u32,
    master: Arc<AsyncFd<OwnedFd>>,
    input_tx: mpsc::Sender<Bytes>,
    output_rx: Option<mpsc::Receiver<Bytes>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl PtyProcess {
    /// Open a PTY pair and spawn the shell on the slave side.
    ///
    /// The child is our own executable running the `--pty-exec` helper,
    /// which becomes a session leader, attaches stdio to the slave, and
    /// execs the shell. Must be called from within a tokio runtime.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, PtyError> {
        let ws = winsize(spec.cols, spec.rows);
        let OpenptyResult { master, slave } = openpty(&ws, None)
            .map_err(|e| PtyError::Open(std::io::Error::from_raw_os_error(e as i32)))?;
        let slave_path = slave_name(&master).map_err(PtyError::Open)?;

        let helper = match &spec.helper_exe {
            Some(path) => path.clone(),
            None => std::env::current_exe().map_err(PtyError::Spawn)?,
        };

        let mut cmd = tokio::process::Command::new(helper);
        cmd.arg("--pty-exec")
            .arg(&slave_path)
            .arg("--")
            .arg(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if !spec.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        cmd.envs(&spec.env);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(uid) = spec.uid {
            cmd.uid(uid);
        }
        if let Some(gid) = spec.gid {
            cmd.gid(gid);
        }

        let mut child = cmd.spawn().map_err(PtyError::Spawn)?;
        let pid = child.id().unwrap_or(0);

        // The child opens the slave by path; our copy is no longer needed.
        drop(slave);

        set_nonblocking(&master).map_err(PtyError::Open)?;
        let master = Arc::new(
            AsyncFd::with_interest(master, Interest::READABLE | Interest::WRITABLE)
                .map_err(PtyError::Open)?,
        );

        // Output reader: PTY master → channel. Drains until the fd would
        // block before clearing readiness, as edge-triggered wakeups demand.
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        let read_fd = Arc::clone(&master);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            'outer: loop {
                let mut guard = match read_fd.readable().await {
                    Ok(g) => g,
                    Err(_) => break,
                };
                loop {
                    let n = unsafe {
                        libc::read(
                            read_fd.get_ref().as_raw_fd(),
                            buf.as_mut_ptr().cast::<libc::c_void>(),
                            buf.len(),
                        )
                    };
                    if n > 0 {
                        let chunk = Bytes::copy_from_slice(&buf[..n as usize]);
                        if output_tx.send(chunk).await.is_err() {
                            break 'outer;
                        }
                        continue;
                    }
                    if n == 0 {
                        break 'outer; // EOF, shell side closed
                    }
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        guard.clear_ready();
                        break;
                    }
                    // EIO is the normal end-of-session signal on Linux.
                    debug!(?err, "pty read ended");
                    break 'outer;
                }
            }
        });

        // Input writer: channel → PTY master.
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(64);
        let write_fd = Arc::clone(&master);
        tokio::spawn(async move {
            'outer: while let Some(data) = input_rx.recv().await {
                let mut offset = 0;
                while offset < data.len() {
                    let mut guard = match write_fd.writable().await {
                        Ok(g) => g,
                        Err(_) => break 'outer,
                    };
                    let n = unsafe {
                        libc::write(
                            write_fd.get_ref().as_raw_fd(),
                            data[offset..].as_ptr().cast::<libc::c_void>(),
                            data.len() - offset,
                        )
                    };
                    if n > 0 {
                        offset += n as usize;
                        continue;
                    }
                    let err = std::io::Error::last_os_error();
                    if err.kind() == std::io::ErrorKind::WouldBlock {
                        guard.clear_ready();
                        continue;
                    }
                    error!(?err, "pty write failed");
                    break 'outer;
                }
            }
        });

        // Exit watcher: reap the shell, record the code.
        let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status
                    .code()
                    .or_else(|| status.signal().map(|sig| 128 + sig))
                    .unwrap_or(-1),
                Err(e) => {
                    error!(?e, "waiting for shell failed");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(Self {
            pid,
            master,
            input_tx,
            output_rx: Some(output_rx),
            exit_rx,
        })
    }

    /// PID of the shell.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the output byte stream. Yields chunks in read order; closes on
    /// shell exit. Can only be taken once.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.take()
    }

    /// Sink for input bytes.
    pub fn input(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }

    /// Apply a new terminal size to the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let ws = winsize(cols, rows);
        let rc = unsafe {
            libc::ioctl(
                self.master.get_ref().as_raw_fd(),
                libc::TIOCSWINSZ,
                std::ptr::addr_of!(ws),
            )
        };
        if rc == -1 {
            Err(PtyError::Resize(std::io::Error::last_os_error()))
        } else {
            Ok(())
        }
    }

    /// Best-effort kill of the shell's whole process group. The helper made
    /// the shell a session leader, so its pid doubles as the pgid.
    pub fn terminate(&self) {
        let pid = self.pid as i32;
        if pid > 0 {
            unsafe {
                libc::kill(-pid, libc::SIGKILL);
            }
        }
    }

    /// True while the shell has not exited.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit code, present once the shell has exited. Signal deaths map to
    /// `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    /// Watch that resolves to `Some(code)` when the shell exits.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_with_missing_helper_fails() {
        let mut spec = SpawnSpec::new("/bin/sh", 80, 24);
        spec.helper_exe = Some("/nonexistent/webmux-host".into());
        let err = PtyProcess::spawn(&spec).expect_err("spawn should fail");
        assert!(matches!(err, PtyError::Spawn(_)));
    }

    #[test]
    fn winsize_maps_cols_rows() {
        let ws = winsize(120, 40);
        assert_eq!(ws.ws_col, 120);
        assert_eq!(ws.ws_row, 40);
        assert_eq!(ws.ws_xpixel, 0);
        assert_eq!(ws.ws_ypixel, 0);
    }

    #[test]
    fn slave_name_resolves_for_fresh_master() {
        let OpenptyResult { master, slave: _slave } =
            openpty(&winsize(80, 24), None).expect("openpty");
        let name = slave_name(&master).expect("ptsname");
        assert!(name.starts_with("/dev/"), "unexpected slave path: {name}");
    }
}
