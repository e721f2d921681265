//! Windows PTY backend over the OS pseudo-console (ConPTY).
//!
//! Uses `portable_pty`'s native pty system and bridges its blocking
//! reader/writer handles onto channels with dedicated blocking tasks.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, watch};
use tracing::error;

use super::{PtyError, SpawnSpec};

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A running shell attached to a pseudo-console.
pub struct PtyProcess {
    pid: u32,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    killer: Box<dyn portable_pty::ChildKiller + Send + Sync>,
    input_tx: mpsc::Sender<Bytes>,
    output_rx: Option<mpsc::Receiver<Bytes>>,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl PtyProcess {
    /// Open a pseudo-console and spawn the shell on its slave side.
    pub fn spawn(spec: &SpawnSpec) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| PtyError::Open(std::io::Error::other(e)))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            cmd.arg(arg);
        }
        if let Some(cwd) = &spec.cwd {
            cmd.cwd(cwd);
        }
        if !spec.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn(std::io::Error::other(e)))?;
        let pid = child.process_id().unwrap_or(0);
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(std::io::Error::other(e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(std::io::Error::other(e)))?;
        let master = Arc::new(Mutex::new(pair.master));

        // Output reader: blocking read loop on a dedicated thread.
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(64);
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut reader = reader;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx
                            .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Input writer.
        let (input_tx, mut input_rx) = mpsc::channel::<Bytes>(64);
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = writer;
            while let Some(data) = input_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        // Exit watcher.
        let (exit_tx, exit_rx) = watch::channel::<Option<i32>>(None);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
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
            killer,
            input_tx,
            output_rx: Some(output_rx),
            exit_rx,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output_rx.take()
    }

    pub fn input(&self) -> mpsc::Sender<Bytes> {
        self.input_tx.clone()
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        self.master
            .lock()
            .resize(pty_size(cols, rows))
            .map_err(|e| PtyError::Resize(std::io::Error::other(e)))
    }

    pub fn terminate(&self) {
        let mut killer = self.killer.clone_killer();
        let _ = killer.kill();
    }

    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }
}
