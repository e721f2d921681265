//! Pseudo-terminal processes, one per session.
//!
//! Each platform provides the same surface: spawn a shell attached to a
//! fresh PTY, a byte source for output, a byte sink for input, resize,
//! best-effort terminate, and an exit-code watch. On Unix the child side of
//! the fork runs the [`exec`] helper; on Windows the host OS pseudo-console
//! does the equivalent plumbing.

pub mod exec;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::PtyProcess;
#[cfg(windows)]
pub use windows::PtyProcess;

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;

/// Everything needed to spawn a shell in a fresh PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments, not including the program name.
    pub args: Vec<String>,
    /// Working directory for the shell.
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment; `TERM` is filled in if absent.
    pub env: HashMap<String, String>,
    /// Run the shell as this uid (Unix only).
    pub uid: Option<u32>,
    /// Run the shell as this gid (Unix only).
    pub gid: Option<u32>,
    /// Executable that understands the `--pty-exec` child-helper subcommand.
    /// Defaults to the current executable.
    pub helper_exe: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(program: impl Into<String>, cols: u16, rows: u16) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            cols,
            rows,
            env: HashMap::new(),
            uid: None,
            gid: None,
            helper_exe: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to spawn shell: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] std::io::Error),

    #[error("pty was never created")]
    NotStarted,
}
