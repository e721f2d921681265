//! Child-side PTY attachment, Unix only.
//!
//! Runs in the child process between fork/spawn and the shell taking over.
//! The parent invokes its own executable with `--pty-exec <slave-path> --
//! <argv...>`; this function performs the attachment and replaces the
//! process image. On success it never returns.
//!
//! Return values are process exit codes for the distinct failure points:
//! 1 setsid, 2 open, 3 dup2, 4 execvp returned, 5 invalid arguments.

/// Exit code: `setsid` failed.
pub const EXIT_SETSID: i32 = 1;
/// Exit code: opening the slave PTY failed.
pub const EXIT_OPEN: i32 = 2;
/// Exit code: `dup2` onto stdio failed.
pub const EXIT_DUP2: i32 = 3;
/// Exit code: `execvp` returned.
pub const EXIT_EXECVP: i32 = 4;
/// Exit code: malformed arguments.
pub const EXIT_BAD_ARGS: i32 = 5;

/// Become a session leader, attach stdio to the slave PTY, and exec `argv`.
///
/// Opening the slave as a session leader makes it the controlling terminal,
/// so no `TIOCSCTTY` is needed. Never returns on success.
#[cfg(unix)]
pub fn pty_exec(slave_path: &str, argv: &[String]) -> i32 {
    use std::ffi::CString;

    if argv.is_empty() {
        return EXIT_BAD_ARGS;
    }
    let Ok(c_path) = CString::new(slave_path) else {
        return EXIT_BAD_ARGS;
    };
    let c_argv: Vec<CString> = match argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
    {
        Ok(v) => v,
        Err(_) => return EXIT_BAD_ARGS,
    };

    if unsafe { libc::setsid() } == -1 {
        return EXIT_SETSID;
    }

    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return EXIT_OPEN;
    }

    for target in 0..3 {
        if unsafe { libc::dup2(fd, target) } == -1 {
            return EXIT_DUP2;
        }
    }
    if fd > 2 {
        unsafe {
            libc::close(fd);
        }
    }

    let mut ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|a| a.as_ptr()).collect();
    ptrs.push(std::ptr::null());

    unsafe {
        libc::execvp(ptrs[0], ptrs.as_ptr());
    }
    // execvp only returns on failure.
    EXIT_EXECVP
}
