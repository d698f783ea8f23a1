//! Pseudo-terminal allocation and the parent-side proxy loop.
//!
//! The PTY is allocated after the privilege drop so the slave belongs to the
//! jail user. The parent keeps the master and relays its output to stdout;
//! the child attaches the slave to stdout/stderr, with the window forced to
//! 80x24 and output post-processing disabled so captured output is exactly
//! what the program wrote.

use std::io::{self, Write as _};
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt, PtyMaster};
use nix::sys::termios::{tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use rustix::io::Errno;
use thiserror::Error;

use crate::fsops::last_errno;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("posix_openpt: {0}")]
    Open(nix::Error),

    #[error("grantpt: {0}")]
    Grant(nix::Error),

    #[error("unlockpt: {0}")]
    Unlock(nix::Error),

    #[error("ptsname: {0}")]
    Name(nix::Error),
}

/// An allocated master/slave pair, slave not yet opened.
pub struct JailPty {
    pub master: PtyMaster,
    pub slave_name: String,
}

/// `posix_openpt` / `grantpt` / `unlockpt` / `ptsname`.
pub fn allocate() -> Result<JailPty, PtyError> {
    let master = posix_openpt(nix::fcntl::OFlag::O_RDWR).map_err(PtyError::Open)?;
    grantpt(&master).map_err(PtyError::Grant)?;
    unlockpt(&master).map_err(PtyError::Unlock)?;
    let slave_name = ptsname_r(&master).map_err(PtyError::Name)?;
    Ok(JailPty { master, slave_name })
}

/// Relay PTY output to stdout until the jailed child exits, then exit with
/// its status. Never returns.
pub fn proxy(child: Pid, master: &PtyMaster) -> ! {
    // Block each read for at most half a second (VMIN=1, VTIME=5) so a child
    // that dies without closing the slave is noticed without busy-polling.
    // SAFETY: master outlives the borrow.
    let master_fd = unsafe { BorrowedFd::borrow_raw(master.as_raw_fd()) };
    if let Ok(mut tty) = tcgetattr(&master_fd) {
        tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 5;
        let _ = tcsetattr(&master_fd, SetArg::TCSANOW, &tty);
    }

    let mut buf = [0u8; 16384];
    let stdout = io::stdout();
    let _ = stdout.lock().flush();

    loop {
        // SAFETY: buf is a live, writable slice; master stays open for the
        // whole loop.
        let n = unsafe {
            libc::read(
                master.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n > 0 {
            let mut out = stdout.lock();
            if out.write_all(&buf[..n as usize]).is_err() || out.flush().is_err() {
                std::process::exit(1);
            }
            // Keep draining until the read stalls.
            continue;
        }

        // Read stalled or failed; has the child died?
        match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => std::process::exit(code),
            Ok(WaitStatus::Signaled(..)) => std::process::exit(0),
            _ => {}
        }

        // Child still running. EINTR/EAGAIN are ordinary; EIO shows up
        // between slave closes and is retried like the others.
        if n == -1 {
            let err = last_errno();
            if err != Errno::INTR && err != Errno::AGAIN && err != Errno::IO {
                eprintln!("read: {err}");
                std::process::exit(1);
            }
        }
    }
}
