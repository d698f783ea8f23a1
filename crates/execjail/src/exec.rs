//! The privilege and exec frame.
//!
//! Once the jail is built the sequence is fixed: `chdir` into the jail,
//! `chroot(".")`, `setgid` then `setuid` to the target user (no way back to
//! root), optionally allocate a PTY, `chdir` to the user's home, and `execve`
//! the user's shell with `-c COMMAND`. Only `PATH`, `LD_LIBRARY_PATH`, and a
//! synthesized `HOME` cross into the jail.
//!
//! In PTY mode the process forks: the child attaches the slave and execs,
//! the parent relays master output to stdout and exits with the child's
//! status. Without a PTY the exec happens in-process.

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use thiserror::Error;

use crate::fsops::{cstr, last_errno};
use crate::pty::{self, JailPty, PtyError};
use crate::trace::Trace;
use crate::users::JailUser;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{path}: {err}")]
    Chdir { path: String, err: Errno },

    #[error("chroot: {0}")]
    Chroot(Errno),

    #[error("setgid: {0}")]
    Setgid(Errno),

    #[error("setuid: {0}")]
    Setuid(Errno),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("open {path}: {err}")]
    Shell { path: String, err: Errno },

    #[error("fork: {0}")]
    Fork(Errno),

    #[error("exec {path}: {err}")]
    Exec { path: String, err: Errno },
}

/// Enter the jail and drop privileges permanently.
pub fn enter_jail(jaildir: &str, user: &JailUser, t: &Trace) -> Result<(), ExecError> {
    t.emit(format_args!("cd {jaildir}"));
    if t.mutate() {
        let dir = cstr(jaildir).map_err(|err| ExecError::Chdir {
            path: jaildir.to_string(),
            err,
        })?;
        // SAFETY: dir is a valid NUL-terminated path.
        if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
            return Err(ExecError::Chdir {
                path: jaildir.to_string(),
                err: last_errno(),
            });
        }
    }

    t.emit(format_args!("chroot ."));
    // SAFETY: plain chroot into the current directory.
    if t.mutate() && unsafe { libc::chroot(c".".as_ptr()) } != 0 {
        return Err(ExecError::Chroot(last_errno()));
    }

    t.emit(format_args!("su {}", user.name));
    if t.mutate() {
        // Group first: after setuid we could no longer change it.
        // SAFETY: plain setgid/setuid.
        if unsafe { libc::setgid(user.gid) } != 0 {
            return Err(ExecError::Setgid(last_errno()));
        }
        if unsafe { libc::setuid(user.uid) } != 0 {
            return Err(ExecError::Setuid(last_errno()));
        }
    }
    Ok(())
}

/// Run `command` as the jail user. Must be called after [`enter_jail`].
///
/// On a real (non-dry-run) invocation this never returns on success: the
/// process image is replaced, or in PTY mode the parent exits with the
/// child's status after the proxy loop drains.
pub fn run_command(
    user: &JailUser,
    command: &str,
    make_pty: bool,
    caller_tty: Option<OwnedFd>,
    t: &Trace,
) -> Result<(), ExecError> {
    let pty = if make_pty && t.mutate() {
        Some(pty::allocate()?)
    } else {
        None
    };
    if make_pty {
        match &pty {
            Some(p) => t.emit(format_args!("make-pty {}", p.slave_name)),
            None => t.emit(format_args!("make-pty")),
        }
    }

    t.emit(format_args!("cd {}", user.home));
    if t.mutate() {
        let home = cstr(&user.home).map_err(|err| ExecError::Chdir {
            path: user.home.clone(),
            err,
        })?;
        // SAFETY: home is a valid NUL-terminated path.
        if unsafe { libc::chdir(home.as_ptr()) } != 0 {
            return Err(ExecError::Chdir {
                path: user.home.clone(),
                err: last_errno(),
            });
        }
    }

    let env = build_env(
        std::env::var("PATH").ok().as_deref(),
        std::env::var("LD_LIBRARY_PATH").ok().as_deref(),
        &user.home,
    );

    let mut argv: Vec<String> = Vec::with_capacity(4);
    argv.push(user.shell.clone());
    if make_pty {
        argv.push("-l".to_string());
    }
    argv.push("-c".to_string());
    argv.push(command.to_string());

    // The shell has to exist inside the jail or exec can only fail.
    if t.mutate() {
        rustix::fs::open(
            user.shell.as_str(),
            OFlags::RDONLY | OFlags::CLOEXEC,
            Mode::empty(),
        )
        .map_err(|err| ExecError::Shell {
            path: user.shell.clone(),
            err,
        })?;
    }

    rewire_stdin(caller_tty);

    if t.verbose() {
        let mut line = String::new();
        for e in &env {
            line.push_str(e);
            line.push(' ');
        }
        for a in &argv[..argv.len() - 1] {
            line.push_str(a);
            line.push(' ');
        }
        t.emit(format_args!("{line}'{}'", argv[argv.len() - 1]));
    }

    if !t.mutate() {
        return Ok(());
    }

    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_bytes()).unwrap_or_default())
        .collect();
    let env_c: Vec<CString> = env
        .iter()
        .map(|e| CString::new(e.as_bytes()).unwrap_or_default())
        .collect();

    match pty {
        Some(p) => {
            // SAFETY: single-threaded; the child only runs async-signal-safe
            // code before execve.
            let pid = unsafe { libc::fork() };
            if pid < 0 {
                return Err(ExecError::Fork(last_errno()));
            }
            if pid == 0 {
                attach_slave(&p);
                reset_signals();
                let err = exec(&argv_c, &env_c, &user.shell);
                eprintln!("{err}");
                // SAFETY: exiting the failed child without unwinding.
                unsafe { libc::_exit(1) }
            }
            pty::proxy(nix::unistd::Pid::from_raw(pid), &p.master)
        }
        None => {
            reset_signals();
            Err(exec(&argv_c, &env_c, &user.shell))
        }
    }
}

/// The jailed environment: `PATH`, optional `LD_LIBRARY_PATH`, `HOME`.
fn build_env(path: Option<&str>, ld_library_path: Option<&str>, home: &str) -> Vec<String> {
    let mut env = Vec::with_capacity(3);
    env.push(match path {
        Some(p) => format!("PATH={p}"),
        None => "PATH=/usr/local/bin:/bin:/usr/bin".to_string(),
    });
    if let Some(ld) = ld_library_path {
        env.push(format!("LD_LIBRARY_PATH={ld}"));
    }
    env.push(format!("HOME={home}"));
    env
}

/// Attach the caller's tty to stdin, or reopen stdin on `/dev/null` so the
/// jailed command cannot keep reading the manifest stream.
fn rewire_stdin(caller_tty: Option<OwnedFd>) {
    match caller_tty {
        Some(fd) => {
            if fd.as_raw_fd() != 0 {
                // SAFETY: duplicating an owned, open descriptor onto stdin.
                unsafe { libc::dup2(fd.as_raw_fd(), 0) };
            } else {
                std::mem::forget(fd);
            }
        }
        None => {
            // SAFETY: fd 0 is reopened immediately after the close.
            unsafe {
                libc::close(0);
                libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY);
            }
        }
    }
}

/// Child side of PTY mode: new session, slave on stdout/stderr, fixed 80x24
/// window, output post-processing off. Exits the child on failure.
fn attach_slave(p: &JailPty) {
    // SAFETY: direct syscalls in the freshly forked child.
    unsafe {
        if libc::setsid() == -1 {
            child_die("setsid");
        }
        let Ok(name) = cstr(&p.slave_name) else {
            child_die(&p.slave_name);
        };
        let slave = libc::open(name.as_ptr(), libc::O_RDWR);
        if slave == -1 {
            child_die(&p.slave_name);
        }

        let mut ws: libc::winsize = std::mem::zeroed();
        libc::ioctl(slave, libc::TIOCGWINSZ, &mut ws);
        ws.ws_row = 24;
        ws.ws_col = 80;
        libc::ioctl(slave, libc::TIOCSWINSZ, &ws);

        let mut tty: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(slave, &mut tty) >= 0 {
            // No NL -> CRNL translation or any other output processing.
            tty.c_oflag = 0;
            libc::tcsetattr(slave, libc::TCSANOW, &tty);
        }

        libc::dup2(slave, libc::STDOUT_FILENO);
        libc::dup2(slave, libc::STDERR_FILENO);
        libc::close(p.master.as_raw_fd());
        libc::close(slave);
    }
}

fn child_die(what: &str) -> ! {
    eprintln!("{what}: {}", last_errno());
    // SAFETY: exiting the failed child without unwinding.
    unsafe { libc::_exit(1) }
}

/// Restore every signal disposition to the default before handing control to
/// jailed code. SIGKILL and SIGSTOP refuse; that is fine.
fn reset_signals() {
    // SAFETY: installing SIG_DFL is valid for every signal number.
    unsafe {
        for sig in 1..=libc::SIGRTMAX() {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// `execve`. Only returns on failure.
fn exec(argv: &[CString], env: &[CString], shell: &str) -> ExecError {
    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let env_ptrs: Vec<*const libc::c_char> = env
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    // SAFETY: both vectors are NULL-terminated arrays of live pointers.
    unsafe { libc::execve(argv_ptrs[0], argv_ptrs.as_ptr(), env_ptrs.as_ptr()) };
    ExecError::Exec {
        path: shell.to_string(),
        err: last_errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_default_path() {
        let env = build_env(None, None, "/home/u");
        assert_eq!(
            env,
            vec![
                "PATH=/usr/local/bin:/bin:/usr/bin".to_string(),
                "HOME=/home/u".to_string()
            ]
        );
    }

    #[test]
    fn env_forwards_path_and_ld() {
        let env = build_env(Some("/bin"), Some("/opt/lib"), "/home/u");
        assert_eq!(
            env,
            vec![
                "PATH=/bin".to_string(),
                "LD_LIBRARY_PATH=/opt/lib".to_string(),
                "HOME=/home/u".to_string()
            ]
        );
    }
}
