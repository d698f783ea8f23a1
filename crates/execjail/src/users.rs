//! Host passwd database lookups.
//!
//! The jail user must be vetted before privileges drop: not root, home
//! directory under `/home` (a home of `/` is rewritten to `/home/nobody`),
//! and a login shell the host approves of. The ownership painter also needs
//! the full user list to hand `/home/<name>` subdirectories back to their
//! owners.

use std::collections::HashMap;
use std::ffi::{CStr, OsString};
use std::os::unix::ffi::OsStringExt;

use nix::unistd::{Gid, Group, Uid, User};
use thiserror::Error;

use crate::validate::NAME_MAX_LEN;

extern "C" {
    fn getusershell() -> *mut libc::c_char;
    fn endusershell();
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("{0}: Username too long")]
    TooLong(String),

    #[error("{0}: No such user")]
    Unknown(String),

    #[error("{0}: {1}")]
    Lookup(String, nix::Error),

    #[error("{user}: Home directory {home} not under /home")]
    HomeNotAllowed { user: String, home: String },

    #[error("{user}: Shell {shell} not allowed by /etc/shells")]
    ShellNotAllowed { user: String, shell: String },

    #[error("{0}: Jail user cannot be root")]
    IsRoot(String),
}

/// A vetted jail user.
#[derive(Debug, Clone)]
pub struct JailUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    /// Home directory as used inside the jail; always under `/home`.
    pub home: String,
    pub shell: String,
}

/// Look up and vet the target user for a jail.
pub fn jail_user(name: &str) -> Result<JailUser, UserError> {
    if name.len() >= NAME_MAX_LEN {
        return Err(UserError::TooLong(name.to_string()));
    }
    let pw = User::from_name(name)
        .map_err(|e| UserError::Lookup(name.to_string(), e))?
        .ok_or_else(|| UserError::Unknown(name.to_string()))?;

    let dir = pw.dir.to_string_lossy().into_owned();
    let home = if dir == "/" {
        "/home/nobody".to_string()
    } else if dir.starts_with("/home/") {
        dir
    } else {
        return Err(UserError::HomeNotAllowed {
            user: name.to_string(),
            home: dir,
        });
    };

    let shell = pw.shell.to_string_lossy().into_owned();
    if shell != "/bin/bash" && shell != "/bin/sh" && !shell_allowed(&shell) {
        return Err(UserError::ShellNotAllowed {
            user: name.to_string(),
            shell,
        });
    }

    if pw.uid.is_root() {
        return Err(UserError::IsRoot(name.to_string()));
    }

    Ok(JailUser {
        name: pw.name,
        uid: pw.uid.as_raw(),
        gid: pw.gid.as_raw(),
        home,
        shell,
    })
}

/// Is `shell` listed in the host's approved-shell database?
fn shell_allowed(shell: &str) -> bool {
    let mut found = false;
    // SAFETY: getusershell walks a static list; we are single-threaded and
    // close the walk before returning.
    unsafe {
        loop {
            let sh = getusershell();
            if sh.is_null() {
                break;
            }
            if CStr::from_ptr(sh).to_bytes() == shell.as_bytes() {
                found = true;
                break;
            }
        }
        endusershell();
    }
    found
}

/// `(uid, gid)` overrides for the `/home` level of the ownership paint.
///
/// Each passwd entry whose home is a direct child of `/home` claims that
/// child by directory name; every other entry claims a child named after the
/// user.
pub fn home_overrides() -> HashMap<OsString, (u32, u32)> {
    let mut map = HashMap::new();
    // SAFETY: getpwent iteration over the passwd database; single-threaded,
    // and every pointer is consumed before the next call.
    unsafe {
        libc::setpwent();
        loop {
            let pw = libc::getpwent();
            if pw.is_null() {
                break;
            }
            let dir = CStr::from_ptr((*pw).pw_dir).to_bytes();
            let name = if let Some(rest) = dir.strip_prefix(b"/home/") {
                if !rest.is_empty() && !rest.contains(&b'/') {
                    rest.to_vec()
                } else {
                    CStr::from_ptr((*pw).pw_name).to_bytes().to_vec()
                }
            } else {
                CStr::from_ptr((*pw).pw_name).to_bytes().to_vec()
            };
            map.insert(OsString::from_vec(name), ((*pw).pw_uid, (*pw).pw_gid));
        }
        libc::endpwent();
    }
    map
}

/// Username for a uid, falling back to the number.
pub fn uid_name(uid: u32) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(pw)) => pw.name,
        _ => uid.to_string(),
    }
}

/// Group name for a gid, falling back to the number.
pub fn gid_name(gid: u32) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(gr)) => gr.name,
        _ => gid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_user_rejected() {
        // Skip quietly on hosts with no passwd database at all. Root fails
        // vetting either way: its home is not under /home, and even a root
        // with a /home home is refused outright.
        let Ok(Some(_)) = User::from_name("root") else {
            return;
        };
        assert!(jail_user("root").is_err());
    }

    #[test]
    fn unknown_user_rejected() {
        assert!(matches!(
            jail_user("no-such-user-here"),
            Err(UserError::Unknown(_))
        ));
    }

    #[test]
    fn long_username_rejected() {
        let name = "x".repeat(NAME_MAX_LEN);
        assert!(matches!(jail_user(&name), Err(UserError::TooLong(_))));
    }

    #[test]
    fn name_fallback_is_numeric() {
        // No passwd entry can exist for the last uid.
        assert_eq!(uid_name(u32::MAX - 1), (u32::MAX - 1).to_string());
    }
}
