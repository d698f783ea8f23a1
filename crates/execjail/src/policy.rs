//! Jail placement authorization: the `JAIL61` ancestor walk.
//!
//! A jail may only be built where a root-controlled policy file says so.
//! Every ancestor of the jail path is opened component by component with
//! `O_PATH|O_NOFOLLOW` handle-relative opens, so a symlink swapped in
//! mid-walk cannot redirect the check. Ancestors above the authorizing
//! directory must be owned by root. Each ancestor may carry a `JAIL61` file:
//!
//! ```text
//! allowjail /srv/jails/
//! nojail /srv/jails/forbidden/
//! ```
//!
//! `allowjail PATH/` authorizes jails under `PATH/`; `nojail PATH/` forbids
//! them there; a bare `nojail` forbids jails anywhere below the file. A
//! `JAIL61` not owned by root, or writable by anyone other than root, is
//! ignored with a warning. `nojail` clauses are honored at every level, even
//! below an ancestor that already granted authorization.

use std::io::Read as _;
use std::os::fd::OwnedFd;

use rustix::fs::{Mode, OFlags};
use rustix::io::Errno;
use thiserror::Error;

use crate::trace::Trace;

/// Policy files larger than this are truncated on read.
const POLICY_MAX: usize = 8192;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{path}: {err}")]
    Open { path: String, err: Errno },

    #[error("{path}: Not a directory")]
    NotDirectory { path: String },

    #[error("{path}: Not owned by root")]
    NotOwnedByRoot { path: String },

    #[error("mkdir {path}: {err}")]
    Mkdir { path: String, err: Errno },

    #[error("{path}/JAIL61: {err}")]
    PolicyFile { path: String, err: Errno },

    #[error("{file}: Jails are not allowed under here")]
    Forbidden { file: String },

    #[error("{file}: Jails are not allowed under {scope}")]
    ForbiddenUnder { file: String, scope: String },

    #[error("{jaildir}: No `JAIL61` above here contains `allowjail {jaildir}`")]
    NoAuthorization { jaildir: String },

    #[error("{path}: Not an absolute path")]
    NotAbsolute { path: String },
}

/// The result of a successful policy walk.
///
/// The handles are held for the rest of the invocation; teardown and move
/// operate relative to them rather than re-resolving the path. `rootfd` is
/// `None` only in dry-run when the jail directory does not exist yet.
#[derive(Debug)]
pub struct Authorization {
    pub rootfd: Option<OwnedFd>,
    pub parentfd: Option<OwnedFd>,
    /// Textual prefix of the final component, trailing slash included.
    pub parent: String,
    /// Final path component of the jail directory.
    pub component: String,
    /// The `allowjail` scope that matched, trailing slash included.
    pub superdir: String,
}

impl Authorization {
    /// Whether the jail directory itself existed (or was created) on disk.
    #[inline]
    pub fn exists(&self) -> bool {
        self.rootfd.is_some()
    }
}

/// One verdict from a single `JAIL61` file.
enum Verdict {
    /// `allowjail` matched with this scope.
    Allow(String),
    /// No clause applied to the jail directory.
    Silent,
}

/// Evaluate one policy file's text against the jail directory.
///
/// Records are `VERB [PATH/]` per line; extra words are ignored. A missing
/// trailing slash on `PATH` is supplied. The first matching `allowjail` wins
/// within a file; any matching `nojail` refuses immediately.
fn evaluate(text: &str, jaildir: &str, file: &str) -> Result<Verdict, PolicyError> {
    let mut allow = None;
    for line in text.lines() {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else { continue };
        let arg = words.next().map(|w| {
            if w.ends_with('/') {
                w.to_string()
            } else {
                format!("{w}/")
            }
        });
        let matches = arg.as_deref().is_some_and(|scope| jaildir.starts_with(scope));
        match (verb, arg) {
            ("nojail", None) => {
                return Err(PolicyError::Forbidden { file: file.to_string() });
            }
            ("nojail", Some(scope)) if matches => {
                return Err(PolicyError::ForbiddenUnder {
                    file: file.to_string(),
                    scope,
                });
            }
            ("allowjail", Some(scope)) if matches && allow.is_none() => {
                allow = Some(scope);
            }
            _ => {}
        }
    }
    Ok(match allow {
        Some(scope) => Verdict::Allow(scope),
        None => Verdict::Silent,
    })
}

/// Read and screen a `JAIL61` file found at `prefix`, an open directory.
///
/// Returns `None` when the file is absent or ignored (not owned by root, or
/// writable by non-root).
fn read_policy_file(dirfd: &OwnedFd, prefix: &str) -> Result<Option<String>, PolicyError> {
    let fd = match rustix::fs::openat(
        dirfd,
        "JAIL61",
        OFlags::RDONLY | OFlags::NOFOLLOW | OFlags::CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(Errno::NOENT) | Err(Errno::LOOP) => return Ok(None),
        Err(err) => {
            return Err(PolicyError::PolicyFile {
                path: prefix.to_string(),
                err,
            })
        }
    };

    let st = rustix::fs::fstat(&fd).map_err(|err| PolicyError::PolicyFile {
        path: prefix.to_string(),
        err,
    })?;
    let group_writable = st.st_gid != 0 && (st.st_mode & libc::S_IWGRP) != 0;
    let other_writable = (st.st_mode & libc::S_IWOTH) != 0;
    if st.st_uid != 0 || group_writable || other_writable {
        eprintln!("{prefix}/JAIL61: Ignoring, writable by non-root");
        tracing::warn!(path = %prefix, "ignoring JAIL61 writable by non-root");
        return Ok(None);
    }

    let mut file = std::fs::File::from(fd);
    let mut buf = vec![0u8; POLICY_MAX];
    let n = file.read(&mut buf).unwrap_or(0);
    buf.truncate(n);
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Walk every ancestor of `jaildir`, enforcing ownership and `JAIL61` policy.
///
/// `jaildir` must be absolute and already name-validated. When `create` is
/// set, components missing below an authorizing ancestor are created with
/// mode `0755`; in dry-run they are only planned and the returned handles for
/// the missing suffix are `None`.
pub fn authorize(jaildir: &str, create: bool, trace: &Trace) -> Result<Authorization, PolicyError> {
    if !jaildir.starts_with('/') {
        return Err(PolicyError::NotAbsolute {
            path: jaildir.to_string(),
        });
    }

    let bytes = jaildir.as_bytes();
    let mut fd: Option<OwnedFd> = None;
    let mut parentfd: Option<OwnedFd> = None;
    let mut parent = String::new();
    let mut component = String::new();
    let mut superdir: Option<String> = None;
    let mut missing = false;
    let mut last_pos = 0;

    while last_pos != bytes.len() {
        let mut next_pos = last_pos;
        while next_pos != 0 && next_pos < bytes.len() && bytes[next_pos] != b'/' {
            next_pos += 1;
        }
        if next_pos == 0 {
            next_pos = 1;
        }
        parent = jaildir[..last_pos].to_string();
        component = jaildir[last_pos..next_pos].to_string();
        let prefix = &jaildir[..next_pos];
        last_pos = next_pos;
        while last_pos < bytes.len() && bytes[last_pos] == b'/' {
            last_pos += 1;
        }

        if missing {
            // Dry-run below a planned directory: nothing to open or check.
            trace.emit(format_args!("mkdir -m 0755 {prefix}"));
            parentfd = None;
            continue;
        }

        let oflags = OFlags::PATH | OFlags::CLOEXEC | OFlags::NOFOLLOW;
        let opened = match &fd {
            None => rustix::fs::open(component.as_str(), oflags, Mode::empty()),
            Some(dirfd) => rustix::fs::openat(dirfd, component.as_str(), oflags, Mode::empty()),
        };
        let next_fd = match opened {
            Ok(next) => next,
            Err(Errno::NOENT) if superdir.is_some() && create => {
                trace.emit(format_args!("mkdir -m 0755 {prefix}"));
                if trace.dryrun() {
                    missing = true;
                    parentfd = fd.take();
                    continue;
                }
                let dirfd = fd.as_ref().expect("authorized component has a parent");
                rustix::fs::mkdirat(dirfd, component.as_str(), Mode::from_raw_mode(0o755)).map_err(
                    |err| PolicyError::Mkdir {
                        path: prefix.to_string(),
                        err,
                    },
                )?;
                rustix::fs::openat(dirfd, component.as_str(), oflags, Mode::empty()).map_err(|err| {
                    PolicyError::Open {
                        path: prefix.to_string(),
                        err,
                    }
                })?
            }
            Err(err) => {
                return Err(PolicyError::Open {
                    path: prefix.to_string(),
                    err,
                })
            }
        };
        parentfd = fd.take();
        fd = Some(next_fd);

        let st = rustix::fs::fstat(fd.as_ref().unwrap()).map_err(|err| PolicyError::Open {
            path: prefix.to_string(),
            err,
        })?;
        if (st.st_mode & libc::S_IFMT) != libc::S_IFDIR {
            return Err(PolicyError::NotDirectory {
                path: prefix.to_string(),
            });
        }
        if superdir.is_none() && st.st_uid != 0 {
            return Err(PolicyError::NotOwnedByRoot {
                path: prefix.to_string(),
            });
        }

        // The root directory itself never carries policy.
        if !parent.is_empty() {
            if let Some(text) = read_policy_file(fd.as_ref().unwrap(), prefix)? {
                let file = format!("{prefix}/JAIL61");
                if let Verdict::Allow(scope) = evaluate(&text, jaildir, &file)? {
                    if superdir.is_none() {
                        superdir = Some(scope);
                    }
                }
            }
        }
    }

    let superdir = superdir.ok_or_else(|| PolicyError::NoAuthorization {
        jaildir: jaildir.to_string(),
    })?;
    Ok(Authorization {
        rootfd: fd,
        parentfd,
        parent,
        component,
        superdir,
    })
}

/// `st_dev` of the deepest existing ancestor of `dir` (or of `dir` itself).
pub fn closest_ancestor_dev(dir: &str) -> u64 {
    let mut dir = dir.to_string();
    loop {
        if let Ok(st) = rustix::fs::lstat(dir.as_str()) {
            return st.st_dev;
        }
        dir = match dir.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(pos) => dir[..pos].to_string(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_of(v: Result<Verdict, PolicyError>) -> Option<String> {
        match v {
            Ok(Verdict::Allow(scope)) => Some(scope),
            Ok(Verdict::Silent) => None,
            Err(e) => panic!("unexpected refusal: {e}"),
        }
    }

    #[test]
    fn allowjail_match() {
        let v = evaluate("allowjail /srv/jails/\n", "/srv/jails/x", "/srv/JAIL61");
        assert_eq!(allow_of(v), Some("/srv/jails/".to_string()));
    }

    #[test]
    fn allowjail_adds_trailing_slash() {
        let v = evaluate("allowjail /srv/jails\n", "/srv/jails/x", "/srv/JAIL61");
        assert_eq!(allow_of(v), Some("/srv/jails/".to_string()));
    }

    #[test]
    fn allowjail_no_match() {
        let v = evaluate("allowjail /srv/other/\n", "/srv/jails/x", "/srv/JAIL61");
        assert_eq!(allow_of(v), None);
    }

    #[test]
    fn bare_nojail_refuses() {
        let v = evaluate("nojail\n", "/srv/jails/x", "/srv/JAIL61");
        assert!(matches!(v, Err(PolicyError::Forbidden { .. })));
    }

    #[test]
    fn scoped_nojail_refuses_only_inside() {
        let text = "nojail /srv/jails/forbidden/\n";
        let v = evaluate(text, "/srv/jails/forbidden/x", "/srv/JAIL61");
        assert!(matches!(v, Err(PolicyError::ForbiddenUnder { .. })));
        let v = evaluate(text, "/srv/jails/ok/x", "/srv/JAIL61");
        assert_eq!(allow_of(v), None);
    }

    #[test]
    fn nojail_beats_allowjail_in_same_file() {
        let text = "allowjail /srv/jails/\nnojail /srv/jails/forbidden/\n";
        let v = evaluate(text, "/srv/jails/forbidden/x", "/srv/JAIL61");
        assert!(matches!(v, Err(PolicyError::ForbiddenUnder { .. })));
    }

    #[test]
    fn extra_words_ignored() {
        let v = evaluate(
            "allowjail /srv/jails/ because reasons\n",
            "/srv/jails/x",
            "/srv/JAIL61",
        );
        assert_eq!(allow_of(v), Some("/srv/jails/".to_string()));
    }

    #[test]
    fn first_allowjail_wins() {
        let text = "allowjail /srv/\nallowjail /srv/jails/\n";
        let v = evaluate(text, "/srv/jails/x", "/srv/JAIL61");
        assert_eq!(allow_of(v), Some("/srv/".to_string()));
    }

    #[test]
    fn closest_ancestor_dev_of_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does/not/exist");
        let dev = closest_ancestor_dev(missing.to_str().unwrap());
        let here = rustix::fs::lstat(tmp.path()).unwrap();
        assert_eq!(dev, here.st_dev);
    }
}
