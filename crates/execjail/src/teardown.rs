//! Jail teardown: unmount, then unlink.
//!
//! Order matters. Every mount under the jail is unmounted first (deepest
//! first, so `/dev/pts` goes before `/dev`), and the unlink walk refuses to
//! descend into any recorded mountpoint. Without that refusal a dry-run
//! teardown of a jail with a live `/proc` would happily enumerate the host's
//! process table, and a bind-mounted home directory would be emptied.
//!
//! The walk itself is fd-relative (`openat` + `unlinkat`), never re-resolving
//! the jail path, so a symlink planted mid-teardown cannot redirect it.

use std::collections::HashSet;
use std::os::fd::OwnedFd;

use rustix::fs::{AtFlags, FileType, Mode, OFlags};
use rustix::io::Errno;
use thiserror::Error;

use crate::mounts::MountTable;
use crate::trace::Trace;

#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("umount {path}: {err}")]
    Unmount { path: String, err: Errno },

    #[error("{path}: {err}")]
    Open { path: String, err: Errno },

    #[error("{op} {path}: {err}")]
    Remove {
        op: &'static str,
        path: String,
        err: Errno,
    },
}

/// Unmount everything under `jaildir` and remove its contents.
///
/// The jail directory itself is left in place; the caller removes it (or
/// rebuilds into it). `mounts` should be a fresh snapshot.
pub fn teardown(
    rootfd: &OwnedFd,
    jaildir: &str,
    mounts: &MountTable,
    trace: &Trace,
) -> Result<(), TeardownError> {
    let mut prefix = jaildir.to_string();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }

    let mut unmounted: HashSet<String> = HashSet::new();
    for mountpoint in mounts.under(&prefix) {
        MountTable::unmount(trace, mountpoint).map_err(|err| TeardownError::Unmount {
            path: mountpoint.to_string(),
            err,
        })?;
        unmounted.insert(mountpoint.to_string());
    }

    remove_tree(rootfd, &prefix, &unmounted, trace)
}

/// Remove everything inside the directory `dirfd` refers to.
///
/// `dirname` carries the textual path (trailing slash) for skips and
/// messages only; no syscall consumes it.
fn remove_tree(
    dirfd: &OwnedFd,
    dirname: &str,
    skips: &HashSet<String>,
    t: &Trace,
) -> Result<(), TeardownError> {
    let readfd = rustix::fs::openat(
        dirfd,
        ".",
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC,
        Mode::empty(),
    )
    .map_err(|err| TeardownError::Open {
        path: dirname.to_string(),
        err,
    })?;
    let dir = rustix::fs::Dir::read_from(&readfd).map_err(|err| TeardownError::Open {
        path: dirname.to_string(),
        err,
    })?;

    for entry in dir {
        let entry = entry.map_err(|err| TeardownError::Open {
            path: dirname.to_string(),
            err,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == "." || name == ".." {
            continue;
        }
        let full = format!("{dirname}{name}");
        let is_dir = entry.file_type() == FileType::Directory;

        if is_dir && !skips.contains(&full) {
            let subfd = rustix::fs::openat(
                dirfd,
                name.as_str(),
                OFlags::PATH | OFlags::NOFOLLOW | OFlags::CLOEXEC,
                Mode::empty(),
            )
            .map_err(|err| TeardownError::Open {
                path: full.clone(),
                err,
            })?;
            remove_tree(&subfd, &format!("{full}/"), skips, t)?;
        }

        let op = if is_dir { "rmdir" } else { "rm" };
        t.emit(format_args!("{op} {full}"));
        if t.mutate() {
            let flags = if is_dir {
                AtFlags::REMOVEDIR
            } else {
                AtFlags::empty()
            };
            rustix::fs::unlinkat(dirfd, name.as_str(), flags).map_err(|err| {
                TeardownError::Remove {
                    op,
                    path: full,
                    err,
                }
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    fn open_root(path: &Path) -> OwnedFd {
        rustix::fs::open(path, OFlags::PATH | OFlags::CLOEXEC, Mode::empty()).unwrap()
    }

    fn build_tree(root: &Path) {
        std::fs::create_dir_all(root.join("usr/bin")).unwrap();
        std::fs::create_dir_all(root.join("etc")).unwrap();
        std::fs::write(root.join("usr/bin/tool"), b"#!/bin/sh\n").unwrap();
        std::fs::write(root.join("etc/passwd"), b"root:x:0:0::/:/bin/sh\n").unwrap();
        symlink("usr/bin/tool", root.join("tool")).unwrap();
    }

    #[test]
    fn removes_everything_inside() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let rootfd = open_root(tmp.path());
        let mounts = MountTable::empty();
        teardown(&rootfd, tmp.path().to_str().unwrap(), &mounts, &Trace::quiet()).unwrap();
        assert!(std::fs::read_dir(tmp.path()).unwrap().next().is_none());
    }

    #[test]
    fn dry_run_removes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        let rootfd = open_root(tmp.path());
        let mounts = MountTable::empty();
        teardown(
            &rootfd,
            tmp.path().to_str().unwrap(),
            &mounts,
            &Trace::plan_only(),
        )
        .unwrap();
        assert!(tmp.path().join("usr/bin/tool").exists());
        assert!(tmp.path().join("tool").exists());
    }

    #[test]
    fn skips_recorded_mountpoints() {
        let tmp = tempfile::tempdir().unwrap();
        build_tree(tmp.path());
        // Pretend usr is still a mountpoint: the walk must not descend.
        let mut skips = HashSet::new();
        let prefix = format!("{}/", tmp.path().to_str().unwrap());
        skips.insert(format!("{prefix}usr"));
        let rootfd = open_root(tmp.path());
        remove_tree(&rootfd, &prefix, &skips, &Trace::plan_only()).unwrap();
        assert!(tmp.path().join("usr/bin/tool").exists());
    }
}
