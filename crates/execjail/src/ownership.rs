//! Ownership painting of an existing jail tree.
//!
//! Before a jail is (re)built, everything already inside it is handed back
//! to root so stale user-owned files cannot influence construction. One
//! level is special: the immediate children of `/home` belong to their
//! users, looked up in the host passwd database. Symlinks are chowned but
//! never followed.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::PathBuf;

use rustix::io::Errno;
use thiserror::Error;

use crate::fsops;
use crate::trace::Trace;
use crate::users;

/// Paths longer than this abort the paint rather than truncate.
const PATH_MAX: usize = 4096;

#[derive(Debug, Error)]
pub enum PaintError {
    #[error("{path}: {err}")]
    ReadDir { path: String, err: io::Error },

    #[error("chown {path}: {err}")]
    Chown { path: String, err: Errno },

    #[error("{path}: Name too long")]
    TooLong { path: String },
}

/// Recursively chown the jail tree to root, with the `/home` exception.
pub fn paint(root: &str, trace: &Trace) -> Result<(), PaintError> {
    let mut buf = PathBuf::from(root);
    paint_dir(&mut buf, 0, 0, 0, trace)
}

fn paint_dir(
    dir: &mut PathBuf,
    depth: usize,
    owner: u32,
    group: u32,
    t: &Trace,
) -> Result<(), PaintError> {
    let home_map: Option<HashMap<OsString, (u32, u32)>> = (depth == 1
        && dir.file_name() == Some(OsStr::new("home")))
    .then(users::home_overrides);

    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        // A jail that does not exist yet is fine to "paint" in a dry run.
        Err(err) if depth == 0 && t.dryrun() && err.kind() == io::ErrorKind::NotFound => {
            return Ok(())
        }
        Err(err) => {
            return Err(PaintError::ReadDir {
                path: dir.display().to_string(),
                err,
            })
        }
    };

    for entry in entries {
        let entry = entry.map_err(|err| PaintError::ReadDir {
            path: dir.display().to_string(),
            err,
        })?;
        let name = entry.file_name();
        dir.push(&name);
        if dir.as_os_str().len() >= PATH_MAX {
            let path = dir.display().to_string();
            dir.pop();
            return Err(PaintError::TooLong { path });
        }
        let file_type = entry.file_type().map_err(|err| PaintError::ReadDir {
            path: dir.display().to_string(),
            err,
        })?;

        let (mut uid, mut gid) = (owner, group);
        if !file_type.is_symlink() {
            if let Some(map) = &home_map {
                if let Some(&(hu, hg)) = map.get(&name) {
                    uid = hu;
                    gid = hg;
                }
            }
        }
        if let Err(err) = fsops::lchown(t, &dir, uid, gid) {
            let path = dir.display().to_string();
            dir.pop();
            return Err(PaintError::Chown { path, err });
        }
        if file_type.is_dir() {
            paint_dir(dir, depth + 1, uid, gid, t)?;
        }
        dir.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn dry_run_walks_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("home/alice/sub")).unwrap();
        std::fs::write(tmp.path().join("home/alice/file"), b"x").unwrap();
        symlink("file", tmp.path().join("home/alice/link")).unwrap();

        let t = Trace::plan_only();
        paint(tmp.path().to_str().unwrap(), &t).unwrap();
    }

    #[test]
    fn dry_run_tolerates_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        paint(missing.to_str().unwrap(), &Trace::plan_only()).unwrap();
    }

    #[test]
    fn real_run_requires_existing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        let err = paint(missing.to_str().unwrap(), &Trace::quiet()).unwrap_err();
        assert!(matches!(err, PaintError::ReadDir { .. }));
    }
}
