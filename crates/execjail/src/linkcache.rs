//! Cross-device hardlink cache.
//!
//! Hardlinks cannot cross filesystems. When the jail lives on a different
//! device than a source file (or a copy is forced), the file is first staged
//! into a configured cache directory on the jail's device, then hardlinked
//! from there. A staged copy is reused as long as its mode, owner, size, and
//! mtime still match the source; otherwise it is refreshed.
//!
//! Staging shells out to `/bin/cp -p` rather than reimplementing
//! metadata-preserving copies; `cp` already handles xattrs and ACLs for every
//! file type we care about.

use std::collections::HashSet;
use std::process::Command;

use rustix::fs::Stat;
use rustix::io::Errno;
use thiserror::Error;

use crate::fsops;
use crate::trace::Trace;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("lstat {path}: {err}")]
    Stat { path: String, err: Errno },

    #[error("{path}: Is a directory")]
    IsDirectory { path: String },

    #[error("lstat {path}: Not a directory")]
    NotDirectory { path: String },

    #[error("mkdir {path}: {err}")]
    Mkdir { path: String, err: Errno },

    /// `/bin/cp` could not be spawned or did not exit cleanly. Unlike the
    /// other variants this one aborts the whole build.
    #[error("/bin/cp {path}: {reason}")]
    Copy { path: String, reason: String },
}

impl CacheError {
    /// Copy failures are catastrophic; everything else unwinds one entry.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::Copy { .. })
    }
}

/// The cache directory plus the set of its subdirectories known to exist.
#[derive(Debug)]
pub struct LinkCache {
    root: String,
    made_dirs: HashSet<String>,
}

impl LinkCache {
    /// `root` is absolute with no trailing slash.
    pub fn new(root: String) -> Self {
        Self {
            root,
            made_dirs: HashSet::new(),
        }
    }

    #[inline]
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Ensure `src` has a current staged copy; return its cache path, ready
    /// to be hardlinked to the destination.
    pub fn stage(&mut self, t: &Trace, src: &str, ss: &Stat) -> Result<String, CacheError> {
        let lnk = format!("{}{}", self.root, src);

        match rustix::fs::lstat(lnk.as_str()) {
            Ok(ls)
                if ls.st_mode == ss.st_mode
                    && ls.st_uid == ss.st_uid
                    && ls.st_gid == ss.st_gid
                    && ls.st_size == ss.st_size
                    && ls.st_mtime == ss.st_mtime =>
            {
                return Ok(lnk);
            }
            Ok(ls) if (ls.st_mode & libc::S_IFMT) == libc::S_IFDIR => {
                return Err(CacheError::IsDirectory { path: lnk });
            }
            Ok(_) | Err(Errno::NOENT) => {}
            Err(err) => return Err(CacheError::Stat { path: lnk, err }),
        }

        tracing::debug!(src, cache = %lnk, "staging cross-device copy");
        self.make_parents(t, &lnk)?;
        self.copy(t, src, &lnk)?;
        Ok(lnk)
    }

    /// Create any missing directories between the cache root and `lnk`,
    /// mode `0770`, remembering what has been verified.
    fn make_parents(&mut self, t: &Trace, lnk: &str) -> Result<(), CacheError> {
        let mut pos = self.root.len();
        while let Some(slash) = lnk[pos + 1..].find('/').map(|i| pos + 1 + i) {
            pos = slash;
            let super_dir = &lnk[..slash];
            if self.made_dirs.contains(super_dir) {
                continue;
            }
            match rustix::fs::lstat(super_dir) {
                Ok(st) if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR => {}
                Ok(_) => {
                    return Err(CacheError::NotDirectory {
                        path: super_dir.to_string(),
                    })
                }
                Err(Errno::NOENT) => match fsops::mkdir(t, super_dir, 0o770) {
                    Ok(()) | Err(Errno::EXIST) => {}
                    Err(err) => {
                        return Err(CacheError::Mkdir {
                            path: super_dir.to_string(),
                            err,
                        })
                    }
                },
                Err(err) => {
                    return Err(CacheError::Stat {
                        path: super_dir.to_string(),
                        err,
                    })
                }
            }
            self.made_dirs.insert(super_dir.to_string());
        }
        Ok(())
    }

    fn copy(&self, t: &Trace, src: &str, lnk: &str) -> Result<(), CacheError> {
        cp_preserving(t, src, lnk)
    }
}

/// Metadata-preserving copy by way of `/bin/cp -p`. Also the fallback for a
/// cross-device destination when no cache is configured.
pub(crate) fn cp_preserving(t: &Trace, src: &str, dst: &str) -> Result<(), CacheError> {
    t.emit(format_args!("cp -p {src} {dst}"));
    if !t.mutate() {
        return Ok(());
    }
    let status = Command::new("/bin/cp")
        .arg("-p")
        .arg(src)
        .arg(dst)
        .status()
        .map_err(|e| CacheError::Copy {
            path: dst.to_string(),
            reason: e.to_string(),
        })?;
    if !status.success() {
        let reason = match status.code() {
            Some(_) => "Bad exit status".to_string(),
            None => "Did not exit".to_string(),
        };
        return Err(CacheError::Copy {
            path: dst.to_string(),
            reason,
        });
    }
    Ok(())
}
