//! The materializer: turning manifest entries into jail contents.
//!
//! Each request is a host source plus a jail destination. The source's file
//! type picks the operation:
//!
//! - **regular file** - hardlink when source and jail share a device and no
//!   copy was forced; otherwise stage through the cross-device cache, or
//!   copy outright when no cache is configured
//! - **directory** - `mkdir` with the source's permission bits; an existing
//!   directory is accepted as-is
//! - **char/block device, fifo** - `mknod` with the source's type and mode
//! - **symlink** - recreate the link, then recursively materialize its
//!   target through the jail's view of the path
//! - anything else is refused
//!
//! After creation the destination's mode and ownership are normalized to the
//! source's, and a directory that is an allowed host mountpoint gets its
//! mount replayed on top.
//!
//! ## Idempotence
//!
//! Every destination enters the done-set before its first syscall, so
//! re-requests (and the recursions below) are no-ops and terminate. Directory
//! symlinks record an equivalence pair, letting a later hardlink that arrives
//! through the other spelling tolerate `EEXIST`.
//!
//! ## Error discipline
//!
//! Filesystem failures on one entry are reported to stderr with the path and
//! latch a sticky failure flag; the build keeps going so one run reports
//! every problem. Only a failed staging copy aborts outright.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::BufRead;

use rustix::io::Errno;
use thiserror::Error;

use crate::fsops;
use crate::linkcache::{self, CacheError, LinkCache};
use crate::manifest::Parser;
use crate::mounts::MountTable;
use crate::trace::Trace;

/// Errors that abort the whole build. Everything recoverable is reported on
/// stderr and latched in [`Builder::failed`] instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{op} {path}: {err}")]
    RootPrep {
        op: &'static str,
        path: String,
        err: Errno,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Build context for one jail construction run.
pub struct Builder<'a> {
    jail_root: String,
    jail_dev: u64,
    trace: Trace,
    mounts: &'a MountTable,
    cache: Option<LinkCache>,
    /// Destinations already materialized (or attempted).
    made: HashSet<String>,
    /// Directory symlink equivalences, both directions.
    links: HashMap<String, Vec<String>>,
    failed: bool,
}

impl<'a> Builder<'a> {
    pub fn new(
        jail_root: &str,
        jail_dev: u64,
        mounts: &'a MountTable,
        cache: Option<LinkCache>,
        trace: Trace,
    ) -> Self {
        let mut jail_root = jail_root.to_string();
        while jail_root.len() > 1 && jail_root.ends_with('/') {
            jail_root.pop();
        }
        Self {
            jail_root,
            jail_dev,
            trace,
            mounts,
            cache,
            made: HashSet::new(),
            links: HashMap::new(),
            failed: false,
        }
    }

    #[inline]
    pub fn jail_root(&self) -> &str {
        &self.jail_root
    }

    /// Jail destination for an absolute host path.
    #[inline]
    pub fn jail_path(&self, abs: &str) -> String {
        format!("{}{}", self.jail_root, abs)
    }

    /// Whether any recoverable error has been reported.
    #[inline]
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Latch the sticky failure flag from outside (e.g. a failed mount
    /// table read before construction started).
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn fail(&mut self, msg: fmt::Arguments) {
        eprintln!("{msg}");
        self.failed = true;
    }

    /// Normalize the jail root itself and seed the done-set with it.
    pub fn prepare_root(&mut self) -> Result<(), BuildError> {
        let t = self.trace;
        let root = self.jail_root.clone();
        fsops::chmod(&t, &root, 0o755).map_err(|err| BuildError::RootPrep {
            op: "chmod",
            path: root.clone(),
            err,
        })?;
        fsops::lchown(&t, &root, 0, 0).map_err(|err| BuildError::RootPrep {
            op: "chown",
            path: root.clone(),
            err,
        })?;
        self.made.insert(format!("{root}/"));
        Ok(())
    }

    /// Materialize the built-in entries every jail carries: `/proc`, plus
    /// `/dev/pts` and `/dev/ptmx` when a PTY will be allocated.
    pub fn install_base(&mut self, pty: bool) -> Result<(), BuildError> {
        let dst = self.jail_path("/proc");
        self.materialize("/proc", &dst, true, false)?;
        if pty {
            for src in ["/dev/pts", "/dev/ptmx"] {
                let dst = self.jail_path(src);
                self.materialize(src, &dst, true, false)?;
            }
        }
        Ok(())
    }

    /// Feed every manifest line through the parser into the materializer.
    pub fn run_manifest<R: BufRead>(
        &mut self,
        reader: R,
        parser: &mut Parser,
    ) -> Result<(), BuildError> {
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    self.fail(format_args!("manifest: {err}"));
                    break;
                }
            };
            if let Some(entry) = parser.parse_line(&line) {
                self.materialize(&entry.src, &entry.dst, entry.check_parents, entry.force_copy)?;
            }
        }
        Ok(())
    }

    /// Materialize one source/destination pair.
    ///
    /// Returns the source's raw `st_mode` on fresh success, `None` when the
    /// destination was already handled or the entry failed recoverably.
    pub fn materialize(
        &mut self,
        src: &str,
        dst: &str,
        check_parents: bool,
        force_copy: bool,
    ) -> Result<Option<u32>, BuildError> {
        if !self.made.insert(dst.to_string()) {
            return Ok(None);
        }

        if check_parents {
            self.fill_parents(src, dst)?;
        }

        let t = self.trace;
        let ss = match rustix::fs::lstat(src) {
            Ok(ss) => ss,
            Err(err) => {
                self.fail(format_args!("lstat {src}: {err}"));
                return Ok(None);
            }
        };
        let src_mode = ss.st_mode;
        let kind = src_mode & libc::S_IFMT;

        // What the create operation left on disk, for normalization below.
        let mut want_mode = src_mode;
        let mut have_mode = src_mode;
        let mut have_uid = 0u32;
        let mut have_gid = 0u32;

        if kind == libc::S_IFREG && !force_copy && ss.st_dev == self.jail_dev {
            if let Err(err) = self.hardlink(src, dst) {
                self.fail(format_args!("link {dst}: {err}"));
                return Ok(None);
            }
            // The link shares the inode; metadata is already the source's.
            have_uid = ss.st_uid;
            have_gid = ss.st_gid;
        } else if kind == libc::S_IFREG || (kind == libc::S_IFLNK && force_copy) {
            if !self.link_through_cache(src, dst, &ss)? {
                return Ok(None);
            }
            have_uid = ss.st_uid;
            have_gid = ss.st_gid;
        } else if kind == libc::S_IFDIR {
            // Setuid/setgid carry over; sticky is restored by the chmod below.
            let perm = src_mode & (libc::S_ISUID | libc::S_ISGID | 0o777);
            match fsops::mkdir(&t, dst, perm) {
                Ok(()) => have_mode = perm | libc::S_IFDIR,
                Err(_) => match rustix::fs::lstat(dst) {
                    Ok(ds) if (ds.st_mode & libc::S_IFMT) == libc::S_IFDIR => {
                        have_mode = ds.st_mode;
                        have_uid = ds.st_uid;
                        have_gid = ds.st_gid;
                    }
                    Ok(_) => {
                        self.fail(format_args!("lstat {dst}: Not a directory"));
                        return Ok(None);
                    }
                    Err(err) => {
                        self.fail(format_args!("lstat {dst}: {err}"));
                        return Ok(None);
                    }
                },
            }
        } else if kind == libc::S_IFCHR || kind == libc::S_IFBLK || kind == libc::S_IFIFO {
            let mode = (src_mode & (libc::S_ISUID | libc::S_ISGID | 0o777)) | kind;
            if let Err(err) = fsops::mknod(&t, dst, mode, ss.st_rdev) {
                self.fail(format_args!("mknod {dst}: {err}"));
                return Ok(None);
            }
            want_mode = mode;
            have_mode = mode;
        } else if kind == libc::S_IFLNK {
            let target = match rustix::fs::readlink(src, Vec::new()) {
                Ok(bytes) => match bytes.into_string() {
                    Ok(s) => s,
                    Err(_) => {
                        self.fail(format_args!("readlink {src}: Bad link target"));
                        return Ok(None);
                    }
                },
                Err(err) => {
                    self.fail(format_args!("readlink {src}: {err}"));
                    return Ok(None);
                }
            };
            if let Err(err) = fsops::symlink(&t, &target, dst) {
                self.fail(format_args!("symlink {src}: {err}"));
                return Ok(None);
            }
            self.follow_symlink(src, dst, &target)?;
        } else {
            self.fail(format_args!("{src}: Odd file type"));
            return Ok(None);
        }

        if want_mode != have_mode {
            if let Err(err) = fsops::chmod(&t, dst, want_mode & 0o7777) {
                self.fail(format_args!("chmod {dst}: {err}"));
                return Ok(None);
            }
        }
        if have_uid != ss.st_uid || have_gid != ss.st_gid {
            if let Err(err) = fsops::lchown(&t, dst, ss.st_uid, ss.st_gid) {
                self.fail(format_args!("chown {dst}: {err}"));
                return Ok(None);
            }
        }

        if kind == libc::S_IFDIR {
            if let Some(slot) = self.mounts.get(src) {
                if slot.allowed {
                    if let Err(err) = MountTable::replay(&t, slot, dst) {
                        self.fail(format_args!("mount {dst}: {err}"));
                        return Ok(None);
                    }
                }
            }
        }

        Ok(Some(src_mode))
    }

    /// Deeply nested entries name only themselves; when source and
    /// destination share their trailing component and the destination's
    /// parent is missing, materialize the parent pair first.
    fn fill_parents(&mut self, src: &str, dst: &str) -> Result<(), BuildError> {
        let Some(last_slash) = dst.rfind('/') else {
            return Ok(());
        };
        if last_slash == 0 || last_slash == dst.len() - 1 {
            return Ok(());
        }
        let tail = dst.len() - last_slash;
        if src.len() <= tail || src.as_bytes()[src.len() - tail..] != dst.as_bytes()[dst.len() - tail..] {
            return Ok(());
        }
        if matches!(rustix::fs::lstat(&dst[..last_slash]), Err(Errno::NOENT)) {
            self.materialize(&src[..src.len() - tail], &dst[..dst.len() - tail], true, false)?;
        }
        Ok(())
    }

    /// Stage `src` in the cross-device cache and hardlink the staged copy,
    /// or fall back to a direct metadata-preserving copy when no cache is
    /// configured. Returns false when the entry failed recoverably.
    fn link_through_cache(
        &mut self,
        src: &str,
        dst: &str,
        ss: &rustix::fs::Stat,
    ) -> Result<bool, BuildError> {
        let t = self.trace;
        let staged = match self.cache.as_mut() {
            Some(cache) => cache.stage(&t, src, ss),
            None => {
                linkcache::cp_preserving(&t, src, dst)?;
                return Ok(true);
            }
        };
        let lnk = match staged {
            Ok(lnk) => lnk,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                self.fail(format_args!("{err}"));
                return Ok(false);
            }
        };
        if let Err(err) = self.hardlink(&lnk, dst) {
            self.fail(format_args!("link {dst}: {err}"));
            return Ok(false);
        }
        Ok(true)
    }

    /// `link(2)` with the `EEXIST`-through-a-symlinked-directory tolerance.
    fn hardlink(&mut self, oldpath: &str, newpath: &str) -> Result<(), Errno> {
        let t = self.trace;
        match fsops::link(&t, oldpath, newpath) {
            Err(Errno::EXIST) if self.link_exists_ok(newpath) => Ok(()),
            other => other,
        }
    }

    /// Does some already-materialized destination reach `newpath` through a
    /// recorded directory symlink equivalence?
    fn link_exists_ok(&self, newpath: &str) -> bool {
        let mut end = newpath.len();
        loop {
            let Some(slash) = newpath[..end].rfind('/') else {
                return false;
            };
            if let Some(alts) = self.links.get(&newpath[..slash]) {
                for alt in alts {
                    let candidate = format!("{alt}{}", &newpath[slash..]);
                    if self.made.contains(&candidate) {
                        return true;
                    }
                }
            }
            if slash == 0 {
                return false;
            }
            end = slash;
        }
    }

    /// A symlink was just recreated at `dst`; pull its target into the jail
    /// too, so the jail is self-consistent.
    fn follow_symlink(&mut self, src: &str, dst: &str, lnk: &str) -> Result<(), BuildError> {
        let Some((tsrc, tdst)) = resolve_link_target(&self.jail_root, src, dst, lnk) else {
            return Ok(());
        };
        // Links into /proc point at live pseudo-files; leave those alone.
        if tdst[self.jail_root.len()..].starts_with("/proc/") {
            return Ok(());
        }
        let mode = self.materialize(&tsrc, &tdst, true, false)?;
        if let Some(mode) = mode {
            if (mode & libc::S_IFMT) == libc::S_IFDIR {
                self.links.entry(tdst.clone()).or_default().push(dst.to_string());
                self.links.entry(dst.to_string()).or_default().push(tdst);
            }
        }
        Ok(())
    }
}

/// Expand a symlink target into a (host source, jail destination) pair.
///
/// An absolute target maps straight under the jail root. A relative target
/// climbs one directory per leading `../` in both views, giving up silently
/// if the climb would leave the jail.
fn resolve_link_target(
    jail_root: &str,
    src: &str,
    dst: &str,
    lnk: &str,
) -> Option<(String, String)> {
    if lnk.starts_with('/') {
        return Some((lnk.to_string(), format!("{jail_root}{lnk}")));
    }
    let mut src = src.to_string();
    let mut dst = dst.to_string();
    let mut lnk = lnk;
    loop {
        if src.len() == 1 {
            return None;
        }
        let srcslash = src[..src.len() - 1].rfind('/')?;
        let dstslash = dst[..dst.len() - 1].rfind('/')?;
        if dstslash < jail_root.len() {
            return None;
        }
        src.truncate(srcslash + 1);
        dst.truncate(dstslash + 1);
        if lnk.len() > 3 && lnk.starts_with("../") {
            lnk = &lnk[3..];
        } else {
            break;
        }
    }
    src.push_str(lnk);
    dst.push_str(lnk);
    Some((src, dst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_target() {
        let r = resolve_link_target("/jail", "/usr/bin/sh", "/jail/usr/bin/sh", "/bin/dash");
        assert_eq!(
            r,
            Some(("/bin/dash".to_string(), "/jail/bin/dash".to_string()))
        );
    }

    #[test]
    fn sibling_target() {
        let r = resolve_link_target(
            "/jail",
            "/usr/bin/python",
            "/jail/usr/bin/python",
            "python3.11",
        );
        assert_eq!(
            r,
            Some((
                "/usr/bin/python3.11".to_string(),
                "/jail/usr/bin/python3.11".to_string()
            ))
        );
    }

    #[test]
    fn parent_climb() {
        let r = resolve_link_target("/jail", "/usr/bin/foo", "/jail/usr/bin/foo", "../lib/x");
        assert_eq!(
            r,
            Some(("/usr/lib/x".to_string(), "/jail/usr/lib/x".to_string()))
        );
    }

    #[test]
    fn climb_out_of_jail_gives_up() {
        let r = resolve_link_target("/jail", "/bin/x", "/jail/bin/x", "../../etc/passwd");
        assert_eq!(r, None);
    }

    #[test]
    fn link_equivalence_via_recorded_symlink() {
        let mounts = MountTable::empty();
        let mut b = Builder::new("/jail", 0, &mounts, None, Trace::plan_only());
        // Pretend /jail/lib64 is a symlink to /jail/usr/lib64 and the real
        // file arrived through the expanded spelling.
        b.links
            .entry("/jail/usr/lib64".to_string())
            .or_default()
            .push("/jail/lib64".to_string());
        b.links
            .entry("/jail/lib64".to_string())
            .or_default()
            .push("/jail/usr/lib64".to_string());
        b.made.insert("/jail/usr/lib64/libc.so".to_string());
        assert!(b.link_exists_ok("/jail/lib64/libc.so"));
        assert!(!b.link_exists_ok("/jail/lib64/other.so"));
    }
}
