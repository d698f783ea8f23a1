//! Trace-gated filesystem primitives.
//!
//! Thin wrappers that announce one pseudo-shell line on the [`Trace`] and then
//! perform the syscall unless dry-run suppresses it. Everything that mutates
//! the jail goes through these so the dry-run plan and the real run stay in
//! lockstep.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use rustix::io::Errno;

use crate::trace::Trace;
use crate::users;

/// NUL-safe conversion at the syscall boundary.
#[inline]
pub fn cstr(path: impl AsRef<Path>) -> Result<CString, Errno> {
    CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| Errno::INVAL)
}

#[inline]
pub fn last_errno() -> Errno {
    // SAFETY: __errno_location always returns a valid thread-local pointer.
    Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}

pub fn mkdir(t: &Trace, path: &str, mode: u32) -> Result<(), Errno> {
    t.emit(format_args!("mkdir -m 0{mode:o} {path}"));
    if !t.mutate() {
        return Ok(());
    }
    let c = cstr(path)?;
    // SAFETY: c is a valid NUL-terminated path.
    if unsafe { libc::mkdir(c.as_ptr(), mode as libc::mode_t) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn link(t: &Trace, oldpath: &str, newpath: &str) -> Result<(), Errno> {
    t.emit(format_args!("ln {oldpath} {newpath}"));
    if !t.mutate() {
        return Ok(());
    }
    let old = cstr(oldpath)?;
    let new = cstr(newpath)?;
    // SAFETY: both are valid NUL-terminated paths.
    if unsafe { libc::link(old.as_ptr(), new.as_ptr()) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn symlink(t: &Trace, target: &str, linkpath: &str) -> Result<(), Errno> {
    t.emit(format_args!("ln -s {target} {linkpath}"));
    if !t.mutate() {
        return Ok(());
    }
    let tgt = cstr(target)?;
    let lnk = cstr(linkpath)?;
    // SAFETY: both are valid NUL-terminated paths.
    if unsafe { libc::symlink(tgt.as_ptr(), lnk.as_ptr()) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn mknod(t: &Trace, path: &str, mode: u32, rdev: u64) -> Result<(), Errno> {
    t.emit(format_args!("mknod -m 0{:o} {} {}", mode, path, dev_name(mode, rdev)));
    if !t.mutate() {
        return Ok(());
    }
    let c = cstr(path)?;
    // SAFETY: c is a valid NUL-terminated path.
    if unsafe { libc::mknod(c.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn chmod(t: &Trace, path: &str, mode: u32) -> Result<(), Errno> {
    t.emit(format_args!("chmod 0{mode:o} {path}"));
    if !t.mutate() {
        return Ok(());
    }
    let c = cstr(path)?;
    // SAFETY: c is a valid NUL-terminated path.
    if unsafe { libc::chmod(c.as_ptr(), mode as libc::mode_t) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// `lchown`, path form. Never follows symlinks.
pub fn lchown(t: &Trace, path: impl AsRef<Path>, uid: u32, gid: u32) -> Result<(), Errno> {
    let path = path.as_ref();
    if t.verbose() {
        t.emit(format_args!(
            "chown -h {}:{} {}",
            users::uid_name(uid),
            users::gid_name(gid),
            path.display()
        ));
    }
    if !t.mutate() {
        return Ok(());
    }
    let c = cstr(path)?;
    // SAFETY: c is a valid NUL-terminated path.
    if unsafe { libc::lchown(c.as_ptr(), uid, gid) } != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Whether `ensure_dir` found or made the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Existed,
    Created,
}

/// Make sure `path` is a directory, creating it with `mode` if absent.
pub fn ensure_dir(t: &Trace, path: &str, mode: u32) -> Result<Ensured, Errno> {
    match rustix::fs::stat(path) {
        Ok(st) if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR => Ok(Ensured::Existed),
        Ok(_) => Err(Errno::NOTDIR),
        Err(Errno::NOENT) => {
            mkdir(t, path, mode)?;
            Ok(Ensured::Created)
        }
        Err(e) => Err(e),
    }
}

/// Render a device node for the trace: `c MAJ MIN`, `b MAJ MIN`, or `p`.
fn dev_name(mode: u32, rdev: u64) -> String {
    let dev = rdev as libc::dev_t;
    let (maj, min) = (libc::major(dev), libc::minor(dev));
    match mode & libc::S_IFMT {
        libc::S_IFCHR => format!("c {maj} {min}"),
        libc::S_IFBLK => format!("b {maj} {min}"),
        libc::S_IFIFO => "p".to_string(),
        _ => format!("{mode} {rdev}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cstr_plain() {
        assert_eq!(cstr("/tmp/x").unwrap().as_bytes(), b"/tmp/x");
    }

    #[test]
    fn cstr_rejects_nul() {
        assert!(cstr("/tmp/\0x").is_err());
    }

    #[test]
    fn dev_name_forms() {
        assert_eq!(dev_name(libc::S_IFIFO, 0), "p");
        assert!(dev_name(libc::S_IFCHR, 0).starts_with("c "));
        assert!(dev_name(libc::S_IFBLK, 0).starts_with("b "));
    }

    #[test]
    fn ensure_dir_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let t = Trace::quiet();
        let sub = tmp.path().join("sub");
        let sub = sub.to_str().unwrap();
        assert_eq!(ensure_dir(&t, sub, 0o755).unwrap(), Ensured::Created);
        assert_eq!(ensure_dir(&t, sub, 0o755).unwrap(), Ensured::Existed);
    }

    #[test]
    fn ensure_dir_rejects_file() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let t = Trace::quiet();
        assert_eq!(ensure_dir(&t, file.to_str().unwrap(), 0o755), Err(Errno::NOTDIR));
    }
}
