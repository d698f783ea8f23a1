//! Host mount table snapshot and mount replay.
//!
//! The builder needs to know which host mountpoints exist so it can replicate
//! pseudo-filesystem mounts inside the jail, and teardown needs the same view
//! to unmount everything under the jail before unlinking. Only four mounts
//! are ever replayed:
//!
//! | mountpoint | fstype |
//! |------------|--------|
//! | `/proc`    | proc   |
//! | `/sys`     | sysfs  |
//! | `/dev`     | udev   |
//! | `/dev/pts` | devpts |
//!
//! Everything else is recorded but never touched. Option strings are split
//! into the flag word `mount(2)` wants plus a residual data string passed
//! through verbatim.

use std::collections::BTreeMap;
use std::io;

use rustix::io::Errno;

use crate::fsops::{cstr, last_errno};
use crate::trace::Trace;

/// One live host mount.
#[derive(Debug, Clone)]
pub struct MountSlot {
    pub fsname: String,
    pub fstype: String,
    /// The full option string as read, for the trace.
    pub options: String,
    /// Recognized options folded into `MS_*` bits.
    pub flags: libc::c_ulong,
    /// Unrecognized options, passed as `data` on replay.
    pub data: String,
    /// Whether this mount may be replayed inside a jail.
    pub allowed: bool,
}

const OPTION_FLAGS: &[(&str, libc::c_ulong)] = &[
    ("nosuid", libc::MS_NOSUID),
    ("nodev", libc::MS_NODEV),
    ("noexec", libc::MS_NOEXEC),
    ("ro", libc::MS_RDONLY),
    ("rw", 0),
    ("noatime", libc::MS_NOATIME),
    ("nodiratime", libc::MS_NODIRATIME),
    ("relatime", libc::MS_RELATIME),
    ("strictatime", libc::MS_STRICTATIME),
];

fn allow_mount(mountpoint: &str, fstype: &str) -> bool {
    matches!(
        (mountpoint, fstype),
        ("/proc", "proc") | ("/sys", "sysfs") | ("/dev", "udev") | ("/dev/pts", "devpts")
    )
}

/// Split an fstab-style option string into flag bits and residual data.
fn parse_options(options: &str) -> (libc::c_ulong, String) {
    let mut flags = 0;
    let mut data = Vec::new();
    for opt in options.split(',') {
        match OPTION_FLAGS.iter().find(|(name, _)| *name == opt) {
            Some((_, bit)) => flags |= bit,
            None if !opt.is_empty() => data.push(opt),
            None => {}
        }
    }
    (flags, data.join(","))
}

/// `/proc/mounts` escapes space, tab, newline, and backslash as `\OOO`.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = String::with_capacity(field.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = &field[i + 1..i + 4];
            if let Ok(v) = u8::from_str_radix(oct, 8) {
                out.push(v as char);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i] as char);
        i += 1;
    }
    out
}

/// Snapshot of the host mount view, keyed by mountpoint.
#[derive(Debug, Default)]
pub struct MountTable {
    slots: BTreeMap<String, MountSlot>,
}

impl MountTable {
    /// Read the live mount view from `/proc/mounts`.
    pub fn read() -> io::Result<Self> {
        let text = std::fs::read_to_string("/proc/mounts")?;
        let table = Self::parse(&text);
        tracing::debug!(mounts = table.slots.len(), "snapshotted host mount table");
        Ok(table)
    }

    /// Parse the content of a `/proc/mounts`-format stream.
    pub fn parse(text: &str) -> Self {
        let mut slots = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(fsname), Some(dir), Some(fstype), Some(options)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let dir = unescape(dir);
            let (flags, data) = parse_options(options);
            let slot = MountSlot {
                fsname: unescape(fsname),
                fstype: fstype.to_string(),
                options: options.to_string(),
                flags,
                data,
                allowed: allow_mount(&dir, fstype),
            };
            slots.insert(dir, slot);
        }
        Self { slots }
    }

    /// An empty table; used when the mount view cannot be read.
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn get(&self, mountpoint: &str) -> Option<&MountSlot> {
        self.slots.get(mountpoint)
    }

    /// Mountpoints strictly under `prefix`, deepest first, so nested mounts
    /// (`/dev/pts` inside `/dev`) unmount cleanly.
    pub fn under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.slots
            .keys()
            .rev()
            .filter(move |dir| dir.starts_with(prefix))
            .map(String::as_str)
    }

    /// Replay one allowed host mount onto `dst` inside the jail.
    pub fn replay(t: &Trace, slot: &MountSlot, dst: &str) -> Result<(), Errno> {
        if slot.options.is_empty() {
            t.emit(format_args!("mount -i -n -t {} {} {}", slot.fstype, slot.fsname, dst));
        } else {
            t.emit(format_args!(
                "mount -i -n -t {} -o {} {} {}",
                slot.fstype, slot.options, slot.fsname, dst
            ));
        }
        if !t.mutate() {
            return Ok(());
        }
        let fsname = cstr(&slot.fsname)?;
        let target = cstr(dst)?;
        let fstype = cstr(&slot.fstype)?;
        let data = cstr(&slot.data)?;
        // SAFETY: all pointers reference live NUL-terminated strings; data may
        // be empty, in which case NULL is passed as mount(2) expects.
        let ret = unsafe {
            libc::mount(
                fsname.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                slot.flags,
                if slot.data.is_empty() {
                    std::ptr::null()
                } else {
                    data.as_ptr().cast()
                },
            )
        };
        if ret != 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    /// Unmount one mountpoint.
    pub fn unmount(t: &Trace, mountpoint: &str) -> Result<(), Errno> {
        t.emit(format_args!("umount -i -n {mountpoint}"));
        if !t.mutate() {
            return Ok(());
        }
        let target = cstr(mountpoint)?;
        // SAFETY: target is a valid NUL-terminated path.
        if unsafe { libc::umount(target.as_ptr()) } != 0 {
            return Err(last_errno());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
udev /dev udev rw,nosuid,relatime,size=16384k,nr_inodes=4096,mode=755 0 0
devpts /dev/pts devpts rw,nosuid,noexec,relatime,gid=5,mode=620,ptmxmode=000 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime,errors=remount-ro 0 0
tmpfs /mnt/with\\040space tmpfs rw 0 0
";

    #[test]
    fn whitelist() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.get("/proc").unwrap().allowed);
        assert!(table.get("/sys").unwrap().allowed);
        assert!(table.get("/dev").unwrap().allowed);
        assert!(table.get("/dev/pts").unwrap().allowed);
        assert!(!table.get("/").unwrap().allowed);
    }

    #[test]
    fn option_flags_and_data() {
        let table = MountTable::parse(SAMPLE);
        let proc = table.get("/proc").unwrap();
        assert_eq!(
            proc.flags,
            libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC | libc::MS_RELATIME
        );
        assert!(proc.data.is_empty());

        let pts = table.get("/dev/pts").unwrap();
        assert_eq!(pts.data, "gid=5,mode=620,ptmxmode=000");
        assert_eq!(pts.flags, libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_RELATIME);
    }

    #[test]
    fn octal_escape_decoded() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.get("/mnt/with space").is_some());
    }

    #[test]
    fn under_is_deepest_first() {
        let table = MountTable::parse(SAMPLE);
        let under: Vec<_> = table.under("/dev/").collect();
        assert_eq!(under, vec!["/dev/pts"]);
        let all_dev: Vec<_> = table.under("/dev").collect();
        assert_eq!(all_dev, vec!["/dev/pts", "/dev"]);
    }

    #[test]
    fn wrong_fstype_not_allowed() {
        let table = MountTable::parse("tmpfs /proc tmpfs rw 0 0\n");
        assert!(!table.get("/proc").unwrap().allowed);
    }
}
