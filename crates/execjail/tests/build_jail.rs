//! End-to-end materialization tests against real (unprivileged) filesystems.
//!
//! These drive the builder the way the CLI does - manifest text in, jail tree
//! out - but confined to temp directories on one device, so they run without
//! root. Ownership painting and mount replay need privilege and are covered
//! by their own unit tests.

use std::io::Cursor;
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt};
use std::path::Path;

use tempfile::TempDir;

use execjail::linkcache::LinkCache;
use execjail::{Builder, MountTable, Parser, Trace};

struct Fixture {
    host: TempDir,
    jail: TempDir,
    mounts: MountTable,
}

impl Fixture {
    fn new() -> Self {
        Self {
            host: TempDir::new().unwrap(),
            jail: TempDir::new().unwrap(),
            mounts: MountTable::empty(),
        }
    }

    fn host_path(&self, rel: &str) -> String {
        format!("{}/{}", self.host.path().to_str().unwrap(), rel)
    }

    fn jail_root(&self) -> &str {
        self.jail.path().to_str().unwrap()
    }

    /// Jail-side mirror of a host path.
    fn jail_path(&self, host_abs: &str) -> String {
        format!("{}{}", self.jail_root(), host_abs)
    }

    fn builder(&self, cache: Option<LinkCache>) -> Builder<'_> {
        let dev = rustix::fs::lstat(self.jail.path()).unwrap().st_dev;
        Builder::new(self.jail_root(), dev, &self.mounts, cache, Trace::quiet())
    }

    fn run(&self, builder: &mut Builder<'_>, manifest: &str) {
        let mut parser = Parser::new(builder.jail_root());
        builder
            .run_manifest(Cursor::new(manifest.to_string()), &mut parser)
            .unwrap();
    }
}

fn ino(path: impl AsRef<Path>) -> u64 {
    std::fs::symlink_metadata(path).unwrap().ino()
}

#[test]
fn absolute_entry_hardlinks_and_fills_parents() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("bin")).unwrap();
    std::fs::write(fx.host_path("bin/true"), b"#!/bin/sh\nexit 0\n").unwrap();

    let src = fx.host_path("bin/true");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{src}\n"));

    assert!(!builder.failed());
    let dst = fx.jail_path(&src);
    assert!(Path::new(&dst).is_file());
    assert_eq!(ino(&src), ino(&dst));
    // Every ancestor between the jail root and the file came into being.
    assert!(Path::new(&fx.jail_path(&fx.host_path("bin"))).is_dir());
}

#[test]
fn repeated_entries_are_idempotent() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("bin")).unwrap();
    std::fs::write(fx.host_path("bin/tool"), b"x").unwrap();

    let src = fx.host_path("bin/tool");
    let mut builder = fx.builder(None);
    // Twice in one manifest, then a whole second pass over the same builder.
    fx.run(&mut builder, &format!("{src}\n{src}\n"));
    fx.run(&mut builder, &format!("{src}\n"));

    // A second link(2) attempt would have failed with EEXIST and latched
    // the failure flag; the idempotence gate must swallow the repeats.
    assert!(!builder.failed());
    assert_eq!(ino(&src), ino(fx.jail_path(&src)));
}

#[test]
fn directory_context_resolves_relative_entries() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("opt/tools")).unwrap();
    std::fs::write(fx.host_path("opt/tools/run"), b"x").unwrap();

    // The absolute form of the directory pulls it in; the relative entry
    // then lands inside it.
    let dir = fx.host_path("opt/tools");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{dir}\n{dir}:\nrun\n"));

    assert!(!builder.failed());
    assert!(Path::new(&fx.jail_path(&fx.host_path("opt/tools/run"))).is_file());
}

#[test]
fn symlink_materializes_its_target_too() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("usr/bin")).unwrap();
    std::fs::write(fx.host_path("usr/bin/python3.11"), b"ELF").unwrap();
    symlink("python3.11", fx.host_path("usr/bin/python")).unwrap();

    let link = fx.host_path("usr/bin/python");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{link}\n"));

    assert!(!builder.failed());
    let jail_link = fx.jail_path(&link);
    let meta = std::fs::symlink_metadata(&jail_link).unwrap();
    assert!(meta.file_type().is_symlink());
    assert_eq!(
        std::fs::read_link(&jail_link).unwrap().to_str().unwrap(),
        "python3.11"
    );
    // The pointed-to file arrived through the recursion.
    let target = fx.jail_path(&fx.host_path("usr/bin/python3.11"));
    assert!(Path::new(&target).is_file());
}

#[test]
fn parent_climbing_symlink_stays_inside_jail() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("usr/bin")).unwrap();
    std::fs::create_dir_all(fx.host_path("usr/lib")).unwrap();
    std::fs::write(fx.host_path("usr/lib/helper"), b"x").unwrap();
    symlink("../lib/helper", fx.host_path("usr/bin/helper")).unwrap();

    let link = fx.host_path("usr/bin/helper");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{link}\n"));

    assert!(!builder.failed());
    assert!(Path::new(&fx.jail_path(&fx.host_path("usr/lib/helper"))).is_file());
}

#[test]
fn forced_copy_goes_through_the_cache() {
    let fx = Fixture::new();
    let cache_dir = TempDir::new().unwrap();
    std::fs::create_dir_all(fx.host_path("lib")).unwrap();
    std::fs::write(fx.host_path("lib/libz.so"), b"payload").unwrap();

    let src = fx.host_path("lib/libz.so");
    let cache_root = cache_dir.path().to_str().unwrap().to_string();
    let mut builder = fx.builder(Some(LinkCache::new(cache_root.clone())));
    fx.run(&mut builder, &format!("{src} [cp]\n"));

    assert!(!builder.failed());
    let dst = fx.jail_path(&src);
    let staged = format!("{cache_root}{src}");
    assert!(Path::new(&staged).is_file());
    // The jail entry shares its inode with the staged copy, not the source.
    assert_eq!(ino(&dst), ino(&staged));
    assert_ne!(ino(&dst), ino(&src));
    assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
}

#[test]
fn forced_copy_without_cache_copies_outright() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("lib")).unwrap();
    std::fs::write(fx.host_path("lib/libz.so"), b"payload").unwrap();

    let src = fx.host_path("lib/libz.so");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{src} [cp]\n"));

    assert!(!builder.failed());
    let dst = fx.jail_path(&src);
    assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    // A copy, not a link.
    assert_ne!(ino(&dst), ino(&src));
}

#[test]
fn fifo_is_recreated_with_mknod() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("run")).unwrap();
    let fifo = fx.host_path("run/queue");
    let c = std::ffi::CString::new(fifo.clone()).unwrap();
    // SAFETY: plain mkfifo on a fresh path.
    assert_eq!(unsafe { libc::mkfifo(c.as_ptr(), 0o644) }, 0);

    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{fifo}\n"));

    assert!(!builder.failed());
    let meta = std::fs::symlink_metadata(fx.jail_path(&fifo)).unwrap();
    assert!(meta.file_type().is_fifo());
}

#[test]
fn socket_is_an_odd_file_type() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("run")).unwrap();
    let sock = fx.host_path("run/ctl");
    let _listener = std::os::unix::net::UnixListener::bind(&sock).unwrap();

    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{sock}\n"));

    assert!(builder.failed());
    assert!(!Path::new(&fx.jail_path(&sock)).exists());
}

#[test]
fn missing_source_latches_failure_and_continues() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("bin")).unwrap();
    std::fs::write(fx.host_path("bin/real"), b"x").unwrap();

    let missing = fx.host_path("bin/ghost");
    let real = fx.host_path("bin/real");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{missing}\n{real}\n"));

    // The bad entry is reported but the good one still materializes.
    assert!(builder.failed());
    assert!(!Path::new(&fx.jail_path(&missing)).exists());
    assert!(Path::new(&fx.jail_path(&real)).is_file());
}

#[test]
fn dry_run_creates_nothing() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("bin")).unwrap();
    std::fs::write(fx.host_path("bin/true"), b"x").unwrap();

    let src = fx.host_path("bin/true");
    let dev = rustix::fs::lstat(fx.jail.path()).unwrap().st_dev;
    let mut builder = Builder::new(fx.jail_root(), dev, &fx.mounts, None, Trace::plan_only());
    fx.run(&mut builder, &format!("{src}\n"));

    assert!(!builder.failed());
    assert!(!Path::new(&fx.jail_path(&src)).exists());
    assert!(std::fs::read_dir(fx.jail.path()).unwrap().next().is_none());
}

#[test]
fn explicit_mapping_renames_inside_the_jail() {
    let fx = Fixture::new();
    std::fs::create_dir_all(fx.host_path("bin")).unwrap();
    std::fs::write(fx.host_path("bin/dash"), b"x").unwrap();

    let dir = fx.host_path("bin");
    let src = fx.host_path("bin/dash");
    let mut builder = fx.builder(None);
    fx.run(&mut builder, &format!("{dir}\n{dir}:\nsh <- {src}\n"));

    assert!(!builder.failed());
    let dst = fx.jail_path(&fx.host_path("bin/sh"));
    assert_eq!(ino(&src), ino(&dst));
}
