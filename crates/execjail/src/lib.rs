//! execjail: chroot jail construction and teardown
//!
//! This crate builds a minimal filesystem tree under a jail directory from a
//! caller-supplied manifest, replays a whitelisted set of pseudo-filesystem
//! mounts into it, and executes a command inside the jail as an unprivileged
//! user, optionally over a freshly allocated pseudo-terminal. It also tears
//! jails down again without escaping through bind mounts.
//!
//! The pieces, in the order an invocation uses them:
//!
//! - **policy** - Walks every ancestor of the jail path with `O_PATH|O_NOFOLLOW`
//!   opens and authorizes construction from a root-owned `JAIL61` file
//! - **ownership** - Repaints an existing jail tree to root ownership, with a
//!   `/home/<user>` exception driven by the host passwd database
//! - **mounts** - Snapshots the live host mount table; replays the allowed
//!   subset (`/proc`, `/sys`, `/dev`, `/dev/pts`) inside the jail
//! - **manifest** - Parses the stdin file list into source/destination pairs
//! - **materialize** - Creates each destination (hardlink, copy via the
//!   cross-device cache, mkdir, mknod, symlink) with the source's metadata
//! - **teardown** - Unmounts everything under the jail, then removes the tree
//! - **exec** - `chroot`, drops to the target user, and runs the command,
//!   proxying a PTY back to the caller when requested
//!
//! ## Requirements
//!
//! - Linux
//! - Effective root (construction hardlinks, mounts, and chowns as root)
//!
//! Nothing here uses namespaces, cgroups, or seccomp: isolation is chroot
//! plus a permanent UID/GID drop, by design of the surrounding system.

pub mod exec;
pub mod fsops;
pub mod linkcache;
pub mod manifest;
pub mod materialize;
pub mod mounts;
pub mod ownership;
pub mod policy;
pub mod pty;
pub mod teardown;
pub mod trace;
pub mod users;
pub mod validate;

pub use manifest::{Entry, Parser};
pub use materialize::{BuildError, Builder};
pub use mounts::MountTable;
pub use policy::{Authorization, PolicyError};
pub use trace::Trace;
