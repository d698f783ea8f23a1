//! execjail - build, enter, move, and tear down chroot jails.
//!
//! ```text
//! execjail [-n|-V] [-l LINKDIR] [-t] [-s] JAILDIR USER COMMAND < MANIFEST
//! execjail -d JAILDIR
//! execjail -d JAILDIR USER COMMAND < MANIFEST
//! execjail -m JAILDIR NEWPATH
//! ```
//!
//! The jail is authorized by a root-owned `JAIL61` policy file on one of its
//! ancestors, populated from the manifest on stdin, and entered as USER with
//! privileges dropped for good. Exit status is 0 on success, 1 on any error;
//! when the command runs under a PTY the child's own exit status is passed
//! through.

use std::io::IsTerminal as _;
use std::os::fd::OwnedFd;
use std::process::ExitCode;

use anyhow::{anyhow, bail, Context as _};
use clap::Parser as ClapParser;

use execjail::fsops::{self, Ensured};
use execjail::linkcache::LinkCache;
use execjail::validate::check_filename;
use execjail::{exec, ownership, policy, teardown, users};
use execjail::{Builder, MountTable, Parser, Trace};

const USAGE: &str = "Usage: execjail [-n | -V] [-l LINKDIR] [-t] [-s] JAILDIR USER COMMAND < MANIFEST
       execjail -m JAILDIR NEWPATH
       execjail -d JAILDIR";

#[derive(ClapParser)]
#[command(
    name = "execjail",
    about = "Build a chroot jail from a manifest and run a command inside it",
    disable_version_flag = true,
    override_usage = USAGE
)]
struct Cli {
    /// Dry run: print the full plan on stdout, mutate nothing (implies -V)
    #[arg(short = 'n')]
    dryrun: bool,

    /// Verbose: trace every operation on stderr
    #[arg(short = 'V')]
    verbose: bool,

    /// Cross-device link cache directory
    #[arg(short = 'l', value_name = "LINKDIR")]
    linkdir: Option<String>,

    /// Allocate a pseudo-terminal for the command
    #[arg(short = 't')]
    pty: bool,

    /// Attach the calling terminal to the command's stdin
    #[arg(short = 's')]
    stdin_tty: bool,

    /// Tear the jail down (alone, or before rebuilding)
    #[arg(short = 'd')]
    teardown: bool,

    /// Move the jail to NEWPATH (must stay under the same allowjail scope)
    #[arg(short = 'm')]
    do_move: bool,

    /// Accepted for compatibility; no effect
    #[arg(short = 'f')]
    force: bool,

    /// Jail directory
    jaildir: String,

    /// Target user (NEWPATH with -m)
    arg2: Option<String>,

    /// Command to run inside the jail
    arg3: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<u8> {
    let trace = Trace::new(cli.verbose, cli.dryrun);
    let _ = cli.force;

    // Which invocation form is this?
    let doexec = (!cli.teardown || cli.arg3.is_some()) && !cli.do_move;
    let arity_ok = if cli.do_move {
        cli.arg2.is_some() && cli.arg3.is_none() && !cli.pty && !cli.stdin_tty && !cli.teardown
    } else if doexec {
        cli.arg2.is_some() && cli.arg3.is_some()
    } else {
        cli.arg2.is_none()
    };
    if !arity_ok {
        bail!("{USAGE}");
    }

    // Grab the calling terminal before anything changes who we are.
    let caller_tty: Option<OwnedFd> = if cli.stdin_tty {
        rustix::fs::open(
            "/dev/tty",
            rustix::fs::OFlags::RDWR | rustix::fs::OFlags::CLOEXEC,
            rustix::fs::Mode::empty(),
        )
        .ok()
    } else {
        None
    };

    // Escalate the real IDs too, so everything spawned runs as root.
    if trace.mutate() {
        // SAFETY: plain setgid/setuid to root.
        if unsafe { libc::setgid(0) } != 0 {
            bail!("setgid: {}", std::io::Error::last_os_error());
        }
        if unsafe { libc::setuid(0) } != 0 {
            bail!("setuid: {}", std::io::Error::last_os_error());
        }
    }

    let jaildir = absolute(&cli.jaildir)?;
    if !check_filename(&jaildir, true, true) {
        bail!("{jaildir}: Bad characters in filename");
    }

    let auth = policy::authorize(&jaildir, doexec, &trace)?;

    let user = match (doexec, &cli.arg2) {
        (true, Some(name)) => Some(users::jail_user(name)?),
        _ => None,
    };

    if cli.do_move {
        return move_jail(&cli, &auth, &trace);
    }

    if cli.teardown {
        let mounts = read_mounts_soft(None);
        if let Some(rootfd) = auth.rootfd.as_ref() {
            teardown::teardown(rootfd, &jaildir, &mounts, &trace)?;
        }
        if !doexec {
            trace.emit(format_args!("rmdir {jaildir}"));
            if trace.mutate() {
                let parentfd = auth
                    .parentfd
                    .as_ref()
                    .ok_or_else(|| anyhow!("{jaildir}: No parent directory handle"))?;
                rustix::fs::unlinkat(
                    parentfd,
                    auth.component.as_str(),
                    rustix::fs::AtFlags::REMOVEDIR,
                )
                .map_err(|err| anyhow!("rmdir {jaildir}: {err}"))?;
            }
            return Ok(0);
        }
    }

    // Cross-device link cache.
    let cache = match &cli.linkdir {
        Some(dir) => {
            let mut dir = dir.clone();
            while dir.len() > 1 && dir.ends_with('/') {
                dir.pop();
            }
            fsops::ensure_dir(&trace, &dir, 0o755).map_err(|err| anyhow!("{dir}: {err}"))?;
            Some(LinkCache::new(absolute(&dir)?))
        }
        None => None,
    };

    // The manifest arrives on stdin; a terminal there is a mistake.
    if std::io::stdin().is_terminal() {
        bail!("stdin: Is a tty");
    }

    let jaildev = policy::closest_ancestor_dev(&jaildir);
    ownership::paint(&jaildir, &trace)?;

    // Build with a clean umask so created modes are exactly the traced ones.
    // SAFETY: umask is process-global; we are single-threaded.
    let old_umask = unsafe { libc::umask(0) };
    let mut mounts_failed = false;
    let mounts = read_mounts_soft(Some(&mut mounts_failed));
    let mut builder = Builder::new(&jaildir, jaildev, &mounts, cache, trace);
    if mounts_failed {
        builder.mark_failed();
    }
    builder.prepare_root()?;
    builder.install_base(cli.pty)?;
    let mut parser = Parser::new(builder.jail_root());
    builder.run_manifest(std::io::stdin().lock(), &mut parser)?;
    // SAFETY: restoring the saved mask.
    unsafe { libc::umask(old_umask) };

    if builder.failed() {
        return Ok(1);
    }

    let user = user.expect("exec path always has a vetted user");

    // The user's home inside the jail, owned by them, closed to others.
    let home_parent = builder.jail_path("/home");
    fsops::ensure_dir(&trace, &home_parent, 0o755)
        .map_err(|err| anyhow!("{home_parent}: {err}"))?;
    let jail_home = builder.jail_path(&user.home);
    match fsops::ensure_dir(&trace, &jail_home, 0o700) {
        Ok(Ensured::Created) => fsops::lchown(&trace, &jail_home, user.uid, user.gid)
            .map_err(|err| anyhow!("chown {jail_home}: {err}"))?,
        Ok(Ensured::Existed) => {}
        Err(err) => bail!("{jail_home}: {err}"),
    }

    let command = cli.arg3.as_deref().expect("exec path always has a command");
    exec::enter_jail(&jaildir, &user, &trace)?;
    exec::run_command(&user, command, cli.pty, caller_tty, &trace)?;

    // Only a dry run comes back from run_command.
    Ok(0)
}

fn move_jail(cli: &Cli, auth: &policy::Authorization, trace: &Trace) -> anyhow::Result<u8> {
    let newpath_arg = cli.arg2.as_deref().expect("move path checked at arity");
    if !check_filename(newpath_arg, true, true) {
        bail!("{newpath_arg}: Bad characters in move destination");
    }
    let mut newpath = absolute(newpath_arg)?;
    if newpath.len() <= auth.superdir.len() || !newpath.starts_with(&auth.superdir) {
        bail!("{newpath}: Not a subdirectory of {}", auth.superdir);
    }

    // Moving into an existing directory keeps the jail's basename.
    if let Ok(st) = rustix::fs::stat(newpath.as_str()) {
        if (st.st_mode & libc::S_IFMT) == libc::S_IFDIR {
            if !newpath.ends_with('/') {
                newpath.push('/');
            }
            newpath.push_str(&auth.component);
        }
    }

    trace.emit(format_args!(
        "mv {}{} {newpath}",
        auth.parent, auth.component
    ));
    if trace.mutate() {
        let parentfd = auth
            .parentfd
            .as_ref()
            .ok_or_else(|| anyhow!("{}: No parent directory handle", auth.parent))?;
        rustix::fs::renameat(parentfd, auth.component.as_str(), parentfd, newpath.as_str())
            .map_err(|err| {
                anyhow!("mv {}{} {newpath}: {err}", auth.parent, auth.component)
            })?;
    }
    Ok(0)
}

/// Read the host mount table, degrading to an empty table plus a sticky
/// failure when it cannot be read.
fn read_mounts_soft(failed: Option<&mut bool>) -> MountTable {
    match MountTable::read() {
        Ok(mounts) => mounts,
        Err(err) => {
            eprintln!("open /proc/mounts: {err}");
            if let Some(flag) = failed {
                *flag = true;
            }
            MountTable::empty()
        }
    }
}

/// Make a path absolute against the current working directory.
fn absolute(path: &str) -> anyhow::Result<String> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    let cwd = std::env::current_dir().context("getcwd")?;
    let mut cwd = cwd
        .to_str()
        .ok_or_else(|| anyhow!("getcwd: Bogus absolute path"))?
        .to_string();
    while cwd.len() > 1 && cwd.ends_with('/') {
        cwd.pop();
    }
    Ok(format!("{cwd}/{path}"))
}
