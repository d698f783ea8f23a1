//! The plan trace and the dry-run gate.
//!
//! Every mutating operation is announced on the trace as a pseudo-shell line
//! (`mkdir -m 0755 /a`, `ln SRC DST`, `mount -i -n -t proc proc DST`) and then
//! performed only when not in dry-run mode. In dry-run the trace goes to
//! stdout and is the complete plan; in plain verbose mode it goes to stderr so
//! it interleaves with error reports.

use std::fmt;
use std::io::{self, Write as _};

/// Trace sink shared by everything that mutates the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct Trace {
    verbose: bool,
    dryrun: bool,
}

impl Trace {
    pub fn new(verbose: bool, dryrun: bool) -> Self {
        // Dry-run implies verbose: a silent dry-run would do nothing at all.
        Self {
            verbose: verbose || dryrun,
            dryrun,
        }
    }

    /// A trace that neither prints nor blocks mutation.
    pub fn quiet() -> Self {
        Self {
            verbose: false,
            dryrun: false,
        }
    }

    /// A trace that prints the plan and suppresses all mutation.
    pub fn plan_only() -> Self {
        Self {
            verbose: true,
            dryrun: true,
        }
    }

    #[inline]
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    #[inline]
    pub fn dryrun(&self) -> bool {
        self.dryrun
    }

    /// True when the operation just traced should actually be performed.
    #[inline]
    pub fn mutate(&self) -> bool {
        !self.dryrun
    }

    /// Emit one line of the plan trace.
    pub fn emit(&self, line: fmt::Arguments) {
        if !self.verbose {
            return;
        }
        if self.dryrun {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        } else {
            let _ = writeln!(io::stderr(), "{line}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dryrun_implies_verbose() {
        let t = Trace::new(false, true);
        assert!(t.verbose());
        assert!(!t.mutate());
    }

    #[test]
    fn verbose_still_mutates() {
        let t = Trace::new(true, false);
        assert!(t.verbose());
        assert!(t.mutate());
    }
}
