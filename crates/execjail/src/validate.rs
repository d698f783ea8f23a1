//! Pathname validation for externally supplied names.
//!
//! Jail directories, move destinations, and usernames all pass through here
//! before any filesystem operation looks at them. The rules are deliberately
//! blunt: a small allowed character set, no `..` component anywhere, and a
//! hard length cap.

/// Maximum accepted name length, exclusive.
pub const NAME_MAX_LEN: usize = 1024;

/// Check a caller-supplied filename.
///
/// Accepts only `[A-Za-z0-9._~-]`, plus `/` when `allow_slash` is set.
/// Rejects names starting with `~`, any `..` path component, absolute names
/// unless `allow_absolute`, and names of `NAME_MAX_LEN` bytes or more.
pub fn check_filename(name: &str, allow_slash: bool, allow_absolute: bool) -> bool {
    if name.len() >= NAME_MAX_LEN {
        return false;
    }
    if name.starts_with('~') {
        return false;
    }
    let ok = |c: char| {
        c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' || c == '~' || (c == '/' && allow_slash)
    };
    if !name.chars().all(ok) {
        return false;
    }
    if !allow_absolute && name.starts_with('/') {
        return false;
    }
    // `..` is rejected only as a whole component: at the start, after a
    // slash, at the end, or before a slash.
    for (i, _) in name.match_indices("..") {
        let before_ok = i == 0 || name.as_bytes()[i - 1] == b'/';
        let after = name.as_bytes().get(i + 2);
        let after_ok = after.is_none() || after == Some(&b'/');
        if before_ok && after_ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names() {
        assert!(check_filename("jail0", false, false));
        assert!(check_filename("a.b-c_d~e", false, false));
        // Empty trips none of the rules; callers resolve it against the cwd.
        assert!(check_filename("", false, false));
        assert!(!check_filename("sp ace", false, false));
        assert!(!check_filename("semi;colon", true, true));
    }

    #[test]
    fn tilde_prefix_rejected() {
        assert!(!check_filename("~root", false, false));
        assert!(check_filename("x~", false, false));
    }

    #[test]
    fn slash_policy() {
        assert!(check_filename("a/b", true, false));
        assert!(!check_filename("a/b", false, false));
        assert!(check_filename("/a/b", true, true));
        assert!(!check_filename("/a/b", true, false));
    }

    #[test]
    fn dotdot_components() {
        assert!(!check_filename("..", true, false));
        assert!(!check_filename("../x", true, false));
        assert!(!check_filename("a/../b", true, false));
        assert!(!check_filename("a/..", true, false));
        // `..` as part of a longer component is fine
        assert!(check_filename("a..b", true, false));
        assert!(check_filename("a/..b/c", true, false));
        assert!(check_filename("a/b../c", true, false));
    }

    #[test]
    fn length_boundary() {
        let just_under = "a".repeat(NAME_MAX_LEN - 1);
        let at_limit = "a".repeat(NAME_MAX_LEN);
        assert!(check_filename(&just_under, false, false));
        assert!(!check_filename(&at_limit, false, false));
    }
}
