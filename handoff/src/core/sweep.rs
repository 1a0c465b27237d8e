//! Pure classification rules for the recycling sweep.
//!
//! The recycler partitions everything under an application directory into
//! three disjoint classes: live slot directories, recycled folders reserved
//! for reuse, and garbage. The decisions live here, away from the
//! filesystem, so they can be tested exhaustively.

use std::collections::BTreeSet;

/// Prefix reserved for retired slot directories awaiting reuse.
pub const RECYCLED_PREFIX: &str = "_unused_";

/// Upper bound for recycled-folder suffix probing. Hitting it is reported as
/// an error instead of probing forever.
pub const SUFFIX_PROBE_LIMIT: u32 = 10_000;

/// What the sweep should do with one directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// Live slot directory, keep.
    Keep,
    /// Recycled folder, keep for reuse.
    KeepRecycled,
    /// Garbage (stray file, dead slot, unknown directory), delete.
    Delete,
}

/// Whether a directory name is in the reserved recycled pattern.
pub fn is_recycled_name(name: &str) -> bool {
    name.strip_prefix(RECYCLED_PREFIX)
        .is_some_and(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
}

/// Directory name for a recycled folder with the given suffix.
pub fn recycled_name(suffix: u32) -> String {
    format!("{RECYCLED_PREFIX}{suffix}")
}

/// Classify one entry of the application directory.
///
/// `live` is the set of slot names with an alive process (running, starting,
/// or paused). Everything that is neither a live slot directory nor a
/// recycled folder is garbage.
pub fn classify(name: &str, is_dir: bool, live: &BTreeSet<String>) -> SweepAction {
    if !is_dir {
        // Stray files should never exist under an application directory.
        return SweepAction::Delete;
    }
    if is_recycled_name(name) {
        return SweepAction::KeepRecycled;
    }
    if live.contains(name) {
        return SweepAction::Keep;
    }
    SweepAction::Delete
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn recycled_names_require_numeric_suffix() {
        assert!(is_recycled_name("_unused_0"));
        assert!(is_recycled_name("_unused_42"));
        assert!(!is_recycled_name("_unused_"));
        assert!(!is_recycled_name("_unused_x"));
        assert!(!is_recycled_name("unused_1"));
        assert!(!is_recycled_name("alfa-bravo"));
    }

    #[test]
    fn files_are_always_garbage() {
        assert_eq!(
            classify("alfa-bravo", false, &live(&["alfa-bravo"])),
            SweepAction::Delete
        );
    }

    #[test]
    fn live_directories_are_kept() {
        assert_eq!(
            classify("alfa-bravo", true, &live(&["alfa-bravo"])),
            SweepAction::Keep
        );
    }

    #[test]
    fn recycled_directories_are_kept() {
        assert_eq!(
            classify("_unused_3", true, &live(&[])),
            SweepAction::KeepRecycled
        );
    }

    #[test]
    fn unknown_directories_are_garbage() {
        assert_eq!(classify("echo-golf", true, &live(&[])), SweepAction::Delete);
    }
}
