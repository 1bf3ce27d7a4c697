//! Read-only policy resolution
//!
//! The effective mode is derived on every execution from the connection's optional override and
//! the global `allow_mutations` switch. It is never stored.

/// Compute whether a connection runs read-only for this execution
///
/// A per-connection override always wins (`true` = read-only, `false` = writable).
/// Without one, the connection is read-only unless mutations are globally allowed.
#[must_use]
pub const fn effective_read_only(per_connection_override: Option<bool>, global_allow_mutations: bool) -> bool {
    match per_connection_override {
        Some(read_only) => read_only,
        None => !global_allow_mutations,
    }
}

/// Human label for a resolved mode, used in connection listings
#[must_use]
pub const fn mode_label(read_only: bool) -> &'static str {
    if read_only {
        "read-only"
    } else {
        "read-write"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_true_is_read_only() {
        assert!(effective_read_only(Some(true), true));
        assert!(effective_read_only(Some(true), false));
    }

    #[test]
    fn test_override_false_is_writable() {
        assert!(!effective_read_only(Some(false), true));
        assert!(!effective_read_only(Some(false), false));
    }

    #[test]
    fn test_absent_override_follows_global_switch() {
        assert!(!effective_read_only(None, true));
        assert!(effective_read_only(None, false));
    }

    #[test]
    fn test_mode_label() {
        assert_eq!(mode_label(true), "read-only");
        assert_eq!(mode_label(false), "read-write");
    }
}
