//! Capability drop, step 4 of `contain.rs`'s `ChildSteps` (spec.md §4.F).
//!
//! Grounded on `northstar-runtime`'s `fork::init::drop_privileges`: read the
//! bounding set, drop everything except what the policy keeps, then clear
//! the remaining three sets to match.

use caps::{CapSet, CapsHashSet};

use crate::error::Error;

/// Pluggable capability policy, the "interface" half of component M.
pub trait CapabilityPolicy: Send + Sync {
    /// Returns the capabilities to retain; an empty set drops everything.
    fn keep(&self) -> CapsHashSet;
}

/// Drops every capability. This is `containDropPrivs`'s default behavior
/// when `--keep_caps` is not given.
#[derive(Clone, Copy, Debug, Default)]
pub struct DropAll;

impl CapabilityPolicy for DropAll {
    fn keep(&self) -> CapsHashSet {
        CapsHashSet::new()
    }
}

/// Leaves the process' current permitted set untouched, matching
/// `--keep_caps`.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeepPermitted;

impl CapabilityPolicy for KeepPermitted {
    fn keep(&self) -> CapsHashSet {
        caps::read(None, CapSet::Permitted).unwrap_or_default()
    }
}

/// Applies `policy` to the calling (child) process: trims the bounding set
/// down to `policy.keep()`, then sets Effective/Permitted/Inheritable to the
/// same set and clears Ambient, same ordering as `northstar`'s
/// `drop_privileges`.
pub fn apply(policy: &dyn CapabilityPolicy) -> Result<(), Error> {
    let keep = policy.keep();

    let bounding = caps::read(None, CapSet::Bounding)?;
    for cap in bounding.difference(&keep) {
        caps::drop(None, CapSet::Bounding, *cap)?;
    }

    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        caps::set(None, set, &keep)?;
    }
    caps::set(None, CapSet::Ambient, &CapsHashSet::new())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_all_keeps_nothing() {
        assert!(DropAll.keep().is_empty());
    }

    #[test]
    fn all_caps_is_nonempty() {
        assert!(!caps::all().is_empty());
    }
}
