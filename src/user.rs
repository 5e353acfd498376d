//! Target-identity resolution and privilege drop (component F, spec.md §4.F).
//!
//! Grounded on the former `UserMapper::set_user` impls in this file (the
//! `setgroups`/`setgid`/`setuid` sequence), generalized to the `setresgid`/
//! `setresuid` triple so real, effective and saved IDs all move together,
//! the way `northstar-runtime`'s `fork::init::set_ids` does it. The
//! uid/gid-namespace mapping machinery (`IdMap`, `newuidmap`/`newgidmap`
//! delegation) that used to live here has no counterpart in this crate:
//! targets run as an existing host uid/gid, not a remapped one.

use caps::CapSet;
use nix::unistd::{geteuid, setgroups, setresgid, setresuid};

use crate::error::JailError;

pub type Uid = nix::unistd::Uid;
pub type Gid = nix::unistd::Gid;

/// Resolves a `-u`/`--user` argument: a numeric uid, or a `passwd(5)` name.
///
/// Mirrors `cmdline.c`'s `getpwnam` lookup with `cmdlineIsANumber` fallback.
pub fn resolve_user(spec: &str) -> Result<Uid, JailError> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(Uid::from_raw(raw));
    }
    match nix::unistd::User::from_name(spec) {
        Ok(Some(user)) => Ok(user.uid),
        _ => Err(JailError::UnknownUser(spec.to_owned())),
    }
}

/// Resolves a `-g`/`--group` argument: a numeric gid, or a `group(5)` name.
pub fn resolve_group(spec: &str) -> Result<Gid, JailError> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(Gid::from_raw(raw));
    }
    match nix::unistd::Group::from_name(spec) {
        Ok(Some(group)) => Ok(group.gid),
        _ => Err(JailError::UnknownGroup(spec.to_owned())),
    }
}

/// Drops the child's identity to `(uid, gid)`, clearing supplementary groups.
///
/// Must run after the mount namespace is torn down and before the seccomp
/// filter is installed (spec.md §4.H order): `setresuid` away from root is
/// itself a syscall the filter may choose to restrict afterwards. Group is
/// set before user, same as `subprocNewProc`'s `containDropPrivs` — once the
/// uid drop succeeds there may no longer be permission left to change gid.
///
/// On Linux, moving away from uid 0 unconditionally zeroes the
/// Effective/Permitted/Ambient capability sets unless the `SECBIT_KEEP_CAPS`
/// securebit is set first - `caps::securebits::set_keepcaps`, bracketing the
/// transition the same way `northstar-runtime`'s `fork::init::set_ids` does.
/// `keep_caps` gates this: with it false the uid switch clears everything as
/// normal and `capability::apply`'s `DropAll` policy confirms the clear;
/// with it true, `Permitted` survives the transition but `Effective` is
/// still zeroed, so it is copied back from the (now-stable) `Permitted` set
/// before the securebit is unset, so `capability::apply`'s `KeepPermitted`
/// policy later reads a non-empty set.
pub fn drop_to(uid: Uid, gid: Gid, keep_caps: bool) -> Result<(), crate::error::Error> {
    let keep_across_transition = keep_caps && geteuid().is_root();
    if keep_across_transition {
        caps::securebits::set_keepcaps(true)?;
    }
    setgroups(&[])?;
    setresgid(gid, gid, gid)?;
    setresuid(uid, uid, uid)?;
    if keep_across_transition {
        let permitted = caps::read(None, CapSet::Permitted)?;
        caps::set(None, CapSet::Effective, &permitted)?;
        caps::securebits::set_keepcaps(false)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_numeric_uid_without_passwd_lookup() {
        assert_eq!(resolve_user("1000").unwrap(), Uid::from_raw(1000));
        assert_eq!(resolve_user("0").unwrap(), Uid::from_raw(0));
    }

    #[test]
    fn resolves_numeric_gid_without_group_lookup() {
        assert_eq!(resolve_group("1000").unwrap(), Gid::from_raw(1000));
    }

    #[test]
    fn rejects_unknown_user_name() {
        let err = resolve_user("this-user-should-not-exist-anywhere-xyz").unwrap_err();
        assert!(matches!(err, JailError::UnknownUser(_)));
    }

    #[test]
    fn rejects_unknown_group_name() {
        let err = resolve_group("this-group-should-not-exist-anywhere-xyz").unwrap_err();
        assert!(matches!(err, JailError::UnknownGroup(_)));
    }
}
