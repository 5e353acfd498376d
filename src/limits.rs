//! Resource limit application, step 5 of `contain.rs`'s `ChildSteps`
//! (spec.md §4.F), grounded on `northstar-runtime`'s `fork::init::set_rlimits`
//! mapping a small enum onto `nix::sys::resource::setrlimit`.

use nix::sys::resource::{getrlimit, setrlimit, Resource};

use crate::config::{RlimitSet, RlimitValue};
use crate::error::Error;

/// Resolves `value` against the resource's current soft/hard limit and
/// applies it. `RlimitValue::KeepCurrent` reads the current *soft* limit
/// (`rlim_cur`) and reapplies it unchanged; `RlimitValue::Max` reads the
/// current *hard* limit (`rlim_max`) and raises the soft limit to match.
/// This is `cmdlineParseRLimit`'s `def`/`max` distinction, preserved
/// verbatim rather than collapsed into one "unlimited" case.
fn apply_one(resource: Resource, value: RlimitValue) -> Result<(), Error> {
    let (soft, hard) = getrlimit(resource)?;
    let new_soft = match value {
        RlimitValue::Value(v) => v,
        RlimitValue::KeepCurrent => soft,
        RlimitValue::Max => hard,
    };
    setrlimit(resource, new_soft, hard)?;
    Ok(())
}

/// Applies every resource limit in `limits` to the calling process, in the
/// same order `subprocNewProc` lists them in `containSetLimits`.
pub fn apply(limits: &RlimitSet) -> Result<(), Error> {
    apply_one(Resource::RLIMIT_AS, limits.as_)?;
    apply_one(Resource::RLIMIT_CORE, limits.core)?;
    apply_one(Resource::RLIMIT_CPU, limits.cpu)?;
    apply_one(Resource::RLIMIT_FSIZE, limits.fsize)?;
    apply_one(Resource::RLIMIT_NOFILE, limits.nofile)?;
    apply_one(Resource::RLIMIT_NPROC, limits.nproc)?;
    apply_one(Resource::RLIMIT_STACK, limits.stack)?;
    Ok(())
}
