//! Seccomp-bpf filter installation, step 7 of `contain.rs`'s `ChildSteps`
//! (spec.md §4.F), grounded on the `seccompiler`-based allow-list pattern
//! used by `boxlite`'s jailer (`other_examples/...jailer-seccomp.rs`).

use std::collections::BTreeMap;

use nix::libc;
use seccompiler::{
    apply_filter, BpfProgram, SeccompAction, SeccompFilter, SeccompRule, TargetArch,
};

use crate::error::Error;

/// Pluggable syscall policy, the "interface" half of component N.
pub trait SandboxPolicy: Send + Sync {
    /// Builds the BPF program to install in the child before `execve`.
    fn build(&self) -> Result<BpfProgram, Error>;

    /// Returns an owned copy of this policy for the `clone(2)` child
    /// closure, which needs its own copy since it may outlive the
    /// supervisor's borrow. Object-safe stand-in for `Clone`, since a
    /// trait object cannot require `Self: Clone` directly.
    fn box_clone(&self) -> Box<dyn SandboxPolicy>;
}

/// Default allow-list: enough syscalls for a normal dynamically linked
/// binary to start, read/write its descriptors, and exit. Anything else
/// is met with `SIGSYS` rather than `EPERM`, matching nsjail's own choice
/// of `SECCOMP_RET_KILL`-by-default sandboxes (§4.F "install a seccomp-bpf
/// program ... or SIGSYS on violation").
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultAllowList;

const ALLOWED_SYSCALLS: &[i64] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_readv,
    libc::SYS_writev,
    libc::SYS_close,
    libc::SYS_fstat,
    libc::SYS_lseek,
    libc::SYS_mmap,
    libc::SYS_mprotect,
    libc::SYS_munmap,
    libc::SYS_brk,
    libc::SYS_rt_sigaction,
    libc::SYS_rt_sigprocmask,
    libc::SYS_rt_sigreturn,
    libc::SYS_ioctl,
    libc::SYS_pread64,
    libc::SYS_pwrite64,
    libc::SYS_access,
    libc::SYS_execve,
    libc::SYS_exit,
    libc::SYS_exit_group,
    libc::SYS_uname,
    libc::SYS_fcntl,
    libc::SYS_getdents64,
    libc::SYS_getcwd,
    libc::SYS_openat,
    libc::SYS_newfstatat,
    libc::SYS_arch_prctl,
    libc::SYS_set_tid_address,
    libc::SYS_set_robust_list,
    libc::SYS_rseq,
    libc::SYS_prlimit64,
    libc::SYS_futex,
    libc::SYS_clock_gettime,
    libc::SYS_gettimeofday,
    libc::SYS_nanosleep,
    libc::SYS_getrandom,
    libc::SYS_madvise,
    libc::SYS_sched_getaffinity,
    libc::SYS_restart_syscall,
];

impl SandboxPolicy for DefaultAllowList {
    fn build(&self) -> Result<BpfProgram, Error> {
        let mut rules = BTreeMap::new();
        for &nr in ALLOWED_SYSCALLS {
            rules.insert(nr, Vec::<SeccompRule>::new());
        }
        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Kill,
            SeccompAction::Allow,
            target_arch(),
        )?;
        Ok(filter.try_into()?)
    }

    fn box_clone(&self) -> Box<dyn SandboxPolicy> {
        Box::new(*self)
    }
}

#[cfg(target_arch = "x86_64")]
fn target_arch() -> TargetArch {
    TargetArch::x86_64
}

#[cfg(target_arch = "aarch64")]
fn target_arch() -> TargetArch {
    TargetArch::aarch64
}

/// Installs `program` for the calling (child) process via `SECCOMP_SET_MODE_FILTER`.
pub fn apply(program: &BpfProgram) -> Result<(), Error> {
    apply_filter(program)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allow_list_builds_a_program() {
        let program = DefaultAllowList.build().unwrap();
        assert!(!program.is_empty());
    }
}
