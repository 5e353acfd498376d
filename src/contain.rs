//! The in-child environment builder (component F, spec.md §4.F): the
//! `ChildSteps` fail-fast pipeline, composed from `mounts`/`user`/
//! `capability`/`limits`/`sandbox`, ending in `execve`.
//!
//! Every step returns `Result<(), Error>`; `run` composes them with `?` and
//! hands the outcome to the teacher's `exit_child` helper, which never
//! returns - success falls through into `execve` itself replacing the
//! process image, failure calls `_exit(1)` after the error is logged to the
//! log pipe, exactly like `subprocNewProc`'s seven-step sequence.

use std::ffi::CString;
use std::os::fd::RawFd;

use nix::fcntl::{fcntl, open, FcntlArg, FdFlag, OFlag};
use nix::sys::personality::Persona;
use nix::sys::resource::{getrlimit, Resource};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, execve, sethostname, setsid, write};

use crate::capability::{self, CapabilityPolicy};
use crate::config::{CloneNamespaces, Config};
use crate::error::Error;
use crate::exit_child;
use crate::limits;
use crate::mounts;
use crate::sandbox::{self, SandboxPolicy};
use crate::user;

/// Step 1: hostname, session id, legacy personality bits.
///
/// nsjail's own `prepareEnv` also pins CPU affinity; that detail was not
/// retrievable from this crate's copy of `contain.c`, so only the
/// session-id and hostname/personality halves are carried here.
fn prepare_env(config: &Config) -> Result<(), Error> {
    setsid()?;
    if config.namespaces.contains(CloneNamespaces::UTS) {
        sethostname(&config.hostname)?;
    }
    if !config.personality.is_empty() {
        let persona = Persona::from_bits_truncate(config.personality.bits());
        nix::sys::personality::set(persona)?;
    }
    Ok(())
}

/// Step 2: wire `fd_in`/`fd_out`/`fd_err` onto stdin/stdout/stderr - the
/// three descriptors spec.md §4.E hands to the orchestrator - or to
/// `/dev/null` for stdout/stderr under `--silent`. `log_fd` is left open
/// past this step; it is only closed in step 6. In `LISTEN_TCP` mode the
/// three are the same accepted socket duplicated three times; in standalone
/// mode they are the supervisor's own inherited 0/1/2.
fn setup_fd(config: &Config, fd_in: RawFd, fd_out: RawFd, fd_err: RawFd, log_fd: RawFd) -> Result<(), Error> {
    dup2(fd_in, 0)?;
    if config.is_silent {
        let devnull = open("/dev/null", OFlag::O_RDWR, Mode::empty())?;
        dup2(devnull, 1)?;
        dup2(devnull, 2)?;
        if devnull > 2 {
            close(devnull)?;
        }
    } else {
        dup2(fd_out, 1)?;
        dup2(fd_err, 2)?;
    }
    for fd in [fd_in, fd_out, fd_err] {
        if fd > 2 && fd != log_fd {
            let _ = close(fd);
        }
    }
    Ok(())
}

/// Step 3: chroot pivot + RO/RW remount + bind/tmpfs mounts.
fn mount_fs(config: &Config) -> Result<(), Error> {
    mounts::setup(
        &config.chroot,
        config.is_root_rw,
        &config.bind_mounts,
        &config.tmpfs_mounts,
    )
}

/// Step 4: drop to the target uid/gid, then apply the capability policy.
fn drop_privs(config: &Config, cap_policy: &dyn CapabilityPolicy) -> Result<(), Error> {
    user::drop_to(config.uid, config.gid, config.keep_caps)?;
    capability::apply(cap_policy)
}

/// Step 5: apply every configured rlimit.
fn set_limits(config: &Config) -> Result<(), Error> {
    limits::apply(&config.rlimits)
}

/// Upper bound on the fd scan below when `RLIMIT_NOFILE`'s soft limit is
/// `RLIM_INFINITY` (no configured ceiling to scan up to).
const COE_FD_SCAN_FALLBACK: u64 = 65536;

/// Step 6: set `FD_CLOEXEC` on every fd above 2 except `log_fd`, so nothing
/// but the log pipe and the standard descriptors survive into `execve`.
///
/// This cannot walk `/proc/self/fd`: by this point `mount_fs` (step 3) has
/// already pivoted into the chroot, and `pivot_root`'s `umount2(MNT_DETACH)`
/// detaches the *entire* old mount tree, taking the host's inherited `/proc`
/// with it - `/proc` is only present here if the caller explicitly bind
/// mounted it. Instead, scan every fd number up to the (already-applied,
/// step 5) `RLIMIT_NOFILE` soft limit and `fcntl` each, ignoring `EBADF` for
/// the (overwhelming majority of) numbers with nothing open.
fn make_fds_coe(log_fd: RawFd) -> Result<(), Error> {
    let (soft, _) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let max_fd = soft.min(COE_FD_SCAN_FALLBACK) as RawFd;
    for fd in 3..max_fd {
        if fd == log_fd {
            continue;
        }
        match fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            Ok(_) => {}
            Err(nix::errno::Errno::EBADF) => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Step 7: install the seccomp-bpf filter, unless `--disable_sandbox`.
fn sandbox_apply(config: &Config, sandbox_policy: &dyn SandboxPolicy) -> Result<(), Error> {
    if !config.apply_sandbox {
        return Ok(());
    }
    let program = sandbox_policy.build()?;
    sandbox::apply(&program)
}

/// Step 8: exec the target command, clearing the environment unless
/// `--keep_env` was given.
fn do_execve(config: &Config) -> Result<(), Error> {
    let path = CString::new(config.command[0].as_bytes())?;
    let args: Vec<CString> = config
        .command
        .iter()
        .map(|s| CString::new(s.as_bytes()))
        .collect::<Result<_, _>>()?;
    let env: Vec<CString> = if config.keep_env {
        std::env::vars()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<_, _>>()?
    } else {
        Vec::new()
    };
    execve(&path, &args, &env)?;
    unreachable!("execve only returns on error, which is propagated by `?` above")
}

fn log_fatal(log_fd: RawFd, message: &str) {
    let _ = write(unsafe { std::os::fd::BorrowedFd::borrow_raw(log_fd) }, message.as_bytes());
}

/// Runs every `ChildSteps` step in order and execs the target command.
/// Never returns: success falls through into the exec'd image, failure logs
/// to `log_fd` and calls `_exit(1)`.
pub fn run(
    config: &Config,
    fd_in: RawFd,
    fd_out: RawFd,
    fd_err: RawFd,
    log_fd: RawFd,
    cap_policy: &dyn CapabilityPolicy,
    sandbox_policy: &dyn SandboxPolicy,
) -> ! {
    let result = (|| -> Result<(), Error> {
        prepare_env(config)?;
        setup_fd(config, fd_in, fd_out, fd_err, log_fd)?;
        mount_fs(config)?;
        drop_privs(config, cap_policy)?;
        set_limits(config)?;
        make_fds_coe(log_fd)?;
        sandbox_apply(config, sandbox_policy)?;
        do_execve(config)
    })();
    if let Err(err) = &result {
        log_fatal(log_fd, &err.to_string());
    }
    exit_child(result)
}
