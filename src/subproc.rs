//! Fork/clone orchestrator, reaper, and shutdown (components E, G, H;
//! spec.md §4.E/§4.G/§4.H).
//!
//! Grounded on `subprocRunChild`'s exact ordering - pipe before clone,
//! the net-attach hook after clone but before draining the log pipe,
//! draining before the child is recorded - and on `subprocReap`'s
//! `SIGCONT`-then-`SIGKILL` wall-clock enforcement.

use std::io::Read;
use std::net::IpAddr;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::capability::CapabilityPolicy;
use crate::children::{ChildRecord, ChildTable};
use crate::config::{CloneNamespaces, Config};
use crate::contain;
use crate::error::Error;
use crate::network::NetAttachPolicy;
use crate::sandbox::SandboxPolicy;

const CLONE_STACK_SIZE: usize = 1024 * 1024;

/// The three descriptors spec.md §4.E hands to the orchestrator for one
/// invocation. In `LISTEN_TCP` mode all three are the same accepted socket;
/// in standalone mode they are the supervisor's own inherited 0/1/2, which
/// must not be closed once the child is spawned - `owned` is `None` in that
/// case, and `Some` only when a descriptor was allocated for this one
/// invocation (the accepted socket) and should be dropped once the clone
/// has taken its own copy.
pub struct ConnFds {
    pub fd_in: RawFd,
    pub fd_out: RawFd,
    pub fd_err: RawFd,
    pub owned: Option<OwnedFd>,
}

impl ConnFds {
    /// A `LISTEN_TCP`-mode connection: `fd` duplicated across all three
    /// slots, with ownership retained until the child has its own copy.
    pub fn from_socket(fd: OwnedFd) -> Self {
        let raw = fd.as_raw_fd();
        Self {
            fd_in: raw,
            fd_out: raw,
            fd_err: raw,
            owned: Some(fd),
        }
    }

    /// Standalone-mode fds: the supervisor's own stdin/stdout/stderr,
    /// never owned or closed here.
    pub fn standalone() -> Self {
        Self {
            fd_in: 0,
            fd_out: 1,
            fd_err: 2,
            owned: None,
        }
    }
}

/// Owns the live-child table and every pluggable per-child policy, and
/// drives the spawn/reap/shutdown lifecycle. The supervisor itself never
/// spawns a thread (spec.md §5): every method here runs to completion on
/// the calling thread before returning.
pub struct Supervisor {
    config: Config,
    table: ChildTable,
    cap_policy: Arc<dyn CapabilityPolicy>,
    sandbox_policy: Arc<dyn SandboxPolicy>,
    net_policy: Box<dyn NetAttachPolicy>,
    last_exit_code: Option<i32>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        cap_policy: Arc<dyn CapabilityPolicy>,
        sandbox_policy: Arc<dyn SandboxPolicy>,
        net_policy: Box<dyn NetAttachPolicy>,
    ) -> Self {
        Self {
            config,
            table: ChildTable::new(),
            cap_policy,
            sandbox_policy,
            net_policy,
            last_exit_code: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn table(&self) -> &ChildTable {
        &self.table
    }

    fn clone_flags(&self) -> CloneFlags {
        let ns = self.config.namespaces;
        let mut flags = CloneFlags::empty();
        if ns.contains(CloneNamespaces::NET) {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if ns.contains(CloneNamespaces::USER) {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if ns.contains(CloneNamespaces::MNT) {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if ns.contains(CloneNamespaces::PID) {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if ns.contains(CloneNamespaces::IPC) {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if ns.contains(CloneNamespaces::UTS) {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Forks one child against `conn`, the three descriptors spec.md §4.E
    /// hands to the orchestrator. Component E.
    ///
    /// Ordering, matching `subprocRunChild`: the log pipe is created before
    /// the clone; the net-attach hook runs in the parent right after clone
    /// returns but before the log pipe is drained; the child is only
    /// recorded in the table after the drain completes.
    pub fn spawn(&mut self, conn: ConnFds, remote_addr: Option<IpAddr>) -> Result<(), Error> {
        let (log_rx, log_tx) = nix::unistd::pipe()?;
        let ConnFds { fd_in, fd_out, fd_err, owned } = conn;
        let log_tx_raw: RawFd = log_tx.as_raw_fd();

        let config = self.config.clone();
        let cap_policy = dyn_clone_cap(&*self.cap_policy);
        let sandbox_policy = dyn_clone_sandbox(&*self.sandbox_policy);

        let mut stack = vec![0u8; CLONE_STACK_SIZE];
        let flags = self.clone_flags();
        let child_pid = unsafe {
            clone(
                Box::new(move || -> isize {
                    contain::run(
                        &config,
                        fd_in,
                        fd_out,
                        fd_err,
                        log_tx_raw,
                        cap_policy.as_ref(),
                        sandbox_policy.as_ref(),
                    )
                }),
                &mut stack,
                flags,
                Some(nix::libc::SIGCHLD),
            )?
        };

        // The accepted socket (if any) now lives only in the child; drop
        // our copy. Standalone mode's inherited 0/1/2 are never owned here.
        drop(owned);
        drop(log_tx);

        // Net-attachment failure is logged, not fatal (spec.md §4.E step 6 /
        // §7): the child keeps running, possibly with degraded networking,
        // and must still be drained and recorded below.
        if let Err(err) = self.net_policy.attach(child_pid) {
            warn!(pid = child_pid.as_raw(), %err, "net-namespace attachment failed");
        }

        drain_log_pipe(log_rx, child_pid);

        self.table.insert(ChildRecord {
            pid: child_pid,
            remote_addr,
            started_at: Instant::now(),
            tlimit: self.config.tlimit,
        });
        info!(pid = child_pid.as_raw(), "spawned child");
        Ok(())
    }

    /// Non-blocking reap pass, component G. Tolerates an unknown pid
    /// (spec.md §5's ordering note) by logging a warning instead of
    /// treating it as a bug.
    pub fn reap(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.record_reaped(pid, format!("exited({code})"), code)
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.record_reaped(pid, format!("killed({sig})"), 128 + sig as i32)
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(%err, "waitpid failed");
                    break;
                }
            }
        }
    }

    fn record_reaped(&mut self, pid: Pid, how: String, code: i32) {
        match self.table.remove_by_pid(pid) {
            Some(_) => {
                self.last_exit_code = Some(code);
                info!(pid = pid.as_raw(), %how, "reaped child")
            }
            None => warn!(pid = pid.as_raw(), %how, "reaped unknown pid"),
        }
    }

    /// Blocks until the standalone-mode child that was just spawned has
    /// been reaped, returning its exit code, while still honoring the
    /// wall-clock deadline: `pause()` returns on any signal (`SIGCHLD` or
    /// the tick alarm installed by the caller), so a silent deadline is
    /// still enforced even when the child never exits on its own.
    pub fn reap_blocking(&mut self) -> Option<i32> {
        self.enforce_deadlines();
        self.reap();
        if self.table.is_empty() {
            return self.last_exit_code.take().or(Some(0));
        }
        unsafe { nix::libc::alarm(1) };
        let _ = nix::unistd::pause();
        None
    }

    /// Walks the table for any child whose wall-clock `tlimit` has
    /// elapsed, sending `SIGCONT` then `SIGKILL`, matching `subprocReap`'s
    /// time-limit walk. `SIGCONT` first wakes a stopped child so the
    /// following `SIGKILL` cannot be ignored by it being asleep in a job
    /// control stop.
    pub fn enforce_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<Pid> = self
            .table
            .iter()
            .filter(|r| r.deadline_elapsed(now))
            .map(|r| r.pid)
            .collect();
        for pid in expired {
            let _ = kill(pid, Signal::SIGCONT);
            let _ = kill(pid, Signal::SIGKILL);
            warn!(pid = pid.as_raw(), "child exceeded time limit, killed");
        }
    }

    /// Kills every live child with `SIGKILL` and returns without waiting,
    /// component H.
    pub fn shutdown(&mut self) {
        for record in self.table.iter() {
            let _ = kill(record.pid, Signal::SIGKILL);
        }
    }
}

/// Blocks until the child's log pipe write end is closed (spec.md §4.E
/// step 7: "Drain the log pipe until EOF"). This is a plain blocking read,
/// not non-blocking: the parent already dropped its own copy of the write
/// end, so the only thing keeping the pipe open is the child itself, which
/// closes it (CLOEXEC) at `execve` at the latest. A non-blocking read here
/// would race ahead of a child still writing and silently drop bytes.
fn drain_log_pipe(log_rx: OwnedFd, child_pid: Pid) {
    let mut file = unsafe { std::fs::File::from_raw_fd(log_rx.into_raw_fd()) };
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_ok() && !buf.is_empty() {
        warn!(pid = child_pid.as_raw(), message = %String::from_utf8_lossy(&buf), "child setup error");
    }
}

// `CapabilityPolicy` is a trait object without a supertrait `Clone`; the
// closure that becomes the clone(2) child needs its own owned copy since it
// may outlive `self`'s borrow. Concrete policies in this crate (`DropAll`,
// `KeepPermitted`) are both zero-sized and fully determined by whether
// `keep()` is empty, so the supervisor rebuilds a trait object from that
// instead of requiring every future policy to implement `Clone`.
fn dyn_clone_cap(policy: &dyn CapabilityPolicy) -> Box<dyn CapabilityPolicy> {
    if policy.keep().is_empty() {
        Box::new(crate::capability::DropAll)
    } else {
        Box::new(crate::capability::KeepPermitted)
    }
}

/// `SandboxPolicy` carries its own object-safe `box_clone`, since unlike
/// `CapabilityPolicy` there is no cheap way to tell two arbitrary BPF
/// programs apart from the outside - this clones whatever policy was
/// actually passed to `Supervisor::new`, not a hardcoded default.
fn dyn_clone_sandbox(policy: &dyn SandboxPolicy) -> Box<dyn SandboxPolicy> {
    policy.box_clone()
}
