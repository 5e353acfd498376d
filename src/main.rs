use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nix::unistd::{chdir, fork, setsid, ForkResult};
use tracing::info;

use jailshim::capability::{CapabilityPolicy, DropAll, KeepPermitted};
use jailshim::cli::Args;
use jailshim::error::Error;
use jailshim::network::{NetAttachPolicy, NoAttach, RtnetlinkAttach};
use jailshim::sandbox::{DefaultAllowList, SandboxPolicy};
use jailshim::subproc::Supervisor;
use jailshim::{log, modes};

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("jailshim: {err}");
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = log::init(config.log_path.as_deref(), config.verbose);

    if config.daemonize {
        if let Err(err) = daemonize() {
            eprintln!("jailshim: failed to daemonize: {err}");
            return ExitCode::FAILURE;
        }
    }

    info!(mode = ?config.mode, "starting");

    let cap_policy: Arc<dyn CapabilityPolicy> = if config.keep_caps {
        Arc::new(KeepPermitted)
    } else {
        Arc::new(DropAll)
    };
    let sandbox_policy: Arc<dyn SandboxPolicy> = Arc::new(DefaultAllowList);
    let net_policy: Box<dyn NetAttachPolicy> =
        if config.iface_macvtap.is_some() || config.iface_macvlan.is_some() {
            Box::new(RtnetlinkAttach {
                macvtap: config.iface_macvtap.clone(),
                macvlan: config.iface_macvlan.clone(),
            })
        } else {
            Box::new(NoAttach)
        };

    let supervisor = Supervisor::new(config, cap_policy, sandbox_policy, net_policy);
    let code = modes::run(supervisor.config().clone(), supervisor);
    ExitCode::from(code as u8)
}

/// Classic double-fork daemonization, matching `utilDaemonize`'s sequence:
/// fork, have the parent exit, `setsid` in the child, fork again so the
/// result can never reacquire a controlling terminal, and `chdir("/")` so
/// the daemon does not pin whatever directory it was launched from.
///
/// No crate in this workspace's dependency stack wraps this, so it is
/// written directly against `nix`'s primitives, the same way the rest of
/// this crate reaches for `nix` instead of rolling raw libc calls.
fn daemonize() -> Result<(), Error> {
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid()?;
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    chdir("/")?;
    Ok(())
}
