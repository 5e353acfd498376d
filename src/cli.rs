//! Command-line surface (component L, spec.md §6), a `clap` derive parser
//! mirroring `cmdline.c`'s `custom_opts` table field-for-field, including
//! its numeric defaults and short-flag aliases.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{Config, Mode, Personality, RlimitSet, RlimitValue};
use crate::error::JailError;
use crate::user;

const MIB: u64 = 1024 * 1024;

/// Namespace/seccomp process jailer.
#[derive(Parser, Debug)]
#[command(name = "jailshim", version, about)]
pub struct Args {
    /// Execution mode: l (listen on TCP), o (standalone, run once),
    /// r (standalone, rerun after every exit).
    #[arg(short = 'M', long = "mode", default_value = "l")]
    pub mode: String,

    /// Directory the child is chrooted into.
    #[arg(short = 'c', long = "chroot", default_value = "/chroot")]
    pub chroot: PathBuf,

    /// Target user, numeric uid or a passwd(5) name.
    #[arg(short = 'u', long = "user", default_value = "nobody")]
    pub user: String,

    /// Target group, numeric gid or a group(5) name.
    #[arg(short = 'g', long = "group", default_value = "nobody")]
    pub group: String,

    /// Hostname set inside the new UTS namespace.
    #[arg(short = 'H', long = "hostname", default_value = "NSJAIL")]
    pub hostname: String,

    /// Mount the chroot root read-write instead of read-only.
    #[arg(long = "rw", default_value_t = false)]
    pub rw: bool,

    /// Bind mount PATH into the chroot, read-only. Repeatable.
    #[arg(short = 'B', long = "bindmount")]
    pub bindmount: Vec<PathBuf>,

    /// Mount a fresh tmpfs at PATH inside the chroot. Repeatable.
    #[arg(short = 'T', long = "tmpfsmount")]
    pub tmpfsmount: Vec<PathBuf>,

    /// TCP port to listen on, mode l only.
    #[arg(short = 'p', long = "port", default_value_t = 31337)]
    pub port: u16,

    /// Per-child wall-clock time limit in seconds, 0 disables.
    #[arg(short = 't', long = "time_limit", default_value_t = 600)]
    pub time_limit: u64,

    /// Maximum simultaneous children per remote IP, 0 disables.
    #[arg(short = 'i', long = "max_conns_per_ip", default_value_t = 0)]
    pub max_conns_per_ip: u32,

    #[arg(long = "rlimit_as", default_value = "512")]
    pub rlimit_as: String,
    #[arg(long = "rlimit_core", default_value = "0")]
    pub rlimit_core: String,
    #[arg(long = "rlimit_cpu", default_value = "600")]
    pub rlimit_cpu: String,
    #[arg(long = "rlimit_fsize", default_value = "1")]
    pub rlimit_fsize: String,
    #[arg(long = "rlimit_nofile", default_value = "32")]
    pub rlimit_nofile: String,
    #[arg(long = "rlimit_nproc", default_value = "def")]
    pub rlimit_nproc: String,
    #[arg(long = "rlimit_stack", default_value = "def")]
    pub rlimit_stack: String,

    #[arg(long = "persona_addr_compat_layout", default_value_t = false)]
    pub persona_addr_compat_layout: bool,
    #[arg(long = "persona_mmap_page_zero", default_value_t = false)]
    pub persona_mmap_page_zero: bool,
    #[arg(long = "persona_read_implies_exec", default_value_t = false)]
    pub persona_read_implies_exec: bool,
    #[arg(long = "persona_addr_limit_3gb", default_value_t = false)]
    pub persona_addr_limit_3gb: bool,
    #[arg(long = "persona_addr_no_randomize", default_value_t = false)]
    pub persona_addr_no_randomize: bool,

    #[arg(long = "disable_clone_newuser", default_value_t = false)]
    pub disable_clone_newuser: bool,
    #[arg(long = "disable_clone_newns", default_value_t = false)]
    pub disable_clone_newns: bool,
    #[arg(long = "disable_clone_newpid", default_value_t = false)]
    pub disable_clone_newpid: bool,
    #[arg(long = "disable_clone_newipc", default_value_t = false)]
    pub disable_clone_newipc: bool,
    #[arg(long = "disable_clone_newuts", default_value_t = false)]
    pub disable_clone_newuts: bool,
    #[arg(short = 'N', long = "disable_clone_newnet", default_value_t = false)]
    pub disable_clone_newnet: bool,

    /// Master interface to attach a macvtap device to.
    #[arg(long = "net_macvtap")]
    pub net_macvtap: Option<String>,

    /// Master interface to attach a macvlan device to.
    #[arg(long = "net_macvlan")]
    pub net_macvlan: Option<String>,

    /// Run in the background after setting up the listener.
    #[arg(short = 'd', long = "daemon", default_value_t = false)]
    pub daemon: bool,

    /// Enable DEBUG-level logging.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    pub verbose: bool,

    /// Keep the parent's environment instead of clearing it.
    #[arg(short = 'e', long = "keep_env", default_value_t = false)]
    pub keep_env: bool,

    /// Keep the parent's permitted capability set instead of dropping all.
    #[arg(long = "keep_caps", default_value_t = false)]
    pub keep_caps: bool,

    /// Skip installing the seccomp-bpf filter.
    #[arg(long = "disable_sandbox", default_value_t = false)]
    pub disable_sandbox: bool,

    /// Suppress the child's stdout/stderr (redirected to /dev/null).
    #[arg(long = "silent", default_value_t = false)]
    pub silent: bool,

    /// Write logs to PATH instead of stderr.
    #[arg(short = 'l', long = "log")]
    pub log: Option<PathBuf>,

    /// Command to execute inside the jail, and its arguments, after `--`.
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Args {
    pub fn into_config(self) -> Result<Config, JailError> {
        let mode = Mode::parse(&self.mode)?;
        let uid = user::resolve_user(&self.user)?;
        let gid = user::resolve_group(&self.group)?;

        let rlimits = RlimitSet {
            as_: RlimitValue::parse("AS", &self.rlimit_as, MIB)?,
            core: RlimitValue::parse("CORE", &self.rlimit_core, MIB)?,
            cpu: RlimitValue::parse("CPU", &self.rlimit_cpu, 1)?,
            fsize: RlimitValue::parse("FSIZE", &self.rlimit_fsize, MIB)?,
            nofile: RlimitValue::parse("NOFILE", &self.rlimit_nofile, 1)?,
            nproc: RlimitValue::parse("NPROC", &self.rlimit_nproc, 1)?,
            stack: RlimitValue::parse("STACK", &self.rlimit_stack, MIB)?,
        };

        let mut namespaces = crate::config::CloneNamespaces::all();
        if self.disable_clone_newnet {
            namespaces.remove(crate::config::CloneNamespaces::NET);
        }
        if self.disable_clone_newuser {
            namespaces.remove(crate::config::CloneNamespaces::USER);
        }
        if self.disable_clone_newns {
            namespaces.remove(crate::config::CloneNamespaces::MNT);
        }
        if self.disable_clone_newpid {
            namespaces.remove(crate::config::CloneNamespaces::PID);
        }
        if self.disable_clone_newipc {
            namespaces.remove(crate::config::CloneNamespaces::IPC);
        }
        if self.disable_clone_newuts {
            namespaces.remove(crate::config::CloneNamespaces::UTS);
        }

        let mut personality = Personality::empty();
        if self.persona_addr_compat_layout {
            personality |= Personality::ADDR_COMPAT_LAYOUT;
        }
        if self.persona_mmap_page_zero {
            personality |= Personality::MMAP_PAGE_ZERO;
        }
        if self.persona_read_implies_exec {
            personality |= Personality::READ_IMPLIES_EXEC;
        }
        if self.persona_addr_limit_3gb {
            personality |= Personality::ADDR_LIMIT_3GB;
        }
        if self.persona_addr_no_randomize {
            personality |= Personality::ADDR_NO_RANDOMIZE;
        }

        let mut builder = Config::builder()
            .mode(mode)
            .user(uid, gid)
            .hostname(self.hostname)
            .chroot(self.chroot)
            .root_rw(self.rw)
            .namespaces(namespaces)
            .tlimit(self.time_limit)
            .rlimits(rlimits)
            .port(self.port)
            .max_conns_per_ip(self.max_conns_per_ip)
            .daemonize(self.daemon)
            .verbose(self.verbose)
            .keep_env(self.keep_env)
            .keep_caps(self.keep_caps)
            .apply_sandbox(!self.disable_sandbox)
            .silent(self.silent)
            .personality(personality)
            .command(self.command);

        for mount in self.bindmount {
            builder = builder.add_bind_mount(mount);
        }
        for mount in self.tmpfsmount {
            builder = builder.add_tmpfs_mount(mount);
        }
        if let Some(iface) = self.net_macvtap {
            builder = builder.net_macvtap(iface);
        }
        if let Some(iface) = self.net_macvlan {
            builder = builder.net_macvlan(iface);
        }
        if let Some(path) = self.log {
            builder = builder.log_path(path);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse_from(std::iter::once(&"jailshim").chain(args.iter()))
    }

    #[test]
    fn minimal_invocation_defaults_to_listen_tcp() {
        let args = parse(&["--", "/bin/true"]);
        let config = args.into_config().unwrap();
        assert_eq!(config.mode, Mode::ListenTcp);
        assert_eq!(config.port, 31337);
        assert_eq!(config.command, vec!["/bin/true".to_owned()]);
    }

    #[test]
    fn persona_flags_combine_into_one_mask() {
        let args = parse(&[
            "--persona_addr_no_randomize",
            "--persona_mmap_page_zero",
            "--",
            "/bin/true",
        ]);
        let config = args.into_config().unwrap();
        assert!(config.personality.contains(Personality::ADDR_NO_RANDOMIZE));
        assert!(config.personality.contains(Personality::MMAP_PAGE_ZERO));
        assert!(!config.personality.contains(Personality::READ_IMPLIES_EXEC));
    }

    #[test]
    fn disable_flags_clear_namespace_bits() {
        let args = parse(&["--disable_clone_newnet", "--disable_clone_newpid", "--", "/bin/true"]);
        let config = args.into_config().unwrap();
        assert!(!config.namespaces.contains(crate::config::CloneNamespaces::NET));
        assert!(!config.namespaces.contains(crate::config::CloneNamespaces::PID));
        assert!(config.namespaces.contains(crate::config::CloneNamespaces::MNT));
    }

    #[test]
    fn missing_command_is_rejected() {
        let result = Args::try_parse_from(["jailshim", "--mode", "o"]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_mode() {
        let args = parse(&["--mode", "z", "--", "/bin/true"]);
        assert!(args.into_config().is_err());
    }
}
