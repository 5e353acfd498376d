use std::path::PathBuf;

use bitflags::bitflags;

use crate::error::JailError;
use crate::user::{Gid, Uid};

/// Execution mode, selected with `-M {l,o,r}`.
///
/// Mirrors `nsjconf->mode` / `MODE_LISTEN_TCP` etc. one-to-one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    ListenTcp,
    StandaloneOnce,
    StandaloneRerun,
}

impl Mode {
    pub fn parse(s: &str) -> Result<Self, JailError> {
        match s.chars().next() {
            Some('l') => Ok(Mode::ListenTcp),
            Some('o') => Ok(Mode::StandaloneOnce),
            Some('r') => Ok(Mode::StandaloneRerun),
            _ => Err(JailError::UnknownMode(s.to_owned())),
        }
    }
}

bitflags! {
    /// The six namespace-isolation toggles from spec.md §3, all on by
    /// default; the CLI only ever clears bits (`--disable_clone_new*`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CloneNamespaces: u32 {
        const NET  = 1 << 0;
        const USER = 1 << 1;
        const MNT  = 1 << 2;
        const PID  = 1 << 3;
        const IPC  = 1 << 4;
        const UTS  = 1 << 5;
    }
}

impl Default for CloneNamespaces {
    fn default() -> Self {
        Self::all()
    }
}

bitflags! {
    /// Legacy personality(2) ABI toggles, see GLOSSARY.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Personality: u64 {
        const ADDR_COMPAT_LAYOUT = nix::libc::ADDR_COMPAT_LAYOUT as u64;
        const MMAP_PAGE_ZERO     = nix::libc::MMAP_PAGE_ZERO as u64;
        const READ_IMPLIES_EXEC  = nix::libc::READ_IMPLIES_EXEC as u64;
        const ADDR_LIMIT_3GB     = nix::libc::ADDR_LIMIT_3GB as u64;
        const ADDR_NO_RANDOMIZE  = nix::libc::ADDR_NO_RANDOMIZE as u64;
    }
}

/// One rlimit ceiling, as accepted by `--rlimit_*`: an absolute value, the
/// process' current hard limit ("max"), or its current soft limit ("def").
///
/// This is `cmdlineParseRLimit`'s three branches, kept as data instead of
/// being resolved immediately, so the same `Config` can be re-applied
/// verbatim on every iteration of `STANDALONE_RERUN` (§8 round-trip
/// property) without re-reading `getrlimit` each time changing the answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RlimitValue {
    Value(u64),
    Max,
    KeepCurrent,
}

impl RlimitValue {
    pub fn parse(resource: &'static str, s: &str, mul: u64) -> Result<Self, JailError> {
        match s {
            "max" => Ok(RlimitValue::Max),
            "def" => Ok(RlimitValue::KeepCurrent),
            _ => {
                let n: u64 = s.parse().map_err(|_| JailError::InvalidRlimit {
                    resource,
                    value: s.to_owned(),
                })?;
                Ok(RlimitValue::Value(n * mul))
            }
        }
    }
}

/// The seven resource ceilings from spec.md §3, with `cmdline.c`'s own
/// defaults (not spelled out in spec.md §6, but authoritative there).
#[derive(Clone, Copy, Debug)]
pub struct RlimitSet {
    pub as_: RlimitValue,
    pub core: RlimitValue,
    pub cpu: RlimitValue,
    pub fsize: RlimitValue,
    pub nofile: RlimitValue,
    pub nproc: RlimitValue,
    pub stack: RlimitValue,
}

impl Default for RlimitSet {
    fn default() -> Self {
        const MIB: u64 = 1024 * 1024;
        Self {
            as_: RlimitValue::Value(512 * MIB),
            core: RlimitValue::Value(0),
            cpu: RlimitValue::Value(600),
            fsize: RlimitValue::Value(1 * MIB),
            nofile: RlimitValue::Value(32),
            nproc: RlimitValue::KeepCurrent,
            stack: RlimitValue::KeepCurrent,
        }
    }
}

/// Frozen-after-startup configuration record (spec.md §3, Invariant 4).
///
/// Built exclusively through [`ConfigBuilder`]; once `build()` returns, no
/// method here takes `&mut self`, so sharing a `&Config` (or an `Arc<Config>`)
/// across the supervisor loop and every forked child is always sound.
#[derive(Clone, Debug)]
pub struct Config {
    pub mode: Mode,
    pub uid: Uid,
    pub gid: Gid,
    pub hostname: String,
    pub chroot: PathBuf,
    pub is_root_rw: bool,
    pub bind_mounts: Vec<PathBuf>,
    pub tmpfs_mounts: Vec<PathBuf>,
    pub namespaces: CloneNamespaces,
    pub tlimit: u64,
    pub rlimits: RlimitSet,
    pub port: u16,
    pub max_conns_per_ip: u32,
    pub iface_macvtap: Option<String>,
    pub iface_macvlan: Option<String>,
    pub daemonize: bool,
    pub verbose: bool,
    pub keep_env: bool,
    pub keep_caps: bool,
    pub apply_sandbox: bool,
    pub is_silent: bool,
    pub personality: Personality,
    pub command: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Fluent builder for [`Config`], in the same style as this crate's
/// `ContainerOptions`/`ProcessOptions` (see `container.rs`/`process.rs`).
#[derive(Debug)]
pub struct ConfigBuilder {
    mode: Mode,
    uid: Option<Uid>,
    gid: Option<Gid>,
    hostname: String,
    chroot: PathBuf,
    is_root_rw: bool,
    bind_mounts: Vec<PathBuf>,
    tmpfs_mounts: Vec<PathBuf>,
    namespaces: CloneNamespaces,
    tlimit: u64,
    rlimits: RlimitSet,
    port: u16,
    max_conns_per_ip: u32,
    iface_macvtap: Option<String>,
    iface_macvlan: Option<String>,
    daemonize: bool,
    verbose: bool,
    keep_env: bool,
    keep_caps: bool,
    apply_sandbox: bool,
    is_silent: bool,
    personality: Personality,
    command: Vec<String>,
    log_path: Option<PathBuf>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            mode: Mode::ListenTcp,
            uid: None,
            gid: None,
            hostname: "NSJAIL".to_owned(),
            chroot: PathBuf::from("/chroot"),
            is_root_rw: false,
            bind_mounts: Vec::new(),
            tmpfs_mounts: Vec::new(),
            namespaces: CloneNamespaces::default(),
            tlimit: 600,
            rlimits: RlimitSet::default(),
            port: 31337,
            max_conns_per_ip: 0,
            iface_macvtap: None,
            iface_macvlan: None,
            daemonize: false,
            verbose: false,
            keep_env: false,
            keep_caps: false,
            apply_sandbox: true,
            is_silent: false,
            personality: Personality::empty(),
            command: Vec::new(),
            log_path: None,
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn user(mut self, uid: Uid, gid: Gid) -> Self {
        self.uid = Some(uid);
        self.gid = Some(gid);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn chroot(mut self, chroot: impl Into<PathBuf>) -> Self {
        self.chroot = chroot.into();
        self
    }

    pub fn root_rw(mut self, rw: bool) -> Self {
        self.is_root_rw = rw;
        self
    }

    pub fn add_bind_mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.bind_mounts.push(path.into());
        self
    }

    pub fn add_tmpfs_mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.tmpfs_mounts.push(path.into());
        self
    }

    pub fn namespaces(mut self, namespaces: CloneNamespaces) -> Self {
        self.namespaces = namespaces;
        self
    }

    pub fn tlimit(mut self, seconds: u64) -> Self {
        self.tlimit = seconds;
        self
    }

    pub fn rlimits(mut self, rlimits: RlimitSet) -> Self {
        self.rlimits = rlimits;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn max_conns_per_ip(mut self, n: u32) -> Self {
        self.max_conns_per_ip = n;
        self
    }

    pub fn net_macvtap(mut self, iface: impl Into<String>) -> Self {
        self.iface_macvtap = Some(iface.into());
        self
    }

    pub fn net_macvlan(mut self, iface: impl Into<String>) -> Self {
        self.iface_macvlan = Some(iface.into());
        self
    }

    pub fn daemonize(mut self, v: bool) -> Self {
        self.daemonize = v;
        self
    }

    pub fn verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    pub fn keep_env(mut self, v: bool) -> Self {
        self.keep_env = v;
        self
    }

    pub fn keep_caps(mut self, v: bool) -> Self {
        self.keep_caps = v;
        self
    }

    pub fn apply_sandbox(mut self, v: bool) -> Self {
        self.apply_sandbox = v;
        self
    }

    pub fn silent(mut self, v: bool) -> Self {
        self.is_silent = v;
        self
    }

    pub fn personality(mut self, bits: Personality) -> Self {
        self.personality = bits;
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<Config, JailError> {
        if !(1..=65535).contains(&self.port) {
            return Err(JailError::InvalidPort(self.port as u32));
        }
        if self.command.is_empty() {
            return Err(JailError::MissingCommand);
        }
        Ok(Config {
            mode: self.mode,
            uid: self.uid.unwrap_or(Uid::from_raw(0)),
            gid: self.gid.unwrap_or(Gid::from_raw(0)),
            hostname: self.hostname,
            chroot: self.chroot,
            is_root_rw: self.is_root_rw,
            bind_mounts: self.bind_mounts,
            tmpfs_mounts: self.tmpfs_mounts,
            namespaces: self.namespaces,
            tlimit: self.tlimit,
            rlimits: self.rlimits,
            port: self.port,
            max_conns_per_ip: self.max_conns_per_ip,
            iface_macvtap: self.iface_macvtap,
            iface_macvlan: self.iface_macvlan,
            daemonize: self.daemonize,
            verbose: self.verbose,
            keep_env: self.keep_env,
            keep_caps: self.keep_caps,
            apply_sandbox: self.apply_sandbox,
            is_silent: self.is_silent,
            personality: self.personality,
            command: self.command,
            log_path: self.log_path,
        })
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_ports() {
        let err = Config::builder()
            .port(0)
            .command(vec!["/bin/true".into()])
            .build()
            .unwrap_err();
        assert!(matches!(err, JailError::InvalidPort(0)));

        let err = Config::builder()
            .port(65535)
            .command(vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, JailError::MissingCommand));
    }

    #[test]
    fn accepts_boundary_ports() {
        assert!(Config::builder()
            .port(1)
            .command(vec!["/bin/true".into()])
            .build()
            .is_ok());
        assert!(Config::builder()
            .port(65535)
            .command(vec!["/bin/true".into()])
            .build()
            .is_ok());
    }

    #[test]
    fn rlimit_parses_max_def_and_numeric() {
        assert_eq!(
            RlimitValue::parse("AS", "max", 1024 * 1024).unwrap(),
            RlimitValue::Max
        );
        assert_eq!(
            RlimitValue::parse("AS", "def", 1024 * 1024).unwrap(),
            RlimitValue::KeepCurrent
        );
        assert_eq!(
            RlimitValue::parse("AS", "8", 1).unwrap(),
            RlimitValue::Value(8)
        );
        assert_eq!(
            RlimitValue::parse("AS", "2", 1024 * 1024).unwrap(),
            RlimitValue::Value(2 * 1024 * 1024)
        );
    }

    #[test]
    fn rlimit_rejects_garbage() {
        assert!(RlimitValue::parse("NOFILE", "banana", 1).is_err());
    }

    #[test]
    fn default_namespaces_are_all_enabled() {
        let ns = CloneNamespaces::default();
        assert!(ns.contains(CloneNamespaces::NET));
        assert!(ns.contains(CloneNamespaces::USER));
        assert!(ns.contains(CloneNamespaces::MNT));
        assert!(ns.contains(CloneNamespaces::PID));
        assert!(ns.contains(CloneNamespaces::IPC));
        assert!(ns.contains(CloneNamespaces::UTS));
    }
}
