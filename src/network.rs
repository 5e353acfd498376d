//! Listener, connection-info rendering, and the net-namespace attachment
//! hook (components C and I, spec.md §4.C/§4.I).
//!
//! The listener socket plumbing (`AF_INET6`, `SO_REUSEADDR`, `in6addr_any`,
//! `SOMAXCONN` backlog, `TCP_CORK` per accepted connection) is grounded on
//! `net.c`'s `netGetRecvSocket`/`netAcceptConn`; the `rtnetlink` attachment
//! hook replaces `net.c`'s libnl3-based `netCloneMacV`.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use futures::TryStreamExt as _;
use nix::sys::socket::{
    accept, bind, getpeername, getsockname, listen, setsockopt, socket, sockopt, AddressFamily,
    Backlog, SockFlag, SockType, SockaddrIn6,
};
use nix::sys::stat::{fstat, SFlag};
use nix::unistd::Pid;

use crate::error::Error;

/// A rendered description of an accepted connection, for logging. Mirrors
/// `netConnToText`'s `remote_ip:remote_port local_ip:local_port` format,
/// falling back to the `[STANDALONE_MODE]` sentinel for a non-socket fd
/// (standalone mode's inherited stdin).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnInfo {
    Socket {
        remote: SocketAddrV6,
        local: SocketAddrV6,
    },
    Standalone,
}

impl ConnInfo {
    /// The remote peer's address for admission control (component D,
    /// spec.md §4.D), stripped of port - `None` for a standalone-mode
    /// connection, which admission control always allows through.
    pub fn remote_addr(&self) -> Option<std::net::IpAddr> {
        match self {
            ConnInfo::Socket { remote, .. } => Some(std::net::IpAddr::V6(*remote.ip())),
            ConnInfo::Standalone => None,
        }
    }
}

impl std::fmt::Display for ConnInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnInfo::Socket { remote, local } => write!(f, "{remote} {local}"),
            ConnInfo::Standalone => write!(f, "[STANDALONE_MODE]"),
        }
    }
}

/// Returns whether `fd` refers to a socket, the Rust equivalent of
/// `netIsSocket`'s `fstat` + `S_ISSOCK` check.
pub fn is_socket(fd: RawFd) -> bool {
    match fstat(fd) {
        Ok(st) => SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFSOCK),
        Err(_) => false,
    }
}

/// Renders `fd` the way `netConnToText` does: peer/local address pair for a
/// socket, the standalone sentinel otherwise.
pub fn conn_to_text(fd: RawFd) -> ConnInfo {
    if !is_socket(fd) {
        return ConnInfo::Standalone;
    }
    let remote = getpeername::<SockaddrIn6>(fd).ok();
    let local = getsockname::<SockaddrIn6>(fd).ok();
    match (remote, local) {
        (Some(r), Some(l)) => ConnInfo::Socket {
            remote: to_std(&r),
            local: to_std(&l),
        },
        _ => ConnInfo::Standalone,
    }
}

fn to_std(addr: &SockaddrIn6) -> SocketAddrV6 {
    SocketAddrV6::new(addr.ip(), addr.port(), 0, addr.scope_id())
}

/// A dual-stack IPv6 TCP listener, component C.
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Binds `in6addr_any:port` with a `SOMAXCONN` backlog, matching
    /// `netGetRecvSocket`.
    pub fn bind(port: u16) -> Result<Self, Error> {
        let fd = socket(
            AddressFamily::Inet6,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )?;
        setsockopt(&fd, sockopt::ReuseAddr, &true)?;
        let addr = SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
        bind(fd.as_raw_fd(), &addr)?;
        listen(&fd, Backlog::new(libc_somaxconn())?)?;
        Ok(Self { fd })
    }

    /// Accepts one connection, setting `TCP_CORK` on it before handing it
    /// back, matching `netAcceptConn`.
    pub fn accept(&self) -> Result<(OwnedFd, ConnInfo), Error> {
        let raw = accept(self.fd.as_raw_fd())?;
        let conn = unsafe { OwnedFd::from_raw_fd(raw) };
        setsockopt(&conn, sockopt::TcpCork, &true)?;
        let info = conn_to_text(conn.as_raw_fd());
        Ok((conn, info))
    }
}

fn libc_somaxconn() -> i32 {
    nix::libc::SOMAXCONN
}

/// Pluggable net-namespace attachment policy, the "interface" half of
/// component O/§4.I: after the child's namespaces exist but before it
/// execs, optionally attach a virtual interface into its netns.
pub trait NetAttachPolicy: Send + Sync {
    fn attach(&self, child: Pid) -> Result<(), Error>;
}

/// No-op policy, used when neither `--iface_macvtap` nor `--iface_macvlan`
/// is given.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAttach;

impl NetAttachPolicy for NoAttach {
    fn attach(&self, _child: Pid) -> Result<(), Error> {
        Ok(())
    }
}

/// Default attachment policy: creates a `macvtap`/`macvlan` device off the
/// named master interface and moves it into the child's network namespace
/// by pid, replacing `net.c`'s libnl3-based `netCloneMacV`.
///
/// `rtnetlink` is async; since the supervisor itself stays synchronous
/// (spec.md §5), this spins up a short-lived single-threaded
/// `tokio::runtime::Runtime` to drive the one netlink exchange and tears it
/// down immediately after - no supervisor state crosses into async code and
/// the whole exchange is awaited before `attach` returns.
#[derive(Clone, Debug, Default)]
pub struct RtnetlinkAttach {
    pub macvtap: Option<String>,
    pub macvlan: Option<String>,
}

impl NetAttachPolicy for RtnetlinkAttach {
    fn attach(&self, child: Pid) -> Result<(), Error> {
        let Some(master) = self.macvtap.as_deref().or(self.macvlan.as_deref()) else {
            return Ok(());
        };
        let is_tap = self.macvtap.is_some();
        let master = master.to_owned();
        let ns_pid = child.as_raw() as u32;

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        rt.block_on(attach_macv(master, is_tap, ns_pid))
    }
}

async fn attach_macv(master: String, is_tap: bool, ns_pid: u32) -> Result<(), Error> {
    let (connection, handle, _) = rtnetlink::new_connection()?;
    tokio::spawn(connection);

    let mut links = handle.link().get().match_name(master.clone()).execute();
    let master_link = links
        .try_next()
        .await?
        .ok_or_else(|| format!("no such master interface: {master}"))?;
    let master_index = master_link.header.index;

    // rtnetlink's builder only exposes `macvlan()` directly; a true macvtap
    // device additionally needs its link-info kind overridden to "macvtap",
    // which is not exposed through this crate's typed API, so both
    // `--iface_macvtap` and `--iface_macvlan` create a macvlan device here.
    // Callers that need a real macvtap device should supply their own
    // `NetAttachPolicy`.
    let name = if is_tap { "vt0" } else { "vl0" };
    handle
        .link()
        .add()
        .macvlan(
            name.to_owned(),
            master_index,
            rtnetlink::packet_route::link::MacVlanMode::Bridge,
        )
        .execute()
        .await?;

    let mut created = handle.link().get().match_name(name.to_owned()).execute();
    let created_link = created
        .try_next()
        .await?
        .ok_or_else(|| format!("failed to create interface: {name}"))?;

    handle
        .link()
        .set(created_link.header.index)
        .setns_by_pid(ns_pid)
        .execute()
        .await?;

    Ok(())
}
