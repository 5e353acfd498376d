//! Connection/child accounting table (component B, spec.md §3-§4.B).
//!
//! An insertion-ordered `Vec`, not a linked list or `HashMap`: per spec.md
//! §9 Design Notes, N is small (bounded by `max_conns_per_ip × distinct
//! ips`), so a flat scan is both simpler and more cache-friendly than the
//! teacher's own patterns elsewhere (e.g. `OwnedPid`'s RAII wrapper, reused
//! here as the per-record pid handle is not owned - just recorded).

use std::net::IpAddr;
use std::time::Instant;

use nix::unistd::Pid;
use tracing::info;

/// One forked-and-running child, tracked from the moment `subprocRunChild`
/// records it until the reaper removes it.
#[derive(Clone, Debug)]
pub struct ChildRecord {
    pub pid: Pid,
    pub remote_addr: Option<IpAddr>,
    pub started_at: Instant,
    pub tlimit: u64,
}

impl ChildRecord {
    pub fn deadline_elapsed(&self, now: Instant) -> bool {
        self.tlimit != 0 && now.duration_since(self.started_at).as_secs() >= self.tlimit
    }
}

/// The ordered collection of live children (component B).
#[derive(Debug, Default)]
pub struct ChildTable {
    records: Vec<ChildRecord>,
}

impl ChildTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: ChildRecord) {
        self.records.push(record);
    }

    /// Removes the record for `pid`, returning it so the reaper can log
    /// what it reaped. Returns `None` if the pid is unknown - tolerated,
    /// per spec.md §5's ordering note, rather than treated as a bug.
    pub fn remove_by_pid(&mut self, pid: Pid) -> Option<ChildRecord> {
        let idx = self.records.iter().position(|r| r.pid == pid)?;
        Some(self.records.remove(idx))
    }

    pub fn count_by_remote_addr(&self, addr: IpAddr) -> u32 {
        self.records
            .iter()
            .filter(|r| r.remote_addr == Some(addr))
            .count() as u32
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.iter()
    }

    /// Logs one line per live child, matching `subprocDisplay`'s
    /// informational dump.
    pub fn log_summary(&self) {
        info!(count = self.records.len(), "live children");
        for r in &self.records {
            info!(pid = r.pid.as_raw(), remote = ?r.remote_addr, "child");
        }
    }

    /// Admission control (component D, spec.md §4.D): `0` disables the
    /// check; otherwise a new connection from `addr` is admitted only while
    /// fewer than `max_per_ip` of its connections are already live. Matching
    /// is on the 16-byte address only, as spec.md §4.D requires - the
    /// caller is expected to have already stripped the port.
    pub fn admit(&self, addr: Option<IpAddr>, max_per_ip: u32) -> bool {
        if max_per_ip == 0 {
            return true;
        }
        let Some(addr) = addr else {
            return true;
        };
        self.count_by_remote_addr(addr) < max_per_ip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(pid: i32, addr: Option<IpAddr>, tlimit: u64) -> ChildRecord {
        ChildRecord {
            pid: Pid::from_raw(pid),
            remote_addr: addr,
            started_at: Instant::now(),
            tlimit,
        }
    }

    #[test]
    fn insert_and_remove_round_trips() {
        let mut table = ChildTable::new();
        table.insert(record(10, None, 0));
        table.insert(record(11, None, 0));
        assert_eq!(table.len(), 2);

        let removed = table.remove_by_pid(Pid::from_raw(10)).unwrap();
        assert_eq!(removed.pid, Pid::from_raw(10));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_unknown_pid_returns_none() {
        let mut table = ChildTable::new();
        table.insert(record(10, None, 0));
        assert!(table.remove_by_pid(Pid::from_raw(999)).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn counts_per_remote_addr() {
        let addr_a: IpAddr = "10.0.0.1".parse().unwrap();
        let addr_b: IpAddr = "10.0.0.2".parse().unwrap();
        let mut table = ChildTable::new();
        table.insert(record(1, Some(addr_a), 0));
        table.insert(record(2, Some(addr_a), 0));
        table.insert(record(3, Some(addr_b), 0));

        assert_eq!(table.count_by_remote_addr(addr_a), 2);
        assert_eq!(table.count_by_remote_addr(addr_b), 1);
    }

    #[test]
    fn deadline_elapsed_respects_zero_as_unlimited() {
        let r = record(1, None, 0);
        assert!(!r.deadline_elapsed(Instant::now() + Duration::from_secs(10_000)));
    }

    #[test]
    fn deadline_elapsed_fires_after_tlimit() {
        let mut r = record(1, None, 5);
        r.started_at = Instant::now() - Duration::from_secs(6);
        assert!(r.deadline_elapsed(Instant::now()));
    }

    #[test]
    fn zero_max_conns_never_rejects() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let mut table = ChildTable::new();
        for i in 0..50 {
            table.insert(record(i, Some(addr), 0));
        }
        assert!(table.admit(Some(addr), 0));
    }

    #[test]
    fn admission_rejects_once_cap_reached() {
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        let mut table = ChildTable::new();
        assert!(table.admit(Some(addr), 2));
        table.insert(record(1, Some(addr), 0));
        assert!(table.admit(Some(addr), 2));
        table.insert(record(2, Some(addr), 0));
        assert!(!table.admit(Some(addr), 2));
    }

    #[test]
    fn admission_is_per_address() {
        let addr_a: IpAddr = "10.0.0.1".parse().unwrap();
        let addr_b: IpAddr = "10.0.0.2".parse().unwrap();
        let mut table = ChildTable::new();
        table.insert(record(1, Some(addr_a), 0));
        table.insert(record(2, Some(addr_a), 0));
        assert!(!table.admit(Some(addr_a), 2));
        assert!(table.admit(Some(addr_b), 2));
    }
}
