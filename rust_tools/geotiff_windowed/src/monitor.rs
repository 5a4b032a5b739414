//! Point-in-time system and process memory telemetry.

use log::debug;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_mb: f64,
    pub available_mb: f64,
    pub used_mb: f64,
    pub process_rss_mb: f64,
    pub usage_percent: f64,
}

impl MemorySnapshot {
    /// Builds a snapshot from raw byte counters, keeping used ≤ total and the
    /// percentage inside [0, 100] even when the OS reports inconsistent numbers.
    pub fn from_bytes(total: u64, available: u64, used: u64, process_rss: u64) -> Self {
        let used = used.min(total);
        let available = available.min(total);
        let usage_percent = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        Self {
            total_mb: total as f64 / BYTES_PER_MB,
            available_mb: available as f64 / BYTES_PER_MB,
            used_mb: used as f64 / BYTES_PER_MB,
            process_rss_mb: process_rss as f64 / BYTES_PER_MB,
            usage_percent,
        }
    }
}

/// Reads memory counters on demand. Each snapshot queries the OS afresh, so a
/// monitor can be shared freely between threads.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMonitor {
    pid: Pid,
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMonitor {
    pub fn new() -> Self {
        Self {
            pid: Pid::from_u32(std::process::id()),
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let process_rss = sys.process(self.pid).map(|p| p.memory()).unwrap_or(0);

        let snapshot = MemorySnapshot::from_bytes(
            sys.total_memory(),
            sys.available_memory(),
            sys.used_memory(),
            process_rss,
        );
        debug!(
            "Memory: {:.0}/{:.0} MB used ({:.1}%), process {:.1} MB",
            snapshot.used_mb, snapshot.total_mb, snapshot.usage_percent, snapshot.process_rss_mb
        );
        snapshot
    }

    pub fn process_rss_mb(&self) -> f64 {
        self.snapshot().process_rss_mb
    }

    /// True when system usage is at or above `threshold_percent`.
    pub fn should_throttle(&self, threshold_percent: f64) -> bool {
        self.snapshot().usage_percent >= threshold_percent
    }

    /// A fraction of currently available memory, in bytes.
    pub fn budget_bytes(&self, fraction: f64) -> u64 {
        let available = self.snapshot().available_mb * BYTES_PER_MB;
        (available * fraction.clamp(0.0, 1.0)) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_invariants() {
        let snapshot = MemoryMonitor::new().snapshot();
        assert!(snapshot.used_mb <= snapshot.total_mb);
        assert!((0.0..=100.0).contains(&snapshot.usage_percent));
        assert!(snapshot.available_mb <= snapshot.total_mb);
    }

    #[test]
    fn test_inconsistent_counters_clamped() {
        let snapshot = MemorySnapshot::from_bytes(1024 * 1024, 0, 4 * 1024 * 1024, 0);
        assert_eq!(snapshot.used_mb, snapshot.total_mb);
        assert_eq!(snapshot.usage_percent, 100.0);

        let empty = MemorySnapshot::from_bytes(0, 0, 0, 0);
        assert_eq!(empty.usage_percent, 0.0);
    }

    #[test]
    fn test_budget_fraction_bounded() {
        let monitor = MemoryMonitor::new();
        let all = monitor.budget_bytes(1.0);
        let half = monitor.budget_bytes(0.5);
        assert!(half <= all);
        assert_eq!(monitor.budget_bytes(-1.0), 0);
    }
}
