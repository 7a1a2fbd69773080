//! Machine-sized defaults for the shuffle engine.
//!
//! [`HostResources::probe`] reads RAM and core count once; [`TuningProfile`]
//! turns that into a spill arena size, a download memory budget and a merge
//! fan-in. Nothing is cached: every [`TuningProfile::for_host`] call probes
//! again.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Spill arena bounds and its share of available memory.
const SPILL_ARENA_RANGE: (u64, u64) = (16 * MIB, 256 * MIB);
const SPILL_ARENA_SHARE: f64 = 0.02;

/// Download budget bounds and its share of available memory.
const DOWNLOAD_BUDGET_RANGE: (u64, u64) = (64 * MIB, 4 * GIB);
const DOWNLOAD_BUDGET_SHARE: f64 = 0.10;

/// Merge fan-in bounds. Each merged input holds one read buffer open.
const FAN_IN_RANGE: (usize, usize) = (8, 64);

/// What the host has to offer.
#[derive(Debug, Clone, Copy)]
pub struct HostResources {
    pub total_memory: u64,
    pub available_memory: u64,
    pub cores: usize,
}

impl HostResources {
    pub fn probe() -> Self {
        let mut sys = System::new_with_specifics(RefreshKind::new().with_memory(MemoryRefreshKind::everything()));
        sys.refresh_memory();
        Self {
            total_memory: sys.total_memory(),
            available_memory: sys.available_memory(),
            cores: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }

    /// Share of RAM in use, 0.0 to 1.0. Unknown totals count as full.
    pub fn memory_in_use(&self) -> f64 {
        if self.total_memory == 0 {
            return 1.0;
        }
        (1.0 - self.available_memory as f64 / self.total_memory as f64).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    pub spill_buffer_size: usize,
    /// Budget shared by in-memory channel downloads.
    pub memory_storage_bytes: u64,
    pub merge_fan_in: usize,
}

impl TuningProfile {
    pub fn for_host() -> Self {
        let host = HostResources::probe();
        let profile = Self::from_host(&host);
        tracing::debug!(
            ?host,
            spill_buffer = profile.spill_buffer_size,
            memory_storage = profile.memory_storage_bytes,
            fan_in = profile.merge_fan_in,
            "tuning profile computed"
        );
        profile
    }

    /// - spill arena: 2% of available memory within 16 MiB..=256 MiB
    /// - download budget: 10% of available memory within 64 MiB..=4 GiB
    /// - fan-in: 8 per GiB of total memory, at most 4 per core, within 8..=64
    pub fn from_host(host: &HostResources) -> Self {
        let share = |fraction: f64, (lo, hi): (u64, u64)| ((host.available_memory as f64 * fraction) as u64).clamp(lo, hi);
        let by_memory = (host.total_memory / GIB) as usize * 8;
        let by_cores = host.cores.max(1) * 4;
        Self {
            spill_buffer_size: share(SPILL_ARENA_SHARE, SPILL_ARENA_RANGE) as usize,
            memory_storage_bytes: share(DOWNLOAD_BUDGET_SHARE, DOWNLOAD_BUDGET_RANGE),
            merge_fan_in: by_memory.min(by_cores).clamp(FAN_IN_RANGE.0, FAN_IN_RANGE.1),
        }
    }
}

impl Default for TuningProfile {
    fn default() -> Self {
        Self {
            spill_buffer_size: 16 * MIB as usize,
            memory_storage_bytes: 256 * MIB,
            merge_fan_in: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Test Helpers ──

    fn host(total_gib: f64, available_gib: f64, cores: usize) -> HostResources {
        HostResources {
            total_memory: (total_gib * GIB as f64) as u64,
            available_memory: (available_gib * GIB as f64) as u64,
            cores,
        }
    }

    #[test]
    fn test_probe_sees_memory_and_cores() {
        let host = HostResources::probe();
        assert!(host.total_memory > 0);
        assert!(host.cores >= 1);
    }

    #[test]
    fn test_fan_in_limited_by_memory_and_cores() {
        assert_eq!(TuningProfile::from_host(&host(2.0, 1.0, 16)).merge_fan_in, 16);
        assert_eq!(TuningProfile::from_host(&host(64.0, 32.0, 3)).merge_fan_in, 12);
        assert_eq!(TuningProfile::from_host(&host(512.0, 256.0, 64)).merge_fan_in, 64);
        assert_eq!(TuningProfile::from_host(&host(0.5, 0.25, 1)).merge_fan_in, 8);
    }

    #[test]
    fn test_budgets_clamped() {
        let big = TuningProfile::from_host(&host(512.0, 256.0, 32));
        assert_eq!(big.spill_buffer_size as u64, SPILL_ARENA_RANGE.1);
        assert_eq!(big.memory_storage_bytes, DOWNLOAD_BUDGET_RANGE.1);

        let small = TuningProfile::from_host(&host(1.0, 0.25, 2));
        assert_eq!(small.spill_buffer_size as u64, SPILL_ARENA_RANGE.0);
        assert_eq!(small.memory_storage_bytes, DOWNLOAD_BUDGET_RANGE.0);
    }

    #[test]
    fn test_memory_in_use() {
        assert!((host(1.0, 0.25, 2).memory_in_use() - 0.75).abs() < 1e-9);
        assert_eq!(host(0.0, 0.0, 1).memory_in_use(), 1.0);
    }
}
