//! Channel and merge metrics.
//!
//! Lock-free byte and pass counters shared by `Arc` between a channel, its
//! background threads, and whoever reports task status. Download latencies
//! are kept in a bounded rolling window for percentile reporting.
//!
//! # Example
//!
//! ```
//! use jet_shuffle::metrics::ChannelMetrics;
//!
//! let metrics = ChannelMetrics::new();
//! metrics.add_local_bytes_read(4096);
//! metrics.record_download(12);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.local_bytes_read, 4096);
//! assert_eq!(snapshot.downloads, 1);
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Number of download latencies retained for percentiles.
const LATENCY_WINDOW_SIZE: usize = 1000;

/// Thread-safe counters for one channel (or one merge reader).
pub struct ChannelMetrics {
    // ── Bytes ──
    local_bytes_read: AtomicU64,
    local_bytes_written: AtomicU64,
    network_bytes_read: AtomicU64,
    network_bytes_written: AtomicU64,

    // ── Spills & merges ──
    spill_count: AtomicU64,
    memory_merge_passes: AtomicU64,
    disk_merge_passes: AtomicU64,

    // ── Downloads ──
    downloads: AtomicU64,
    downloads_to_memory: AtomicU64,
    downloads_to_disk: AtomicU64,
    downloads_retried: AtomicU64,
    download_latencies_ms: Mutex<VecDeque<u64>>,

    started_at: Instant,
}

/// Point-in-time copy of [`ChannelMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub local_bytes_read: u64,
    pub local_bytes_written: u64,
    pub network_bytes_read: u64,
    pub network_bytes_written: u64,
    pub spill_count: u64,
    pub memory_merge_passes: u64,
    pub disk_merge_passes: u64,
    pub downloads: u64,
    pub downloads_to_memory: u64,
    pub downloads_to_disk: u64,
    pub downloads_retried: u64,
    /// Median download latency over the recent window
    pub download_p50_ms: u64,
    /// 95th percentile download latency
    pub download_p95_ms: u64,
    pub uptime_secs: u64,
}

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self {
            local_bytes_read: AtomicU64::new(0),
            local_bytes_written: AtomicU64::new(0),
            network_bytes_read: AtomicU64::new(0),
            network_bytes_written: AtomicU64::new(0),
            spill_count: AtomicU64::new(0),
            memory_merge_passes: AtomicU64::new(0),
            disk_merge_passes: AtomicU64::new(0),
            downloads: AtomicU64::new(0),
            downloads_to_memory: AtomicU64::new(0),
            downloads_to_disk: AtomicU64::new(0),
            downloads_retried: AtomicU64::new(0),
            download_latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_SIZE)),
            started_at: Instant::now(),
        }
    }

    pub fn add_local_bytes_read(&self, n: u64) {
        add(&self.local_bytes_read, n);
    }

    pub fn add_local_bytes_written(&self, n: u64) {
        add(&self.local_bytes_written, n);
    }

    pub fn add_network_bytes_read(&self, n: u64) {
        add(&self.network_bytes_read, n);
    }

    pub fn add_network_bytes_written(&self, n: u64) {
        add(&self.network_bytes_written, n);
    }

    pub fn record_spills(&self, n: u64) {
        add(&self.spill_count, n);
    }

    pub fn record_memory_merge_pass(&self) {
        add(&self.memory_merge_passes, 1);
    }

    pub fn record_disk_merge_pass(&self) {
        add(&self.disk_merge_passes, 1);
    }

    pub fn record_download_target(&self, to_memory: bool) {
        if to_memory {
            add(&self.downloads_to_memory, 1);
        } else {
            add(&self.downloads_to_disk, 1);
        }
    }

    pub fn record_retry(&self) {
        add(&self.downloads_retried, 1);
    }

    /// Record one completed download of a task's output.
    pub fn record_download(&self, duration_ms: u64) {
        add(&self.downloads, 1);
        let mut window = self
            .download_latencies_ms
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if window.len() == LATENCY_WINDOW_SIZE {
            window.pop_front();
        }
        window.push_back(duration_ms);
    }

    pub fn local_bytes_read(&self) -> u64 {
        load(&self.local_bytes_read)
    }

    pub fn network_bytes_read(&self) -> u64 {
        load(&self.network_bytes_read)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p95) = {
            let window = self
                .download_latencies_ms
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let mut sorted: Vec<u64> = window.iter().copied().collect();
            sorted.sort_unstable();
            (percentile(&sorted, 50), percentile(&sorted, 95))
        };
        MetricsSnapshot {
            local_bytes_read: load(&self.local_bytes_read),
            local_bytes_written: load(&self.local_bytes_written),
            network_bytes_read: load(&self.network_bytes_read),
            network_bytes_written: load(&self.network_bytes_written),
            spill_count: load(&self.spill_count),
            memory_merge_passes: load(&self.memory_merge_passes),
            disk_merge_passes: load(&self.disk_merge_passes),
            downloads: load(&self.downloads),
            downloads_to_memory: load(&self.downloads_to_memory),
            downloads_to_disk: load(&self.downloads_to_disk),
            downloads_retried: load(&self.downloads_retried),
            download_p50_ms: p50,
            download_p95_ms: p95,
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Nearest-rank percentile of an ascending slice; 0 when empty.
fn percentile(sorted: &[u64], p: usize) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_counters_accumulate_across_threads() {
        let metrics = Arc::new(ChannelMetrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.add_network_bytes_read(2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot().network_bytes_read, 8000);
    }

    #[test]
    fn test_percentiles() {
        let metrics = ChannelMetrics::new();
        for ms in 1..=100 {
            metrics.record_download(ms);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.downloads, 100);
        assert_eq!(snapshot.download_p50_ms, 50);
        assert_eq!(snapshot.download_p95_ms, 95);
    }

    #[test]
    fn test_latency_window_bounded() {
        let metrics = ChannelMetrics::new();
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record_download(1);
        }
        for _ in 0..LATENCY_WINDOW_SIZE {
            metrics.record_download(7);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.download_p50_ms, 7);
        assert_eq!(snapshot.downloads, 2 * LATENCY_WINDOW_SIZE as u64);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ChannelMetrics::new().snapshot();
        assert_eq!(snapshot.download_p95_ms, 0);
        assert_eq!(snapshot.local_bytes_written, 0);
    }
}
