//! Spill buffering.
//!
//! [`SpillBuffer`] accumulates records in a circular arena and hands frozen
//! regions to a background thread, which passes them to a [`SpillSink`]:
//! [`SortedSpillSink`] (sorted, combined, merged into one partition file at
//! finish) or [`UnsortedSpillSink`] (regions appended as they come).

pub mod arena;
pub mod buffer;
pub mod sorted;
pub mod unsorted;

pub use arena::{ArenaView, RecordBytes, RecordIndexEntry, SpillArena};
pub use buffer::{SpillBuffer, SpillCancelHandle, SpillPhase};
pub use sorted::{SortedSpillOptions, SortedSpillSink};
pub use unsorted::UnsortedSpillSink;

use crate::config::SpillConfig;
use crate::error::{JetError, Result};
use crate::record::RecordFraming;

/// Shape of a spill buffer.
#[derive(Debug, Clone)]
pub struct SpillBufferOptions {
    /// Arena size in bytes.
    pub capacity: usize,
    /// Fraction of `capacity` of unspilled data that requests a spill.
    pub spill_threshold: f64,
    pub partition_count: u32,
    pub framing: RecordFraming,
    /// Represent consecutive same-partition records by one index entry.
    pub coalesce_records: bool,
    /// Let records straddle the physical end of the arena.
    pub allow_record_wrapping: bool,
}

impl SpillBufferOptions {
    pub fn new(capacity: usize, partition_count: u32) -> Self {
        Self {
            capacity,
            spill_threshold: 0.8,
            partition_count,
            framing: RecordFraming::LengthPrefixed,
            coalesce_records: false,
            allow_record_wrapping: false,
        }
    }

    pub fn from_config(config: &SpillConfig, partition_count: u32) -> Self {
        Self {
            capacity: config.buffer_size,
            spill_threshold: config.spill_threshold,
            partition_count,
            framing: config.framing,
            coalesce_records: config.coalesce_records,
            allow_record_wrapping: config.allow_record_wrapping,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(JetError::Config("spill buffer capacity must be positive".into()));
        }
        if self.partition_count == 0 {
            return Err(JetError::Config("partition count must be positive".into()));
        }
        if !(self.spill_threshold > 0.0 && self.spill_threshold <= 1.0) {
            return Err(JetError::Config(format!(
                "spill threshold {} outside (0, 1]",
                self.spill_threshold
            )));
        }
        Ok(())
    }

    pub(crate) fn threshold_bytes(&self) -> u64 {
        ((self.capacity as f64 * self.spill_threshold) as u64).max(1)
    }
}

// ── SpillSink ──────────────────────────────────────────────────────

/// One frozen spill as seen by the sink.
pub struct SpillRegion<'a> {
    pub spill_number: u32,
    /// Index entries per partition, after `prepare_partition`.
    pub partitions: &'a [Vec<RecordIndexEntry>],
    pub arena: ArenaView<'a>,
}

impl SpillRegion<'_> {
    pub fn entry_count(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }
}

/// Destination of spills. Runs on the spill thread.
pub trait SpillSink: Send + 'static {
    /// Constrain the buffer layout this sink can consume.
    fn adjust_options(&self, _options: &mut SpillBufferOptions) {}

    /// Called for every non-empty partition before `write_spill`; may
    /// reorder `entries`.
    fn prepare_partition(
        &mut self,
        _partition: u32,
        _entries: &mut [RecordIndexEntry],
        _arena: &ArenaView<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn write_spill(&mut self, spill: &SpillRegion<'_>) -> Result<()>;
}
