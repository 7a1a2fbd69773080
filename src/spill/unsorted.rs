//! Unsorted spill sink: every spill appends one region per non-empty
//! partition to a single partition file. Records keep the buffer's framing,
//! so coalesced and wrapping entries are copied as-is.

use std::path::{Path, PathBuf};

use crate::codec::CompressionKind;
use crate::error::{JetError, Result};
use crate::partition_file::{remove_partition_file, PartitionFileInfo, PartitionFileWriter};
use crate::spill::{SpillRegion, SpillSink};

pub struct UnsortedSpillSink {
    path: PathBuf,
    writer: Option<PartitionFileWriter>,
    spills: u32,
}

impl UnsortedSpillSink {
    pub fn create(path: &Path, partition_count: u32, compression: CompressionKind, checksum: bool) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(PartitionFileWriter::create(path, partition_count, compression, checksum)?),
            spills: 0,
        })
    }

    pub fn spills_written(&self) -> u32 {
        self.spills
    }

    /// Flush the data file and write its index.
    pub fn finish_output(&mut self) -> Result<PartitionFileInfo> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| JetError::InvalidState("unsorted output already finished".into()))?;
        writer.finish()
    }
}

impl Drop for UnsortedSpillSink {
    fn drop(&mut self) {
        if self.writer.take().is_some() {
            if let Err(e) = remove_partition_file(&self.path) {
                tracing::warn!(path = %self.path.display(), "failed to remove unfinished output: {}", e);
            }
        }
    }
}

impl SpillSink for UnsortedSpillSink {
    fn write_spill(&mut self, spill: &SpillRegion<'_>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| JetError::InvalidState("unsorted output already finished".into()))?;
        for (partition, entries) in spill.partitions.iter().enumerate() {
            if entries.is_empty() {
                continue;
            }
            let mut region = writer.begin_partition(partition as u32)?;
            for entry in entries {
                spill.arena.bytes(entry).write_to(&mut region)?;
            }
            region.finish()?;
        }
        self.spills += 1;
        tracing::debug!(spill = spill.spill_number, records = spill.entry_count(), "unsorted spill written");
        Ok(())
    }
}
