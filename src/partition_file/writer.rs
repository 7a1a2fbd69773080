//! Partition file writer.
//!
//! Appends region envelopes to a data file and records one index entry per
//! non-empty region. `finish` writes the sibling index file.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::codec::{CompressionKind, RegionSizes, RegionWriter};
use crate::error::{JetError, Result};
use crate::partition_file::format::{index_path, write_index_file, PartitionFileIndexEntry};
use crate::record::{write_framed, RawRecordSink};

/// Summary of a finished partition file.
#[derive(Debug, Clone)]
pub struct PartitionFileInfo {
    pub data_path: PathBuf,
    pub index_path: PathBuf,
    pub partition_count: u32,
    pub entries: Vec<PartitionFileIndexEntry>,
}

impl PartitionFileInfo {
    /// Bytes the data file occupies.
    pub fn data_len(&self) -> u64 {
        self.entries.iter().map(|e| e.compressed_size as u64).sum()
    }

    pub fn uncompressed_len(&self) -> u64 {
        self.entries.iter().map(|e| e.uncompressed_size as u64).sum()
    }
}

pub struct PartitionFileWriter {
    data_path: PathBuf,
    file: BufWriter<File>,
    offset: u64,
    partition_count: u32,
    compression: CompressionKind,
    checksum: bool,
    entries: Vec<PartitionFileIndexEntry>,
}

impl PartitionFileWriter {
    pub fn create(
        data_path: &Path,
        partition_count: u32,
        compression: CompressionKind,
        checksum: bool,
    ) -> Result<Self> {
        let file = File::create(data_path)?;
        Ok(Self {
            data_path: data_path.to_path_buf(),
            file: BufWriter::with_capacity(256 * 1024, file),
            offset: 0,
            partition_count,
            compression,
            checksum,
            entries: Vec::new(),
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Bytes written to the data file so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn entries(&self) -> &[PartitionFileIndexEntry] {
        &self.entries
    }

    /// Start a streamed region for `partition`.
    pub fn begin_partition(&mut self, partition: u32) -> Result<PartitionRegion<'_>> {
        self.check_partition(partition)?;
        Ok(PartitionRegion {
            partition,
            start: self.offset,
            region: RegionWriter::new(&mut self.file, self.compression, self.checksum),
            offset: &mut self.offset,
            entries: &mut self.entries,
        })
    }

    /// Encode `data` as one region of `partition`.
    pub fn write_partition(&mut self, partition: u32, data: &[u8]) -> Result<RegionSizes> {
        let mut region = self.begin_partition(partition)?;
        region.write_all(data)?;
        region.finish()
    }

    /// Copy an already-encoded region envelope verbatim.
    pub fn append_region<R: Read>(&mut self, partition: u32, sizes: RegionSizes, source: &mut R) -> Result<()> {
        self.check_partition(partition)?;
        if sizes.compressed == 0 {
            return Ok(());
        }
        let copied = io::copy(&mut source.take(sizes.compressed), &mut self.file)?;
        if copied != sizes.compressed {
            return Err(JetError::Corrupt(format!(
                "region for partition {partition} truncated: {copied} of {} bytes",
                sizes.compressed
            )));
        }
        self.entries
            .push(PartitionFileIndexEntry::new(partition, self.offset, sizes));
        self.offset += sizes.compressed;
        Ok(())
    }

    /// Record a zero-size entry for a partition with no data.
    pub fn add_placeholder(&mut self, partition: u32) -> Result<()> {
        self.check_partition(partition)?;
        self.entries
            .push(PartitionFileIndexEntry::placeholder(partition, self.offset));
        Ok(())
    }

    /// Flush the data file and write the index.
    pub fn finish(mut self) -> Result<PartitionFileInfo> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        let index_path = index_path(&self.data_path);
        write_index_file(&index_path, self.partition_count, &self.entries)?;
        tracing::debug!(
            path = %self.data_path.display(),
            entries = self.entries.len(),
            bytes = self.offset,
            "partition file written"
        );
        Ok(PartitionFileInfo {
            data_path: self.data_path,
            index_path,
            partition_count: self.partition_count,
            entries: self.entries,
        })
    }

    fn check_partition(&self, partition: u32) -> Result<()> {
        if partition >= self.partition_count {
            return Err(JetError::InvalidState(format!(
                "partition {partition} out of range for a file with {} partitions",
                self.partition_count
            )));
        }
        Ok(())
    }
}

// ── Streamed Region ────────────────────────────────────────────────

/// One partition region being written. Accepts raw bytes via `Write` or
/// length-prefixed records via `RawRecordSink`.
pub struct PartitionRegion<'a> {
    partition: u32,
    start: u64,
    region: RegionWriter<&'a mut BufWriter<File>>,
    offset: &'a mut u64,
    entries: &'a mut Vec<PartitionFileIndexEntry>,
}

impl PartitionRegion<'_> {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Close the region. Empty regions leave no entry.
    pub fn finish(self) -> Result<RegionSizes> {
        let (_, sizes) = self.region.finish()?;
        if sizes.uncompressed > 0 {
            self.entries
                .push(PartitionFileIndexEntry::new(self.partition, self.start, sizes));
        }
        *self.offset += sizes.compressed;
        Ok(sizes)
    }
}

impl Write for PartitionRegion<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.region.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.region.flush()
    }
}

impl RawRecordSink for PartitionRegion<'_> {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        write_framed(&mut self.region, record)?;
        Ok(())
    }
}
