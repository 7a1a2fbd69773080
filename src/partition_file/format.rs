//! Partition file index format.
//!
//! A partition file `<name>` holds the region envelopes of every partition;
//! the sibling `<name>.index` lists where they are:
//!
//! ```text
//! Offset  Size  Field
//! 0       4     partition: i32 LE
//! 4       8     offset: i64 LE            (into the data file)
//! 12      8     compressed_size: i64 LE   (region envelope bytes)
//! 20      8     uncompressed_size: i64 LE
//! ```
//!
//! The first entry is a sentinel whose `partition` field holds the total
//! partition count and whose sizes are zero. Real entries follow in write
//! order; a partition may have several entries (one per spill region) and
//! a zero-size entry is a placeholder for a partition with no data.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::codec::RegionSizes;
use crate::error::{JetError, Result};

/// Size of one serialized index entry.
pub const INDEX_ENTRY_SIZE: usize = 28;

/// Suffix appended to the data file name to form the index file name.
pub const INDEX_SUFFIX: &str = ".index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionFileIndexEntry {
    pub partition: i32,
    pub offset: i64,
    pub compressed_size: i64,
    pub uncompressed_size: i64,
}

impl PartitionFileIndexEntry {
    pub fn new(partition: u32, offset: u64, sizes: RegionSizes) -> Self {
        Self {
            partition: partition as i32,
            offset: offset as i64,
            compressed_size: sizes.compressed as i64,
            uncompressed_size: sizes.uncompressed as i64,
        }
    }

    /// Leading entry carrying the partition count.
    pub fn sentinel(partition_count: u32) -> Self {
        Self {
            partition: partition_count as i32,
            ..Self::default()
        }
    }

    /// Zero-size stand-in for a partition without data.
    pub fn placeholder(partition: u32, offset: u64) -> Self {
        Self {
            partition: partition as i32,
            offset: offset as i64,
            ..Self::default()
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.compressed_size == 0 && self.uncompressed_size == 0
    }

    pub fn sizes(&self) -> RegionSizes {
        RegionSizes {
            compressed: self.compressed_size as u64,
            uncompressed: self.uncompressed_size as u64,
        }
    }

    pub fn to_bytes(&self) -> [u8; INDEX_ENTRY_SIZE] {
        let mut out = [0u8; INDEX_ENTRY_SIZE];
        out[0..4].copy_from_slice(&self.partition.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out[12..20].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[20..28].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; INDEX_ENTRY_SIZE]) -> Result<Self> {
        let mut i32_buf = [0u8; 4];
        let mut i64_buf = [0u8; 8];
        i32_buf.copy_from_slice(&bytes[0..4]);
        let partition = i32::from_le_bytes(i32_buf);
        i64_buf.copy_from_slice(&bytes[4..12]);
        let offset = i64::from_le_bytes(i64_buf);
        i64_buf.copy_from_slice(&bytes[12..20]);
        let compressed_size = i64::from_le_bytes(i64_buf);
        i64_buf.copy_from_slice(&bytes[20..28]);
        let uncompressed_size = i64::from_le_bytes(i64_buf);

        let entry = Self {
            partition,
            offset,
            compressed_size,
            uncompressed_size,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn validate(&self) -> Result<()> {
        if self.partition < 0 || self.offset < 0 || self.compressed_size < 0 || self.uncompressed_size < 0 {
            return Err(JetError::Corrupt(format!("invalid index entry {:?}", self)));
        }
        if (self.compressed_size == 0) != (self.uncompressed_size == 0) {
            return Err(JetError::Corrupt(format!(
                "index entry for partition {} has mismatched empty sizes",
                self.partition
            )));
        }
        Ok(())
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Read one entry; `None` on a clean end of input.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; INDEX_ENTRY_SIZE];
        let mut filled = 0;
        while filled < INDEX_ENTRY_SIZE {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        match filled {
            0 => Ok(None),
            INDEX_ENTRY_SIZE => Self::from_bytes(&buf).map(Some),
            n => Err(JetError::Corrupt(format!(
                "index truncated mid-entry ({n} of {INDEX_ENTRY_SIZE} bytes)"
            ))),
        }
    }
}

/// `data_path` with `suffix` appended to its file name.
pub fn sibling_path(data_path: &Path, suffix: &str) -> PathBuf {
    let mut name = data_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Path of the index file belonging to `data_path`.
pub fn index_path(data_path: &Path) -> PathBuf {
    sibling_path(data_path, INDEX_SUFFIX)
}

/// Write a complete index file: sentinel, then `entries` in order.
pub fn write_index_file(path: &Path, partition_count: u32, entries: &[PartitionFileIndexEntry]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    PartitionFileIndexEntry::sentinel(partition_count).write_to(&mut writer)?;
    for entry in entries {
        entry.write_to(&mut writer)?;
    }
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read an index file. Returns the partition count and the real entries.
pub fn read_index_file(path: &Path) -> Result<(u32, Vec<PartitionFileIndexEntry>)> {
    let mut reader = BufReader::new(File::open(path)?);
    let sentinel = PartitionFileIndexEntry::read_from(&mut reader)?
        .ok_or_else(|| JetError::Corrupt(format!("index file {} is empty", path.display())))?;
    if !sentinel.is_placeholder() {
        return Err(JetError::Corrupt(format!(
            "index file {} does not start with a sentinel entry",
            path.display()
        )));
    }
    let partition_count = sentinel.partition as u32;

    let mut entries = Vec::new();
    while let Some(entry) = PartitionFileIndexEntry::read_from(&mut reader)? {
        if entry.partition as u32 >= partition_count {
            return Err(JetError::Corrupt(format!(
                "index entry for partition {} but file has {} partitions",
                entry.partition, partition_count
            )));
        }
        entries.push(entry);
    }
    Ok((partition_count, entries))
}
