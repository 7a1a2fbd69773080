//! Merge inputs.
//!
//! A [`RecordInput`] is one sorted run of length-prefixed records, held in
//! whichever form it arrived in. Inputs are moved into a merge pass and
//! opened there; anything they own (a memory reservation, a temporary
//! file) is released once the opened source is dropped.

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::channel::memory_storage::MemoryReservation;
use crate::codec::{encode_segment, CompressionKind, SegmentedChecksumReader};
use crate::error::Result;
use crate::partition_file::{remove_partition_file, PartitionFileIndex, PartitionStream};
use crate::record::{write_framed, FramedRecordReader, RawRecordSource, RECORD_LENGTH_SIZE};

// ── Temporary Files ────────────────────────────────────────────────

/// Partition file deleted (with its index) when dropped.
#[derive(Debug)]
pub struct TempPartitionFile {
    path: PathBuf,
}

impl TempPartitionFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPartitionFile {
    fn drop(&mut self) {
        if let Err(e) = remove_partition_file(&self.path) {
            tracing::warn!(path = %self.path.display(), "failed to remove temporary merge file: {}", e);
        }
    }
}

/// Plain file deleted when dropped.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
}

impl TempFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "failed to remove temporary file: {}", e),
        }
    }
}

// ── RecordInput ────────────────────────────────────────────────────

/// Segmented data held in memory.
pub struct MemoryInput {
    /// Concatenated segments (header + region envelope each).
    pub data: Vec<u8>,
    pub segment_count: u64,
    pub compression: CompressionKind,
    pub uncompressed_len: u64,
    pub reservation: Option<MemoryReservation>,
}

impl MemoryInput {
    /// Encode `records` as one length-prefixed, checksummed segment.
    pub fn from_records<'r>(
        records: impl IntoIterator<Item = &'r [u8]>,
        compression: CompressionKind,
        checksum: bool,
    ) -> Result<Self> {
        let mut payload = Vec::new();
        for record in records {
            write_framed(&mut payload, record)?;
        }
        let data = encode_segment(&payload, compression, checksum)?;
        Ok(Self {
            data,
            segment_count: 1,
            compression,
            uncompressed_len: payload.len() as u64,
            reservation: None,
        })
    }
}

/// Segmented data spooled to a local file.
pub struct FileInput {
    pub file: TempFile,
    pub segment_count: u64,
    pub compression: CompressionKind,
    pub uncompressed_len: u64,
}

/// One partition of a partition file, read in place.
pub struct PartitionFileInput {
    pub index: Arc<PartitionFileIndex>,
    pub partition: u32,
    pub compression: CompressionKind,
    /// Set when the file was produced by a merge pass and is owned here.
    pub temp: Option<TempPartitionFile>,
}

/// Segmented data read from an arbitrary byte stream.
pub struct StreamInput {
    pub reader: Box<dyn Read + Send>,
    pub segment_count: Option<u64>,
    pub compression: CompressionKind,
    pub uncompressed_len: Option<u64>,
}

pub enum RecordInput {
    Memory(MemoryInput),
    File(FileInput),
    PartitionFile(PartitionFileInput),
    Stream(StreamInput),
}

impl RecordInput {
    /// An input without records, for a producer with nothing in a partition.
    pub fn empty() -> Self {
        RecordInput::Memory(MemoryInput {
            data: Vec::new(),
            segment_count: 0,
            compression: CompressionKind::None,
            uncompressed_len: 0,
            reservation: None,
        })
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, RecordInput::Memory(_))
    }

    /// Bytes of process memory the input occupies.
    pub fn memory_bytes(&self) -> u64 {
        match self {
            RecordInput::Memory(m) => m.data.len() as u64,
            _ => 0,
        }
    }

    /// Decoded (framed record) bytes, when known up front.
    pub fn uncompressed_len(&self) -> Option<u64> {
        match self {
            RecordInput::Memory(m) => Some(m.uncompressed_len),
            RecordInput::File(f) => Some(f.uncompressed_len),
            RecordInput::PartitionFile(p) => p.index.uncompressed_size(p.partition).ok(),
            RecordInput::Stream(s) => s.uncompressed_len,
        }
    }

    /// Open for reading. Owned resources move into the returned source.
    pub fn open(self) -> Result<OpenInput> {
        let total = self.uncompressed_len();
        let spooled = matches!(
            &self,
            RecordInput::File(_) | RecordInput::PartitionFile(PartitionFileInput { temp: Some(_), .. })
        );
        let (reader, guard): (Box<dyn Read + Send>, InputGuard) = match self {
            RecordInput::Memory(m) => (
                Box::new(SegmentedChecksumReader::new(
                    Cursor::new(m.data),
                    Some(m.segment_count),
                    m.compression,
                )),
                m.reservation.map(InputGuard::Reservation).unwrap_or(InputGuard::None),
            ),
            RecordInput::File(f) => {
                let source = BufReader::with_capacity(64 * 1024, File::open(f.file.path())?);
                (
                    Box::new(SegmentedChecksumReader::new(source, Some(f.segment_count), f.compression)),
                    InputGuard::File(f.file),
                )
            }
            RecordInput::PartitionFile(p) => {
                let entries = p.index.entries(p.partition)?;
                let stream = PartitionStream::open(p.index.data_path(), entries, p.compression)?;
                (
                    Box::new(stream),
                    p.temp.map(InputGuard::PartitionFile).unwrap_or(InputGuard::None),
                )
            }
            RecordInput::Stream(s) => (
                Box::new(SegmentedChecksumReader::new(s.reader, s.segment_count, s.compression)),
                InputGuard::None,
            ),
        };
        Ok(OpenInput {
            records: FramedRecordReader::new(reader),
            total_bytes: total,
            spooled,
            _guard: guard,
        })
    }
}

// Variants are held only for their Drop.
#[allow(dead_code)]
enum InputGuard {
    None,
    Reservation(MemoryReservation),
    File(TempFile),
    PartitionFile(TempPartitionFile),
}

/// An opened input: framed records plus whatever keeps them alive.
pub struct OpenInput {
    records: FramedRecordReader<Box<dyn Read + Send>>,
    total_bytes: Option<u64>,
    /// Backed by a temporary file this process wrote.
    spooled: bool,
    // Dropped after `records`.
    _guard: InputGuard,
}

impl OpenInput {
    /// Framed bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.records.bytes_read()
    }

    pub fn records_read(&self) -> u64 {
        self.records.records_read()
    }

    /// Bytes read back from a spooled or merged temporary file. Task output
    /// read in place and memory inputs count zero.
    pub fn local_bytes_read(&self) -> u64 {
        if self.spooled {
            self.bytes_read()
        } else {
            0
        }
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }
}

impl RawRecordSource for OpenInput {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        self.records.next_record()
    }
}

/// Framed size of a record.
pub fn framed_len(record: &[u8]) -> u64 {
    (RECORD_LENGTH_SIZE + record.len()) as u64
}
