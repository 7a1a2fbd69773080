//! Raw record model.
//!
//! Records are opaque byte strings. Where individual record boundaries must
//! survive (sorted output, merge inputs) they carry a size marker:
//!
//! ```text
//! [len: u32 LE][len bytes]
//! ```

pub mod combiner;
pub mod comparer;
pub mod partitioner;

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

pub use combiner::{combine_sorted, Combiner, FnCombiner};
pub use comparer::{BytewiseComparator, FnComparator, KeyPrefixComparator, RawComparator};
pub use partitioner::{FnPartitioner, HashPartitioner, Partitioner};

use crate::error::{corrupt_io, Result};

/// Size of the per-record length marker.
pub const RECORD_LENGTH_SIZE: usize = 4;

/// How records are laid out inside a partition region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFraming {
    /// Each record is prefixed with its u32 length.
    #[default]
    LengthPrefixed,
    /// Records are concatenated; the consumer must be able to delimit them.
    Raw,
}

// ── Source / Sink ──────────────────────────────────────────────────

/// Pull-based source of raw records.
///
/// The returned slice is only valid until the next call.
pub trait RawRecordSource {
    fn next_record(&mut self) -> Result<Option<&[u8]>>;
}

/// Push-based consumer of raw records.
pub trait RawRecordSink {
    fn write_record(&mut self, record: &[u8]) -> Result<()>;
}

impl RawRecordSink for Vec<Vec<u8>> {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.push(record.to_vec());
        Ok(())
    }
}

impl<T: RawRecordSource + ?Sized> RawRecordSource for Box<T> {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        (**self).next_record()
    }
}

/// Append one length-prefixed record.
pub fn write_framed<W: Write>(w: &mut W, record: &[u8]) -> io::Result<()> {
    let len = u32::try_from(record.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "record longer than u32::MAX bytes")
    })?;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(record)
}

// ── Framed Reader / Writer ─────────────────────────────────────────

/// Reads length-prefixed records from a byte stream.
pub struct FramedRecordReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
    records_read: u64,
    bytes_read: u64,
}

impl<R: Read> FramedRecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            records_read: 0,
            bytes_read: 0,
        }
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Framed bytes consumed, including length markers.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> RawRecordSource for FramedRecordReader<R> {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        let mut len = [0u8; RECORD_LENGTH_SIZE];
        let mut filled = 0;
        while filled < RECORD_LENGTH_SIZE {
            match self.inner.read(&mut len[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < RECORD_LENGTH_SIZE {
            return Err(corrupt_io("truncated record length marker").into());
        }
        let len = u32::from_le_bytes(len) as usize;
        self.buf.resize(len, 0);
        self.inner.read_exact(&mut self.buf).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                corrupt_io(format!("record of {len} bytes truncated"))
            } else {
                e
            }
        })?;
        self.records_read += 1;
        self.bytes_read += (RECORD_LENGTH_SIZE + len) as u64;
        Ok(Some(&self.buf))
    }
}

/// Writes length-prefixed records to a byte stream.
pub struct FramedRecordWriter<W: Write> {
    inner: W,
    records_written: u64,
    bytes_written: u64,
}

impl<W: Write> FramedRecordWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            records_written: 0,
            bytes_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> RawRecordSink for FramedRecordWriter<W> {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        write_framed(&mut self.inner, record)?;
        self.records_written += 1;
        self.bytes_written += (RECORD_LENGTH_SIZE + record.len()) as u64;
        Ok(())
    }
}

// ── In-memory Source ───────────────────────────────────────────────

/// Owned records replayed in order.
pub struct VecRecordSource {
    records: Vec<Vec<u8>>,
    pos: usize,
}

impl VecRecordSource {
    pub fn new(records: Vec<Vec<u8>>) -> Self {
        Self { records, pos: 0 }
    }
}

impl RawRecordSource for VecRecordSource {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        if self.pos >= self.records.len() {
            return Ok(None);
        }
        self.pos += 1;
        Ok(Some(&self.records[self.pos - 1]))
    }
}

/// Drain a source into owned records.
pub fn collect_records(source: &mut dyn RawRecordSource) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    while let Some(record) = source.next_record()? {
        out.push(record.to_vec());
    }
    Ok(out)
}
