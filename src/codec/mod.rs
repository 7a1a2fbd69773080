//! Byte-level stream codec.
//!
//! Every region of spilled or transferred data is a *region envelope*:
//! compressed bytes wrapped in a CRC32 checksum envelope. Regions are written
//! with [`RegionWriter`] and read back with [`RegionReader`]; network
//! transfers prefix each region with a 16-byte segment header (see
//! [`segmented`]).

pub mod checksum;
pub mod compression;
pub mod segmented;

use std::io::{self, Read, Write};

pub use checksum::{ChecksumReader, ChecksumWriter};
pub use compression::{CompressedWriter, CompressionKind, DecompressedReader};
pub use segmented::{
    encode_segment, write_segment_header, SegmentHeader, SegmentedChecksumReader,
    SEGMENT_HEADER_SIZE,
};

use crate::error::corrupt_io;

// ── Counting Adapters ───────────────────────────────────────────────

/// Writer that counts bytes passed through it.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that counts bytes passed through it.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

// ── Region Writer ───────────────────────────────────────────────────

/// Sizes of one finished region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSizes {
    /// Bytes on disk / on the wire (envelope included).
    pub compressed: u64,
    /// Bytes the caller wrote.
    pub uncompressed: u64,
}

/// Compresses and checksums one region into `W`.
///
/// The compressor is only created on the first non-empty write, so a region
/// that never receives data occupies zero bytes.
pub struct RegionWriter<W: Write> {
    compression: CompressionKind,
    idle: Option<ChecksumWriter<CountingWriter<W>>>,
    active: Option<CompressedWriter<ChecksumWriter<CountingWriter<W>>>>,
    uncompressed: u64,
}

impl<W: Write> RegionWriter<W> {
    pub fn new(inner: W, compression: CompressionKind, checksum: bool) -> Self {
        Self {
            compression,
            idle: Some(ChecksumWriter::new(CountingWriter::new(inner), checksum)),
            active: None,
            uncompressed: 0,
        }
    }

    /// Bytes written by the caller so far.
    pub fn uncompressed_len(&self) -> u64 {
        self.uncompressed
    }

    pub fn finish(mut self) -> io::Result<(W, RegionSizes)> {
        let checksum = match (self.active.take(), self.idle.take()) {
            (Some(active), _) => active.finish()?,
            (None, Some(idle)) => idle,
            (None, None) => return Err(released()),
        };
        let counting = checksum.finish()?;
        let sizes = RegionSizes {
            compressed: counting.count(),
            uncompressed: self.uncompressed,
        };
        Ok((counting.into_inner(), sizes))
    }
}

impl<W: Write> Write for RegionWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.active.is_none() {
            let idle = self.idle.take().ok_or_else(released)?;
            self.active = Some(self.compression.compressor(idle));
        }
        let active = self.active.as_mut().ok_or_else(released)?;
        let n = active.write(buf)?;
        self.uncompressed += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.active.as_mut() {
            Some(active) => active.flush(),
            None => Ok(()),
        }
    }
}

fn released() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "region writer already released")
}

// ── Region Reader ───────────────────────────────────────────────────

/// Reads back one region written by [`RegionWriter`].
///
/// Consumes exactly `compressed_len` bytes from the underlying reader. If
/// `expected_uncompressed` is given, a region that decodes to a different
/// length fails as corrupt.
pub struct RegionReader<R: Read> {
    inner: DecompressedReader<ChecksumReader<io::Take<R>>>,
    expected_uncompressed: Option<u64>,
    produced: u64,
    done: bool,
}

impl<R: Read> RegionReader<R> {
    pub fn new(inner: R, compressed_len: u64, compression: CompressionKind) -> Self {
        Self::with_expected_len(inner, compressed_len, compression, None)
    }

    pub fn with_expected_len(
        inner: R,
        compressed_len: u64,
        compression: CompressionKind,
        expected_uncompressed: Option<u64>,
    ) -> Self {
        let checksum = ChecksumReader::new(inner.take(compressed_len), compressed_len);
        let compression = if compressed_len == 0 {
            CompressionKind::None
        } else {
            compression
        };
        Self {
            inner: compression.decompressor(checksum),
            expected_uncompressed,
            produced: 0,
            done: false,
        }
    }

    /// Validate the rest of the region and return the underlying reader.
    pub fn into_inner(mut self) -> io::Result<R> {
        if !self.done {
            io::copy(&mut self, &mut io::sink())?;
        }
        let checksum = match self.inner {
            DecompressedReader::Plain(r) => r,
            DecompressedReader::Deflate(d) => d.into_inner(),
            DecompressedReader::Gzip(d) => d.into_inner(),
        };
        Ok(checksum.into_inner()?.into_inner())
    }

    fn complete(&mut self) -> io::Result<()> {
        self.inner.get_mut().finish()?;
        self.done = true;
        if let Some(expected) = self.expected_uncompressed {
            if expected != self.produced {
                return Err(corrupt_io(format!(
                    "region decoded to {} bytes, expected {}",
                    self.produced, expected
                )));
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for RegionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf).map_err(decode_error)?;
        if n == 0 {
            self.complete()?;
            return Ok(0);
        }
        self.produced += n as u64;
        Ok(n)
    }
}

/// Decoder failures on a bounded region mean the bytes are damaged.
fn decode_error(e: io::Error) -> io::Error {
    match e.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
            if !is_marked(&e) =>
        {
            corrupt_io(format!("region failed to decode: {e}"))
        }
        _ => e,
    }
}

fn is_marked(e: &io::Error) -> bool {
    e.get_ref()
        .map(|inner| inner.is::<crate::error::CorruptionMarker>())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::error::JetError;

    fn write_region(payload: &[u8], compression: CompressionKind) -> (Vec<u8>, RegionSizes) {
        let mut w = RegionWriter::new(Vec::new(), compression, true);
        w.write_all(payload).unwrap();
        w.finish().unwrap()
    }

    #[test]
    fn test_empty_region_occupies_nothing() {
        let (bytes, sizes) = write_region(&[], CompressionKind::Deflate);
        assert!(bytes.is_empty());
        assert_eq!(sizes, RegionSizes::default());

        let mut reader = RegionReader::new(Cursor::new(bytes), 0, CompressionKind::Deflate);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_region_round_trip_with_trailing_data() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let (mut bytes, sizes) = write_region(&payload, CompressionKind::Deflate);
        assert_eq!(sizes.compressed, bytes.len() as u64);
        assert_eq!(sizes.uncompressed, payload.len() as u64);
        bytes.extend_from_slice(b"NEXT");

        let mut reader = RegionReader::with_expected_len(
            Cursor::new(bytes),
            sizes.compressed,
            CompressionKind::Deflate,
            Some(sizes.uncompressed),
        );
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);

        let mut rest = Vec::new();
        reader.into_inner().unwrap().read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[test]
    fn test_wrong_expected_length_is_corrupt() {
        let (bytes, sizes) = write_region(b"abcdef", CompressionKind::None);
        let mut reader = RegionReader::with_expected_len(
            Cursor::new(bytes),
            sizes.compressed,
            CompressionKind::None,
            Some(99),
        );
        let mut out = Vec::new();
        let err: JetError = reader.read_to_end(&mut out).unwrap_err().into();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupted_compressed_region_fails() {
        let payload = vec![42u8; 4096];
        let (mut bytes, sizes) = write_region(&payload, CompressionKind::Deflate);
        let last = bytes.len() - 1;
        bytes[last] ^= 0x55;
        let mut reader = RegionReader::new(Cursor::new(bytes), sizes.compressed, CompressionKind::Deflate);
        let mut out = Vec::new();
        let err: JetError = reader.read_to_end(&mut out).unwrap_err().into();
        assert!(err.is_corruption());
    }
}
