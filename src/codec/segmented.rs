//! Multi-segment framing.
//!
//! A segmented stream is a concatenation of independently checksummed
//! regions, each preceded by a fixed header:
//!
//! ```text
//! Offset  Size  Field
//! 0       8     segment_len: i64 LE (region envelope bytes that follow)
//! 8       8     uncompressed_len: i64 LE
//! 16      ...   region envelope
//! ```
//!
//! Used when a partition's data spans several spills or several network
//! transfers received out of band.

use std::io::{self, Read, Write};

use crate::codec::{CompressionKind, RegionReader, RegionSizes, RegionWriter};
use crate::error::corrupt_io;

/// Size of the per-segment header.
pub const SEGMENT_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub segment_len: u64,
    pub uncompressed_len: u64,
}

impl SegmentHeader {
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE] {
        let mut out = [0u8; SEGMENT_HEADER_SIZE];
        out[0..8].copy_from_slice(&(self.segment_len as i64).to_le_bytes());
        out[8..16].copy_from_slice(&(self.uncompressed_len as i64).to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; SEGMENT_HEADER_SIZE]) -> io::Result<Self> {
        let mut len = [0u8; 8];
        len.copy_from_slice(&buf[0..8]);
        let segment_len = i64::from_le_bytes(len);
        len.copy_from_slice(&buf[8..16]);
        let uncompressed_len = i64::from_le_bytes(len);
        if segment_len < 0 || uncompressed_len < 0 {
            return Err(corrupt_io(format!(
                "negative segment sizes ({segment_len}, {uncompressed_len})"
            )));
        }
        Ok(Self {
            segment_len: segment_len as u64,
            uncompressed_len: uncompressed_len as u64,
        })
    }
}

/// Write a segment header for an already-encoded region.
pub fn write_segment_header<W: Write>(w: &mut W, sizes: RegionSizes) -> io::Result<()> {
    let header = SegmentHeader {
        segment_len: sizes.compressed,
        uncompressed_len: sizes.uncompressed,
    };
    w.write_all(&header.encode())
}

/// Encode `payload` as one complete segment (header + region envelope).
pub fn encode_segment(
    payload: &[u8],
    compression: CompressionKind,
    checksum: bool,
) -> io::Result<Vec<u8>> {
    let mut region = RegionWriter::new(Vec::with_capacity(payload.len() + 8), compression, checksum);
    region.write_all(payload)?;
    let (body, sizes) = region.finish()?;
    let mut out = Vec::with_capacity(SEGMENT_HEADER_SIZE + body.len());
    write_segment_header(&mut out, sizes)?;
    out.extend_from_slice(&body);
    Ok(out)
}

// ── SegmentedChecksumReader ─────────────────────────────────────────

/// Presents a sequence of segments as one logical, decoded byte stream.
///
/// With a known segment count, exactly that many segments are consumed and
/// a missing header is corruption. Without one, the stream ends at a clean
/// end-of-input on a segment boundary.
pub struct SegmentedChecksumReader<R: Read> {
    source: Option<R>,
    current: Option<RegionReader<R>>,
    segments_left: Option<u64>,
    compression: CompressionKind,
    segments_read: u64,
}

impl<R: Read> SegmentedChecksumReader<R> {
    pub fn new(source: R, segment_count: Option<u64>, compression: CompressionKind) -> Self {
        Self {
            source: Some(source),
            current: None,
            segments_left: segment_count,
            compression,
            segments_read: 0,
        }
    }

    /// Segments fully or partially consumed so far.
    pub fn segments_read(&self) -> u64 {
        self.segments_read
    }

    /// Validate remaining segments and return the underlying reader.
    pub fn into_inner(mut self) -> io::Result<R> {
        io::copy(&mut self, &mut io::sink())?;
        self.source
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "segment source released"))
    }

    /// Open the next segment. Returns false at end of stream.
    fn advance(&mut self) -> io::Result<bool> {
        if self.segments_left == Some(0) {
            return Ok(false);
        }
        let mut source = match self.source.take() {
            Some(s) => s,
            None => return Ok(false),
        };

        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        let mut filled = 0;
        while filled < SEGMENT_HEADER_SIZE {
            match source.read(&mut header[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.source = Some(source);
                    return Err(e);
                }
            }
        }
        if filled == 0 && self.segments_left.is_none() {
            self.source = Some(source);
            return Ok(false);
        }
        if filled < SEGMENT_HEADER_SIZE {
            self.source = Some(source);
            return Err(corrupt_io(format!(
                "truncated segment header after {} segments ({} of {} bytes)",
                self.segments_read, filled, SEGMENT_HEADER_SIZE
            )));
        }

        let header = SegmentHeader::decode(&header)?;
        self.current = Some(RegionReader::with_expected_len(
            source,
            header.segment_len,
            self.compression,
            Some(header.uncompressed_len),
        ));
        if let Some(left) = self.segments_left.as_mut() {
            *left -= 1;
        }
        self.segments_read += 1;
        Ok(true)
    }
}

impl<R: Read> Read for SegmentedChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                if let Some(done) = self.current.take() {
                    self.source = Some(done.into_inner()?);
                }
            }
            if !self.advance()? {
                return Ok(0);
            }
        }
    }
}
