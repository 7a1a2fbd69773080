//! Compression as a stream transform.
//!
//! Writers compress *outside* the checksum envelope and readers decompress
//! *inside* it, so the CRC always covers the compressed bytes.

use std::io::{self, Read, Write};

use flate2::read::{DeflateDecoder, GzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};

/// Compression codec for spill and channel data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CompressionKind {
    #[default]
    None = 0,
    /// Raw deflate at the fast level; the default for spills.
    Deflate = 1,
    /// Gzip framing at the default level.
    Gzip = 2,
}

impl CompressionKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Deflate),
            2 => Some(Self::Gzip),
            _ => None,
        }
    }

    /// Wrap `inner` so that bytes written are compressed into it.
    pub fn compressor<W: Write>(self, inner: W) -> CompressedWriter<W> {
        match self {
            CompressionKind::None => CompressedWriter::Plain(inner),
            CompressionKind::Deflate => {
                CompressedWriter::Deflate(DeflateEncoder::new(inner, Compression::fast()))
            }
            CompressionKind::Gzip => {
                CompressedWriter::Gzip(GzEncoder::new(inner, Compression::default()))
            }
        }
    }

    /// Wrap `inner` so that reads yield decompressed bytes.
    pub fn decompressor<R: Read>(self, inner: R) -> DecompressedReader<R> {
        match self {
            CompressionKind::None => DecompressedReader::Plain(inner),
            CompressionKind::Deflate => DecompressedReader::Deflate(DeflateDecoder::new(inner)),
            CompressionKind::Gzip => DecompressedReader::Gzip(GzDecoder::new(inner)),
        }
    }
}

// ── Writer ──────────────────────────────────────────────────────────

pub enum CompressedWriter<W: Write> {
    Plain(W),
    Deflate(DeflateEncoder<W>),
    Gzip(GzEncoder<W>),
}

impl<W: Write> CompressedWriter<W> {
    /// Flush the codec's trailing block and return the wrapped writer.
    pub fn finish(self) -> io::Result<W> {
        match self {
            CompressedWriter::Plain(w) => Ok(w),
            CompressedWriter::Deflate(e) => e.finish(),
            CompressedWriter::Gzip(e) => e.finish(),
        }
    }

    pub fn get_ref(&self) -> &W {
        match self {
            CompressedWriter::Plain(w) => w,
            CompressedWriter::Deflate(e) => e.get_ref(),
            CompressedWriter::Gzip(e) => e.get_ref(),
        }
    }
}

impl<W: Write> Write for CompressedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressedWriter::Plain(w) => w.write(buf),
            CompressedWriter::Deflate(e) => e.write(buf),
            CompressedWriter::Gzip(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressedWriter::Plain(w) => w.flush(),
            CompressedWriter::Deflate(e) => e.flush(),
            CompressedWriter::Gzip(e) => e.flush(),
        }
    }
}

// ── Reader ──────────────────────────────────────────────────────────

pub enum DecompressedReader<R: Read> {
    Plain(R),
    Deflate(DeflateDecoder<R>),
    Gzip(GzDecoder<R>),
}

impl<R: Read> DecompressedReader<R> {
    pub fn get_mut(&mut self) -> &mut R {
        match self {
            DecompressedReader::Plain(r) => r,
            DecompressedReader::Deflate(d) => d.get_mut(),
            DecompressedReader::Gzip(d) => d.get_mut(),
        }
    }
}

impl<R: Read> Read for DecompressedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DecompressedReader::Plain(r) => r.read(buf),
            DecompressedReader::Deflate(d) => d.read(buf),
            DecompressedReader::Gzip(d) => d.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(kind: CompressionKind, payload: &[u8]) -> Vec<u8> {
        let mut w = kind.compressor(Vec::new());
        w.write_all(payload).unwrap();
        let compressed = w.finish().unwrap();
        let mut out = Vec::new();
        kind.decompressor(&compressed[..]).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_all_kinds_round_trip() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        for kind in [CompressionKind::None, CompressionKind::Deflate, CompressionKind::Gzip] {
            assert_eq!(round_trip(kind, &payload), payload, "{kind:?}");
        }
    }

    #[test]
    fn test_wire_codes() {
        for kind in [CompressionKind::None, CompressionKind::Deflate, CompressionKind::Gzip] {
            assert_eq!(CompressionKind::from_u8(kind as u8), Some(kind));
        }
        assert_eq!(CompressionKind::from_u8(9), None);
    }

    #[test]
    fn test_deflate_shrinks_repetitive_data() {
        let payload = vec![b'x'; 64 * 1024];
        let mut w = CompressionKind::Deflate.compressor(Vec::new());
        w.write_all(&payload).unwrap();
        assert!(w.finish().unwrap().len() < payload.len() / 10);
    }
}
