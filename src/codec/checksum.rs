//! CRC32 checksum envelope.
//!
//! ```text
//! [flag: u8]  1 = checksum enabled, 0 = disabled
//! [payload]   all bytes written by the caller
//! [crc: u32]  little-endian CRC32 of the payload, present only if flag = 1
//! ```
//!
//! A writer that never receives a byte emits nothing at all, so an empty
//! envelope has length zero.

use std::io::{self, Read, Write};

use crc32fast::Hasher;

use crate::error::corrupt_io;

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: usize = 4;

/// Size of the leading flag byte.
pub const FLAG_SIZE: usize = 1;

const FLAG_DISABLED: u8 = 0;
const FLAG_ENABLED: u8 = 1;

// ── ChecksumWriter ──────────────────────────────────────────────────

/// Writes the checksum envelope around everything passed to `write`.
pub struct ChecksumWriter<W: Write> {
    inner: W,
    enabled: bool,
    hasher: Hasher,
    started: bool,
    payload_len: u64,
}

impl<W: Write> ChecksumWriter<W> {
    pub fn new(inner: W, enabled: bool) -> Self {
        Self {
            inner,
            enabled,
            hasher: Hasher::new(),
            started: false,
            payload_len: 0,
        }
    }

    /// Payload bytes written so far (excludes flag and trailer).
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Append the trailer (if any) and return the wrapped writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.started && self.enabled {
            let crc = self.hasher.clone().finalize();
            self.inner.write_all(&crc.to_le_bytes())?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChecksumWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.started {
            let flag = if self.enabled { FLAG_ENABLED } else { FLAG_DISABLED };
            self.inner.write_all(&[flag])?;
            self.started = true;
        }
        let n = self.inner.write(buf)?;
        if self.enabled {
            self.hasher.update(&buf[..n]);
        }
        self.payload_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ── ChecksumReader ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Unstarted,
    Payload,
    Done,
}

/// Reads exactly `length` envelope bytes from `inner` and validates the CRC.
///
/// The checksum is compared as soon as the last payload byte is read, so a
/// corrupt stream fails on the read that reaches its end. Dropping a
/// partially consumed reader drains the rest to validate it; use
/// [`ChecksumReader::finish`] to observe that failure instead of a log line.
pub struct ChecksumReader<R: Read> {
    inner: Option<R>,
    length: u64,
    remaining: u64,
    enabled: bool,
    hasher: Hasher,
    state: ReadState,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R, length: u64) -> Self {
        Self {
            inner: Some(inner),
            length,
            remaining: 0,
            enabled: false,
            hasher: Hasher::new(),
            state: ReadState::Unstarted,
        }
    }

    /// Total envelope length this reader consumes.
    pub fn envelope_len(&self) -> u64 {
        self.length
    }

    /// Whether the stream carried a checksum (known after the first read).
    pub fn is_checksummed(&self) -> bool {
        self.enabled
    }

    /// Read any unconsumed payload and validate the checksum.
    pub fn finish(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 8192];
        while self.state != ReadState::Done {
            self.read(&mut scratch)?;
        }
        Ok(())
    }

    /// Validate the envelope and hand back the underlying reader, positioned
    /// just past the trailer.
    pub fn into_inner(mut self) -> io::Result<R> {
        self.finish()?;
        self.inner.take().ok_or_else(consumed)
    }

    fn source(&mut self) -> io::Result<&mut R> {
        self.inner.as_mut().ok_or_else(consumed)
    }

    fn start(&mut self) -> io::Result<()> {
        if self.length == 0 {
            self.state = ReadState::Done;
            return Ok(());
        }
        let mut flag = [0u8; 1];
        read_exact_or_corrupt(self.source()?, &mut flag, "checksum flag")?;
        match flag[0] {
            FLAG_DISABLED => {
                self.enabled = false;
                self.remaining = self.length - FLAG_SIZE as u64;
            }
            FLAG_ENABLED => {
                let overhead = (FLAG_SIZE + CHECKSUM_SIZE) as u64;
                if self.length < overhead {
                    return Err(corrupt_io(format!(
                        "checksummed envelope of {} bytes is shorter than its framing",
                        self.length
                    )));
                }
                self.enabled = true;
                self.remaining = self.length - overhead;
            }
            other => {
                return Err(corrupt_io(format!("invalid checksum flag byte {other}")));
            }
        }
        self.state = ReadState::Payload;
        if self.remaining == 0 {
            self.verify()?;
        }
        Ok(())
    }

    fn verify(&mut self) -> io::Result<()> {
        self.state = ReadState::Done;
        if !self.enabled {
            return Ok(());
        }
        let mut trailer = [0u8; CHECKSUM_SIZE];
        read_exact_or_corrupt(self.source()?, &mut trailer, "checksum trailer")?;
        let expected = u32::from_le_bytes(trailer);
        let actual = self.hasher.clone().finalize();
        if expected != actual {
            return Err(corrupt_io(format!(
                "checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            )));
        }
        Ok(())
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state == ReadState::Unstarted {
            self.start()?;
        }
        if self.state == ReadState::Done || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.source()?.read(&mut buf[..want])?;
        if n == 0 {
            return Err(corrupt_io(format!(
                "stream truncated with {} payload bytes outstanding",
                self.remaining
            )));
        }
        if self.enabled {
            self.hasher.update(&buf[..n]);
        }
        self.remaining -= n as u64;
        if self.remaining == 0 {
            self.verify()?;
        }
        Ok(n)
    }
}

impl<R: Read> Drop for ChecksumReader<R> {
    fn drop(&mut self) {
        if self.state != ReadState::Done && self.inner.is_some() {
            if let Err(e) = self.finish() {
                tracing::warn!("checksummed stream failed validation on drop: {}", e);
            }
        }
    }
}

fn consumed() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "checksummed stream already released")
}

fn read_exact_or_corrupt<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> io::Result<()> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            corrupt_io(format!("stream truncated while reading {what}"))
        } else {
            e
        }
    })
}

// ── Tests ──────────────────────────────────────────────────────────
