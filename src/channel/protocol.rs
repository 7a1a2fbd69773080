//! Wire formats of the TCP and file channels.
//!
//! TCP channel, one batch per spill:
//!
//! ```text
//! segment header (9 bytes)
//!   0  1  flags (FINAL_SEGMENT)
//!   1  4  sending task number: u32 LE (1-based)
//!   5  4  segment number: u32 LE
//! then per partition of the destination, in order:
//!   0  4  partition: u32 LE
//!   4  4  size: u32 LE
//!   8  .. one encoded segment (or nothing when size is 0)
//! response: 1 byte (1 = ok, 0 = error followed by a serialized error)
//! ```
//!
//! File channel download:
//!
//! ```text
//! server: i32 CONNECTION_ACCEPTED
//! client: [16 job id][i32 n][n x i32 partition][i32 m][m x string attempt id]
//! server, per task: i64 size (-1 then a serialized error if missing)
//!         per partition: i64 size, i64 uncompressed, i32 segment count, data
//! ```
//!
//! Strings and serialized errors are `[u32 LE len][bytes]`.

use std::io::{self, Read, Write};

use crate::error::{JetError, RemoteError, Result};
use crate::job::{JobId, TaskAttemptId};

/// Header flag: last batch from this task; its partitions are complete.
pub const FLAG_FINAL_SEGMENT: u8 = 0x01;

pub const SEGMENT_HEADER_LEN: usize = 9;
pub const PARTITION_HEADER_LEN: usize = 8;

const ACK_OK: u8 = 1;
const ACK_ERROR: u8 = 0;

/// First value a file server writes on a new connection.
pub const CONNECTION_ACCEPTED: i32 = 0x4A45_5401;

/// Per-partition framing bytes in a download response.
pub const DOWNLOAD_PARTITION_HEADER_LEN: u64 = 8 + 8 + 4;

/// Upper bound on strings and error blobs read from a peer.
const MAX_BLOB_LEN: usize = 1024 * 1024;

// ── Primitives ─────────────────────────────────────────────────────

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_blob<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    if len > MAX_BLOB_LEN {
        return Err(JetError::Protocol(format!("blob of {len} bytes exceeds limit")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_blob<W: Write>(w: &mut W, data: &[u8]) -> io::Result<()> {
    w.write_all(&(data.len() as u32).to_le_bytes())?;
    w.write_all(data)
}

pub fn read_string<R: Read>(r: &mut R) -> Result<String> {
    String::from_utf8(read_blob(r)?).map_err(|_| JetError::Protocol("string is not UTF-8".into()))
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_blob(w, s.as_bytes())
}

/// Serialized error body: `[u32 len][json RemoteError]`.
pub fn write_error<W: Write>(w: &mut W, error: &JetError) -> Result<()> {
    let body = serde_json::to_vec(&error.to_remote())?;
    write_blob(w, &body)?;
    Ok(())
}

pub fn read_error<R: Read>(r: &mut R) -> Result<JetError> {
    let remote: RemoteError = serde_json::from_slice(&read_blob(r)?)?;
    Ok(remote.into())
}

// ── TCP Channel ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentBatchHeader {
    pub flags: u8,
    pub sending_task: u32,
    pub segment: u32,
}

impl SegmentBatchHeader {
    pub fn is_final(&self) -> bool {
        self.flags & FLAG_FINAL_SEGMENT != 0
    }

    pub fn encode(&self) -> [u8; SEGMENT_HEADER_LEN] {
        let mut out = [0u8; SEGMENT_HEADER_LEN];
        out[0] = self.flags;
        out[1..5].copy_from_slice(&self.sending_task.to_le_bytes());
        out[5..9].copy_from_slice(&self.segment.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8; SEGMENT_HEADER_LEN]) -> Self {
        let mut word = [0u8; 4];
        word.copy_from_slice(&buf[1..5]);
        let sending_task = u32::from_le_bytes(word);
        word.copy_from_slice(&buf[5..9]);
        Self {
            flags: buf[0],
            sending_task,
            segment: u32::from_le_bytes(word),
        }
    }

    /// Read a header; `None` on a clean end of stream before its first byte.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Option<Self>> {
        let mut buf = [0u8; SEGMENT_HEADER_LEN];
        let mut filled = 0;
        while filled < buf.len() {
            match r.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(JetError::Protocol(format!(
                        "connection closed inside segment header ({filled} of {SEGMENT_HEADER_LEN} bytes)"
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Some(Self::decode(&buf)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionHeader {
    pub partition: u32,
    pub size: u32,
}

impl PartitionHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut out = [0u8; PARTITION_HEADER_LEN];
        out[0..4].copy_from_slice(&self.partition.to_le_bytes());
        out[4..8].copy_from_slice(&self.size.to_le_bytes());
        w.write_all(&out)
    }

    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            partition: read_u32(r)?,
            size: read_u32(r)?,
        })
    }
}

pub fn write_ack_ok<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(&[ACK_OK])?;
    w.flush()
}

pub fn write_ack_error<W: Write>(w: &mut W, error: &JetError) -> Result<()> {
    w.write_all(&[ACK_ERROR])?;
    write_error(w, error)?;
    w.flush()?;
    Ok(())
}

/// Wait for the acknowledgment of a batch; a failure response is returned
/// as the deserialized remote error.
pub fn read_ack<R: Read>(r: &mut R) -> Result<()> {
    let mut byte = [0u8; 1];
    r.read_exact(&mut byte)?;
    match byte[0] {
        ACK_OK => Ok(()),
        ACK_ERROR => Err(read_error(r)?),
        other => Err(JetError::Protocol(format!("unexpected acknowledgment byte {other}"))),
    }
}

// ── File Channel Download ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub job_id: JobId,
    pub partitions: Vec<u32>,
    pub tasks: Vec<TaskAttemptId>,
}

impl DownloadRequest {
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.job_id.to_bytes())?;
        w.write_all(&(self.partitions.len() as i32).to_le_bytes())?;
        for p in &self.partitions {
            w.write_all(&(*p as i32).to_le_bytes())?;
        }
        w.write_all(&(self.tasks.len() as i32).to_le_bytes())?;
        for task in &self.tasks {
            write_string(w, &task.to_string())?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let mut id = [0u8; 16];
        r.read_exact(&mut id)?;
        let partition_count = read_count(r, "partition")?;
        let mut partitions = Vec::with_capacity(partition_count);
        for _ in 0..partition_count {
            let p = read_i32(r)?;
            if p < 0 {
                return Err(JetError::Protocol(format!("negative partition number {p}")));
            }
            partitions.push(p as u32);
        }
        let task_count = read_count(r, "task")?;
        let mut tasks = Vec::with_capacity(task_count);
        for _ in 0..task_count {
            tasks.push(read_string(r)?.parse()?);
        }
        Ok(Self {
            job_id: JobId::from_bytes(id),
            partitions,
            tasks,
        })
    }
}

fn read_count<R: Read>(r: &mut R, what: &str) -> Result<usize> {
    let n = read_i32(r)?;
    if !(0..=1 << 20).contains(&n) {
        return Err(JetError::Protocol(format!("implausible {what} count {n}")));
    }
    Ok(n as usize)
}

/// Framing that precedes one partition's data in a download response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadPartitionHeader {
    pub size: u64,
    pub uncompressed_size: u64,
    pub segment_count: u32,
}

impl DownloadPartitionHeader {
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&(self.size as i64).to_le_bytes())?;
        w.write_all(&(self.uncompressed_size as i64).to_le_bytes())?;
        w.write_all(&(self.segment_count as i32).to_le_bytes())
    }

    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let size = read_i64(r)?;
        let uncompressed_size = read_i64(r)?;
        let segment_count = read_i32(r)?;
        if size < 0 || uncompressed_size < 0 || segment_count < 0 {
            return Err(JetError::Protocol(format!(
                "bad partition header ({size}, {uncompressed_size}, {segment_count})"
            )));
        }
        Ok(Self {
            size: size as u64,
            uncompressed_size: uncompressed_size as u64,
            segment_count: segment_count as u32,
        })
    }
}

/// Start of one task's section in a download response.
pub enum TaskResponse {
    Found { size: u64 },
    Missing(JetError),
}

impl TaskResponse {
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        match read_i64(r)? {
            -1 => Ok(TaskResponse::Missing(read_error(r)?)),
            size if size >= 0 => Ok(TaskResponse::Found { size: size as u64 }),
            other => Err(JetError::Protocol(format!("bad task size {other}"))),
        }
    }
}

pub fn write_task_found<W: Write>(w: &mut W, size: u64) -> io::Result<()> {
    w.write_all(&(size as i64).to_le_bytes())
}

pub fn write_task_missing<W: Write>(w: &mut W, error: &JetError) -> Result<()> {
    w.write_all(&(-1i64).to_le_bytes())?;
    write_error(w, error)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::job::TaskId;

    #[test]
    fn test_segment_header_layout() {
        let header = SegmentBatchHeader {
            flags: FLAG_FINAL_SEGMENT,
            sending_task: 3,
            segment: 258,
        };
        let bytes = header.encode();
        assert_eq!(bytes, [1, 3, 0, 0, 0, 2, 1, 0, 0]);
        assert!(SegmentBatchHeader::decode(&bytes).is_final());
    }

    #[test]
    fn test_segment_header_clean_eof_and_truncation() {
        assert!(SegmentBatchHeader::read_from(&mut Cursor::new(Vec::new()))
            .unwrap()
            .is_none());
        let err = SegmentBatchHeader::read_from(&mut Cursor::new(vec![0, 1, 0])).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_ack_carries_remote_error() {
        let mut buf = Vec::new();
        write_ack_ok(&mut buf).unwrap();
        write_ack_error(&mut buf, &JetError::Protocol("task 0".into())).unwrap();
        let mut cursor = Cursor::new(buf);
        read_ack(&mut cursor).unwrap();
        match read_ack(&mut cursor).unwrap_err() {
            JetError::Remote { kind, message } => {
                assert_eq!(kind, "PROTOCOL_VIOLATION");
                assert!(message.contains("task 0"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_download_request_round_trip() {
        let request = DownloadRequest {
            job_id: JobId::new(),
            partitions: vec![0, 4],
            tasks: vec![
                TaskAttemptId::new(TaskId::new("Map", 1), 1),
                TaskAttemptId::new(TaskId::new("Map", 2), 3),
            ],
        };
        let mut buf = Vec::new();
        request.write_to(&mut buf).unwrap();
        assert_eq!(DownloadRequest::read_from(&mut Cursor::new(buf)).unwrap(), request);
    }

    #[test]
    fn test_negative_counts_rejected() {
        let mut buf = vec![0u8; 16];
        buf.extend_from_slice(&(-5i32).to_le_bytes());
        let err = DownloadRequest::read_from(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_task_response_variants() {
        let mut buf = Vec::new();
        write_task_found(&mut buf, 42).unwrap();
        write_task_missing(&mut buf, &JetError::InvalidState("gone".into())).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            TaskResponse::read_from(&mut cursor).unwrap(),
            TaskResponse::Found { size: 42 }
        ));
        assert!(matches!(
            TaskResponse::read_from(&mut cursor).unwrap(),
            TaskResponse::Missing(JetError::Remote { .. })
        ));
    }
}
