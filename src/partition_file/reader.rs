//! Partition file reader.
//!
//! A partition's data is the concatenation of its regions in index order.
//! [`PartitionStream`] seeks to each region in turn and decodes it, moving on
//! to the next when the current one is exhausted.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{CompressionKind, RegionReader};
use crate::error::Result;
use crate::partition_file::format::PartitionFileIndexEntry;
use crate::partition_file::index::PartitionFileIndex;
use crate::record::FramedRecordReader;

pub struct PartitionFileReader {
    index: Arc<PartitionFileIndex>,
    compression: CompressionKind,
}

impl PartitionFileReader {
    /// Open `data_path`; the index loads in the background.
    pub fn open(data_path: &Path, compression: CompressionKind) -> Self {
        Self::from_index(Arc::new(PartitionFileIndex::load(data_path)), compression)
    }

    pub fn from_index(index: Arc<PartitionFileIndex>, compression: CompressionKind) -> Self {
        Self { index, compression }
    }

    pub fn index(&self) -> &Arc<PartitionFileIndex> {
        &self.index
    }

    pub fn data_path(&self) -> &Path {
        self.index.data_path()
    }

    /// Decoded bytes of `partition`.
    pub fn partition_stream(&self, partition: u32) -> Result<PartitionStream> {
        let entries = self.index.entries(partition)?;
        PartitionStream::open(self.index.data_path(), entries, self.compression)
    }

    /// Length-prefixed records of `partition`.
    pub fn partition_records(&self, partition: u32) -> Result<FramedRecordReader<PartitionStream>> {
        Ok(FramedRecordReader::new(self.partition_stream(partition)?))
    }

    pub fn read_partition(&self, partition: u32) -> Result<Vec<u8>> {
        let mut stream = self.partition_stream(partition)?;
        let mut out = Vec::with_capacity(stream.uncompressed_len() as usize);
        stream.read_to_end(&mut out)?;
        Ok(out)
    }
}

// ── PartitionStream ────────────────────────────────────────────────

pub struct PartitionStream {
    path: PathBuf,
    entries: Vec<PartitionFileIndexEntry>,
    next_entry: usize,
    compression: CompressionKind,
    source: Option<BufReader<File>>,
    current: Option<RegionReader<BufReader<File>>>,
}

impl PartitionStream {
    pub fn open(
        data_path: &Path,
        entries: Vec<PartitionFileIndexEntry>,
        compression: CompressionKind,
    ) -> Result<Self> {
        let entries: Vec<_> = entries.into_iter().filter(|e| !e.is_placeholder()).collect();
        let source = if entries.is_empty() {
            None
        } else {
            Some(BufReader::with_capacity(64 * 1024, File::open(data_path)?))
        };
        Ok(Self {
            path: data_path.to_path_buf(),
            entries,
            next_entry: 0,
            compression,
            source,
            current: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Region envelope bytes this stream covers.
    pub fn compressed_len(&self) -> u64 {
        self.entries.iter().map(|e| e.compressed_size as u64).sum()
    }

    pub fn uncompressed_len(&self) -> u64 {
        self.entries.iter().map(|e| e.uncompressed_size as u64).sum()
    }

    fn advance(&mut self) -> io::Result<bool> {
        let entry = match self.entries.get(self.next_entry) {
            Some(e) => *e,
            None => return Ok(false),
        };
        let mut source = match self.source.take() {
            Some(s) => s,
            None => return Ok(false),
        };
        source.seek(SeekFrom::Start(entry.offset as u64))?;
        self.current = Some(RegionReader::with_expected_len(
            source,
            entry.compressed_size as u64,
            self.compression,
            Some(entry.uncompressed_size as u64),
        ));
        self.next_entry += 1;
        Ok(true)
    }
}

impl Read for PartitionStream {
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

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::TempDir;

    use super::*;
    use crate::partition_file::writer::PartitionFileWriter;
    use crate::record::{collect_records, RawRecordSink};

    // ── Test Helpers ──

    fn write_two_spills(path: &Path, compression: CompressionKind) {
        let mut writer = PartitionFileWriter::create(path, 2, compression, true).unwrap();
        // spill 1
        writer.write_partition(0, b"p0-s1;").unwrap();
        writer.write_partition(1, b"p1-s1;").unwrap();
        // spill 2
        writer.add_placeholder(0).unwrap();
        writer.write_partition(1, b"p1-s2;").unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_reads_partition_across_regions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write_two_spills(&path, CompressionKind::Deflate);

        let reader = PartitionFileReader::open(&path, CompressionKind::Deflate);
        assert_eq!(reader.read_partition(0).unwrap(), b"p0-s1;");
        assert_eq!(reader.read_partition(1).unwrap(), b"p1-s1;p1-s2;");
    }

    #[test]
    fn test_partition_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let mut writer = PartitionFileWriter::create(&path, 1, CompressionKind::Gzip, true).unwrap();
        let chunks = vec![vec![&b"a"[..], &b"b"[..]], vec![&b"c"[..]]];
        for chunk in chunks {
            let mut region = writer.begin_partition(0).unwrap();
            for r in chunk {
                region.write_record(r).unwrap();
            }
            region.finish().unwrap();
        }
        writer.finish().unwrap();

        let reader = PartitionFileReader::open(&path, CompressionKind::Gzip);
        let mut records = reader.partition_records(0).unwrap();
        assert_eq!(
            collect_records(&mut records).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_corrupted_region_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write_two_spills(&path, CompressionKind::None);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[3] ^= 0x20;
        std::fs::File::create(&path).unwrap().write_all(&bytes).unwrap();

        let reader = PartitionFileReader::open(&path, CompressionKind::None);
        let err: crate::error::JetError = reader.read_partition(0).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(reader.read_partition(1).unwrap(), b"p1-s1;p1-s2;");
    }

    #[test]
    fn test_stream_reports_uncompressed_len() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        write_two_spills(&path, CompressionKind::None);
        let reader = PartitionFileReader::open(&path, CompressionKind::None);
        let stream = reader.partition_stream(0).unwrap();
        assert_eq!(stream.uncompressed_len(), 6);
    }
}
