//! K-way merge of sorted inputs.
//!
//! Inputs are opened, primed with their first record, and drained through a
//! min-heap keyed by the comparator. The heap holds owned copies of the
//! current head of each input; buffers are recycled so a long merge does
//! not allocate per record.
//!
//! Two entry points share the heap:
//!
//! - [`write_merge`] pushes the merged (optionally combined) records into a
//!   sink, used by on-disk merge passes.
//! - [`merge`] returns a lazy [`MergeStream`] for a final pass that the
//!   consumer pulls from directly.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::codec::CompressionKind;
use crate::error::Result;
use crate::merge::input::{framed_len, OpenInput, PartitionFileInput, RecordInput, TempPartitionFile};
use crate::metrics::ChannelMetrics;
use crate::partition_file::{PartitionFileIndex, PartitionFileWriter};
use crate::record::combiner::CombiningSource;
use crate::record::{combine_sorted, Combiner, RawComparator, RawRecordSink, RawRecordSource};

// ── Heap Entry ─────────────────────────────────────────────────────

/// Head record of one input.
struct HeapEntry {
    record: Vec<u8>,
    input: usize,
    comparator: Arc<dyn RawComparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal records come out in input order.
        self.comparator
            .compare(&self.record, &other.record)
            .then(self.input.cmp(&other.input))
    }
}

// ── HeapMerger ─────────────────────────────────────────────────────

/// Pull-based k-way merge over opened inputs.
pub struct HeapMerger {
    inputs: Vec<OpenInput>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    comparator: Arc<dyn RawComparator>,
    current: Vec<u8>,
    /// Input whose head was just handed out; refilled on the next call so
    /// the returned slice stays valid until then.
    refill: Option<usize>,
    spare: Vec<Vec<u8>>,
    total_bytes: Option<u64>,
    records_read: u64,
    exhausted: bool,
    metrics: Option<Arc<ChannelMetrics>>,
    /// Local bytes already added to `metrics`.
    charged: u64,
}

impl HeapMerger {
    pub fn new(inputs: Vec<RecordInput>, comparator: Arc<dyn RawComparator>) -> Result<Self> {
        let opened = inputs
            .into_iter()
            .map(RecordInput::open)
            .collect::<Result<Vec<_>>>()?;
        let total_bytes = opened
            .iter()
            .map(OpenInput::total_bytes)
            .try_fold(0u64, |acc, t| t.map(|t| acc + t));

        let mut merger = Self {
            heap: BinaryHeap::with_capacity(opened.len()),
            inputs: opened,
            comparator,
            current: Vec::new(),
            refill: None,
            spare: Vec::new(),
            total_bytes,
            records_read: 0,
            exhausted: false,
            metrics: None,
            charged: 0,
        };
        for i in 0..merger.inputs.len() {
            merger.pull(i)?;
        }
        Ok(merger)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Records handed out so far.
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Framed bytes consumed from all inputs.
    pub fn bytes_read(&self) -> u64 {
        self.inputs.iter().map(OpenInput::bytes_read).sum()
    }

    /// Framed bytes consumed from temporary files.
    pub fn local_bytes_read(&self) -> u64 {
        self.inputs.iter().map(OpenInput::local_bytes_read).sum()
    }

    /// Fraction of input bytes consumed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.exhausted {
            return 1.0;
        }
        match self.total_bytes {
            Some(0) | None => 0.0,
            Some(total) => (self.bytes_read() as f64 / total as f64).min(1.0),
        }
    }

    fn settle_metrics(&mut self) {
        let read = self.local_bytes_read();
        if let Some(metrics) = &self.metrics {
            metrics.add_local_bytes_read(read - self.charged);
            self.charged = read;
        }
    }

    fn pull(&mut self, input: usize) -> Result<()> {
        let record = match self.inputs[input].next_record()? {
            Some(record) => record,
            None => return Ok(()),
        };
        let mut buf = self.spare.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(record);
        self.heap.push(Reverse(HeapEntry {
            record: buf,
            input,
            comparator: Arc::clone(&self.comparator),
        }));
        Ok(())
    }
}

impl RawRecordSource for HeapMerger {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        if let Some(input) = self.refill.take() {
            self.pull(input)?;
        }
        match self.heap.pop() {
            None => {
                if !self.exhausted {
                    self.exhausted = true;
                    self.settle_metrics();
                }
                Ok(None)
            }
            Some(Reverse(entry)) => {
                let previous = std::mem::replace(&mut self.current, entry.record);
                if self.spare.len() < self.inputs.len() {
                    self.spare.push(previous);
                }
                self.refill = Some(entry.input);
                self.records_read += 1;
                Ok(Some(&self.current))
            }
        }
    }
}

impl Drop for HeapMerger {
    fn drop(&mut self) {
        self.settle_metrics();
    }
}

// ── Lazy Merge ─────────────────────────────────────────────────────

enum MergeSource {
    Plain(HeapMerger),
    Combined(CombiningSource<HeapMerger>),
}

/// Lazily merged record stream.
pub struct MergeStream {
    source: MergeSource,
}

impl MergeStream {
    fn merger(&self) -> &HeapMerger {
        match &self.source {
            MergeSource::Plain(m) => m,
            MergeSource::Combined(c) => c.get_ref(),
        }
    }

    pub fn input_count(&self) -> usize {
        self.merger().input_count()
    }

    /// Charge bytes read back from temporary files to `metrics`, once the
    /// stream is exhausted or dropped.
    pub fn with_metrics(mut self, metrics: Arc<ChannelMetrics>) -> Self {
        let merger = match &mut self.source {
            MergeSource::Plain(m) => m,
            MergeSource::Combined(c) => c.get_mut(),
        };
        merger.metrics = Some(metrics);
        self
    }

    /// Framed bytes consumed over the framed total of all inputs. Record
    /// counts of spooled and merged inputs are unknown until read, so this
    /// is measured in bytes, not records.
    pub fn progress(&self) -> f64 {
        self.merger().progress()
    }

    pub fn bytes_read(&self) -> u64 {
        self.merger().bytes_read()
    }

    /// Records read from the inputs (before combining).
    pub fn records_read(&self) -> u64 {
        self.merger().records_read()
    }
}


impl RawRecordSource for MergeStream {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        match &mut self.source {
            MergeSource::Plain(m) => m.next_record(),
            MergeSource::Combined(c) => c.next_record(),
        }
    }
}

// ── Eager Merge ────────────────────────────────────────────────────

/// Counters of one `write_merge` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub inputs: usize,
    pub records_read: u64,
    pub bytes_read: u64,
    /// Part of `bytes_read` that came from temporary files.
    pub local_bytes_read: u64,
    pub records_written: u64,
    /// Framed bytes handed to the sink.
    pub bytes_written: u64,
}

struct CountingSink<'a> {
    inner: &'a mut dyn RawRecordSink,
    records: u64,
    bytes: u64,
}

impl RawRecordSink for CountingSink<'_> {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.records += 1;
        self.bytes += framed_len(record);
        self.inner.write_record(record)
    }
}

/// Merge `inputs` into `sink`.
pub fn write_merge(
    inputs: Vec<RecordInput>,
    comparator: &Arc<dyn RawComparator>,
    combiner: Option<&dyn Combiner>,
    sink: &mut dyn RawRecordSink,
) -> Result<MergeStats> {
    let input_count = inputs.len();
    let mut merger = HeapMerger::new(inputs, Arc::clone(comparator))?;
    let mut counting = CountingSink {
        inner: sink,
        records: 0,
        bytes: 0,
    };
    match combiner {
        Some(combiner) => {
            combine_sorted(&mut merger, comparator.as_ref(), combiner, &mut counting)?;
        }
        None => {
            while let Some(record) = merger.next_record()? {
                counting.write_record(record)?;
            }
        }
    }
    Ok(MergeStats {
        inputs: input_count,
        records_read: merger.records_read(),
        bytes_read: merger.bytes_read(),
        local_bytes_read: merger.local_bytes_read(),
        records_written: counting.records,
        bytes_written: counting.bytes,
    })
}

/// Merge `inputs` into a new single-partition file at `path` and return it
/// as an input that deletes the file once consumed.
pub fn merge_to_file(
    inputs: Vec<RecordInput>,
    comparator: &Arc<dyn RawComparator>,
    combiner: Option<&dyn Combiner>,
    path: PathBuf,
    compression: CompressionKind,
    checksum: bool,
) -> Result<(RecordInput, MergeStats)> {
    // Owns the file from the start so a failed pass leaves nothing behind.
    let temp = TempPartitionFile::new(path.clone());
    let mut writer = PartitionFileWriter::create(&path, 1, compression, checksum)?;
    let stats = {
        let mut region = writer.begin_partition(0)?;
        let stats = write_merge(inputs, comparator, combiner, &mut region)?;
        region.finish()?;
        stats
    };
    let info = writer.finish()?;
    let input = RecordInput::PartitionFile(PartitionFileInput {
        index: Arc::new(PartitionFileIndex::from_entries(&path, 1, &info.entries)),
        partition: 0,
        compression,
        temp: Some(temp),
    });
    Ok((input, stats))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::merge::input::MemoryInput;
    use crate::record::{collect_records, BytewiseComparator, FnCombiner, KeyPrefixComparator};

    // ── Test Helpers ──

    fn memory(records: &[&[u8]]) -> RecordInput {
        RecordInput::Memory(
            MemoryInput::from_records(records.iter().copied(), CompressionKind::Deflate, true).unwrap(),
        )
    }

    fn bytewise() -> Arc<dyn RawComparator> {
        Arc::new(BytewiseComparator)
    }

    fn first_wins() -> Arc<dyn Combiner> {
        Arc::new(FnCombiner::new(|group: &[&[u8]], emit: &mut dyn FnMut(&[u8]) -> Result<()>| {
            emit(group[0])
        }))
    }

    #[test]
    fn test_merge_interleaves_sorted_inputs() {
        let inputs = vec![
            memory(&[b"a", b"d", b"g"]),
            memory(&[b"b", b"e"]),
            memory(&[]),
            memory(&[b"c", b"f", b"h"]),
        ];
        let mut stream = merge(inputs, bytewise(), None).unwrap();
        assert_eq!(stream.input_count(), 4);
        let out = collect_records(&mut stream).unwrap();
        let expected: Vec<Vec<u8>> = ["a", "b", "c", "d", "e", "f", "g", "h"]
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();
        assert_eq!(out, expected);
        assert_eq!(stream.records_read(), 8);
        assert!((stream.progress() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_equal_keys_follow_input_order() {
        let inputs = vec![memory(&[b"k1", b"z0"]), memory(&[b"k2"]), memory(&[b"k3"])];
        let comparator: Arc<dyn RawComparator> = Arc::new(KeyPrefixComparator::new(1));
        let mut stream = merge(inputs, comparator, None).unwrap();
        let out = collect_records(&mut stream).unwrap();
        assert_eq!(out, vec![b"k1".to_vec(), b"k2".to_vec(), b"k3".to_vec(), b"z0".to_vec()]);
    }

    #[test]
    fn test_progress_advances_with_reads() {
        let inputs = vec![memory(&[b"a", b"c"]), memory(&[b"b", b"d"])];
        let mut stream = merge(inputs, bytewise(), None).unwrap();
        // Priming reads the first record of each input.
        assert!((stream.progress() - 0.5).abs() < 1e-9);
        stream.next_record().unwrap();
        stream.next_record().unwrap();
        stream.next_record().unwrap();
        assert!((stream.progress() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_lazy_merge_combines_groups() {
        let inputs = vec![memory(&[b"a1", b"b1"]), memory(&[b"a2", b"c1"])];
        let comparator: Arc<dyn RawComparator> = Arc::new(KeyPrefixComparator::new(1));
        let mut stream = merge(inputs, comparator, Some(first_wins())).unwrap();
        let out = collect_records(&mut stream).unwrap();
        assert_eq!(out, vec![b"a1".to_vec(), b"b1".to_vec(), b"c1".to_vec()]);
        assert_eq!(stream.records_read(), 4);
    }

    #[test]
    fn test_write_merge_reports_stats() {
        let inputs = vec![memory(&[b"aa", b"cc"]), memory(&[b"bb"])];
        let mut out: Vec<Vec<u8>> = Vec::new();
        let stats = write_merge(inputs, &bytewise(), None, &mut out).unwrap();
        assert_eq!(out, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);
        assert_eq!(
            stats,
            MergeStats {
                inputs: 2,
                records_read: 3,
                bytes_read: 18,
                local_bytes_read: 0,
                records_written: 3,
                bytes_written: 18,
            }
        );
    }

    #[test]
    fn test_write_merge_with_combiner_shrinks_output() {
        let inputs = vec![memory(&[b"x1", b"y1"]), memory(&[b"x2", b"y2"])];
        let comparator: Arc<dyn RawComparator> = Arc::new(KeyPrefixComparator::new(1));
        let mut out: Vec<Vec<u8>> = Vec::new();
        let stats = write_merge(inputs, &comparator, Some(first_wins().as_ref()), &mut out).unwrap();
        assert_eq!(out, vec![b"x1".to_vec(), b"y1".to_vec()]);
        assert_eq!(stats.records_read, 4);
        assert_eq!(stats.records_written, 2);
    }

    #[test]
    fn test_merge_to_file_round_trip_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pass-0");
        let inputs = vec![memory(&[b"m", b"o"]), memory(&[b"n"])];
        let (input, stats) =
            merge_to_file(inputs, &bytewise(), None, path.clone(), CompressionKind::Gzip, true).unwrap();
        assert_eq!(stats.records_written, 3);
        assert!(path.exists());
        assert_eq!(input.uncompressed_len(), Some(stats.bytes_written));

        let mut stream = merge(vec![input], bytewise(), None).unwrap();
        let out = collect_records(&mut stream).unwrap();
        assert_eq!(out, vec![b"m".to_vec(), b"n".to_vec(), b"o".to_vec()]);
        drop(stream);
        assert!(!path.exists());
    }

    #[test]
    fn test_stream_charges_only_temp_file_reads() {
        let dir = TempDir::new().unwrap();
        let (on_disk, stats) = merge_to_file(
            vec![memory(&[b"bb"])],
            &bytewise(),
            None,
            dir.path().join("pass-1"),
            CompressionKind::Deflate,
            true,
        )
        .unwrap();
        assert_eq!(stats.local_bytes_read, 0);

        let metrics = Arc::new(ChannelMetrics::new());
        let mut stream = merge(vec![on_disk, memory(&[b"aa", b"cc"])], bytewise(), None)
            .unwrap()
            .with_metrics(Arc::clone(&metrics));
        let out = collect_records(&mut stream).unwrap();
        assert_eq!(out, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);
        // Charged once the stream runs dry, not again on drop.
        assert_eq!(metrics.local_bytes_read(), 6);
        drop(stream);
        assert_eq!(metrics.local_bytes_read(), 6);
    }

    #[test]
    fn test_corrupt_input_fails_merge() {
        let mut input = MemoryInput::from_records([&b"abc"[..]], CompressionKind::None, true).unwrap();
        let last = input.data.len() - 1;
        input.data[last] ^= 0xff;
        let result = merge(vec![RecordInput::Memory(input)], bytewise(), None)
            .and_then(|mut s| collect_records(&mut s));
        assert!(result.unwrap_err().is_corruption());
    }
}
