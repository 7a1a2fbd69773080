//! Integration test: sorted spilling end to end.
//!
//! Validates that:
//! - Several spills of a sorted writer are merged into one partition file
//!   whose index has one entry per partition plus the sentinel
//! - Every partition reads back complete and in comparator order
//! - An unsorted writer keeps each partition's records in write order

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use jet_shuffle::codec::CompressionKind;
use jet_shuffle::partition_file::{index_path, read_index_file, PartitionFileReader};
use jet_shuffle::record::{BytewiseComparator, FnPartitioner, Partitioner, RawRecordSource};
use jet_shuffle::spill::{SortedSpillOptions, SortedSpillSink, SpillBuffer, SpillBufferOptions, SpillSink, UnsortedSpillSink};
use jet_shuffle::RawComparator;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Record with a big-endian key followed by filler, `len` bytes in total.
fn make_record(key: u32, len: usize) -> Vec<u8> {
    let mut record = key.to_be_bytes().to_vec();
    record.resize(len, (key % 251) as u8);
    record
}

fn key_of(record: &[u8]) -> u32 {
    u32::from_be_bytes([record[0], record[1], record[2], record[3]])
}

/// Keys spread over one shared range, so every spill overlaps the others.
fn keys(count: usize, seed: u32) -> Vec<u32> {
    let mut state = seed;
    (0..count)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 8) % 1000
        })
        .collect()
}

fn key_partitioner() -> Arc<dyn Partitioner> {
    Arc::new(FnPartitioner(|record: &[u8], n: u32| key_of(record) % n))
}

fn wait_for_spills<S: SpillSink>(buffer: &SpillBuffer<S>, count: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while buffer.spills_completed() < count {
        assert!(Instant::now() < deadline, "spill {count} did not complete");
        thread::sleep(Duration::from_millis(5));
    }
}

fn read_partition(reader: &PartitionFileReader, partition: u32) -> Vec<Vec<u8>> {
    let mut records = reader.partition_records(partition).unwrap();
    let mut out = Vec::new();
    while let Some(r) = records.next_record().unwrap() {
        out.push(r.to_vec());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_three_spills_merge_into_one_sorted_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("map-1");

    // 128_000 * 0.25 = 32_000 bytes per spill trigger. 100 framed records
    // of 320 bytes and 150 of 214 bytes each reach it exactly on their last
    // record; the final 80 records stay below it and spill at finish.
    let mut options = SpillBufferOptions::new(128_000, 2);
    options.spill_threshold = 0.25;
    let mut sorted = SortedSpillOptions::new(&path, 2);
    sorted.compression = CompressionKind::Deflate;
    let sink = SortedSpillSink::new(sorted, Arc::new(BytewiseComparator), None).unwrap();
    let mut buffer = SpillBuffer::new(options, key_partitioner(), sink).unwrap();

    let batches = [(100usize, 316usize, 1u32), (150, 210, 2), (80, 210, 3)];
    let mut written = Vec::new();
    for (i, (count, len, seed)) in batches.into_iter().enumerate() {
        for key in keys(count, seed) {
            let record = make_record(key, len);
            buffer.write_record(&record).unwrap();
            written.push(record);
        }
        if i < 2 {
            wait_for_spills(&buffer, i as u32 + 1);
        }
    }
    assert_eq!(buffer.spill_count(), 2);

    let mut sink = buffer.finish().unwrap();
    assert_eq!(sink.spill_files().len(), 3);
    let info = sink.finish_output().unwrap();
    assert!(sink.spill_files().is_empty());
    let mut left: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    left.sort();
    assert_eq!(left, vec!["map-1".to_string(), "map-1.index".to_string()]);

    let (partition_count, entries) = read_index_file(&index_path(&info.data_path)).unwrap();
    assert_eq!(partition_count, 2);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries.iter().map(|e| e.partition).collect::<Vec<_>>(), vec![0, 1]);

    let reader = PartitionFileReader::open(&info.data_path, CompressionKind::Deflate);
    let comparator = BytewiseComparator;
    let mut total = 0;
    for partition in 0..2u32 {
        let records = read_partition(&reader, partition);
        assert!(records
            .windows(2)
            .all(|w| comparator.compare(&w[0], &w[1]) != std::cmp::Ordering::Greater));
        assert!(records.iter().all(|r| key_of(r) % 2 == partition));

        let mut expected: Vec<Vec<u8>> = written
            .iter()
            .filter(|r| key_of(r) % 2 == partition)
            .cloned()
            .collect();
        expected.sort();
        assert_eq!(records, expected);
        total += records.len();
    }
    assert_eq!(total, 330);
}

#[test]
fn test_unsorted_output_keeps_write_order() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("map-2");
    let sink = UnsortedSpillSink::create(&path, 3, CompressionKind::None, true).unwrap();
    let mut buffer = SpillBuffer::new(SpillBufferOptions::new(4096, 3), key_partitioner(), sink).unwrap();

    let records: Vec<Vec<u8>> = keys(2000, 7).into_iter().map(|k| make_record(k, 24)).collect();
    for record in &records {
        buffer.write_record(record).unwrap();
    }
    assert!(buffer.spill_count() > 1);
    let info = buffer.finish().unwrap().finish_output().unwrap();

    let reader = PartitionFileReader::open(&info.data_path, CompressionKind::None);
    for partition in 0..3u32 {
        let expected: Vec<Vec<u8>> = records
            .iter()
            .filter(|r| key_of(r) % 3 == partition)
            .cloned()
            .collect();
        assert_eq!(read_partition(&reader, partition), expected);
    }
}
