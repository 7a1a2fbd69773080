//! Integration test: TCP channel from producer spill buffers to a consumer.
//!
//! Validates that:
//! - Sorted producers streaming several batches each are merged by the
//!   consumer into one sorted stream per partition
//! - Unsorted streams arrive per task in write order through blocking readers
//! - A producer numbered outside the consumer's task range is rejected with
//!   a protocol violation on both ends

use std::sync::Arc;
use std::thread;

use jet_shuffle::codec::CompressionKind;
use jet_shuffle::channel::{TcpInputChannel, TcpInputOptions, TcpOutputChannel, TcpOutputOptions};
use jet_shuffle::config::{SpillConfig, TcpChannelConfig};
use jet_shuffle::merge::{MergeReaderOptions, MultiInputMergeReader};
use jet_shuffle::record::{BytewiseComparator, FnPartitioner, Partitioner, RawRecordSource};
use jet_shuffle::{ChannelMetrics, JetError, JobId, ServerAddress, StaticCoordinator, TaskId};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Partition by the last digit of the key in `key-NNNNN-T`.
fn partition_of(record: &[u8], n: u32) -> u32 {
    u32::from(record.get(8).copied().unwrap_or(0)) % n
}

fn parity_partitioner() -> Arc<dyn Partitioner> {
    Arc::new(FnPartitioner(partition_of))
}

/// Coordinator with a single consuming task owning `partitions`.
fn coordinator(consumer: &TaskId, partitions: Vec<u32>, port: u16) -> Arc<StaticCoordinator> {
    let coordinator = Arc::new(StaticCoordinator::new());
    coordinator.set_partitions(consumer.clone(), partitions);
    coordinator.set_task_server(consumer.clone(), ServerAddress::new("127.0.0.1", port));
    coordinator
}

fn output_options(job: JobId, task: u32, consumer: &TaskId) -> TcpOutputOptions {
    TcpOutputOptions {
        job_id: job,
        sending_task: task,
        downstream_tasks: vec![consumer.clone()],
        partition_count: 2,
        spill: SpillConfig {
            // Small arena so every producer sends several batches.
            buffer_size: 2048,
            ..SpillConfig::default()
        },
        config: TcpChannelConfig::default(),
    }
}

fn producer_records(task: u32, count: u32) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("key-{:05}-{task}", (i * 7919 + task * 31) % 10_000).into_bytes())
        .collect()
}

fn drain<S: RawRecordSource + ?Sized>(source: &mut S) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(r) = source.next_record().unwrap() {
        out.push(r.to_vec());
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_sorted_producers_merge_at_consumer() {
    let temp = TempDir::new().unwrap();
    let job = JobId::new();
    let consumer = TaskId::new("Reduce", 1);
    let metrics = Arc::new(ChannelMetrics::new());

    let mut reader = MultiInputMergeReader::new(
        MergeReaderOptions::new(temp.path()),
        Arc::new(BytewiseComparator),
        None,
        None,
        Arc::clone(&metrics),
    )
    .unwrap();
    reader.assign_partitions(vec![0, 1], 2).unwrap();
    let input = TcpInputChannel::bind(
        "127.0.0.1:0",
        TcpInputOptions {
            task_count: 2,
            partitions: vec![0, 1],
            compression: CompressionKind::Deflate,
        },
        Some(reader.input_handle()),
        Arc::clone(&metrics),
    )
    .unwrap();
    let coordinator = coordinator(&consumer, vec![0, 1], input.local_addr().port());

    let producers: Vec<_> = (1..=2u32)
        .map(|task| {
            let coordinator = Arc::clone(&coordinator);
            let consumer = consumer.clone();
            thread::spawn(move || {
                let mut output = TcpOutputChannel::sorted(
                    output_options(job, task, &consumer),
                    coordinator,
                    parity_partitioner(),
                    Arc::new(BytewiseComparator),
                    Arc::new(ChannelMetrics::new()),
                )
                .unwrap();
                for record in producer_records(task, 600) {
                    output.write_record(&record).unwrap();
                }
                output.finish().unwrap()
            })
        })
        .collect();
    for p in producers {
        assert!(p.join().unwrap() > 2, "expected several batches per producer");
    }
    input.wait_complete().unwrap();
    assert_eq!(input.tasks_finished(), 2);

    let mut all: Vec<Vec<u8>> = producer_records(1, 600)
        .into_iter()
        .chain(producer_records(2, 600))
        .collect();
    all.sort();
    for partition in [0u32, 1] {
        assert_eq!(reader.current_partition(), Some(partition));
        let mut records = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            records.push(r.to_vec());
        }
        let expected: Vec<Vec<u8>> = all
            .iter()
            .filter(|r| partition_of(r, 2) == partition)
            .cloned()
            .collect();
        assert_eq!(records, expected);
        reader.next_partition();
    }
    assert!(metrics.snapshot().network_bytes_read > 0);
    reader.dispose();
}

#[test]
fn test_unsorted_streams_keep_write_order() {
    let job = JobId::new();
    let consumer = TaskId::new("Reduce", 1);
    let metrics = Arc::new(ChannelMetrics::new());
    let input = TcpInputChannel::bind(
        "127.0.0.1:0",
        TcpInputOptions {
            task_count: 1,
            partitions: vec![0, 1],
            compression: CompressionKind::Deflate,
        },
        None,
        Arc::clone(&metrics),
    )
    .unwrap();
    let coordinator = coordinator(&consumer, vec![0, 1], input.local_addr().port());
    let mut even = input.reader_for(1, 0).unwrap().open().unwrap();
    let mut odd = input.reader_for(1, 1).unwrap().open().unwrap();

    let records = producer_records(1, 500);
    let sent = records.clone();
    let producer = thread::spawn(move || {
        let mut output = TcpOutputChannel::new(
            output_options(job, 1, &consumer),
            coordinator,
            parity_partitioner(),
            Arc::new(ChannelMetrics::new()),
        )
        .unwrap();
        for record in &sent {
            output.write_record(record).unwrap();
        }
        output.finish().unwrap();
    });

    let odd_reader = thread::spawn(move || drain(&mut odd));
    let even_records = drain(&mut even);
    let odd_records = odd_reader.join().unwrap();
    producer.join().unwrap();
    input.wait_complete().unwrap();

    let by_parity = |p: u32| -> Vec<Vec<u8>> {
        records
            .iter()
            .filter(|r| partition_of(r, 2) == p)
            .cloned()
            .collect()
    };
    assert_eq!(even_records, by_parity(0));
    assert_eq!(odd_records, by_parity(1));
}

#[test]
fn test_producer_outside_task_range_rejected() {
    let job = JobId::new();
    let consumer = TaskId::new("Reduce", 1);
    let input = TcpInputChannel::bind(
        "127.0.0.1:0",
        TcpInputOptions {
            task_count: 2,
            partitions: vec![0, 1],
            compression: CompressionKind::Deflate,
        },
        None,
        Arc::new(ChannelMetrics::new()),
    )
    .unwrap();
    let coordinator = coordinator(&consumer, vec![0, 1], input.local_addr().port());

    let mut output = TcpOutputChannel::new(
        output_options(job, 3, &consumer),
        coordinator,
        parity_partitioner(),
        Arc::new(ChannelMetrics::new()),
    )
    .unwrap();
    output.write_record(b"stray").unwrap();
    let err = output.finish().unwrap_err();
    match err.root() {
        JetError::Remote { kind, .. } => assert_eq!(kind, "PROTOCOL_VIOLATION"),
        other => panic!("unexpected {other:?}"),
    }

    let err = input.wait_complete().unwrap_err();
    assert!(err.is_protocol_violation());
}
