//! TCP channel output.
//!
//! Spills go straight from the frozen spill region to the consuming tasks,
//! one batch per destination per spill, with no intermediate file. Each
//! destination is a task of the downstream stage; its partitions and server
//! are looked up from the job coordinator when the first spill is sent.
//!
//! Every batch is acknowledged before the next one goes out. A failed
//! acknowledgment carries the consumer's error, which is returned as-is:
//! the TCP channel needs every participant alive, so nothing is retried.

use std::io::{BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::protocol::{read_ack, PartitionHeader, SegmentBatchHeader, FLAG_FINAL_SEGMENT, PARTITION_HEADER_LEN, SEGMENT_HEADER_LEN};
use crate::codec::{encode_segment, CompressionKind};
use crate::config::{SpillConfig, TcpChannelConfig};
use crate::error::{JetError, Result};
use crate::job::{JobCoordinator, JobId, ServerAddress, TaskId};
use crate::metrics::ChannelMetrics;
use crate::record::{Partitioner, RawComparator, RawRecordSink, RecordFraming};
use crate::spill::sorted::record_body;
use crate::spill::{ArenaView, RecordIndexEntry, SpillBuffer, SpillBufferOptions, SpillRegion, SpillSink};

#[derive(Debug, Clone)]
pub struct TcpOutputOptions {
    pub job_id: JobId,
    /// Task number of this producer (1-based), sent in every batch header.
    pub sending_task: u32,
    /// Tasks of the consuming stage.
    pub downstream_tasks: Vec<TaskId>,
    pub partition_count: u32,
    pub spill: SpillConfig,
    pub config: TcpChannelConfig,
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl Connection {
    fn open(server: &ServerAddress, timeout: Duration) -> Result<Self> {
        let addr = (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| JetError::Transport(format!("resolve {server}: {e}")))?
            .next()
            .ok_or_else(|| JetError::Transport(format!("no address for {server}")))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| JetError::Transport(format!("connect to {server}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::with_capacity(256 * 1024, stream),
        })
    }
}

struct Destination {
    task: TaskId,
    server: ServerAddress,
    partitions: Vec<u32>,
    connection: Option<Connection>,
}

/// Spill sink that sends each spill over the network.
pub struct TcpSpillSink {
    job_id: JobId,
    sending_task: u32,
    downstream: Vec<TaskId>,
    partition_count: u32,
    coordinator: Arc<dyn JobCoordinator>,
    destinations: Option<Vec<Destination>>,
    next_segment: u32,
    compression: CompressionKind,
    checksum: bool,
    config: TcpChannelConfig,
    metrics: Arc<ChannelMetrics>,
    payload: Vec<u8>,
    /// Sort every partition of a spill before sending it.
    comparator: Option<Arc<dyn RawComparator>>,
}

impl TcpSpillSink {
    pub fn new(options: &TcpOutputOptions, coordinator: Arc<dyn JobCoordinator>, metrics: Arc<ChannelMetrics>) -> Self {
        Self {
            job_id: options.job_id,
            sending_task: options.sending_task,
            downstream: options.downstream_tasks.clone(),
            partition_count: options.partition_count,
            coordinator,
            destinations: None,
            next_segment: 0,
            compression: options.spill.compression,
            checksum: options.spill.checksum,
            config: options.config.clone(),
            metrics,
            payload: Vec::new(),
            comparator: None,
        }
    }

    /// Send every batch sorted by `comparator`, for consumers that merge.
    pub fn with_comparator(mut self, comparator: Arc<dyn RawComparator>) -> Self {
        self.comparator = Some(comparator);
        self
    }

    /// Batches sent to every destination so far.
    pub fn segments_sent(&self) -> u32 {
        self.next_segment
    }

    fn destinations(&mut self) -> Result<&mut Vec<Destination>> {
        if self.destinations.is_none() {
            let mut resolved = Vec::with_capacity(self.downstream.len());
            for task in &self.downstream {
                let partitions = self.coordinator.partitions_for_task(self.job_id, task)?;
                if let Some(p) = partitions.iter().find(|p| **p >= self.partition_count) {
                    return Err(JetError::Config(format!(
                        "task {task} owns partition {p} of {}",
                        self.partition_count
                    )));
                }
                let server = self.coordinator.task_server_for_task(self.job_id, task)?;
                tracing::debug!(%task, %server, ?partitions, "tcp destination resolved");
                resolved.push(Destination {
                    task: task.clone(),
                    server,
                    partitions,
                    connection: None,
                });
            }
            self.destinations = Some(resolved);
        }
        self.destinations
            .as_mut()
            .ok_or_else(|| JetError::InvalidState("tcp destinations unavailable".into()))
    }

    /// Send one batch to every destination. `encode` fills the segment of
    /// a partition; an empty result sends a zero size.
    fn send_batch<F>(&mut self, flags: u8, mut encode: F) -> Result<()>
    where
        F: FnMut(u32, &mut Vec<u8>) -> Result<()>,
    {
        let header = SegmentBatchHeader {
            flags,
            sending_task: self.sending_task,
            segment: self.next_segment,
        };
        let keep_alive = self.config.keep_alive;
        let timeout = self.config.connect_timeout();
        let metrics = Arc::clone(&self.metrics);
        let mut segment = Vec::new();
        for dest in self.destinations()?.iter_mut() {
            let mut connection = match dest.connection.take() {
                Some(c) => c,
                None => Connection::open(&dest.server, timeout)?,
            };
            connection.writer.write_all(&header.encode())?;
            let mut sent = SEGMENT_HEADER_LEN as u64;
            for &partition in &dest.partitions {
                segment.clear();
                encode(partition, &mut segment)?;
                let size = u32::try_from(segment.len()).map_err(|_| {
                    JetError::InvalidState(format!("segment of partition {partition} exceeds u32 size"))
                })?;
                PartitionHeader { partition, size }.write_to(&mut connection.writer)?;
                connection.writer.write_all(&segment)?;
                sent += PARTITION_HEADER_LEN as u64 + size as u64;
            }
            connection.writer.flush()?;
            read_ack(&mut connection.reader).map_err(|e| {
                tracing::error!(task = %dest.task, server = %dest.server, "tcp batch rejected: {}", e);
                e
            })?;
            metrics.add_network_bytes_written(sent);
            if keep_alive && header.flags & FLAG_FINAL_SEGMENT == 0 {
                dest.connection = Some(connection);
            }
        }
        self.next_segment += 1;
        Ok(())
    }

    /// Send the final (empty) batch and close every connection.
    pub fn finish_output(&mut self) -> Result<u32> {
        self.send_batch(FLAG_FINAL_SEGMENT, |_, _| Ok(()))?;
        if let Some(destinations) = self.destinations.as_mut() {
            for dest in destinations.iter_mut() {
                dest.connection = None;
            }
        }
        tracing::debug!(segments = self.next_segment, "tcp output complete");
        Ok(self.next_segment)
    }
}

impl SpillSink for TcpSpillSink {
    fn adjust_options(&self, options: &mut SpillBufferOptions) {
        // Consumers merge the stream raw.
        options.framing = RecordFraming::LengthPrefixed;
        if self.comparator.is_some() {
            options.coalesce_records = false;
            options.allow_record_wrapping = false;
        }
    }

    fn prepare_partition(
        &mut self,
        partition: u32,
        entries: &mut [RecordIndexEntry],
        arena: &ArenaView<'_>,
    ) -> Result<()> {
        let Some(comparator) = self.comparator.as_ref() else {
            return Ok(());
        };
        if entries.iter().any(|e| arena.bytes(e).contiguous().is_none()) {
            return Err(JetError::InvalidState(format!(
                "partition {partition} has records wrapping the arena end"
            )));
        }
        entries.sort_by(|a, b| comparator.compare(record_body(arena, a), record_body(arena, b)));
        Ok(())
    }

    fn write_spill(&mut self, spill: &SpillRegion<'_>) -> Result<()> {
        let compression = self.compression;
        let checksum = self.checksum;
        let mut payload = std::mem::take(&mut self.payload);
        let result = self.send_batch(0, |partition, segment| {
            let entries = &spill.partitions[partition as usize];
            if entries.is_empty() {
                return Ok(());
            }
            payload.clear();
            for entry in entries {
                spill.arena.bytes(entry).write_to(&mut payload)?;
            }
            segment.extend_from_slice(&encode_segment(&payload, compression, checksum)?);
            Ok(())
        });
        self.payload = payload;
        result?;
        tracing::debug!(spill = spill.spill_number, records = spill.entry_count(), "tcp spill sent");
        Ok(())
    }
}

pub struct TcpOutputChannel {
    buffer: Option<SpillBuffer<TcpSpillSink>>,
    metrics: Arc<ChannelMetrics>,
}

impl TcpOutputChannel {
    pub fn new(
        options: TcpOutputOptions,
        coordinator: Arc<dyn JobCoordinator>,
        partitioner: Arc<dyn Partitioner>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        Self::open(options, coordinator, partitioner, None, metrics)
    }

    /// Like [`new`](Self::new), with every batch sorted by `comparator` so
    /// the consumer can merge what it receives.
    pub fn sorted(
        options: TcpOutputOptions,
        coordinator: Arc<dyn JobCoordinator>,
        partitioner: Arc<dyn Partitioner>,
        comparator: Arc<dyn RawComparator>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        Self::open(options, coordinator, partitioner, Some(comparator), metrics)
    }

    fn open(
        options: TcpOutputOptions,
        coordinator: Arc<dyn JobCoordinator>,
        partitioner: Arc<dyn Partitioner>,
        comparator: Option<Arc<dyn RawComparator>>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        if options.sending_task == 0 {
            return Err(JetError::Config("task numbers start at 1".into()));
        }
        let mut sink = TcpSpillSink::new(&options, coordinator, Arc::clone(&metrics));
        if let Some(comparator) = comparator {
            sink = sink.with_comparator(comparator);
        }
        let buffer = SpillBuffer::new(
            SpillBufferOptions::from_config(&options.spill, options.partition_count),
            partitioner,
            sink,
        )?;
        tracing::info!(
            task = options.sending_task,
            destinations = options.downstream_tasks.len(),
            "tcp output channel opened"
        );
        Ok(Self {
            buffer: Some(buffer),
            metrics,
        })
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.buffer
            .as_mut()
            .ok_or_else(|| JetError::InvalidState("tcp output channel finished".into()))?
            .write_record(record)
    }

    /// Send the remaining records and the final batch. Returns the number of
    /// batches each destination received.
    pub fn finish(&mut self) -> Result<u32> {
        let buffer = self
            .buffer
            .take()
            .ok_or_else(|| JetError::InvalidState("tcp output channel finished".into()))?;
        let spills = buffer.spill_count();
        let mut sink = buffer.finish()?;
        let segments = sink.finish_output()?;
        self.metrics.record_spills(spills as u64);
        tracing::info!(spills, segments, "tcp output channel finished");
        Ok(segments)
    }

    pub fn dispose(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.dispose();
        }
    }
}

impl RawRecordSink for TcpOutputChannel {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        TcpOutputChannel::write_record(self, record)
    }
}

impl Drop for TcpOutputChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}
