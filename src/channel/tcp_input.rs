//! TCP channel input.
//!
//! An accept loop hands each inbound connection to its own handler thread.
//! A handler reads batches until the producer closes the connection:
//!
//! 1. the batch header, whose sending task must lie in `1..=task_count` and
//!    whose segment number must be the next one expected from that task
//! 2. one partition header and segment per partition of this consumer, in
//!    the order the partitions were given
//! 3. an acknowledgment, or the error that rejected the batch
//!
//! Segments are queued per (task, partition). A queue is consumed either by
//! a blocking reader from [`TcpInputChannel::reader_for`] while data is still
//! arriving, or, when the channel feeds a merge reader, handed over whole as
//! one memory input once the task's final batch arrives. Producers feeding
//! a merge reader sort every batch, so a queue of several segments is
//! merged into a single run on handoff.
//!
//! Protocol violations are fatal for the channel: they are acknowledged
//! with the error and reported by [`TcpInputChannel::wait_complete`].

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufReader, BufWriter, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::channel::protocol::{
    write_ack_error, write_ack_ok, PartitionHeader, SegmentBatchHeader, PARTITION_HEADER_LEN, SEGMENT_HEADER_LEN,
};
use crate::codec::{CompressionKind, SegmentHeader, SEGMENT_HEADER_SIZE};
use crate::error::{JetError, Result};
use crate::merge::input::{MemoryInput, RecordInput, StreamInput};
use crate::merge::primitive::write_merge;
use crate::merge::reader::MergeInputHandle;
use crate::metrics::ChannelMetrics;
use crate::record::RawComparator;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long a rejected connection is drained before it is closed.
const REJECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct TcpInputOptions {
    /// Number of producing tasks; valid sending task numbers are
    /// `1..=task_count`.
    pub task_count: u32,
    /// Partitions of this consumer, in the order producers send them.
    pub partitions: Vec<u32>,
    pub compression: CompressionKind,
}

#[derive(Default)]
struct SegmentQueue {
    segments: VecDeque<Vec<u8>>,
    segment_count: u64,
    uncompressed_len: u64,
    complete: bool,
    /// Claimed by a reader or handed to the merge reader.
    taken: bool,
}

struct InputState {
    queues: HashMap<(u32, u32), SegmentQueue>,
    /// Next expected segment number per sending task.
    next_segment: HashMap<u32, u32>,
    finished_tasks: u32,
    error: Option<Arc<JetError>>,
    shutdown: bool,
}

struct Shared {
    options: TcpInputOptions,
    state: Mutex<InputState>,
    changed: Condvar,
    merge: Option<MergeInputHandle>,
    metrics: Arc<ChannelMetrics>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fatal error for `wait_complete` and blocked readers.
    fn fail(&self, error: JetError) -> Arc<JetError> {
        let error = Arc::new(error);
        let mut state = self.lock();
        if state.error.is_none() {
            state.error = Some(Arc::clone(&error));
        }
        self.changed.notify_all();
        error
    }

    /// Validate a batch header against what has been received so far.
    fn check_header(&self, header: &SegmentBatchHeader) -> Result<()> {
        let task = header.sending_task;
        if task == 0 || task > self.options.task_count {
            return Err(JetError::Protocol(format!(
                "sending task {task} outside 1..={}",
                self.options.task_count
            )));
        }
        expect_segment(&self.lock(), header)
    }

    /// Queue a fully read batch.
    fn commit(&self, header: &SegmentBatchHeader, segments: Vec<(u32, Vec<u8>)>) -> Result<()> {
        let task = header.sending_task;
        let mut handoff = Vec::new();
        {
            let mut state = self.lock();
            if state.shutdown {
                return Err(JetError::Cancelled);
            }
            // Another connection of the same task may have committed this
            // segment since the header was checked.
            expect_segment(&state, header)?;
            for (partition, data) in segments {
                let queue = state.queues.entry((task, partition)).or_default();
                if !data.is_empty() {
                    queue.uncompressed_len += segment_uncompressed_len(&data)?;
                    queue.segment_count += 1;
                    queue.segments.push_back(data);
                }
            }
            if header.is_final() {
                state.next_segment.insert(task, u32::MAX);
                state.finished_tasks += 1;
                for &partition in &self.options.partitions {
                    let queue = state.queues.entry((task, partition)).or_default();
                    queue.complete = true;
                    if self.merge.is_some() && !queue.taken {
                        handoff.push((partition, std::mem::take(queue)));
                        queue.complete = true;
                        queue.taken = true;
                    }
                }
                tracing::debug!(task, finished = state.finished_tasks, "tcp input task complete");
            } else {
                state.next_segment.insert(task, header.segment + 1);
            }
            self.changed.notify_all();
        }
        if let Some(merge) = &self.merge {
            for (partition, queue) in handoff {
                let input = queue_to_input(queue, self.options.compression, merge.comparator())?;
                merge.add_input(partition, input)?;
            }
        }
        Ok(())
    }
}

fn expect_segment(state: &InputState, header: &SegmentBatchHeader) -> Result<()> {
    let task = header.sending_task;
    let expected = state.next_segment.get(&task).copied().unwrap_or(0);
    if expected == u32::MAX {
        return Err(JetError::Protocol(format!("task {task} sent data after its final segment")));
    }
    if header.segment != expected {
        return Err(JetError::Protocol(format!(
            "task {task} sent segment {} but {expected} was expected",
            header.segment
        )));
    }
    Ok(())
}

fn segment_uncompressed_len(segment: &[u8]) -> Result<u64> {
    let header: &[u8; SEGMENT_HEADER_SIZE] = segment
        .get(..SEGMENT_HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| JetError::Corrupt(format!("segment of {} bytes has no header", segment.len())))?;
    Ok(SegmentHeader::decode(header)?.uncompressed_len)
}

/// One merge input from a completed queue. Every segment is a sorted run of
/// its own, so a queue of several segments is merged down to one run first.
fn queue_to_input(
    queue: SegmentQueue,
    compression: CompressionKind,
    comparator: &Arc<dyn RawComparator>,
) -> Result<RecordInput> {
    match queue.segment_count {
        0 => Ok(RecordInput::empty()),
        1 => Ok(RecordInput::Memory(MemoryInput {
            data: queue.segments.into_iter().flatten().collect(),
            segment_count: 1,
            compression,
            uncompressed_len: queue.uncompressed_len,
            reservation: None,
        })),
        _ => {
            let mut runs = Vec::with_capacity(queue.segments.len());
            for data in queue.segments {
                let uncompressed_len = segment_uncompressed_len(&data)?;
                runs.push(RecordInput::Memory(MemoryInput {
                    data,
                    segment_count: 1,
                    compression,
                    uncompressed_len,
                    reservation: None,
                }));
            }
            let mut records: Vec<Vec<u8>> = Vec::new();
            write_merge(runs, comparator, None, &mut records)?;
            let merged = MemoryInput::from_records(records.iter().map(Vec::as_slice), compression, true)?;
            Ok(RecordInput::Memory(merged))
        }
    }
}

pub struct TcpInputChannel {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl TcpInputChannel {
    /// Listen on `addr`. With `merge` set, each (task, partition) stream is
    /// delivered to it once complete; otherwise streams are taken with
    /// [`reader_for`](Self::reader_for).
    pub fn bind(
        addr: impl ToSocketAddrs,
        options: TcpInputOptions,
        merge: Option<MergeInputHandle>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        if options.task_count == 0 {
            return Err(JetError::Config("tcp input needs at least one producer".into()));
        }
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            options,
            state: Mutex::new(InputState {
                queues: HashMap::new(),
                next_segment: HashMap::new(),
                finished_tasks: 0,
                error: None,
                shutdown: false,
            }),
            changed: Condvar::new(),
            merge,
            metrics,
        });
        let stop = Arc::new(AtomicBool::new(false));
        let accept_shared = Arc::clone(&shared);
        let accept_stop = Arc::clone(&stop);
        let accept = thread::Builder::new()
            .name("tcp-input-accept".into())
            .spawn(move || accept_loop(listener, accept_shared, accept_stop))?;
        tracing::info!(%local_addr, "tcp input channel listening");
        Ok(Self {
            shared,
            local_addr,
            stop,
            accept: Some(accept),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Blocking stream of the segments `task` sends for `partition`. It ends
    /// after the task's final batch. Each stream can be taken once.
    pub fn reader_for(&self, task: u32, partition: u32) -> Result<RecordInput> {
        if task == 0 || task > self.shared.options.task_count {
            return Err(JetError::InvalidState(format!("no producer task {task}")));
        }
        if !self.shared.options.partitions.contains(&partition) {
            return Err(JetError::InvalidState(format!("partition {partition} is not read here")));
        }
        {
            let mut state = self.shared.lock();
            let queue = state.queues.entry((task, partition)).or_default();
            if queue.taken {
                return Err(JetError::InvalidState(format!(
                    "stream of task {task} partition {partition} already taken"
                )));
            }
            queue.taken = true;
        }
        Ok(RecordInput::Stream(StreamInput {
            reader: Box::new(QueueReader {
                shared: Arc::clone(&self.shared),
                key: (task, partition),
                current: Vec::new(),
                pos: 0,
            }),
            segment_count: None,
            compression: self.shared.options.compression,
            uncompressed_len: None,
        }))
    }

    /// Number of producers whose final batch has arrived.
    pub fn tasks_finished(&self) -> u32 {
        self.shared.lock().finished_tasks
    }

    /// Block until every producer has sent its final batch.
    pub fn wait_complete(&self) -> Result<()> {
        let mut state = self.shared.lock();
        loop {
            if let Some(e) = &state.error {
                return Err(JetError::background_shared("tcp input", e));
            }
            if state.finished_tasks >= self.shared.options.task_count {
                return Ok(());
            }
            if state.shutdown {
                return Err(JetError::Cancelled);
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Stop accepting and release blocked readers. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                tracing::warn!("tcp accept thread panicked");
            }
        }
    }
}

impl Drop for TcpInputChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let conn_shared = Arc::clone(&shared);
                let spawned = thread::Builder::new()
                    .name("tcp-input-conn".into())
                    .spawn(move || {
                        if let Err(e) = handle_connection(stream, &conn_shared) {
                            tracing::warn!(%peer, "tcp input connection failed: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!("cannot spawn tcp input handler: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => tracing::warn!("accept error: {}", e),
        }
    }
}

fn handle_connection(stream: TcpStream, shared: &Shared) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = BufReader::with_capacity(256 * 1024, stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    while let Some(header) = SegmentBatchHeader::read_from(&mut reader)? {
        let batch = shared
            .check_header(&header)
            .and_then(|()| read_batch(&mut reader, &shared.options.partitions))
            .and_then(|(segments, bytes)| {
                shared.commit(&header, segments)?;
                Ok(bytes)
            });
        match batch {
            Ok(bytes) => {
                shared.metrics.add_network_bytes_read(bytes);
                write_ack_ok(&mut writer)?;
            }
            Err(e) => {
                tracing::error!(task = header.sending_task, segment = header.segment, "batch rejected: {}", e);
                let fatal = e.is_protocol_violation() || e.is_corruption();
                let error = if fatal { shared.fail(e) } else { Arc::new(e) };
                // Best effort: the peer may already be gone.
                if write_ack_error(&mut writer, &error).is_ok() {
                    drain_after_rejection(&mut reader, writer.get_ref());
                }
                return Err(JetError::background_shared("tcp input batch", &error));
            }
        }
    }
    Ok(())
}

/// Discard what the peer still sends so closing does not reset the
/// connection before the rejection is read.
fn drain_after_rejection<R: Read>(reader: &mut R, stream: &TcpStream) {
    if stream.set_read_timeout(Some(REJECTION_DRAIN_TIMEOUT)).is_ok() {
        let _ = io::copy(reader, &mut io::sink());
    }
}

/// Read one partition header and segment per expected partition.
fn read_batch<R: Read>(reader: &mut R, partitions: &[u32]) -> Result<(Vec<(u32, Vec<u8>)>, u64)> {
    let mut segments = Vec::with_capacity(partitions.len());
    let mut bytes = SEGMENT_HEADER_LEN as u64;
    for &expected in partitions {
        let header = PartitionHeader::read_from(reader)?;
        if header.partition != expected {
            return Err(JetError::Protocol(format!(
                "partition {} received where {expected} was expected",
                header.partition
            )));
        }
        // Grows with what actually arrives; the size is the peer's claim.
        let size = u64::from(header.size);
        let mut data = Vec::new();
        let read = (&mut *reader).take(size).read_to_end(&mut data)? as u64;
        if read != size {
            return Err(JetError::Transport(format!(
                "connection closed after {read} of {size} segment bytes"
            )));
        }
        bytes += PARTITION_HEADER_LEN as u64 + size;
        segments.push((expected, data));
    }
    Ok((segments, bytes))
}

// ── Queue Reader ───────────────────────────────────────────────────

/// Reads the queued segments of one (task, partition), blocking until more
/// arrive or the task completes.
struct QueueReader {
    shared: Arc<Shared>,
    key: (u32, u32),
    current: Vec<u8>,
    pos: usize,
}

impl QueueReader {
    /// Next segment, or `None` once the stream is complete.
    fn next_segment(&self) -> io::Result<Option<Vec<u8>>> {
        let mut state = self.shared.lock();
        loop {
            if let Some(e) = &state.error {
                return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
            }
            if state.shutdown {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, JetError::Cancelled.to_string()));
            }
            let queue = state.queues.entry(self.key).or_default();
            if let Some(segment) = queue.segments.pop_front() {
                return Ok(Some(segment));
            }
            if queue.complete {
                return Ok(None);
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Read for QueueReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.current.len() {
            match self.next_segment()? {
                Some(segment) => {
                    self.current = segment;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.pos);
        buf[..n].copy_from_slice(&self.current[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::channel::protocol::read_ack;
    use crate::codec::encode_segment;
    use crate::merge::reader::{MergeReaderOptions, MultiInputMergeReader};
    use crate::record::{collect_records, write_framed, BytewiseComparator};

    // ── Test Helpers ──

    fn segment(records: &[&[u8]]) -> Vec<u8> {
        let mut payload = Vec::new();
        for r in records {
            write_framed(&mut payload, r).unwrap();
        }
        encode_segment(&payload, CompressionKind::Deflate, true).unwrap()
    }

    fn send_batch(stream: &mut TcpStream, task: u32, segment_no: u32, flags: u8, parts: &[(u32, Vec<u8>)]) -> Result<()> {
        let header = SegmentBatchHeader {
            flags,
            sending_task: task,
            segment: segment_no,
        };
        stream.write_all(&header.encode()).unwrap();
        for (partition, data) in parts {
            PartitionHeader {
                partition: *partition,
                size: data.len() as u32,
            }
            .write_to(stream)
            .unwrap();
            stream.write_all(data).unwrap();
        }
        read_ack(stream)
    }

    fn options(task_count: u32, partitions: Vec<u32>) -> TcpInputOptions {
        TcpInputOptions {
            task_count,
            partitions,
            compression: CompressionKind::Deflate,
        }
    }

    #[test]
    fn test_reader_streams_segments_until_final() {
        let channel = TcpInputChannel::bind("127.0.0.1:0", options(1, vec![5]), None, Arc::new(ChannelMetrics::new())).unwrap();
        let input = channel.reader_for(1, 5).unwrap();
        assert!(channel.reader_for(1, 5).is_err());

        let mut stream = TcpStream::connect(channel.local_addr()).unwrap();
        send_batch(&mut stream, 1, 0, 0, &[(5, segment(&[b"a", b"b"]))]).unwrap();
        send_batch(&mut stream, 1, 1, 0, &[(5, Vec::new())]).unwrap();
        send_batch(&mut stream, 1, 2, 0, &[(5, segment(&[b"c"]))]).unwrap();
        send_batch(&mut stream, 1, 3, crate::channel::protocol::FLAG_FINAL_SEGMENT, &[(5, Vec::new())]).unwrap();

        let mut open = input.open().unwrap();
        assert_eq!(
            collect_records(&mut open).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
        channel.wait_complete().unwrap();
        assert_eq!(channel.tasks_finished(), 1);
    }

    #[test]
    fn test_task_zero_rejected_before_partition_data() {
        let channel = TcpInputChannel::bind("127.0.0.1:0", options(2, vec![0]), None, Arc::new(ChannelMetrics::new())).unwrap();
        let mut stream = TcpStream::connect(channel.local_addr()).unwrap();
        let header = SegmentBatchHeader {
            flags: 0,
            sending_task: 0,
            segment: 0,
        };
        // Only the header: the rejection must not wait for partition data.
        stream.write_all(&header.encode()).unwrap();
        match read_ack(&mut stream).unwrap_err() {
            JetError::Remote { kind, .. } => assert_eq!(kind, "PROTOCOL_VIOLATION"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(channel.wait_complete().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_out_of_order_segment_rejected() {
        let channel = TcpInputChannel::bind("127.0.0.1:0", options(1, vec![0]), None, Arc::new(ChannelMetrics::new())).unwrap();
        let mut stream = TcpStream::connect(channel.local_addr()).unwrap();
        send_batch(&mut stream, 1, 0, 0, &[(0, segment(&[b"x"]))]).unwrap();
        let header = SegmentBatchHeader {
            flags: 0,
            sending_task: 1,
            segment: 2,
        };
        stream.write_all(&header.encode()).unwrap();
        assert!(read_ack(&mut stream).is_err());
        assert!(channel.wait_complete().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_segment_committed_twice_rejected() {
        let channel = TcpInputChannel::bind("127.0.0.1:0", options(1, vec![0]), None, Arc::new(ChannelMetrics::new())).unwrap();
        let header = SegmentBatchHeader {
            flags: 0,
            sending_task: 1,
            segment: 0,
        };
        // Two connections of one task pass the header check before either commits.
        channel.shared.check_header(&header).unwrap();
        channel.shared.check_header(&header).unwrap();
        channel.shared.commit(&header, vec![(0, segment(&[b"a"]))]).unwrap();
        let err = channel.shared.commit(&header, vec![(0, segment(&[b"a"]))]).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(channel.shared.lock().queues[&(1, 0)].segment_count, 1);
    }

    #[test]
    fn test_oversized_partition_claim_fails_on_short_data() {
        let mut wire = Vec::new();
        PartitionHeader {
            partition: 0,
            size: u32::MAX,
        }
        .write_to(&mut wire)
        .unwrap();
        wire.extend_from_slice(b"abc");
        let err = read_batch(&mut std::io::Cursor::new(wire), &[0]).unwrap_err();
        assert!(matches!(err, JetError::Transport(_)), "unexpected {err:?}");
    }

    #[test]
    fn test_partition_mismatch_rejected() {
        let channel = TcpInputChannel::bind("127.0.0.1:0", options(1, vec![0, 1]), None, Arc::new(ChannelMetrics::new())).unwrap();
        let mut stream = TcpStream::connect(channel.local_addr()).unwrap();
        let result = send_batch(&mut stream, 1, 0, 0, &[(1, Vec::new()), (0, Vec::new())]);
        assert!(matches!(result, Err(JetError::Remote { .. })));
        assert!(channel.wait_complete().unwrap_err().is_protocol_violation());
    }

    #[test]
    fn test_completed_streams_feed_merge_reader() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut reader = MultiInputMergeReader::new(
            MergeReaderOptions::new(temp.path()),
            Arc::new(BytewiseComparator),
            None,
            None,
            Arc::new(ChannelMetrics::new()),
        )
        .unwrap();
        reader.assign_partitions(vec![0], 2).unwrap();
        let metrics = Arc::new(ChannelMetrics::new());
        let channel = TcpInputChannel::bind(
            "127.0.0.1:0",
            options(2, vec![0]),
            Some(reader.input_handle()),
            Arc::clone(&metrics),
        )
        .unwrap();

        let addr = channel.local_addr();
        let producers: Vec<_> = [(1u32, vec![&b"b"[..], b"d"]), (2, vec![&b"a"[..], b"c"])]
            .into_iter()
            .map(|(task, records)| {
                let data = segment(&records);
                thread::spawn(move || {
                    let mut stream = TcpStream::connect(addr).unwrap();
                    send_batch(&mut stream, task, 0, 0, &[(0, data)]).unwrap();
                    send_batch(&mut stream, task, 1, crate::channel::protocol::FLAG_FINAL_SEGMENT, &[(0, Vec::new())])
                        .unwrap();
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        channel.wait_complete().unwrap();
        assert!(channel.reader_for(1, 0).is_err());

        let mut records = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            records.push(r.to_vec());
        }
        assert_eq!(records, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
        assert!(metrics.snapshot().network_bytes_read > 0);
    }
}
