//! Circular spill buffer with a background spill thread.
//!
//! The producer appends records at the logical head of the arena. When the
//! unspilled bytes reach the trigger threshold, the pending index entries are
//! frozen and sent to the spill thread while the producer keeps appending to
//! the remaining capacity. At most one spill is in flight; a producer that
//! runs out of room waits for it to release space.
//!
//! ```text
//!   released            pending_start               head
//!      |----- in flight -----|------- pending -------|---- free ----|
//!      <------------------------ capacity ------------------------->
//! ```
//!
//! A failure on the spill thread is stored and re-raised on the producer's
//! next blocking call or at `finish`.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{JetError, Result};
use crate::record::{Partitioner, RecordFraming, RECORD_LENGTH_SIZE};
use crate::spill::arena::{RecordIndexEntry, SpillArena};
use crate::spill::{SpillBufferOptions, SpillRegion, SpillSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpillPhase {
    Idle,
    Requested,
    InProgress,
}

struct SpillState {
    /// Logical offset below which the arena is free again.
    released: u64,
    phase: SpillPhase,
    spills_completed: u32,
    error: Option<Arc<JetError>>,
    cancelled: bool,
}

struct Shared {
    arena: SpillArena,
    state: Mutex<SpillState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SpillState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SpillRequest {
    spill_number: u32,
    start: u64,
    end: u64,
    partitions: Vec<Vec<RecordIndexEntry>>,
}

fn check_state(state: &SpillState) -> Result<()> {
    if let Some(e) = &state.error {
        return Err(JetError::background_shared("spill", e));
    }
    if state.cancelled {
        return Err(JetError::Cancelled);
    }
    Ok(())
}

// ── SpillBuffer ────────────────────────────────────────────────────

pub struct SpillBuffer<S: SpillSink> {
    shared: Arc<Shared>,
    options: SpillBufferOptions,
    partitioner: Arc<dyn Partitioner>,
    threshold: u64,
    head: u64,
    pending_start: u64,
    pending: Vec<Vec<RecordIndexEntry>>,
    /// Partition and end offset of the last record, for coalescing.
    last_write: Option<(u32, u64)>,
    spills_requested: u32,
    records_written: u64,
    sender: Option<Sender<SpillRequest>>,
    worker: Option<JoinHandle<S>>,
}

impl<S: SpillSink> SpillBuffer<S> {
    pub fn new(mut options: SpillBufferOptions, partitioner: Arc<dyn Partitioner>, sink: S) -> Result<Self> {
        sink.adjust_options(&mut options);
        options.validate()?;

        let shared = Arc::new(Shared {
            arena: SpillArena::new(options.capacity),
            state: Mutex::new(SpillState {
                released: 0,
                phase: SpillPhase::Idle,
                spills_completed: 0,
                error: None,
                cancelled: false,
            }),
            changed: Condvar::new(),
        });

        // One request in flight at a time; the slot just avoids a rendezvous.
        let (tx, rx) = bounded(1);
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("spill-writer".into())
            .spawn(move || spill_loop(worker_shared, rx, sink))?;

        let threshold = options.threshold_bytes();
        let pending = vec![Vec::new(); options.partition_count as usize];
        Ok(Self {
            shared,
            options,
            partitioner,
            threshold,
            head: 0,
            pending_start: 0,
            pending,
            last_write: None,
            spills_requested: 0,
            records_written: 0,
            sender: Some(tx),
            worker: Some(worker),
        })
    }

    pub fn options(&self) -> &SpillBufferOptions {
        &self.options
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Spills handed to the spill thread so far.
    pub fn spill_count(&self) -> u32 {
        self.spills_requested
    }

    pub fn spills_completed(&self) -> u32 {
        self.shared.lock().spills_completed
    }

    pub fn phase(&self) -> SpillPhase {
        self.shared.lock().phase
    }

    /// Handle that can cancel this buffer from another thread.
    pub fn cancel_handle(&self) -> SpillCancelHandle {
        SpillCancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Partition `record` with the configured partitioner and append it.
    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        let partition = self
            .partitioner
            .partition(record, self.options.partition_count);
        self.write_record_to(partition, record)
    }

    pub fn write_record_to(&mut self, partition: u32, record: &[u8]) -> Result<()> {
        if partition >= self.options.partition_count {
            return Err(JetError::InvalidState(format!(
                "partition {partition} out of range ({} partitions)",
                self.options.partition_count
            )));
        }
        if self.sender.is_none() {
            return Err(JetError::InvalidState("spill buffer already finished".into()));
        }
        let framed = self.options.framing == RecordFraming::LengthPrefixed;
        let len = record.len() + if framed { RECORD_LENGTH_SIZE } else { 0 };
        let capacity = self.shared.arena.capacity();
        if len > capacity || len > u32::MAX as usize {
            return Err(JetError::RecordTooLarge { size: len, capacity });
        }

        let start = self.make_room(len)?;
        // SAFETY: `make_room` returned a range at or past `head` that lies
        // within `released + capacity`; the spill thread never reads past a
        // frozen `end <= head`, so nobody else touches these bytes.
        unsafe {
            if framed {
                let prefix = (record.len() as u32).to_le_bytes();
                self.shared.arena.write_at(start, &prefix);
                self.shared.arena.write_at(start + RECORD_LENGTH_SIZE as u64, record);
            } else {
                self.shared.arena.write_at(start, record);
            }
        }

        let entries = &mut self.pending[partition as usize];
        let coalesced = match (self.options.coalesce_records, self.last_write, entries.last_mut()) {
            (true, Some((last_partition, end)), Some(last))
                if last_partition == partition
                    && end == start
                    && last.end() == start
                    && last.len as usize + len <= u32::MAX as usize =>
            {
                last.len += len as u32;
                true
            }
            _ => false,
        };
        if !coalesced {
            entries.push(RecordIndexEntry {
                offset: start,
                len: len as u32,
            });
        }
        self.head = start + len as u64;
        self.last_write = Some((partition, self.head));
        self.records_written += 1;

        if self.head - self.pending_start >= self.threshold {
            let idle = {
                let state = self.shared.lock();
                check_state(&state)?;
                state.phase == SpillPhase::Idle
            };
            if idle {
                self.request_spill()?;
            }
        }
        Ok(())
    }

    /// Wait for the in-flight spill, spill what remains (at least one spill
    /// always happens), and return the sink.
    pub fn finish(mut self) -> Result<S> {
        if self.sender.is_none() {
            return Err(JetError::InvalidState("spill buffer already finished".into()));
        }
        if self.head > self.pending_start || self.spills_requested == 0 {
            self.wait_idle()?;
            self.request_spill()?;
        }
        self.wait_idle()?;
        self.sender.take();
        let sink = self.join_worker()?;
        check_state(&self.shared.lock())?;
        tracing::debug!(
            spills = self.spills_requested,
            records = self.records_written,
            "spill buffer finished"
        );
        Ok(sink)
    }

    /// Cancel and release the spill thread. Idempotent.
    pub fn dispose(&mut self) {
        self.cancel_handle().cancel();
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("spill thread panicked during dispose");
            }
        }
    }

    // ── Internals ──

    /// Physical placement of a record of `len` bytes written at `head`.
    fn placement(&self, len: usize) -> u64 {
        if self.options.allow_record_wrapping {
            return self.head;
        }
        let capacity = self.shared.arena.capacity() as u64;
        let physical = self.head % capacity;
        if physical + len as u64 > capacity {
            // Skip the tail so the record starts at physical offset 0.
            self.head + (capacity - physical)
        } else {
            self.head
        }
    }

    /// Block until `len` bytes fit; returns the logical start offset.
    fn make_room(&mut self, len: usize) -> Result<u64> {
        let capacity = self.shared.arena.capacity() as u64;
        loop {
            let start = self.placement(len);
            let end = start + len as u64;
            {
                let mut state = self.shared.lock();
                loop {
                    check_state(&state)?;
                    if end - state.released <= capacity {
                        return Ok(start);
                    }
                    if state.phase == SpillPhase::Idle {
                        break;
                    }
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.released == self.head {
                    // Empty buffer: realign instead of spilling skipped bytes.
                    state.released = start;
                    drop(state);
                    self.head = start;
                    self.pending_start = start;
                    self.last_write = None;
                    return Ok(start);
                }
            }
            self.request_spill()?;
        }
    }

    fn request_spill(&mut self) -> Result<()> {
        let partitions = std::mem::replace(
            &mut self.pending,
            vec![Vec::new(); self.options.partition_count as usize],
        );
        let request = SpillRequest {
            spill_number: self.spills_requested,
            start: self.pending_start,
            end: self.head,
            partitions,
        };
        {
            let mut state = self.shared.lock();
            check_state(&state)?;
            state.phase = SpillPhase::Requested;
        }
        tracing::debug!(
            spill = request.spill_number,
            bytes = request.end - request.start,
            "spill requested"
        );
        self.spills_requested += 1;
        self.pending_start = self.head;
        self.last_write = None;

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| JetError::InvalidState("spill buffer already finished".into()))?;
        if sender.send(request).is_err() {
            check_state(&self.shared.lock())?;
            return Err(JetError::InvalidState("spill thread exited".into()));
        }
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        let mut state = self.shared.lock();
        loop {
            check_state(&state)?;
            if state.phase == SpillPhase::Idle {
                return Ok(());
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn join_worker(&mut self) -> Result<S> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| JetError::InvalidState("spill thread already joined".into()))?;
        worker
            .join()
            .map_err(|_| JetError::InvalidState("spill thread panicked".into()))
    }
}

impl<S: SpillSink> Drop for SpillBuffer<S> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Cancels a spill buffer, unblocking the producer and the spill thread.
#[derive(Clone)]
pub struct SpillCancelHandle {
    shared: Arc<Shared>,
}

impl SpillCancelHandle {
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        state.cancelled = true;
        self.shared.changed.notify_all();
    }
}

// ── Spill Thread ───────────────────────────────────────────────────

fn spill_loop<S: SpillSink>(shared: Arc<Shared>, requests: Receiver<SpillRequest>, mut sink: S) -> S {
    for mut request in requests.iter() {
        {
            let mut state = shared.lock();
            if state.cancelled || state.error.is_some() {
                break;
            }
            state.phase = SpillPhase::InProgress;
        }

        let result = run_spill(&shared, &mut sink, &mut request);

        let mut state = shared.lock();
        state.released = request.end;
        state.phase = SpillPhase::Idle;
        match result {
            Ok(()) => state.spills_completed += 1,
            Err(e) => {
                tracing::error!(spill = request.spill_number, "spill failed: {}", e);
                state.error = Some(Arc::new(e));
            }
        }
        shared.changed.notify_all();
        if state.error.is_some() {
            break;
        }
    }
    sink
}

fn run_spill<S: SpillSink>(shared: &Shared, sink: &mut S, request: &mut SpillRequest) -> Result<()> {
    // SAFETY: the producer froze [start, end) when it sent the request and
    // only writes past `end` until `released` reaches `end`, which happens
    // after this function returns.
    let view = unsafe { shared.arena.view(request.start, request.end) };
    for (partition, entries) in request.partitions.iter_mut().enumerate() {
        if !entries.is_empty() {
            sink.prepare_partition(partition as u32, entries, &view)?;
        }
    }
    sink.write_spill(&SpillRegion {
        spill_number: request.spill_number,
        partitions: &request.partitions,
        arena: view,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::record::{FnPartitioner, HashPartitioner};

    // ── Test Helpers ──

    /// Records every spill as (spill number, per-partition records).
    #[derive(Default)]
    struct CollectingSink {
        spills: Vec<(u32, Vec<Vec<Vec<u8>>>)>,
        fail_on: Option<u32>,
        delay: Option<Duration>,
    }

    impl SpillSink for CollectingSink {
        fn write_spill(&mut self, spill: &SpillRegion<'_>) -> Result<()> {
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.fail_on == Some(spill.spill_number) {
                return Err(JetError::Transport("disk full".into()));
            }
            let mut partitions = Vec::new();
            for entries in spill.partitions {
                let mut records = Vec::new();
                for entry in entries {
                    let mut bytes = Vec::new();
                    spill.arena.bytes(entry).write_to(&mut bytes).unwrap();
                    records.push(bytes);
                }
                partitions.push(records);
            }
            self.spills.push((spill.spill_number, partitions));
            Ok(())
        }
    }

    fn by_first_byte() -> Arc<dyn Partitioner> {
        Arc::new(FnPartitioner(|r: &[u8], n: u32| r[0] as u32 % n))
    }

    fn framed(record: &[u8]) -> Vec<u8> {
        let mut out = (record.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(record);
        out
    }

    #[test]
    fn test_final_spill_always_happens() {
        let buffer = SpillBuffer::new(
            SpillBufferOptions::new(1024, 2),
            Arc::new(HashPartitioner::default()),
            CollectingSink::default(),
        )
        .unwrap();
        let sink = buffer.finish().unwrap();
        assert_eq!(sink.spills.len(), 1);
        assert!(sink.spills[0].1.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_records_spill_in_order_per_partition() {
        let mut options = SpillBufferOptions::new(64, 2);
        options.spill_threshold = 0.5;
        let mut buffer = SpillBuffer::new(options, by_first_byte(), CollectingSink::default()).unwrap();
        let mut written: Vec<Vec<u8>> = Vec::new();
        for i in 0..40u8 {
            let record = vec![i, i.wrapping_mul(3), 7];
            buffer.write_record(&record).unwrap();
            written.push(record);
        }
        let requested = buffer.spill_count();
        let sink = buffer.finish().unwrap();
        assert!(requested > 1);

        let mut got: Vec<Vec<Vec<u8>>> = vec![Vec::new(), Vec::new()];
        for (_, partitions) in &sink.spills {
            for (p, records) in partitions.iter().enumerate() {
                got[p].extend(records.iter().cloned());
            }
        }
        for p in 0..2usize {
            let expected: Vec<Vec<u8>> = written
                .iter()
                .filter(|r| r[0] as usize % 2 == p)
                .map(|r| framed(r))
                .collect();
            assert_eq!(got[p], expected);
        }
        let numbers: Vec<u32> = sink.spills.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, (0..numbers.len() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_no_wrap_relocates_record() {
        // 10-byte arena; 4+3 byte records: the second cannot fit in the tail.
        let mut options = SpillBufferOptions::new(10, 1);
        options.spill_threshold = 1.0;
        let mut buffer = SpillBuffer::new(options, by_first_byte(), CollectingSink::default()).unwrap();
        buffer.write_record(b"abc").unwrap();
        buffer.write_record(b"def").unwrap();
        let sink = buffer.finish().unwrap();
        let all: Vec<Vec<u8>> = sink.spills.iter().flat_map(|(_, p)| p[0].clone()).collect();
        assert_eq!(all, vec![framed(b"abc"), framed(b"def")]);
    }

    #[test]
    fn test_coalescing_with_wrapping() {
        let mut options = SpillBufferOptions::new(16, 2);
        options.framing = RecordFraming::Raw;
        options.coalesce_records = true;
        options.allow_record_wrapping = true;
        options.spill_threshold = 1.0;
        let mut buffer = SpillBuffer::new(options, by_first_byte(), CollectingSink::default()).unwrap();
        for record in [&b"\x00aa"[..], b"\x00bb", b"\x01cc", b"\x00dd"] {
            buffer.write_record(record).unwrap();
        }
        let sink = buffer.finish().unwrap();
        let (_, partitions) = &sink.spills[0];
        assert_eq!(partitions[0], vec![b"\x00aa\x00bb".to_vec(), b"\x00dd".to_vec()]);
        assert_eq!(partitions[1], vec![b"\x01cc".to_vec()]);
    }

    #[test]
    fn test_record_too_large() {
        let mut buffer = SpillBuffer::new(
            SpillBufferOptions::new(8, 1),
            by_first_byte(),
            CollectingSink::default(),
        )
        .unwrap();
        let err = buffer.write_record(&[0u8; 5]).unwrap_err();
        assert!(matches!(err, JetError::RecordTooLarge { size: 9, capacity: 8 }));
    }

    #[test]
    fn test_background_error_surfaces_on_producer() {
        let mut options = SpillBufferOptions::new(32, 1);
        options.spill_threshold = 0.25;
        let sink = CollectingSink {
            fail_on: Some(0),
            ..Default::default()
        };
        let mut buffer = SpillBuffer::new(options, by_first_byte(), sink).unwrap();
        let mut failure = None;
        for i in 0..100u8 {
            if let Err(e) = buffer.write_record(&[0, i, i, i]) {
                failure = Some(e);
                break;
            }
        }
        let err = match failure {
            Some(e) => e,
            None => buffer.finish().err().unwrap(),
        };
        assert!(matches!(err, JetError::Background { .. }));
        assert!(matches!(err.root(), JetError::Transport(_)));
    }

    #[test]
    fn test_producer_blocks_until_spill_releases_space() {
        let mut options = SpillBufferOptions::new(24, 1);
        options.spill_threshold = 0.5;
        let sink = CollectingSink {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let mut buffer = SpillBuffer::new(options, by_first_byte(), sink).unwrap();
        for i in 0..30u8 {
            buffer.write_record(&[0, i]).unwrap();
        }
        let sink = buffer.finish().unwrap();
        let total: usize = sink.spills.iter().map(|(_, p)| p[0].len()).sum();
        assert_eq!(total, 30);
    }

    #[test]
    fn test_cancel_unblocks_producer() {
        let mut options = SpillBufferOptions::new(16, 1);
        options.spill_threshold = 0.5;
        let sink = CollectingSink {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let mut buffer = SpillBuffer::new(options, by_first_byte(), sink).unwrap();
        let handle = buffer.cancel_handle();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            flag.store(true, Ordering::SeqCst);
            handle.cancel();
        });
        let mut result = Ok(());
        for i in 0..100u8 {
            result = buffer.write_record(&[0, i, i]);
            if result.is_err() {
                break;
            }
        }
        canceller.join().unwrap();
        assert!(cancelled.load(Ordering::SeqCst));
        assert!(matches!(result, Err(JetError::Cancelled)));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut buffer = SpillBuffer::new(
            SpillBufferOptions::new(64, 1),
            by_first_byte(),
            CollectingSink::default(),
        )
        .unwrap();
        buffer.write_record(&[0, 1]).unwrap();
        buffer.dispose();
        buffer.dispose();
        assert!(buffer.write_record(&[0, 2]).is_err());
    }
}
