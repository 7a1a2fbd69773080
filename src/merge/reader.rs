//! Multi-input merge reader.
//!
//! Inputs for a set of partitions arrive over time (from a channel's
//! download thread) and are handed to a background coordinator by message.
//! The coordinator owns all per-partition state and keeps it bounded:
//!
//! - **memory purge**: when the memory storage is above the purge trigger,
//!   or a download had to wait for memory, buffered memory inputs are
//!   merged to disk
//! - **disk pass**: when a partition holds `2k - 1` disk inputs, the oldest
//!   `k` are merged into one
//!
//! Once every expected input has arrived the coordinator runs the final
//! pass for each partition, a lazy merge the consumer pulls from directly,
//! and exits. `read_record` blocks until the current partition's final pass
//! is ready.
//!
//! ```text
//!  add_input ──msg──> coordinator ──purge/disk passes──> temp files
//!                          │
//!                          └── final pass ──> ready streams ──> read_record
//! ```
//!
//! Assigning more partitions starts a new generation with its own
//! coordinator, after the previous generation's final passes are exposed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use uuid::Uuid;

use crate::channel::memory_storage::MemoryStorage;
use crate::codec::CompressionKind;
use crate::config::MergeConfig;
use crate::error::{JetError, Result};
use crate::merge::input::RecordInput;
use crate::merge::primitive::{merge, merge_to_file, MergeStream};
use crate::metrics::ChannelMetrics;
use crate::record::{Combiner, RawComparator, RawRecordSource};

#[derive(Debug, Clone)]
pub struct MergeReaderOptions {
    pub max_fan_in: usize,
    pub memory_purge_trigger: f64,
    pub purge_before_final_pass: bool,
    pub poll_interval: Duration,
    pub compression: CompressionKind,
    pub checksum: bool,
    /// Directory for intermediate merge files.
    pub temp_dir: PathBuf,
}

impl MergeReaderOptions {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&MergeConfig::default(), temp_dir)
    }

    pub fn from_config(config: &MergeConfig, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_fan_in: config.max_fan_in,
            memory_purge_trigger: config.memory_purge_trigger,
            purge_before_final_pass: config.purge_before_final_pass,
            poll_interval: config.poll_interval(),
            compression: config.compression,
            checksum: true,
            temp_dir: temp_dir.into(),
        }
    }
}

// ── Shared State ───────────────────────────────────────────────────

struct ReaderState {
    /// Final-pass streams not yet taken by the consumer.
    ready: HashMap<u32, MergeStream>,
    error: Option<Arc<JetError>>,
    cancelled: bool,
    inputs_received: u64,
    inputs_expected: u64,
    /// Coordinators started, and those that published their final passes.
    generations_started: u64,
    generations_ready: u64,
    background_passes: u64,
    peak_disk_inputs: usize,
}

struct ReaderShared {
    state: Mutex<ReaderState>,
    changed: Condvar,
}

impl ReaderShared {
    fn lock(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum CoordinatorMessage {
    AddInput { partition: u32, input: RecordInput },
}

struct Route {
    partitions: HashSet<u32>,
    sender: Sender<CoordinatorMessage>,
}

/// Routes inputs to the coordinator of the generation owning the partition.
#[derive(Clone)]
pub struct MergeInputHandle {
    route: Arc<Mutex<Option<Route>>>,
    shared: Arc<ReaderShared>,
    comparator: Arc<dyn RawComparator>,
}

impl MergeInputHandle {
    /// Ordering the reader merges by. Inputs must already be sorted by it.
    pub fn comparator(&self) -> &Arc<dyn RawComparator> {
        &self.comparator
    }

    /// Hand `input` over to the reader. Ownership moves to the coordinator.
    pub fn add_input(&self, partition: u32, input: RecordInput) -> Result<()> {
        let route = self.route.lock().unwrap_or_else(PoisonError::into_inner);
        let route = route
            .as_ref()
            .filter(|r| r.partitions.contains(&partition))
            .ok_or_else(|| JetError::InvalidState(format!("partition {partition} is not being collected")))?;
        if route
            .sender
            .send(CoordinatorMessage::AddInput { partition, input })
            .is_err()
        {
            let state = self.shared.lock();
            if let Some(e) = &state.error {
                return Err(JetError::background_shared("merge coordinator", e));
            }
            return Err(JetError::Cancelled);
        }
        Ok(())
    }
}

// ── MultiInputMergeReader ──────────────────────────────────────────

pub struct MultiInputMergeReader {
    options: MergeReaderOptions,
    comparator: Arc<dyn RawComparator>,
    combiner: Option<Arc<dyn Combiner>>,
    memory: Option<Arc<MemoryStorage>>,
    metrics: Arc<ChannelMetrics>,
    shared: Arc<ReaderShared>,
    handle: MergeInputHandle,
    reader_id: String,
    partitions: Vec<u32>,
    position: usize,
    current: Option<MergeStream>,
    coordinator: Option<JoinHandle<()>>,
    generation: u32,
    disposed: bool,
}

impl MultiInputMergeReader {
    pub fn new(
        options: MergeReaderOptions,
        comparator: Arc<dyn RawComparator>,
        combiner: Option<Arc<dyn Combiner>>,
        memory: Option<Arc<MemoryStorage>>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        if options.max_fan_in < 2 {
            return Err(JetError::Config(format!(
                "merge fan-in must be at least 2, got {}",
                options.max_fan_in
            )));
        }
        let shared = Arc::new(ReaderShared {
            state: Mutex::new(ReaderState {
                ready: HashMap::new(),
                error: None,
                cancelled: false,
                inputs_received: 0,
                inputs_expected: 0,
                generations_started: 0,
                generations_ready: 0,
                background_passes: 0,
                peak_disk_inputs: 0,
            }),
            changed: Condvar::new(),
        });
        let handle = MergeInputHandle {
            route: Arc::new(Mutex::new(None)),
            shared: Arc::clone(&shared),
            comparator: Arc::clone(&comparator),
        };
        Ok(Self {
            options,
            comparator,
            combiner,
            memory,
            metrics,
            shared,
            handle,
            reader_id: Uuid::new_v4().simple().to_string(),
            partitions: Vec::new(),
            position: 0,
            current: None,
            coordinator: None,
            generation: 0,
            disposed: false,
        })
    }

    /// Handle for the thread that delivers inputs.
    pub fn input_handle(&self) -> MergeInputHandle {
        self.handle.clone()
    }

    pub fn add_input(&self, partition: u32, input: RecordInput) -> Result<()> {
        self.handle.add_input(partition, input)
    }

    /// Start collecting `partitions`, each expecting `expected_inputs`
    /// inputs. Blocks until the previous generation's final passes are
    /// ready.
    pub fn assign_partitions(&mut self, partitions: Vec<u32>, expected_inputs: u32) -> Result<()> {
        if self.disposed {
            return Err(JetError::InvalidState("merge reader disposed".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = partitions
            .iter()
            .find(|p| self.partitions.contains(p) || !seen.insert(**p))
        {
            return Err(JetError::InvalidState(format!("partition {dup} assigned twice")));
        }
        self.join_coordinator()?;

        self.generation += 1;
        let (tx, rx) = unbounded();
        {
            let mut state = self.shared.lock();
            state.inputs_expected += partitions.len() as u64 * expected_inputs as u64;
            state.generations_started += 1;
        }
        let coordinator = Coordinator {
            options: self.options.clone(),
            comparator: Arc::clone(&self.comparator),
            combiner: self.combiner.clone(),
            memory: self.memory.clone(),
            metrics: Arc::clone(&self.metrics),
            shared: Arc::clone(&self.shared),
            file_prefix: format!("merge-{}-g{}", self.reader_id, self.generation),
            partitions: partitions
                .iter()
                .map(|p| (*p, PartitionMerger::default()))
                .collect(),
            expected_inputs,
            receiver: rx,
            passes: 0,
        };
        let worker = thread::Builder::new()
            .name("merge-coordinator".into())
            .spawn(move || coordinator.run())?;

        *self.handle.route.lock().unwrap_or_else(PoisonError::into_inner) = Some(Route {
            partitions: partitions.iter().copied().collect(),
            sender: tx,
        });
        tracing::debug!(generation = self.generation, ?partitions, expected_inputs, "partitions assigned");
        self.partitions.extend(partitions);
        self.coordinator = Some(worker);
        Ok(())
    }

    /// Partition `read_record` currently reads from.
    pub fn current_partition(&self) -> Option<u32> {
        self.partitions.get(self.position).copied()
    }

    /// Move to the next assigned partition. Returns it, or `None` when every
    /// assigned partition has been read.
    pub fn next_partition(&mut self) -> Option<u32> {
        if self.position < self.partitions.len() {
            self.position += 1;
        }
        self.current = None;
        self.current_partition()
    }

    /// Next record of the current partition; `None` once it is exhausted.
    pub fn read_record(&mut self) -> Result<Option<&[u8]>> {
        if self.disposed {
            return Err(JetError::InvalidState("merge reader disposed".into()));
        }
        let Some(partition) = self.current_partition() else {
            return Ok(None);
        };
        if self.current.is_none() {
            self.current = Some(self.wait_ready(partition)?);
        }
        match self.current.as_mut() {
            Some(stream) => stream.next_record(),
            None => Ok(None),
        }
    }

    /// Average final-pass progress over the assigned partitions. Each
    /// partition reports framed bytes consumed over its inputs' framed
    /// total (see [`MergeStream::progress`]).
    pub fn progress(&self) -> f64 {
        if self.partitions.is_empty() {
            return 0.0;
        }
        let state = self.shared.lock();
        let total: f64 = self
            .partitions
            .iter()
            .enumerate()
            .map(|(i, p)| {
                if i < self.position {
                    1.0
                } else if i == self.position && self.current.is_some() {
                    self.current.as_ref().map_or(0.0, MergeStream::progress)
                } else {
                    state.ready.get(p).map_or(0.0, MergeStream::progress)
                }
            })
            .sum();
        total / self.partitions.len() as f64
    }

    /// Background work done before the final passes: every input taken in
    /// counts one step, and so does each generation whose purge and disk
    /// passes are finished and whose final passes are published. Reaches
    /// 1.0 only when nothing is left for the coordinators to do.
    pub fn additional_progress(&self) -> f64 {
        let state = self.shared.lock();
        let total = state.inputs_expected + state.generations_started;
        if total == 0 {
            return 1.0;
        }
        (state.inputs_received + state.generations_ready) as f64 / total as f64
    }

    /// Background (memory purge and disk) passes run so far.
    pub fn background_pass_count(&self) -> u64 {
        self.shared.lock().background_passes
    }

    /// Most disk inputs any partition held at once.
    pub fn peak_disk_inputs(&self) -> usize {
        self.shared.lock().peak_disk_inputs
    }

    /// Cancel background work and release every input. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        {
            let mut state = self.shared.lock();
            state.cancelled = true;
            self.shared.changed.notify_all();
        }
        self.handle
            .route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = self.coordinator.take() {
            if worker.join().is_err() {
                tracing::warn!("merge coordinator panicked during dispose");
            }
        }
        self.current = None;
        let streams: Vec<MergeStream> = self.shared.lock().ready.drain().map(|(_, s)| s).collect();
        drop(streams);
    }

    fn wait_ready(&self, partition: u32) -> Result<MergeStream> {
        let mut state = self.shared.lock();
        loop {
            if let Some(stream) = state.ready.remove(&partition) {
                return Ok(stream);
            }
            if let Some(e) = &state.error {
                return Err(JetError::background_shared("merge coordinator", e));
            }
            if state.cancelled {
                return Err(JetError::Cancelled);
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Wait for the running generation to publish its final passes.
    fn join_coordinator(&mut self) -> Result<()> {
        if let Some(worker) = self.coordinator.take() {
            worker
                .join()
                .map_err(|_| JetError::InvalidState("merge coordinator panicked".into()))?;
        }
        self.handle
            .route
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let state = self.shared.lock();
        if let Some(e) = &state.error {
            return Err(JetError::background_shared("merge coordinator", e));
        }
        if state.cancelled {
            return Err(JetError::Cancelled);
        }
        Ok(())
    }
}

impl RawRecordSource for MultiInputMergeReader {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        self.read_record()
    }
}

impl Drop for MultiInputMergeReader {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ── Coordinator ────────────────────────────────────────────────────

#[derive(Default)]
struct PartitionMerger {
    memory_inputs: Vec<RecordInput>,
    /// Oldest first.
    disk_inputs: VecDeque<RecordInput>,
    received: u32,
}

struct Coordinator {
    options: MergeReaderOptions,
    comparator: Arc<dyn RawComparator>,
    combiner: Option<Arc<dyn Combiner>>,
    memory: Option<Arc<MemoryStorage>>,
    metrics: Arc<ChannelMetrics>,
    shared: Arc<ReaderShared>,
    file_prefix: String,
    partitions: BTreeMap<u32, PartitionMerger>,
    expected_inputs: u32,
    receiver: Receiver<CoordinatorMessage>,
    passes: u64,
}

impl Coordinator {
    fn run(mut self) {
        match self.collect().and_then(|()| self.final_passes()) {
            Ok(streams) => {
                let mut state = self.shared.lock();
                if !state.cancelled {
                    state.ready.extend(streams);
                }
                state.generations_ready += 1;
                self.shared.changed.notify_all();
            }
            Err(JetError::Cancelled) => {
                tracing::debug!("merge coordinator cancelled");
            }
            Err(e) => {
                tracing::error!("merge coordinator failed: {}", e);
                let mut state = self.shared.lock();
                state.error = Some(Arc::new(e));
                self.shared.changed.notify_all();
            }
        }
    }

    /// Take in inputs until all have arrived, running background passes.
    fn collect(&mut self) -> Result<()> {
        loop {
            loop {
                match self.receiver.try_recv() {
                    Ok(message) => self.handle(message)?,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if self.all_arrived() {
                            break;
                        }
                        return Err(JetError::Cancelled);
                    }
                }
            }
            self.check_cancelled()?;
            if self.under_memory_pressure() {
                self.purge_memory()?;
            }
            self.disk_passes()?;
            if self.all_arrived() {
                return Ok(());
            }
            match self.receiver.recv_timeout(self.options.poll_interval) {
                Ok(message) => self.handle(message)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.check_cancelled()?;
                    if !self.all_arrived() {
                        return Err(JetError::Cancelled);
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: CoordinatorMessage) -> Result<()> {
        match message {
            CoordinatorMessage::AddInput { partition, input } => {
                let merger = self.partitions.get_mut(&partition).ok_or_else(|| {
                    JetError::InvalidState(format!("input for unassigned partition {partition}"))
                })?;
                merger.received += 1;
                if input.uncompressed_len() != Some(0) {
                    if input.is_memory() {
                        merger.memory_inputs.push(input);
                    } else {
                        merger.disk_inputs.push_back(input);
                    }
                }
                let disk = merger.disk_inputs.len();
                let mut state = self.shared.lock();
                state.inputs_received += 1;
                state.peak_disk_inputs = state.peak_disk_inputs.max(disk);
                drop(state);
                self.disk_pass(partition)
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.shared.lock().cancelled {
            return Err(JetError::Cancelled);
        }
        Ok(())
    }

    fn all_arrived(&self) -> bool {
        self.partitions
            .values()
            .all(|m| m.received >= self.expected_inputs)
    }

    fn under_memory_pressure(&self) -> bool {
        let Some(memory) = &self.memory else {
            return false;
        };
        let has_memory_inputs = self.partitions.values().any(|m| !m.memory_inputs.is_empty());
        // Always consume the signal so a stale one does not trigger later.
        let waited = memory.take_waiting_signal();
        has_memory_inputs && (waited || memory.usage_fraction() > self.options.memory_purge_trigger)
    }

    fn next_path(&mut self, partition: u32) -> PathBuf {
        self.passes += 1;
        self.options
            .temp_dir
            .join(format!("{}-p{partition}-{}", self.file_prefix, self.passes))
    }

    fn merge_batch(&mut self, partition: u32, batch: Vec<RecordInput>) -> Result<RecordInput> {
        let path = self.next_path(partition);
        let (merged, stats) = merge_to_file(
            batch,
            &self.comparator,
            self.combiner.as_deref(),
            path,
            self.options.compression,
            self.options.checksum,
        )?;
        self.metrics.add_local_bytes_read(stats.local_bytes_read);
        self.metrics.add_local_bytes_written(stats.bytes_written);
        self.shared.lock().background_passes += 1;
        tracing::debug!(
            partition,
            inputs = stats.inputs,
            records = stats.records_written,
            "background merge pass"
        );
        Ok(merged)
    }

    /// Move every partition's memory inputs to disk.
    fn purge_memory(&mut self) -> Result<()> {
        let fan_in = self.options.max_fan_in;
        let partitions: Vec<u32> = self.partitions.keys().copied().collect();
        for partition in partitions {
            loop {
                let batch: Vec<RecordInput> = match self.partitions.get_mut(&partition) {
                    Some(m) if !m.memory_inputs.is_empty() => {
                        let n = m.memory_inputs.len().min(fan_in);
                        m.memory_inputs.drain(..n).collect()
                    }
                    _ => break,
                };
                let merged = self.merge_batch(partition, batch)?;
                self.metrics.record_memory_merge_pass();
                self.push_disk(partition, merged);
                self.disk_pass(partition)?;
            }
        }
        Ok(())
    }

    fn disk_passes(&mut self) -> Result<()> {
        let partitions: Vec<u32> = self.partitions.keys().copied().collect();
        for partition in partitions {
            self.disk_pass(partition)?;
        }
        Ok(())
    }

    /// Merge the oldest `k` disk inputs while `2k - 1` are held.
    fn disk_pass(&mut self, partition: u32) -> Result<()> {
        let fan_in = self.options.max_fan_in;
        loop {
            let batch: Vec<RecordInput> = match self.partitions.get_mut(&partition) {
                Some(m) if m.disk_inputs.len() >= 2 * fan_in - 1 => m.disk_inputs.drain(..fan_in).collect(),
                _ => return Ok(()),
            };
            let merged = self.merge_batch(partition, batch)?;
            self.metrics.record_disk_merge_pass();
            self.push_disk(partition, merged);
        }
    }

    fn push_disk(&mut self, partition: u32, input: RecordInput) {
        if let Some(m) = self.partitions.get_mut(&partition) {
            m.disk_inputs.push_back(input);
            let disk = m.disk_inputs.len();
            let mut state = self.shared.lock();
            state.peak_disk_inputs = state.peak_disk_inputs.max(disk);
        }
    }

    /// Lazy final merge for every partition, reducing to the fan-in first.
    fn final_passes(&mut self) -> Result<Vec<(u32, MergeStream)>> {
        if self.options.purge_before_final_pass && self.memory.is_some() {
            self.purge_memory()?;
        }
        let fan_in = self.options.max_fan_in;
        let partitions: Vec<u32> = self.partitions.keys().copied().collect();
        let mut streams = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let Some(merger) = self.partitions.remove(&partition) else {
                continue;
            };
            let mut inputs: VecDeque<RecordInput> = merger.disk_inputs;
            inputs.extend(merger.memory_inputs);
            while inputs.len() > fan_in {
                let batch: Vec<RecordInput> = inputs.drain(..fan_in).collect();
                let merged = self.merge_batch(partition, batch)?;
                inputs.push_back(merged);
            }
            let stream = merge(inputs.into(), Arc::clone(&self.comparator), self.combiner.clone())?
                .with_metrics(Arc::clone(&self.metrics));
            tracing::debug!(partition, inputs = stream.input_count(), "final pass ready");
            streams.push((partition, stream));
        }
        Ok(streams)
    }
}
