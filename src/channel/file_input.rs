//! File channel input.
//!
//! Two background threads cooperate:
//!
//! - the **poll thread** asks the job coordinator which upstream tasks have
//!   completed (and takes UDP completion notices when a listener is
//!   configured), then queues each new completion under the file server
//!   holding its output
//! - the **download thread** takes everything queued, one batch per server,
//!   and turns every (task, partition) into a merge input
//!
//! Output on this host is read in place through its partition file index.
//! Remote output is streamed; each partition goes to memory if the shared
//! [`MemoryStorage`] admits it and to a temporary file otherwise. When an
//! admission had to wait, the connection is dropped and the download is
//! restarted without waiting, since the server may have timed out meanwhile.
//! Transient failures are retried with jittered backoff once a whole round
//! of servers made no progress.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use uuid::Uuid;

use crate::channel::broadcast::BroadcastListener;
use crate::channel::file_output::task_output_path;
use crate::channel::memory_storage::{Admission, MemoryStorage};
use crate::channel::protocol::{
    read_i32, DownloadPartitionHeader, DownloadRequest, TaskResponse, CONNECTION_ACCEPTED,
};
use crate::codec::CompressionKind;
use crate::config::FileChannelConfig;
use crate::error::{JetError, Result};
use crate::job::{CompletedTask, JobCoordinator, JobId, ServerAddress, TaskId};
use crate::merge::input::{FileInput, MemoryInput, PartitionFileInput, RecordInput, TempFile};
use crate::merge::reader::MergeInputHandle;
use crate::metrics::ChannelMetrics;
use crate::partition_file::PartitionFileIndex;

/// Longest backoff between download rounds.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How long the broadcast listener blocks before re-checking cancellation.
const LISTENER_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct FileInputOptions {
    pub job_id: JobId,
    /// Producer tasks whose output this channel collects.
    pub upstream_tasks: Vec<TaskId>,
    pub partitions: Vec<u32>,
    /// Host name of this server. Output on it is read from disk.
    pub local_host: String,
    /// Output directory of this server's file output channels.
    pub local_output_dir: PathBuf,
    /// Directory for partitions spooled to disk.
    pub temp_dir: PathBuf,
    pub compression: CompressionKind,
    pub config: FileChannelConfig,
    pub connect_timeout: Duration,
}

enum PollEvent {
    Completed(CompletedTask),
    Wake,
}

struct InputState {
    /// Completed tasks waiting for download, by file server.
    queue: HashMap<ServerAddress, Vec<CompletedTask>>,
    known: HashSet<TaskId>,
    downloaded: usize,
    expected: usize,
    error: Option<Arc<JetError>>,
    cancelled: bool,
}

struct InputShared {
    state: Mutex<InputState>,
    changed: Condvar,
}

impl InputShared {
    fn lock(&self) -> MutexGuard<'_, InputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail(&self, error: JetError) {
        let mut state = self.lock();
        if state.error.is_none() && !state.cancelled {
            tracing::error!("file channel input failed: {}", error);
            state.error = Some(Arc::new(error));
        }
        self.changed.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        let state = self.lock();
        state.cancelled || state.error.is_some()
    }

    /// Sleep up to `delay`, returning early on cancellation.
    fn pause(&self, delay: Duration) -> Result<()> {
        let deadline = Instant::now() + delay;
        let mut state = self.lock();
        loop {
            if state.cancelled || state.error.is_some() {
                return Err(JetError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }
}

pub struct FileInputChannel {
    shared: Arc<InputShared>,
    wake: Sender<PollEvent>,
    threads: Vec<JoinHandle<()>>,
    broadcast_addr: Option<std::net::SocketAddr>,
    metrics: Arc<ChannelMetrics>,
    disposed: bool,
}

impl FileInputChannel {
    /// Start the poll and download threads (and the broadcast listener when
    /// `config.broadcast_port` is set). Inputs go to `merge`.
    pub fn start(
        options: FileInputOptions,
        coordinator: Arc<dyn JobCoordinator>,
        merge: MergeInputHandle,
        memory: Arc<MemoryStorage>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        let shared = Arc::new(InputShared {
            state: Mutex::new(InputState {
                queue: HashMap::new(),
                known: HashSet::new(),
                downloaded: 0,
                expected: options.upstream_tasks.len(),
                error: None,
                cancelled: false,
            }),
            changed: Condvar::new(),
        });
        let (events_tx, events_rx) = unbounded();
        let mut threads = Vec::new();

        let mut broadcast_addr = None;
        if let Some(port) = options.config.broadcast_port {
            let listener = BroadcastListener::bind(port)?;
            broadcast_addr = Some(listener.local_addr()?);
            let tx = events_tx.clone();
            let listener_shared = Arc::clone(&shared);
            threads.push(
                thread::Builder::new()
                    .name("file-input-broadcast".into())
                    .spawn(move || listen_loop(listener, tx, listener_shared))?,
            );
        }

        let poller = Poller {
            job_id: options.job_id,
            upstream: options.upstream_tasks.clone(),
            poll_interval: options.config.poll_interval(),
            coordinator,
            events: events_rx,
            shared: Arc::clone(&shared),
        };
        threads.push(
            thread::Builder::new()
                .name("file-input-poll".into())
                .spawn(move || poller.run())?,
        );

        let downloader = Downloader {
            options,
            merge,
            memory,
            metrics: Arc::clone(&metrics),
            shared: Arc::clone(&shared),
        };
        threads.push(
            thread::Builder::new()
                .name("file-input-download".into())
                .spawn(move || downloader.run())?,
        );

        Ok(Self {
            shared,
            wake: events_tx,
            threads,
            broadcast_addr,
            metrics,
            disposed: false,
        })
    }

    /// Address the completion listener is bound to, if any.
    pub fn broadcast_addr(&self) -> Option<std::net::SocketAddr> {
        self.broadcast_addr
    }

    pub fn metrics(&self) -> &Arc<ChannelMetrics> {
        &self.metrics
    }

    /// Upstream tasks whose output has been handed to the merge reader.
    pub fn tasks_downloaded(&self) -> usize {
        self.shared.lock().downloaded
    }

    /// Block until every upstream task is downloaded, or a background
    /// failure is reported.
    pub fn wait_complete(&self) -> Result<()> {
        let mut state = self.shared.lock();
        loop {
            if let Some(e) = &state.error {
                return Err(JetError::background_shared("file channel download", e));
            }
            if state.downloaded >= state.expected {
                return Ok(());
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

    /// Stop all threads. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        {
            let mut state = self.shared.lock();
            state.cancelled = true;
            state.queue.clear();
            self.shared.changed.notify_all();
        }
        // The poll thread may be idle in its event wait.
        let _ = self.wake.send(PollEvent::Wake);
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("file channel thread panicked during dispose");
            }
        }
    }
}

impl Drop for FileInputChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}

// ── Poll Thread ────────────────────────────────────────────────────

struct Poller {
    job_id: JobId,
    upstream: Vec<TaskId>,
    poll_interval: Duration,
    coordinator: Arc<dyn JobCoordinator>,
    events: Receiver<PollEvent>,
    shared: Arc<InputShared>,
}

impl Poller {
    fn run(self) {
        if let Err(e) = self.poll() {
            if !matches!(e, JetError::Cancelled) {
                self.shared.fail(JetError::background("completion poll", e));
            }
        }
    }

    fn poll(&self) -> Result<()> {
        loop {
            let pending: Vec<TaskId> = {
                let state = self.shared.lock();
                if state.cancelled || state.error.is_some() {
                    return Err(JetError::Cancelled);
                }
                self.upstream
                    .iter()
                    .filter(|t| !state.known.contains(t))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                return Ok(());
            }
            match self.coordinator.check_task_completion(self.job_id, &pending) {
                Ok(completed) => self.enqueue(completed, "poll"),
                Err(e) if e.is_transient() => tracing::warn!("completion poll failed, will retry: {}", e),
                Err(e) => return Err(e),
            }

            match self.events.recv_timeout(self.poll_interval) {
                Ok(PollEvent::Completed(task)) => {
                    let mut notices = vec![task];
                    notices.extend(self.events.try_iter().filter_map(|event| match event {
                        PollEvent::Completed(task) => Some(task),
                        PollEvent::Wake => None,
                    }));
                    self.enqueue(notices, "broadcast");
                }
                Ok(PollEvent::Wake) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.shared.pause(self.poll_interval)?,
            }
        }
    }

    /// Queue completions not seen before, grouped by server.
    fn enqueue(&self, completed: Vec<CompletedTask>, source: &str) {
        let mut state = self.shared.lock();
        let mut added = 0;
        for task in completed {
            let id = task.task_attempt_id.task.clone();
            if task.job_id != self.job_id || !self.upstream.contains(&id) || !state.known.insert(id) {
                continue;
            }
            state.queue.entry(task.file_server()).or_default().push(task);
            added += 1;
        }
        if added > 0 {
            tracing::debug!(added, source, "completed tasks queued for download");
            self.shared.changed.notify_all();
        }
    }
}

fn listen_loop(mut listener: BroadcastListener, events: Sender<PollEvent>, shared: Arc<InputShared>) {
    while !shared.is_cancelled() {
        {
            let state = shared.lock();
            if state.known.len() >= state.expected {
                return;
            }
        }
        match listener.recv(LISTENER_POLL) {
            Ok(Some(task)) => {
                if events.send(PollEvent::Completed(task)).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("completion listener error: {}", e);
                if shared.pause(LISTENER_POLL).is_err() {
                    return;
                }
            }
        }
    }
}

// ── Download Thread ────────────────────────────────────────────────

struct Downloader {
    options: FileInputOptions,
    merge: MergeInputHandle,
    memory: Arc<MemoryStorage>,
    metrics: Arc<ChannelMetrics>,
    shared: Arc<InputShared>,
}

/// Result of downloading one server's batch.
struct BatchOutcome {
    completed: usize,
    remaining: Vec<CompletedTask>,
    error: Option<JetError>,
}

impl Downloader {
    fn run(self) {
        if let Err(e) = self.download() {
            if !matches!(e, JetError::Cancelled) {
                self.shared.fail(JetError::background("download", e));
            }
        }
    }

    fn download(&self) -> Result<()> {
        let mut failed_rounds = 0u32;
        while let Some(batches) = self.wait_for_work()? {
            let mut progressed = false;
            let mut last_error = None;
            let mut retry = Vec::new();
            for (server, tasks) in batches {
                let outcome = self.download_batch(&server, tasks);
                progressed |= outcome.completed > 0;
                if let Some(e) = outcome.error {
                    if !e.is_transient() {
                        return Err(e);
                    }
                    tracing::warn!(%server, remaining = outcome.remaining.len(), "download failed: {}", e);
                    retry.push((server, outcome.remaining));
                    last_error = Some(e);
                }
            }
            if !retry.is_empty() {
                let mut state = self.shared.lock();
                for (server, tasks) in retry {
                    state.queue.entry(server).or_default().extend(tasks);
                }
            }
            match last_error {
                Some(e) if !progressed => {
                    failed_rounds += 1;
                    self.metrics.record_retry();
                    if failed_rounds > self.options.config.max_download_retries {
                        return Err(e);
                    }
                    self.shared.pause(self.backoff(failed_rounds))?;
                }
                _ => failed_rounds = 0,
            }
        }
        Ok(())
    }

    fn backoff(&self, failed_rounds: u32) -> Duration {
        let base = self.options.config.retry_base_delay();
        let exp = base.saturating_mul(1 << failed_rounds.saturating_sub(1).min(16));
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        exp.min(MAX_RETRY_DELAY).mul_f64(jitter)
    }

    /// Take all queued work; `None` once every task is downloaded.
    fn wait_for_work(&self) -> Result<Option<Vec<(ServerAddress, Vec<CompletedTask>)>>> {
        let mut state = self.shared.lock();
        loop {
            if state.cancelled || state.error.is_some() {
                return Err(JetError::Cancelled);
            }
            if !state.queue.is_empty() {
                return Ok(Some(state.queue.drain().collect()));
            }
            if state.downloaded >= state.expected {
                return Ok(None);
            }
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn download_batch(&self, server: &ServerAddress, mut tasks: Vec<CompletedTask>) -> BatchOutcome {
        let before = tasks.len();
        let result = if server.host == self.options.local_host {
            self.read_local(&mut tasks)
        } else {
            self.fetch_remote_with_restart(server, &mut tasks)
        };
        BatchOutcome {
            completed: before - tasks.len(),
            remaining: tasks,
            error: result.err(),
        }
    }

    /// Register output on this host straight from its partition files.
    fn read_local(&self, tasks: &mut Vec<CompletedTask>) -> Result<()> {
        while let Some(task) = tasks.first() {
            let path = task_output_path(&self.options.local_output_dir, task.job_id, &task.task_attempt_id);
            let index = Arc::new(PartitionFileIndex::load(&path));
            let mut inputs = Vec::with_capacity(self.options.partitions.len());
            for &partition in &self.options.partitions {
                if index.uncompressed_size(partition)? == 0 {
                    inputs.push((partition, RecordInput::empty()));
                    continue;
                }
                self.metrics.add_local_bytes_read(index.partition_size(partition, false)?);
                inputs.push((
                    partition,
                    RecordInput::PartitionFile(PartitionFileInput {
                        index: Arc::clone(&index),
                        partition,
                        compression: self.options.compression,
                        temp: None,
                    }),
                ));
            }
            let task = tasks.remove(0);
            tracing::debug!(task = %task.task_attempt_id, "local output registered");
            self.register(inputs)?;
        }
        Ok(())
    }

    fn fetch_remote_with_restart(&self, server: &ServerAddress, tasks: &mut Vec<CompletedTask>) -> Result<()> {
        let mut allow_wait = true;
        while !tasks.is_empty() {
            if self.shared.is_cancelled() {
                return Err(JetError::Cancelled);
            }
            if self.fetch_remote(server, tasks, allow_wait)? {
                tracing::debug!(%server, "memory admission waited; restarting download");
                allow_wait = false;
            }
        }
        Ok(())
    }

    /// Stream the remaining tasks from `server`. Returns true when the
    /// download must be restarted because an admission waited.
    fn fetch_remote(&self, server: &ServerAddress, tasks: &mut Vec<CompletedTask>, allow_wait: bool) -> Result<bool> {
        let started = Instant::now();
        let addr = (server.host.as_str(), server.port)
            .to_socket_addrs()
            .map_err(|e| JetError::Transport(format!("resolve {server}: {e}")))?
            .next()
            .ok_or_else(|| JetError::Transport(format!("no address for {server}")))?;
        let stream = TcpStream::connect_timeout(&addr, self.options.connect_timeout)
            .map_err(|e| JetError::Transport(format!("connect to {server}: {e}")))?;
        stream.set_nodelay(true)?;
        let mut reader = BufReader::with_capacity(256 * 1024, stream.try_clone()?);
        let mut writer = stream;

        let accepted = read_i32(&mut reader)?;
        if accepted != CONNECTION_ACCEPTED {
            return Err(JetError::Protocol(format!("{server} refused the download ({accepted:#x})")));
        }
        DownloadRequest {
            job_id: self.options.job_id,
            partitions: self.options.partitions.clone(),
            tasks: tasks.iter().map(|t| t.task_attempt_id.clone()).collect(),
        }
        .write_to(&mut writer)?;

        while !tasks.is_empty() {
            match TaskResponse::read_from(&mut reader)? {
                TaskResponse::Found { .. } => {}
                TaskResponse::Missing(e) => return Err(e),
            }
            let mut inputs = Vec::with_capacity(self.options.partitions.len());
            for &partition in &self.options.partitions {
                let header = DownloadPartitionHeader::read_from(&mut reader)?;
                if header.size == 0 {
                    inputs.push((partition, RecordInput::empty()));
                    continue;
                }
                let admission = if allow_wait {
                    self.memory
                        .reserve(header.size, true, self.options.config.memory_wait_timeout())
                } else {
                    Admission {
                        reservation: self.memory.try_reserve(header.size),
                        waited: false,
                    }
                };
                if admission.waited {
                    return Ok(true);
                }
                let input = match admission.reservation {
                    Some(reservation) => {
                        let mut data = vec![0u8; header.size as usize];
                        reader.read_exact(&mut data)?;
                        self.metrics.record_download_target(true);
                        RecordInput::Memory(MemoryInput {
                            data,
                            segment_count: header.segment_count as u64,
                            compression: self.options.compression,
                            uncompressed_len: header.uncompressed_size,
                            reservation: Some(reservation),
                        })
                    }
                    None => {
                        let file = self.spool(&mut reader, header.size)?;
                        self.metrics.record_download_target(false);
                        RecordInput::File(FileInput {
                            file,
                            segment_count: header.segment_count as u64,
                            compression: self.options.compression,
                            uncompressed_len: header.uncompressed_size,
                        })
                    }
                };
                self.metrics.add_network_bytes_read(header.size);
                inputs.push((partition, input));
            }
            let task = tasks.remove(0);
            tracing::debug!(task = %task.task_attempt_id, %server, "remote output downloaded");
            self.register(inputs)?;
        }
        self.metrics.record_download(started.elapsed().as_millis() as u64);
        Ok(false)
    }

    /// Copy `size` bytes to a temporary file.
    fn spool<R: Read>(&self, reader: &mut R, size: u64) -> Result<TempFile> {
        let path = self.options.temp_dir.join(format!("download-{}", Uuid::new_v4().simple()));
        let file = TempFile::new(path.clone());
        let mut out = BufWriter::new(File::create(&path)?);
        let copied = io::copy(&mut reader.take(size), &mut out)?;
        if copied != size {
            return Err(JetError::Transport(format!(
                "connection closed after {copied} of {size} partition bytes"
            )));
        }
        out.flush()?;
        self.metrics.add_local_bytes_written(size);
        Ok(file)
    }

    fn register(&self, inputs: Vec<(u32, RecordInput)>) -> Result<()> {
        for (partition, input) in inputs {
            self.merge.add_input(partition, input)?;
        }
        let mut state = self.shared.lock();
        state.downloaded += 1;
        self.shared.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::channel::file_server::FileChannelServer;
    use crate::codec::CompressionKind;
    use crate::job::{StaticCoordinator, TaskAttemptId};
    use crate::merge::reader::{MergeReaderOptions, MultiInputMergeReader};
    use crate::partition_file::PartitionFileWriter;
    use crate::record::{write_framed, BytewiseComparator};

    // ── Test Helpers ──

    fn write_output(dir: &std::path::Path, job: JobId, attempt: &TaskAttemptId, records: &[&[u8]]) {
        let path = task_output_path(dir, job, attempt);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut payload = Vec::new();
        for r in records {
            write_framed(&mut payload, r).unwrap();
        }
        let mut writer = PartitionFileWriter::create(&path, 1, CompressionKind::Deflate, true).unwrap();
        writer.write_partition(0, &payload).unwrap();
        writer.finish().unwrap();
    }

    fn completed(job: JobId, number: u32, host: &str, port: u16) -> CompletedTask {
        CompletedTask {
            job_id: job,
            task_attempt_id: TaskAttemptId::new(TaskId::new("Map", number), 1),
            task_server: ServerAddress::new(host, 1),
            file_server_port: port,
        }
    }

    fn options(job: JobId, tasks: u32, output: &TempDir, temp: &TempDir) -> FileInputOptions {
        FileInputOptions {
            job_id: job,
            upstream_tasks: (1..=tasks).map(|n| TaskId::new("Map", n)).collect(),
            partitions: vec![0],
            local_host: "this-host".into(),
            local_output_dir: output.path().to_path_buf(),
            temp_dir: temp.path().to_path_buf(),
            compression: CompressionKind::Deflate,
            config: FileChannelConfig {
                poll_interval_ms: 10,
                retry_base_delay_ms: 10,
                memory_wait_timeout_ms: 50,
                ..FileChannelConfig::default()
            },
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn reader(temp: &TempDir, tasks: u32, metrics: &Arc<ChannelMetrics>) -> MultiInputMergeReader {
        let mut reader = MultiInputMergeReader::new(
            MergeReaderOptions::new(temp.path()),
            Arc::new(BytewiseComparator),
            None,
            None,
            Arc::clone(metrics),
        )
        .unwrap();
        reader.assign_partitions(vec![0], tasks).unwrap();
        reader
    }

    fn drain(reader: &mut MultiInputMergeReader) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(r) = reader.read_record().unwrap() {
            out.push(r.to_vec());
        }
        out
    }

    #[test]
    fn test_local_output_read_in_place() {
        let output = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let job = JobId::new();
        let task = completed(job, 1, "this-host", 0);
        write_output(output.path(), job, &task.task_attempt_id, &[b"a", b"c"]);
        let coordinator = Arc::new(StaticCoordinator::new());
        coordinator.complete_task(task);

        let metrics = Arc::new(ChannelMetrics::new());
        let mut merge = reader(&temp, 1, &metrics);
        let channel = FileInputChannel::start(
            options(job, 1, &output, &temp),
            coordinator,
            merge.input_handle(),
            MemoryStorage::new(1 << 20),
            Arc::clone(&metrics),
        )
        .unwrap();
        channel.wait_complete().unwrap();
        assert_eq!(drain(&mut merge), vec![b"a".to_vec(), b"c".to_vec()]);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.network_bytes_read, 0);
        assert!(snapshot.local_bytes_read > 0);
    }

    #[test]
    fn test_remote_download_goes_to_disk_when_memory_is_short() {
        let output = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let job = JobId::new();
        let server = FileChannelServer::bind("127.0.0.1:0", output.path(), Arc::new(ChannelMetrics::new())).unwrap();
        let port = server.local_addr().unwrap().port();
        let shutdown = server.shutdown_handle();
        let serving = thread::spawn(move || server.serve().unwrap());

        let coordinator = Arc::new(StaticCoordinator::new());
        for (n, records) in [(1u32, vec![&b"b"[..], b"d"]), (2, vec![&b"a"[..], b"e"])] {
            let task = completed(job, n, "127.0.0.1", port);
            write_output(output.path(), job, &task.task_attempt_id, &records);
            coordinator.complete_task(task);
        }

        let metrics = Arc::new(ChannelMetrics::new());
        let mut merge = reader(&temp, 2, &metrics);
        let mut channel = FileInputChannel::start(
            options(job, 2, &output, &temp),
            coordinator,
            merge.input_handle(),
            MemoryStorage::new(4),
            Arc::clone(&metrics),
        )
        .unwrap();
        channel.wait_complete().unwrap();
        assert_eq!(
            drain(&mut merge),
            vec![b"a".to_vec(), b"b".to_vec(), b"d".to_vec(), b"e".to_vec()]
        );
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.downloads_to_disk, 2);
        assert_eq!(snapshot.downloads_to_memory, 0);
        assert!(snapshot.network_bytes_read > 0);
        assert_eq!(snapshot.local_bytes_written, snapshot.network_bytes_read);
        // Both spooled downloads are read back in full: four 1-byte records.
        assert_eq!(snapshot.local_bytes_read, 4 * 5);
        channel.dispose();
        channel.dispose();
        shutdown.shutdown();
        serving.join().unwrap();
    }

    #[test]
    fn test_unreachable_server_fails_after_retries() {
        let output = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let job = JobId::new();
        // Bind and drop to get a port nobody listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let coordinator = Arc::new(StaticCoordinator::new());
        coordinator.complete_task(completed(job, 1, "127.0.0.1", port));

        let metrics = Arc::new(ChannelMetrics::new());
        let merge = reader(&temp, 1, &metrics);
        let mut opts = options(job, 1, &output, &temp);
        opts.config.max_download_retries = 2;
        let channel = FileInputChannel::start(
            opts,
            coordinator,
            merge.input_handle(),
            MemoryStorage::new(1 << 20),
            Arc::clone(&metrics),
        )
        .unwrap();
        let err = channel.wait_complete().unwrap_err();
        assert!(err.is_transient());
        assert_eq!(metrics.snapshot().downloads_retried, 3);
    }
}
