//! File channel server: the producer half of the file channel.
//!
//! Serves finished partition files from an output directory laid out by
//! [`FileOutputChannel`](super::file_output::FileOutputChannel). Each
//! connection carries one download request; every requested partition of
//! every requested task is streamed as segments straight from the data file.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::channel::file_output::task_output_path;
use crate::channel::protocol::{
    write_task_found, write_task_missing, DownloadPartitionHeader, DownloadRequest, CONNECTION_ACCEPTED,
    DOWNLOAD_PARTITION_HEADER_LEN,
};
use crate::codec::write_segment_header;
use crate::error::{JetError, Result};
use crate::job::{JobId, TaskAttemptId};
use crate::metrics::ChannelMetrics;
use crate::partition_file::{index_path, PartitionFileIndex, PartitionFileIndexEntry};

/// Sleep between accept attempts while idle.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

static NEXT_CONNECTION_ID: AtomicUsize = AtomicUsize::new(1);

/// Stops a running [`FileChannelServer::serve`] loop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<AtomicBool>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub struct FileChannelServer {
    listener: TcpListener,
    output_dir: PathBuf,
    shutdown: Arc<AtomicBool>,
    metrics: Arc<ChannelMetrics>,
}

impl FileChannelServer {
    pub fn bind(addr: impl ToSocketAddrs, output_dir: impl Into<PathBuf>, metrics: Arc<ChannelMetrics>) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            output_dir: output_dir.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
            metrics,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Accept connections until shut down. Each connection gets a thread.
    pub fn serve(&self) -> Result<()> {
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            dir = %self.output_dir.display(),
            "file channel server listening"
        );
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::SeqCst);
                    let output_dir = self.output_dir.clone();
                    let metrics = Arc::clone(&self.metrics);
                    thread::Builder::new()
                        .name(format!("file-server-{id}"))
                        .spawn(move || {
                            tracing::debug!(connection = id, %peer, "download connection accepted");
                            if let Err(e) = handle_connection(stream, &output_dir, &metrics) {
                                tracing::warn!(connection = id, %peer, "download failed: {}", e);
                            }
                        })?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => tracing::warn!("accept error: {}", e),
            }
        }
        tracing::info!("file channel server stopped");
        Ok(())
    }
}

/// What is sent for one task, computed before any of its bytes go out.
struct TaskPlan {
    data_path: PathBuf,
    partitions: Vec<(DownloadPartitionHeader, Vec<PartitionFileIndexEntry>)>,
}

impl TaskPlan {
    fn size(&self) -> u64 {
        self.partitions
            .iter()
            .map(|(header, _)| DOWNLOAD_PARTITION_HEADER_LEN + header.size)
            .sum()
    }
}

fn plan_task(output_dir: &Path, job_id: JobId, attempt: &TaskAttemptId, partitions: &[u32]) -> Result<TaskPlan> {
    let data_path = task_output_path(output_dir, job_id, attempt);
    if !index_path(&data_path).exists() {
        return Err(JetError::InvalidState(format!("no output for task attempt {attempt}")));
    }
    let index = PartitionFileIndex::load(&data_path);
    let mut planned = Vec::with_capacity(partitions.len());
    for &partition in partitions {
        let entries: Vec<PartitionFileIndexEntry> = index
            .entries(partition)?
            .into_iter()
            .filter(|e| !e.is_placeholder())
            .collect();
        let header = DownloadPartitionHeader {
            size: index.partition_size(partition, true)?,
            uncompressed_size: index.uncompressed_size(partition)?,
            segment_count: entries.len() as u32,
        };
        planned.push((header, entries));
    }
    Ok(TaskPlan {
        data_path,
        partitions: planned,
    })
}

fn handle_connection(stream: TcpStream, output_dir: &Path, metrics: &ChannelMetrics) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::with_capacity(256 * 1024, stream);

    writer.write_all(&CONNECTION_ACCEPTED.to_le_bytes())?;
    writer.flush()?;
    let request = DownloadRequest::read_from(&mut reader)?;
    tracing::debug!(
        job = %request.job_id,
        tasks = request.tasks.len(),
        partitions = request.partitions.len(),
        "serving download"
    );

    let mut sent = 0u64;
    for attempt in &request.tasks {
        let plan = match plan_task(output_dir, request.job_id, attempt, &request.partitions) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(task = %attempt, "cannot serve task output: {}", e);
                write_task_missing(&mut writer, &e)?;
                continue;
            }
        };
        write_task_found(&mut writer, plan.size())?;
        let mut data = File::open(&plan.data_path)?;
        for (header, entries) in &plan.partitions {
            header.write_to(&mut writer)?;
            for entry in entries {
                write_segment_header(&mut writer, entry.sizes())?;
                data.seek(SeekFrom::Start(entry.offset as u64))?;
                let copied = io::copy(&mut (&mut data).take(entry.compressed_size as u64), &mut writer)?;
                if copied != entry.compressed_size as u64 {
                    return Err(JetError::Corrupt(format!(
                        "{} is shorter than its index ({} of {} bytes at offset {})",
                        plan.data_path.display(),
                        copied,
                        entry.compressed_size,
                        entry.offset
                    )));
                }
            }
        }
        sent += 8 + plan.size();
    }
    writer.flush()?;
    metrics.add_network_bytes_written(sent);
    Ok(())
}
