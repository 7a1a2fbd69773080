//! Pipeline channel: hands records to a downstream task in the same process.
//!
//! No transport and no partitioning. Push-style tasks are called inline on
//! the producer's thread. Pull-style tasks run on a dedicated thread and read
//! from a bounded queue of record batches, so producer and consumer overlap
//! while the consumer sees records in exactly the order they were written.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{JetError, Result};
use crate::record::{RawRecordSink, RawRecordSource};

/// Records per queued batch.
const BATCH_RECORDS: usize = 256;

/// Downstream task that is handed one record at a time.
pub trait PushTask: Send {
    fn process_record(&mut self, record: &[u8]) -> Result<()>;

    /// Called once after the last record.
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Downstream task that pulls its input itself.
pub trait PullTask: Send + 'static {
    fn run(&mut self, input: &mut dyn RawRecordSource) -> Result<()>;
}

enum Mode {
    Inline(Box<dyn PushTask>),
    Threaded {
        sender: Option<Sender<Vec<Vec<u8>>>>,
        batch: Vec<Vec<u8>>,
        worker: Option<JoinHandle<Result<()>>>,
    },
}

pub struct PipelineOutputChannel {
    mode: Mode,
    records_written: u64,
    finished: bool,
}

impl PipelineOutputChannel {
    /// Call `task` synchronously for every record.
    pub fn inline(task: Box<dyn PushTask>) -> Self {
        Self {
            mode: Mode::Inline(task),
            records_written: 0,
            finished: false,
        }
    }

    /// Run `task` on its own thread, fed through a queue holding at most
    /// `capacity` batches.
    pub fn threaded(mut task: Box<dyn PullTask>, capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded(capacity.max(1));
        let worker = thread::Builder::new()
            .name("pipeline-consumer".into())
            .spawn(move || {
                let mut source = QueueSource::new(receiver);
                let result = task.run(&mut source);
                // Drop unread input so a blocked producer notices.
                drop(source);
                result
            })?;
        Ok(Self {
            mode: Mode::Threaded {
                sender: Some(sender),
                batch: Vec::with_capacity(BATCH_RECORDS),
                worker: Some(worker),
            },
            records_written: 0,
            finished: false,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        if self.finished {
            return Err(JetError::InvalidState("pipeline channel finished".into()));
        }
        match &mut self.mode {
            Mode::Inline(task) => task.process_record(record)?,
            Mode::Threaded { batch, .. } => {
                batch.push(record.to_vec());
                if batch.len() >= BATCH_RECORDS {
                    self.flush()?;
                }
            }
        }
        self.records_written += 1;
        Ok(())
    }

    /// Deliver the remaining records and wait for the downstream task.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Err(JetError::InvalidState("pipeline channel finished".into()));
        }
        self.finished = true;
        if let Mode::Inline(task) = &mut self.mode {
            return task.finish();
        }
        let flushed = self.flush();
        let joined = self.join();
        // The consumer's own error explains a failed send.
        joined.and(flushed)
    }

    fn flush(&mut self) -> Result<()> {
        let Mode::Threaded { sender, batch, .. } = &mut self.mode else {
            return Ok(());
        };
        if batch.is_empty() {
            return Ok(());
        }
        let full = std::mem::replace(batch, Vec::with_capacity(BATCH_RECORDS));
        let sender = sender
            .as_ref()
            .ok_or_else(|| JetError::InvalidState("pipeline channel finished".into()))?;
        if sender.send(full).is_err() {
            return match self.join() {
                Ok(()) => Err(JetError::InvalidState(
                    "pipeline consumer finished before reading all records".into(),
                )),
                Err(e) => Err(e),
            };
        }
        Ok(())
    }

    /// Close the queue and wait for the consumer thread.
    fn join(&mut self) -> Result<()> {
        let Mode::Threaded { sender, worker, .. } = &mut self.mode else {
            return Ok(());
        };
        sender.take();
        match worker.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| JetError::InvalidState("pipeline consumer panicked".into()))?
                .map_err(|e| JetError::background("pipeline consumer", e)),
            None => Ok(()),
        }
    }
}

impl RawRecordSink for PipelineOutputChannel {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        PipelineOutputChannel::write_record(self, record)
    }
}

impl Drop for PipelineOutputChannel {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            tracing::warn!("pipeline consumer failed: {}", e);
        }
    }
}

/// Record source over the batch queue.
struct QueueSource {
    receiver: Receiver<Vec<Vec<u8>>>,
    batch: Vec<Vec<u8>>,
    next: usize,
}

impl QueueSource {
    fn new(receiver: Receiver<Vec<Vec<u8>>>) -> Self {
        Self {
            receiver,
            batch: Vec::new(),
            next: 0,
        }
    }
}

impl RawRecordSource for QueueSource {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        while self.next >= self.batch.len() {
            match self.receiver.recv() {
                Ok(batch) => {
                    self.batch = batch;
                    self.next = 0;
                }
                Err(_) => return Ok(None),
            }
        }
        self.next += 1;
        Ok(Some(&self.batch[self.next - 1]))
    }
}
