//! File channel output: one partition file per task attempt, written under
//! `<output_dir>/<job id>/<task attempt id>` where the file server and the
//! local download path expect it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{OutputType, SpillConfig};
use crate::error::{JetError, Result};
use crate::job::{JobId, TaskAttemptId};
use crate::metrics::ChannelMetrics;
use crate::partition_file::PartitionFileInfo;
use crate::record::{Combiner, Partitioner, RawComparator, RawRecordSink};
use crate::spill::{SortedSpillOptions, SortedSpillSink, SpillBuffer, SpillBufferOptions, UnsortedSpillSink};

/// Location of a task attempt's partition file.
pub fn task_output_path(output_dir: &Path, job_id: JobId, attempt: &TaskAttemptId) -> PathBuf {
    output_dir.join(job_id.to_string()).join(attempt.to_string())
}

#[derive(Debug, Clone)]
pub struct FileOutputOptions {
    pub output_dir: PathBuf,
    pub job_id: JobId,
    pub task_attempt: TaskAttemptId,
    pub partition_count: u32,
    pub output_type: OutputType,
    pub spill: SpillConfig,
}

enum OutputWriter {
    Sorted(SpillBuffer<SortedSpillSink>),
    Unsorted(SpillBuffer<UnsortedSpillSink>),
}

pub struct FileOutputChannel {
    path: PathBuf,
    writer: Option<OutputWriter>,
    metrics: Arc<ChannelMetrics>,
}

impl FileOutputChannel {
    /// `comparator` is required for [`OutputType::SortSpill`]; `combiner` is
    /// only used there.
    pub fn new(
        options: FileOutputOptions,
        partitioner: Arc<dyn Partitioner>,
        comparator: Option<Arc<dyn RawComparator>>,
        combiner: Option<Arc<dyn Combiner>>,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Self> {
        let path = task_output_path(&options.output_dir, options.job_id, &options.task_attempt);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let buffer_options = SpillBufferOptions::from_config(&options.spill, options.partition_count);
        let writer = match options.output_type {
            OutputType::SortSpill => {
                let comparator = comparator
                    .ok_or_else(|| JetError::Config("sorted file output needs a comparer".into()))?;
                let sink = SortedSpillSink::new(
                    SortedSpillOptions::from_config(&options.spill, &path, options.partition_count),
                    comparator,
                    combiner,
                )?;
                OutputWriter::Sorted(SpillBuffer::new(buffer_options, partitioner, sink)?)
            }
            OutputType::Spill => {
                let sink = UnsortedSpillSink::create(
                    &path,
                    options.partition_count,
                    options.spill.compression,
                    options.spill.checksum,
                )?;
                OutputWriter::Unsorted(SpillBuffer::new(buffer_options, partitioner, sink)?)
            }
        };
        tracing::info!(
            path = %path.display(),
            output_type = ?options.output_type,
            partitions = options.partition_count,
            "file output channel opened"
        );
        Ok(Self {
            path,
            writer: Some(writer),
            metrics,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(OutputWriter::Sorted(buffer)) => buffer.write_record(record),
            Some(OutputWriter::Unsorted(buffer)) => buffer.write_record(record),
            None => Err(JetError::InvalidState("file output channel finished".into())),
        }
    }

    /// Flush all spills and produce the final partition file.
    pub fn finish(&mut self) -> Result<PartitionFileInfo> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| JetError::InvalidState("file output channel finished".into()))?;
        let (info, spills) = match writer {
            OutputWriter::Sorted(buffer) => {
                let spills = buffer.spill_count();
                (buffer.finish()?.finish_output()?, spills)
            }
            OutputWriter::Unsorted(buffer) => {
                let spills = buffer.spill_count();
                (buffer.finish()?.finish_output()?, spills)
            }
        };
        self.metrics.record_spills(spills as u64);
        self.metrics.add_local_bytes_written(info.data_len());
        tracing::info!(
            path = %self.path.display(),
            spills,
            bytes = info.data_len(),
            "file output channel finished"
        );
        Ok(info)
    }

    /// Abandon the output. Idempotent.
    pub fn dispose(&mut self) {
        match self.writer.take() {
            Some(OutputWriter::Sorted(mut buffer)) => buffer.dispose(),
            Some(OutputWriter::Unsorted(mut buffer)) => buffer.dispose(),
            None => {}
        }
    }
}

impl RawRecordSink for FileOutputChannel {
    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        FileOutputChannel::write_record(self, record)
    }
}

impl Drop for FileOutputChannel {
    fn drop(&mut self) {
        self.dispose();
    }
}
