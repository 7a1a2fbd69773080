//! Sorting spill sink.
//!
//! Each spill is sorted per partition by reordering the arena's index
//! handles (records never move), optionally combined, and written to its
//! own `<output>.spill-N` partition file. `finish_output` turns the spill
//! files into the single sorted output file:
//!
//! - no spill: an empty output file
//! - one spill: renamed into place, index rewritten without placeholders
//! - more: merged partition by partition with bounded fan-in, re-applying
//!   the combiner when enough spills exist
//!
//! Spill files are deleted once the output exists, and on drop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::slice::ParallelSliceMut;

use crate::codec::CompressionKind;
use crate::config::SpillConfig;
use crate::error::{JetError, Result};
use crate::merge::input::{PartitionFileInput, RecordInput};
use crate::merge::primitive::{merge_to_file, write_merge};
use crate::partition_file::{
    index_path, remove_partition_file, rename_partition_file, sibling_path, write_index_file,
    PartitionFileIndex, PartitionFileInfo, PartitionFileWriter,
};
use crate::record::{
    combine_sorted, Combiner, RawComparator, RawRecordSource, RecordFraming, RECORD_LENGTH_SIZE,
};
use crate::spill::arena::{ArenaView, RecordIndexEntry};
use crate::spill::{SpillBufferOptions, SpillRegion, SpillSink};

/// Partitions with at least this many records are sorted on the rayon pool.
const PARALLEL_SORT_THRESHOLD: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct SortedSpillOptions {
    pub output_path: PathBuf,
    pub partition_count: u32,
    pub compression: CompressionKind,
    pub checksum: bool,
    /// Re-apply the combiner during the final merge only with at least this
    /// many spills.
    pub min_spills_for_combine: u32,
    pub max_merge_fan_in: usize,
}

impl SortedSpillOptions {
    pub fn new(output_path: impl Into<PathBuf>, partition_count: u32) -> Self {
        Self {
            output_path: output_path.into(),
            partition_count,
            compression: CompressionKind::Deflate,
            checksum: true,
            min_spills_for_combine: 3,
            max_merge_fan_in: 16,
        }
    }

    pub fn from_config(config: &SpillConfig, output_path: impl Into<PathBuf>, partition_count: u32) -> Self {
        Self {
            output_path: output_path.into(),
            partition_count,
            compression: config.compression,
            checksum: config.checksum,
            min_spills_for_combine: config.min_spills_for_combine,
            max_merge_fan_in: config.max_merge_fan_in,
        }
    }
}

pub struct SortedSpillSink {
    options: SortedSpillOptions,
    comparator: Arc<dyn RawComparator>,
    combiner: Option<Arc<dyn Combiner>>,
    spills: Vec<PartitionFileInfo>,
    merge_passes: u32,
    finished: bool,
}

impl SortedSpillSink {
    pub fn new(
        options: SortedSpillOptions,
        comparator: Arc<dyn RawComparator>,
        combiner: Option<Arc<dyn Combiner>>,
    ) -> Result<Self> {
        if options.max_merge_fan_in < 2 {
            return Err(JetError::Config(format!(
                "merge fan-in must be at least 2, got {}",
                options.max_merge_fan_in
            )));
        }
        Ok(Self {
            options,
            comparator,
            combiner,
            spills: Vec::new(),
            merge_passes: 0,
            finished: false,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.options.output_path
    }

    /// Spill files written and not yet merged.
    pub fn spill_files(&self) -> &[PartitionFileInfo] {
        &self.spills
    }

    /// Intermediate passes run because a partition exceeded the fan-in.
    pub fn merge_passes(&self) -> u32 {
        self.merge_passes
    }

    fn spill_path(&self, spill_number: u32) -> PathBuf {
        sibling_path(&self.options.output_path, &format!(".spill-{spill_number}"))
    }

    /// Produce the single sorted output file from the spills written so far.
    pub fn finish_output(&mut self) -> Result<PartitionFileInfo> {
        if self.finished {
            return Err(JetError::InvalidState("sorted output already finished".into()));
        }
        self.finished = true;

        let output = self.options.output_path.clone();
        let result = match self.spills.len() {
            0 => PartitionFileWriter::create(
                &output,
                self.options.partition_count,
                self.options.compression,
                self.options.checksum,
            )
            .and_then(PartitionFileWriter::finish),
            1 => self.promote_single_spill(),
            _ => self.merge_spills(),
        };
        match result {
            Ok(info) => {
                self.remove_spills();
                tracing::debug!(
                    path = %info.data_path.display(),
                    entries = info.entries.len(),
                    merge_passes = self.merge_passes,
                    "sorted output finished"
                );
                Ok(info)
            }
            Err(e) => {
                remove_quietly(&output);
                self.remove_spills();
                Err(e)
            }
        }
    }

    fn promote_single_spill(&mut self) -> Result<PartitionFileInfo> {
        let output = self.options.output_path.clone();
        rename_partition_file(&self.spills[0].data_path, &output)?;
        let spill = self.spills.remove(0);
        let entries: Vec<_> = spill
            .entries
            .into_iter()
            .filter(|e| !e.is_placeholder())
            .collect();
        let index = index_path(&output);
        write_index_file(&index, spill.partition_count, &entries)?;
        Ok(PartitionFileInfo {
            data_path: output,
            index_path: index,
            partition_count: spill.partition_count,
            entries,
        })
    }

    fn merge_spills(&mut self) -> Result<PartitionFileInfo> {
        let partition_count = self.options.partition_count;
        let compression = self.options.compression;
        let combiner = self
            .combiner
            .clone()
            .filter(|_| self.spills.len() as u32 >= self.options.min_spills_for_combine);
        let indexes: Vec<Arc<PartitionFileIndex>> = self
            .spills
            .iter()
            .map(|s| Arc::new(PartitionFileIndex::from_entries(&s.data_path, s.partition_count, &s.entries)))
            .collect();

        let mut writer = PartitionFileWriter::create(
            &self.options.output_path,
            partition_count,
            compression,
            self.options.checksum,
        )?;
        for partition in 0..partition_count {
            let mut inputs: Vec<RecordInput> = Vec::with_capacity(indexes.len());
            for index in &indexes {
                if index.uncompressed_size(partition)? > 0 {
                    inputs.push(RecordInput::PartitionFile(PartitionFileInput {
                        index: Arc::clone(index),
                        partition,
                        compression,
                        temp: None,
                    }));
                }
            }
            if inputs.is_empty() {
                continue;
            }
            let inputs = self.reduce_fan_in(partition, inputs, combiner.as_deref())?;
            let mut region = writer.begin_partition(partition)?;
            write_merge(inputs, &self.comparator, combiner.as_deref(), &mut region)?;
            region.finish()?;
        }
        writer.finish()
    }

    /// Merge the oldest inputs into temporary files until at most
    /// `max_merge_fan_in` remain.
    fn reduce_fan_in(
        &mut self,
        partition: u32,
        mut inputs: Vec<RecordInput>,
        combiner: Option<&dyn Combiner>,
    ) -> Result<Vec<RecordInput>> {
        let fan_in = self.options.max_merge_fan_in;
        while inputs.len() > fan_in {
            let batch: Vec<RecordInput> = inputs.drain(..fan_in).collect();
            let path = sibling_path(
                &self.options.output_path,
                &format!(".merge-{partition}-{}", self.merge_passes),
            );
            let (merged, stats) = merge_to_file(
                batch,
                &self.comparator,
                combiner,
                path,
                self.options.compression,
                self.options.checksum,
            )?;
            tracing::debug!(partition, inputs = stats.inputs, records = stats.records_written, "intermediate merge pass");
            self.merge_passes += 1;
            inputs.push(merged);
        }
        Ok(inputs)
    }

    fn remove_spills(&mut self) {
        for spill in self.spills.drain(..) {
            remove_quietly(&spill.data_path);
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = remove_partition_file(path) {
        tracing::warn!(path = %path.display(), "failed to remove spill file: {}", e);
    }
}

impl Drop for SortedSpillSink {
    fn drop(&mut self) {
        self.remove_spills();
    }
}

impl SpillSink for SortedSpillSink {
    fn adjust_options(&self, options: &mut SpillBufferOptions) {
        // Sorting needs every record addressable and contiguous.
        options.framing = RecordFraming::LengthPrefixed;
        options.coalesce_records = false;
        options.allow_record_wrapping = false;
    }

    fn prepare_partition(
        &mut self,
        partition: u32,
        entries: &mut [RecordIndexEntry],
        arena: &ArenaView<'_>,
    ) -> Result<()> {
        if entries.iter().any(|e| arena.bytes(e).contiguous().is_none()) {
            return Err(JetError::InvalidState(format!(
                "partition {partition} has records wrapping the arena end"
            )));
        }
        let comparator = self.comparator.as_ref();
        let compare = |a: &RecordIndexEntry, b: &RecordIndexEntry| {
            comparator.compare(record_body(arena, a), record_body(arena, b))
        };
        if entries.len() >= PARALLEL_SORT_THRESHOLD {
            entries.par_sort_by(compare);
        } else {
            entries.sort_by(compare);
        }
        Ok(())
    }

    fn write_spill(&mut self, spill: &SpillRegion<'_>) -> Result<()> {
        let path = self.spill_path(spill.spill_number);
        let mut writer = PartitionFileWriter::create(
            &path,
            self.options.partition_count,
            self.options.compression,
            self.options.checksum,
        )?;
        for (partition, entries) in spill.partitions.iter().enumerate() {
            let partition = partition as u32;
            if entries.is_empty() {
                writer.add_placeholder(partition)?;
                continue;
            }
            let mut region = writer.begin_partition(partition)?;
            match &self.combiner {
                Some(combiner) => {
                    let mut replay = ReplaySource {
                        arena: spill.arena,
                        entries,
                        pos: 0,
                    };
                    combine_sorted(&mut replay, self.comparator.as_ref(), combiner.as_ref(), &mut region)?;
                }
                None => {
                    for entry in entries {
                        // Entries already carry their size marker.
                        spill.arena.bytes(entry).write_to(&mut region)?;
                    }
                }
            }
            if region.finish()?.uncompressed == 0 {
                writer.add_placeholder(partition)?;
            }
        }
        let info = writer.finish()?;
        tracing::debug!(
            spill = spill.spill_number,
            records = spill.entry_count(),
            bytes = info.data_len(),
            "sorted spill written"
        );
        self.spills.push(info);
        Ok(())
    }
}

/// Record without its size marker. Entries are contiguous by construction.
pub(crate) fn record_body<'a>(arena: &ArenaView<'a>, entry: &RecordIndexEntry) -> &'a [u8] {
    let framed = arena.bytes(entry).head;
    &framed[RECORD_LENGTH_SIZE.min(framed.len())..]
}

/// Replays sorted index entries as records.
struct ReplaySource<'a> {
    arena: ArenaView<'a>,
    entries: &'a [RecordIndexEntry],
    pos: usize,
}

impl RawRecordSource for ReplaySource<'_> {
    fn next_record(&mut self) -> Result<Option<&[u8]>> {
        let Some(entry) = self.entries.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        Ok(Some(record_body(&self.arena, entry)))
    }
}
