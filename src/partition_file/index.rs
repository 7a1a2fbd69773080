//! Asynchronously loaded partition file index.
//!
//! `PartitionFileIndex::load` returns immediately and reads the index file
//! on a background thread. Every accessor blocks until loading completes;
//! a load failure is reported to every caller, wrapped.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::codec::SEGMENT_HEADER_SIZE;
use crate::error::{JetError, Result};
use crate::partition_file::format::{index_path, read_index_file, PartitionFileIndexEntry};

/// Loaded contents: real entries grouped by partition, in file order.
#[derive(Debug)]
pub struct LoadedIndex {
    pub partition_count: u32,
    pub partitions: Vec<Vec<PartitionFileIndexEntry>>,
}

impl LoadedIndex {
    pub fn from_entries(partition_count: u32, entries: &[PartitionFileIndexEntry]) -> Self {
        let mut partitions = vec![Vec::new(); partition_count as usize];
        for entry in entries {
            if let Some(list) = partitions.get_mut(entry.partition as usize) {
                list.push(*entry);
            }
        }
        Self {
            partition_count,
            partitions,
        }
    }
}

enum LoadState {
    Loading,
    Loaded(Arc<LoadedIndex>),
    Failed(Arc<JetError>),
}

pub struct PartitionFileIndex {
    data_path: PathBuf,
    state: Arc<(Mutex<LoadState>, Condvar)>,
}

impl PartitionFileIndex {
    /// Start loading the index of `data_path` in the background.
    pub fn load(data_path: &Path) -> Self {
        let state = Arc::new((Mutex::new(LoadState::Loading), Condvar::new()));
        let index_file = index_path(data_path);
        let shared = Arc::clone(&state);
        let spawned = thread::Builder::new()
            .name("partition-index-load".into())
            .spawn(move || {
                let result = read_index_file(&index_file);
                let (lock, cvar) = &*shared;
                let mut guard = match lock.lock() {
                    Ok(g) => g,
                    Err(poisoned) => poisoned.into_inner(),
                };
                *guard = match result {
                    Ok((count, entries)) => {
                        LoadState::Loaded(Arc::new(LoadedIndex::from_entries(count, &entries)))
                    }
                    Err(e) => {
                        tracing::warn!(path = %index_file.display(), "index load failed: {}", e);
                        LoadState::Failed(Arc::new(e))
                    }
                };
                cvar.notify_all();
            });
        if let Err(e) = spawned {
            if let Ok(mut guard) = state.0.lock() {
                *guard = LoadState::Failed(Arc::new(JetError::Io(e)));
            }
        }
        Self {
            data_path: data_path.to_path_buf(),
            state,
        }
    }

    /// Index over entries already in memory (a freshly written file).
    pub fn from_entries(data_path: &Path, partition_count: u32, entries: &[PartitionFileIndexEntry]) -> Self {
        let loaded = LoadedIndex::from_entries(partition_count, entries);
        Self {
            data_path: data_path.to_path_buf(),
            state: Arc::new((Mutex::new(LoadState::Loaded(Arc::new(loaded))), Condvar::new())),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Block until loaded.
    pub fn wait_loaded(&self) -> Result<Arc<LoadedIndex>> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock()?;
        loop {
            match &*guard {
                LoadState::Loading => guard = cvar.wait(guard)?,
                LoadState::Loaded(index) => return Ok(Arc::clone(index)),
                LoadState::Failed(e) => return Err(JetError::background_shared("partition index load", e)),
            }
        }
    }

    pub fn partition_count(&self) -> Result<u32> {
        Ok(self.wait_loaded()?.partition_count)
    }

    /// Entries of `partition` in file order, placeholders included.
    pub fn entries(&self, partition: u32) -> Result<Vec<PartitionFileIndexEntry>> {
        let index = self.wait_loaded()?;
        index
            .partitions
            .get(partition as usize)
            .cloned()
            .ok_or_else(|| {
                JetError::InvalidState(format!(
                    "partition {partition} out of range ({} partitions in {})",
                    index.partition_count,
                    self.data_path.display()
                ))
            })
    }

    /// Bytes needed to transfer `partition`: compressed sizes, plus one
    /// segment header per entry when `include_segment_header` is set.
    pub fn partition_size(&self, partition: u32, include_segment_header: bool) -> Result<u64> {
        let entries = self.entries(partition)?;
        let data: u64 = entries.iter().map(|e| e.compressed_size as u64).sum();
        let framing = if include_segment_header {
            (entries.iter().filter(|e| !e.is_placeholder()).count() * SEGMENT_HEADER_SIZE) as u64
        } else {
            0
        };
        Ok(data + framing)
    }

    pub fn uncompressed_size(&self, partition: u32) -> Result<u64> {
        Ok(self
            .entries(partition)?
            .iter()
            .map(|e| e.uncompressed_size as u64)
            .sum())
    }
}
