//! On-disk partition file: one data file of region envelopes plus a
//! sibling `.index` file describing each partition's regions.

pub mod format;
pub mod index;
pub mod reader;
pub mod writer;

pub use format::{
    index_path, read_index_file, sibling_path, write_index_file, PartitionFileIndexEntry, INDEX_ENTRY_SIZE,
};
pub use index::{LoadedIndex, PartitionFileIndex};
pub use reader::{PartitionFileReader, PartitionStream};
pub use writer::{PartitionFileInfo, PartitionFileWriter, PartitionRegion};

use std::fs;
use std::io;
use std::path::Path;

/// Remove a partition file and its index. Missing files are not an error.
pub fn remove_partition_file(data_path: &Path) -> io::Result<()> {
    for path in [data_path.to_path_buf(), index_path(data_path)] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Move a partition file and its index to a new name.
pub fn rename_partition_file(from: &Path, to: &Path) -> io::Result<()> {
    fs::rename(from, to)?;
    fs::rename(index_path(from), index_path(to))
}
