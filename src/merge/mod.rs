//! Merging sorted runs.
//!
//! [`primitive`] is the k-way merge shared by the sorting spill sink and the
//! reader; [`reader::MultiInputMergeReader`] merges inputs that arrive over
//! time, running bounded fan-in passes in the background.

pub mod input;
pub mod primitive;
pub mod reader;

pub use input::{
    FileInput, MemoryInput, OpenInput, PartitionFileInput, RecordInput, StreamInput, TempFile, TempPartitionFile,
};
pub use primitive::{merge, merge_to_file, write_merge, HeapMerger, MergeStats, MergeStream};
pub use reader::{MergeInputHandle, MergeReaderOptions, MultiInputMergeReader};
