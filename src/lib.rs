//! jet-shuffle - shuffle and merge subsystem of the Jet batch runtime
//!
//! Moves the intermediate records of a task to the tasks that consume them:
//!
//! - spill buffers turn an unbounded record stream into bounded,
//!   partitioned, optionally sorted spills ([`spill`])
//! - spills land in partition files with a sidecar index ([`partition_file`])
//!   built on a checksummed, compressed stream codec ([`codec`])
//! - channels move a task's output to its consumers over files, TCP, or an
//!   in-process pipeline ([`channel`])
//! - a multi-input merge reader merges inputs as they arrive into one sorted
//!   stream per partition ([`merge`])

pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod merge;
pub mod metrics;
pub mod partition_file;
pub mod record;
pub mod resource;
pub mod spill;

pub use error::{JetError, Result};
pub use job::{CompletedTask, JobCoordinator, JobId, ServerAddress, StaticCoordinator, TaskAttemptId, TaskId};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use record::{RawComparator, RawRecordSink, RawRecordSource};
