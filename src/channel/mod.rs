//! Channels between producing and consuming tasks.
//!
//! - **file**: the producer writes one partition file per task attempt
//!   ([`file_output`]) and serves it ([`file_server`]); consumers download
//!   it, or read it in place when it is local ([`file_input`])
//! - **tcp**: spills are streamed to the consumers as they happen
//!   ([`tcp_output`], [`tcp_input`])
//! - **pipeline**: records go straight to a task in the same process
//!
//! Downloaded data is admitted to memory through a shared
//! [`MemoryStorage`] budget.

pub mod broadcast;
pub mod file_input;
pub mod file_output;
pub mod file_server;
pub mod memory_storage;
pub mod pipeline;
pub mod protocol;
pub mod tcp_input;
pub mod tcp_output;

pub use broadcast::{BroadcastListener, BroadcastNotifier};
pub use file_input::{FileInputChannel, FileInputOptions};
pub use file_output::{task_output_path, FileOutputChannel, FileOutputOptions};
pub use file_server::{FileChannelServer, ShutdownHandle};
pub use memory_storage::{Admission, MemoryReservation, MemoryStorage};
pub use pipeline::{PipelineOutputChannel, PullTask, PushTask};
pub use tcp_input::{TcpInputChannel, TcpInputOptions};
pub use tcp_output::{TcpOutputChannel, TcpOutputOptions, TcpSpillSink};
