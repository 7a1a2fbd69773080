//! Job identifiers and the job-coordinator interface.
//!
//! The scheduler is outside this crate. Channels only ask it which upstream
//! tasks have completed, which partitions a task owns, and where a task
//! runs; [`JobCoordinator`] is that query surface.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{JetError, Result};

/// Job identifier; 16 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A task of a stage. Task numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub stage_id: String,
    pub task_number: u32,
}

impl TaskId {
    pub fn new(stage_id: impl Into<String>, task_number: u32) -> Self {
        Self {
            stage_id: stage_id.into(),
            task_number,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.stage_id, self.task_number)
    }
}

/// One execution attempt of a task, rendered as `Stage-007_2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskAttemptId {
    pub task: TaskId,
    pub attempt: u32,
}

impl TaskAttemptId {
    pub fn new(task: TaskId, attempt: u32) -> Self {
        Self { task, attempt }
    }
}

impl fmt::Display for TaskAttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.task, self.attempt)
    }
}

impl FromStr for TaskAttemptId {
    type Err = JetError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || JetError::Protocol(format!("malformed task attempt id {s:?}"));
        let (task, attempt) = s.rsplit_once('_').ok_or_else(invalid)?;
        let (stage, number) = task.rsplit_once('-').ok_or_else(invalid)?;
        if stage.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            task: TaskId::new(stage, number.parse().map_err(|_| invalid())?),
            attempt: attempt.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A producer task whose output is ready for download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedTask {
    pub job_id: JobId,
    pub task_attempt_id: TaskAttemptId,
    /// Server the task ran on.
    pub task_server: ServerAddress,
    /// Port of that server's file channel server.
    pub file_server_port: u16,
}

impl CompletedTask {
    /// Address to download the task's output from.
    pub fn file_server(&self) -> ServerAddress {
        ServerAddress::new(self.task_server.host.clone(), self.file_server_port)
    }
}

// ── Coordinator ────────────────────────────────────────────────────

pub trait JobCoordinator: Send + Sync {
    /// Completed attempts among `tasks`. Tasks still running are omitted.
    fn check_task_completion(&self, job_id: JobId, tasks: &[TaskId]) -> Result<Vec<CompletedTask>>;

    fn partitions_for_task(&self, job_id: JobId, task: &TaskId) -> Result<Vec<u32>>;

    /// Address of the server running `task`.
    fn task_server_for_task(&self, job_id: JobId, task: &TaskId) -> Result<ServerAddress>;
}

#[derive(Default)]
struct StaticState {
    completed: HashMap<TaskId, CompletedTask>,
    partitions: HashMap<TaskId, Vec<u32>>,
    servers: HashMap<TaskId, ServerAddress>,
}

/// In-process coordinator with explicitly registered state.
#[derive(Default)]
pub struct StaticCoordinator {
    state: Mutex<StaticState>,
}

impl StaticCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StaticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn complete_task(&self, task: CompletedTask) {
        self.lock()
            .completed
            .insert(task.task_attempt_id.task.clone(), task);
    }

    pub fn set_partitions(&self, task: TaskId, partitions: Vec<u32>) {
        self.lock().partitions.insert(task, partitions);
    }

    pub fn set_task_server(&self, task: TaskId, server: ServerAddress) {
        self.lock().servers.insert(task, server);
    }
}

impl JobCoordinator for StaticCoordinator {
    fn check_task_completion(&self, job_id: JobId, tasks: &[TaskId]) -> Result<Vec<CompletedTask>> {
        let state = self.lock();
        Ok(tasks
            .iter()
            .filter_map(|t| state.completed.get(t))
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect())
    }

    fn partitions_for_task(&self, _job_id: JobId, task: &TaskId) -> Result<Vec<u32>> {
        self.lock()
            .partitions
            .get(task)
            .cloned()
            .ok_or_else(|| JetError::InvalidState(format!("no partitions assigned to {task}")))
    }

    fn task_server_for_task(&self, _job_id: JobId, task: &TaskId) -> Result<ServerAddress> {
        self.lock()
            .servers
            .get(task)
            .cloned()
            .ok_or_else(|| JetError::InvalidState(format!("task {task} is not running")))
    }
}
