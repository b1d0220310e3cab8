//! The executor contract: one uniform way to run a map or reduce task,
//! whether in-process or on a deployed cloud function.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::Driver;
use crate::job::Job;
use crate::split::InputSplit;

/// Where a task failed. Remote executors carry the kind across the wire so
/// a user-code failure inside a cloud function surfaces the same way it
/// would locally.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to read input: {0}")]
    InputRead(#[source] anyhow::Error),

    #[error("map function failed: {0}")]
    UserMap(#[source] anyhow::Error),

    #[error("failed to write intermediate data: {0}")]
    IntermediateWrite(#[source] anyhow::Error),

    #[error("failed to read intermediate data: {0}")]
    IntermediateRead(#[source] anyhow::Error),

    #[error("reduce function failed: {0}")]
    UserReduce(#[source] anyhow::Error),

    #[error("failed to write output: {0}")]
    OutputWrite(#[source] anyhow::Error),

    #[error("transport failure: {0}")]
    Transport(#[source] anyhow::Error),
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::InputRead(_) => "input_read",
            TaskError::UserMap(_) => "user_map",
            TaskError::IntermediateWrite(_) => "intermediate_write",
            TaskError::IntermediateRead(_) => "intermediate_read",
            TaskError::UserReduce(_) => "user_reduce",
            TaskError::OutputWrite(_) => "output_write",
            TaskError::Transport(_) => "transport",
        }
    }

    /// Rebuild a task error from its wire form. Unknown kinds degrade to
    /// transport failures.
    pub fn from_wire(kind: &str, message: String) -> Self {
        let inner = anyhow::anyhow!(message);
        match kind {
            "input_read" => TaskError::InputRead(inner),
            "user_map" => TaskError::UserMap(inner),
            "intermediate_write" => TaskError::IntermediateWrite(inner),
            "intermediate_read" => TaskError::IntermediateRead(inner),
            "user_reduce" => TaskError::UserReduce(inner),
            "output_write" => TaskError::OutputWrite(inner),
            _ => TaskError::Transport(inner),
        }
    }
}

/// Deploy or undeploy failures are fatal to the run.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("deploy failed: {0}")]
    Deploy(#[source] anyhow::Error),

    #[error("undeploy failed: {0}")]
    Undeploy(#[source] anyhow::Error),
}

/// Byte totals observed by one task.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct TaskCounters {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Runs one map or reduce task. Implementations must be safe to call
/// concurrently up to the driver's configured parallelism.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run_mapper(
        &self,
        job: &Arc<Job>,
        job_index: usize,
        bin_id: u32,
        bin: &[InputSplit],
    ) -> Result<(), TaskError>;

    async fn run_reducer(
        &self,
        job: &Arc<Job>,
        job_index: usize,
        bin_id: u32,
    ) -> Result<(), TaskError>;

    /// Executors that manage their own remote lifecycle expose it here.
    fn platform(&self) -> Option<&dyn Platform> {
        None
    }
}

/// Lifecycle capability of executors backed by a managed cloud function.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn deploy(&self) -> Result<(), PlatformError>;

    async fn undeploy(&self) -> Result<(), PlatformError>;

    /// Serve task requests when this process *is* the remote worker.
    /// Does not return under normal operation.
    async fn start(&self, driver: Arc<Driver>) -> anyhow::Result<()>;
}

/// In-process execution. No serialization of the user functions; the job is
/// invoked directly.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

#[async_trait]
impl Executor for LocalExecutor {
    async fn run_mapper(
        &self,
        job: &Arc<Job>,
        _job_index: usize,
        bin_id: u32,
        bin: &[InputSplit],
    ) -> Result<(), TaskError> {
        job.run_mapper(bin_id, bin).await.map(|_| ())
    }

    async fn run_reducer(
        &self,
        job: &Arc<Job>,
        _job_index: usize,
        bin_id: u32,
    ) -> Result<(), TaskError> {
        job.run_reducer(bin_id).await.map(|_| ())
    }
}

/////////////////////////////////////////////////////////////////////////////
// Remote task wire format
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPhase {
    Map,
    Reduce,
}

/// Everything a stateless worker needs to reconstruct and run one task.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskPayload {
    pub job_index: usize,
    pub phase: TaskPhase,
    pub bin_id: u32,
    #[serde(default)]
    pub splits: Vec<InputSplit>,
    pub output_path: String,
    pub intermediate_bins: u32,
    pub runtime_id: String,
}

/// What the worker sends back: counters plus an optional typed error.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TaskResponse {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl TaskResponse {
    pub fn from_result(result: Result<TaskCounters, TaskError>) -> Self {
        match result {
            Ok(counters) => TaskResponse {
                bytes_read: counters.bytes_read,
                bytes_written: counters.bytes_written,
                error_kind: None,
                error_message: None,
            },
            Err(e) => TaskResponse {
                error_kind: Some(e.kind().to_string()),
                error_message: Some(e.to_string()),
                ..TaskResponse::default()
            },
        }
    }

    /// Fold a remote response back into the driver-side job: counters are
    /// accumulated, errors are rehydrated.
    pub fn into_result(self, job: &Job) -> Result<(), TaskError> {
        job.add_counters(TaskCounters {
            bytes_read: self.bytes_read,
            bytes_written: self.bytes_written,
        });
        match self.error_kind {
            None => Ok(()),
            Some(kind) => Err(TaskError::from_wire(
                &kind,
                self.error_message.unwrap_or_else(|| "unknown remote failure".to_string()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds_survive_the_wire() {
        let err = TaskError::UserReduce(anyhow::anyhow!("bad key"));
        let rebuilt = TaskError::from_wire(err.kind(), err.to_string());
        assert!(matches!(rebuilt, TaskError::UserReduce(_)));

        let rebuilt = TaskError::from_wire("no_such_kind", "x".to_string());
        assert!(matches!(rebuilt, TaskError::Transport(_)));
    }
}
