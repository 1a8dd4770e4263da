use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{CancelerError, Result};
use crate::runtime::task::{TaskId, WorkloadTag};

/// Every externally dispatched call the orchestrations make.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Fresh identifier for a child task.
    GenerateId,
    /// Ask the remote side to terminate every running task with `tag`.
    StartBatch { tag: WorkloadTag, reason: String },
    /// Running tasks with `tag` that started at or after `started_at_or_after`.
    QueryNew {
        tag: WorkloadTag,
        started_at_or_after: String,
    },
    /// Bounded-concurrency best-effort termination.
    Terminate { ids: Vec<TaskId> },
    /// Poll until no running task carries `tag`, or the poll deadline passes.
    Confirm { tag: WorkloadTag },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GenerateId => "generate_id",
            Operation::StartBatch { .. } => "start_batch",
            Operation::QueryNew { .. } => "query_new_executions",
            Operation::Terminate { .. } => "terminate_all",
            Operation::Confirm { .. } => "confirm_drained",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Id(Uuid),
    JobId(String),
    Ids(Vec<TaskId>),
    Count(usize),
    Drained(bool),
}

impl OperationOutput {
    pub fn into_id(self, op: &'static str) -> Result<Uuid> {
        match self {
            OperationOutput::Id(id) => Ok(id),
            _ => Err(CancelerError::UnexpectedOutput(op)),
        }
    }

    pub fn into_job_id(self, op: &'static str) -> Result<String> {
        match self {
            OperationOutput::JobId(id) => Ok(id),
            _ => Err(CancelerError::UnexpectedOutput(op)),
        }
    }

    pub fn into_ids(self, op: &'static str) -> Result<Vec<TaskId>> {
        match self {
            OperationOutput::Ids(ids) => Ok(ids),
            _ => Err(CancelerError::UnexpectedOutput(op)),
        }
    }

    pub fn into_count(self, op: &'static str) -> Result<usize> {
        match self {
            OperationOutput::Count(n) => Ok(n),
            _ => Err(CancelerError::UnexpectedOutput(op)),
        }
    }

    pub fn into_drained(self, op: &'static str) -> Result<bool> {
        match self {
            OperationOutput::Drained(b) => Ok(b),
            _ => Err(CancelerError::UnexpectedOutput(op)),
        }
    }
}

/// Hard start-to-close limit per operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub generate_id: Duration,
    pub query: Duration,
    pub terminate: Duration,
    pub confirm: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            generate_id: Duration::from_secs(60),
            query: Duration::from_secs(10 * 60),
            terminate: Duration::from_secs(25 * 60),
            confirm: Duration::from_secs(15 * 60),
        }
    }
}

impl OperationTimeouts {
    pub fn for_operation(&self, op: &Operation) -> Duration {
        match op {
            Operation::GenerateId => self.generate_id,
            Operation::QueryNew { .. } => self.query,
            Operation::StartBatch { .. } | Operation::Terminate { .. } => self.terminate,
            Operation::Confirm { .. } => self.confirm,
        }
    }
}

/// Executes one attempt of an operation. Retries and timeouts live in the
/// [`Dispatcher`](crate::runtime::dispatch::Dispatcher), not here.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn execute(&self, op: Operation) -> Result<OperationOutput>;
}
