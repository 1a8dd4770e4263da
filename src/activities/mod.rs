//! Leaf operations that talk to the task API. Each executes exactly one
//! attempt; the [`Dispatcher`](crate::runtime::dispatch::Dispatcher) owns
//! retries and timeouts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::client::{TaskClient, TaskQuery};
use crate::config::Settings;
use crate::error::Result;
use crate::runtime::operation::{ActivityHandler, Operation, OperationOutput};

pub mod poller;
pub mod query;
pub mod terminator;

pub use poller::{ConfirmationPoller, DEFAULT_CONFIRM_DEADLINE, DEFAULT_CONFIRM_POLL};
pub use query::query_new_executions;
pub use terminator::{BulkTerminator, DEFAULT_CANCEL_CONCURRENCY, DEFAULT_REASON};

/// Routes every [`Operation`] to the task client.
pub struct TaskActivities {
    client: Arc<dyn TaskClient>,
    attribute: String,
    terminator: BulkTerminator,
    poller: ConfirmationPoller,
}

impl TaskActivities {
    pub fn new(
        client: Arc<dyn TaskClient>,
        attribute: impl Into<String>,
        concurrency_limit: usize,
        confirm_deadline: Duration,
        confirm_poll: Duration,
    ) -> Self {
        let attribute = attribute.into();
        Self {
            terminator: BulkTerminator::new(client.clone(), concurrency_limit),
            poller: ConfirmationPoller::new(client.clone(), attribute.clone(), confirm_deadline, confirm_poll),
            client,
            attribute,
        }
    }

    pub fn from_settings(client: Arc<dyn TaskClient>, settings: &Settings) -> Self {
        Self::new(
            client,
            settings.workload_attribute.clone(),
            settings.cancel_concurrency,
            settings.confirm_deadline(),
            settings.confirm_poll(),
        )
    }
}

#[async_trait]
impl ActivityHandler for TaskActivities {
    async fn execute(&self, op: Operation) -> Result<OperationOutput> {
        match op {
            Operation::GenerateId => Ok(OperationOutput::Id(Uuid::new_v4())),
            Operation::StartBatch { tag, reason } => {
                let query = TaskQuery::running(self.attribute.clone(), tag);
                let job_id = self.client.start_batch_termination(&query, &reason).await?;
                info!(job_id = %job_id, query = %query, "batch termination requested");
                Ok(OperationOutput::JobId(job_id))
            }
            Operation::QueryNew {
                tag,
                started_at_or_after,
            } => {
                let ids =
                    query_new_executions(self.client.as_ref(), &self.attribute, &tag, &started_at_or_after).await?;
                Ok(OperationOutput::Ids(ids))
            }
            Operation::Terminate { ids } => Ok(OperationOutput::Count(self.terminator.terminate_all(&ids).await)),
            Operation::Confirm { tag } => Ok(OperationOutput::Drained(self.poller.confirm_drained(&tag).await?)),
        }
    }
}
