use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::client::{TaskClient, TaskQuery};
use crate::error::{CancelerError, Result};
use crate::runtime::task::WorkloadTag;

pub const DEFAULT_CONFIRM_DEADLINE: Duration = Duration::from_secs(240);
pub const DEFAULT_CONFIRM_POLL: Duration = Duration::from_secs(5);

/// Bounded liveness check: has the workload drained?
pub struct ConfirmationPoller {
    client: Arc<dyn TaskClient>,
    attribute: String,
    deadline: Duration,
    poll_interval: Duration,
}

impl ConfirmationPoller {
    pub fn new(
        client: Arc<dyn TaskClient>,
        attribute: impl Into<String>,
        deadline: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            attribute: attribute.into(),
            deadline,
            poll_interval,
        }
    }

    /// `true` as soon as no running task carries `tag`; `false` once the
    /// deadline is spent. `false` means "reconcile again", not failure.
    pub async fn confirm_drained(&self, tag: &WorkloadTag) -> Result<bool> {
        if self.poll_interval.is_zero() {
            return Err(CancelerError::Config("confirmation poll interval must be positive".into()));
        }
        let query = TaskQuery::running(self.attribute.clone(), tag.clone());
        let mut remaining = self.deadline;
        let mut checks = 0u32;

        while !remaining.is_zero() {
            checks += 1;
            if !self.client.any_task(&query).await? {
                debug!(workload_tag = %tag, checks, "workload drained");
                return Ok(true);
            }
            tokio::time::sleep(self.poll_interval).await;
            remaining = remaining.saturating_sub(self.poll_interval);
        }

        debug!(workload_tag = %tag, checks, "workload still running at deadline");
        Ok(false)
    }
}
