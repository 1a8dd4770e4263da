use tracing::debug;

use crate::client::{TaskClient, TaskQuery};
use crate::error::Result;
use crate::runtime::task::{TaskId, WorkloadTag};

/// Running tasks with `tag` that started at or after `started_at_or_after`
/// (an ISO-8601 UTC millisecond literal).
pub async fn query_new_executions(
    client: &dyn TaskClient,
    attribute: &str,
    tag: &WorkloadTag,
    started_at_or_after: &str,
) -> Result<Vec<TaskId>> {
    let query = TaskQuery::running(attribute, tag.clone()).started_at_or_after(started_at_or_after)?;
    let ids = client.list_tasks(&query).await?;
    debug!(query = %query, found = ids.len(), "queried new executions");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskClient;
    use crate::runtime::clock::{Clock, TokioClock};
    use crate::runtime::task::format_query_timestamp;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn only_tasks_started_since_the_bound_are_returned() {
        let clock = Arc::new(TokioClock::new());
        let client = InMemoryTaskClient::new(clock.clone());
        let tag = WorkloadTag::from("1");

        client.start_task("old", tag.clone(), None);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let since = format_query_timestamp(clock.now());
        tokio::time::sleep(Duration::from_secs(1)).await;
        client.start_task("new", tag.clone(), None);
        client.start_task("other", WorkloadTag::from("2"), None);

        let ids = query_new_executions(&client, "WorkloadId", &tag, &since).await.unwrap();
        assert_eq!(ids, vec![TaskId::from("new")]);
    }
}
