use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::TaskClient;
use crate::runtime::task::TaskId;

pub const DEFAULT_CANCEL_CONCURRENCY: usize = 750;
pub const DEFAULT_REASON: &str = "Runaway Train";

/// Best-effort parallel termination under a concurrency cap.
pub struct BulkTerminator {
    client: Arc<dyn TaskClient>,
    concurrency_limit: usize,
    reason: String,
}

impl BulkTerminator {
    pub fn new(client: Arc<dyn TaskClient>, concurrency_limit: usize) -> Self {
        Self {
            client,
            concurrency_limit: concurrency_limit.max(1),
            reason: DEFAULT_REASON.to_string(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    /// Returns how many termination requests succeeded. Individual failures
    /// (not found, transport errors, panics) are counted out, never raised.
    /// Duplicate ids are terminated once.
    pub async fn terminate_all(&self, ids: &[TaskId]) -> usize {
        let semaphore = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut seen = HashSet::with_capacity(ids.len());
        let mut set = JoinSet::new();

        for id in ids {
            if !seen.insert(id) {
                continue;
            }
            let id = id.clone();
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let reason = self.reason.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return false;
                };
                match client.terminate(&id, &reason).await {
                    Ok(()) => true,
                    Err(e) => {
                        debug!(task_id = %id, error = %e, "termination failed");
                        false
                    }
                }
            });
        }

        let requested = set.len();
        let mut succeeded = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "termination task aborted"),
            }
        }

        info!(requested, succeeded, failed = requested - succeeded, "bulk termination finished");
        succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskClient;
    use crate::runtime::clock::TokioClock;
    use crate::runtime::task::{TaskStatus, WorkloadTag};
    use std::time::Duration;

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    #[tokio::test]
    async fn counts_only_successful_terminations() {
        let client = InMemoryTaskClient::new(Arc::new(TokioClock::new()));
        let tag = WorkloadTag::from("1");
        for name in ["a", "b", "c", "d"] {
            client.start_task(name, tag.clone(), None);
        }
        client.fail_terminations_for("c");

        let terminator = BulkTerminator::new(Arc::new(client.clone()), 2);
        // "ghost" is unknown, "c" fails in transport.
        let n = terminator.terminate_all(&ids(&["a", "b", "c", "d", "ghost"])).await;

        assert_eq!(n, 3);
        assert_eq!(client.status(&TaskId::from("a")), Some(TaskStatus::Terminated));
        assert_eq!(client.status(&TaskId::from("c")), Some(TaskStatus::Running));
    }

    #[tokio::test]
    async fn already_terminal_tasks_count_as_success() {
        let client = InMemoryTaskClient::new(Arc::new(TokioClock::new()));
        let task = client.start_task("done", WorkloadTag::from("1"), None);
        client.set_status(&task.id, TaskStatus::Closed);

        let terminator = BulkTerminator::new(Arc::new(client), 10);
        assert_eq!(terminator.terminate_all(&[task.id]).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_concurrency_limit() {
        let client = InMemoryTaskClient::new(Arc::new(TokioClock::new()))
            .with_terminate_latency(Duration::from_millis(50));
        let tag = WorkloadTag::from("1");
        let all: Vec<TaskId> = (0..40)
            .map(|i| client.start_task(format!("t{i}"), tag.clone(), None).id)
            .collect();

        let terminator = BulkTerminator::new(Arc::new(client.clone()), 4);
        assert_eq!(terminator.terminate_all(&all).await, 40);
        assert_eq!(client.max_concurrent_terminations(), 4);
        assert_eq!(client.running_count(&tag), 0);
    }

    #[tokio::test]
    async fn duplicates_are_terminated_once() {
        let client = InMemoryTaskClient::new(Arc::new(TokioClock::new()));
        client.start_task("a", WorkloadTag::from("1"), None);

        let terminator = BulkTerminator::new(Arc::new(client.clone()), 3);
        assert_eq!(terminator.terminate_all(&ids(&["a", "a", "a"])).await, 1);
        assert_eq!(client.terminate_calls(), 1);
    }

    #[tokio::test]
    async fn empty_input_is_zero() {
        let client = InMemoryTaskClient::new(Arc::new(TokioClock::new()));
        let terminator = BulkTerminator::new(Arc::new(client), 750);
        assert_eq!(terminator.terminate_all(&[]).await, 0);
    }
}
