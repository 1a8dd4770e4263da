use std::sync::Arc;

use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CancelerError, Result};
use crate::runtime::operation::{ActivityHandler, Operation, OperationOutput, OperationTimeouts};
use crate::runtime::retry::RetryPolicy;
use crate::runtime::task::{TaskId, WorkloadTag};

/// Single typed entry point for external calls. Wraps every attempt in the
/// retry policy and bounds the whole call by the operation's timeout.
pub struct Dispatcher {
    handler: Arc<dyn ActivityHandler>,
    retry: RetryPolicy,
    timeouts: OperationTimeouts,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn ActivityHandler>, retry: RetryPolicy, timeouts: OperationTimeouts) -> Self {
        Self {
            handler,
            retry,
            timeouts,
        }
    }

    pub async fn call(&self, op: Operation) -> Result<OperationOutput> {
        let name = op.name();
        let limit = self.timeouts.for_operation(&op);
        let deadline = Instant::now() + limit;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CancelerError::OperationTimedOut {
                    operation: name,
                    timeout: limit,
                });
            }

            let error = match timeout(remaining, self.handler.execute(op.clone())).await {
                Ok(Ok(output)) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "operation succeeded after retry");
                    }
                    return Ok(output);
                }
                Ok(Err(e)) => e,
                Err(_) => {
                    return Err(CancelerError::OperationTimedOut {
                        operation: name,
                        timeout: limit,
                    });
                }
            };

            if !error.is_retryable() || self.retry.is_exhausted(attempt) {
                return Err(error);
            }

            let delay = self.retry.delay_for(attempt);
            warn!(operation = name, attempt, error = %error, "operation failed; retrying in {:?}", delay);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if delay >= remaining {
                sleep(remaining).await;
                return Err(CancelerError::OperationTimedOut {
                    operation: name,
                    timeout: limit,
                });
            }
            sleep(delay).await;
        }
    }

    pub async fn generate_id(&self) -> Result<Uuid> {
        self.call(Operation::GenerateId).await?.into_id("generate_id")
    }

    pub async fn start_batch(&self, tag: &WorkloadTag, reason: &str) -> Result<String> {
        self.call(Operation::StartBatch {
            tag: tag.clone(),
            reason: reason.to_string(),
        })
        .await?
        .into_job_id("start_batch")
    }

    pub async fn query_new(&self, tag: &WorkloadTag, started_at_or_after: &str) -> Result<Vec<TaskId>> {
        self.call(Operation::QueryNew {
            tag: tag.clone(),
            started_at_or_after: started_at_or_after.to_string(),
        })
        .await?
        .into_ids("query_new_executions")
    }

    pub async fn terminate(&self, ids: Vec<TaskId>) -> Result<usize> {
        self.call(Operation::Terminate { ids })
            .await?
            .into_count("terminate_all")
    }

    pub async fn confirm(&self, tag: &WorkloadTag) -> Result<bool> {
        self.call(Operation::Confirm { tag: tag.clone() })
            .await?
            .into_drained("confirm_drained")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` attempts with the given error factory.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        error: fn() -> CancelerError,
    }

    #[async_trait]
    impl ActivityHandler for Flaky {
        async fn execute(&self, _op: Operation) -> Result<OperationOutput> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err((self.error)())
            } else {
                Ok(OperationOutput::Drained(true))
            }
        }
    }

    struct Hanging;

    #[async_trait]
    impl ActivityHandler for Hanging {
        async fn execute(&self, _op: Operation) -> Result<OperationOutput> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn tag() -> WorkloadTag {
        WorkloadTag::from("1")
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_with_backoff() {
        let handler = Arc::new(Flaky {
            failures: 3,
            calls: AtomicU32::new(0),
            error: || CancelerError::Transport("connection reset".into()),
        });
        let dispatcher = Dispatcher::new(handler.clone(), RetryPolicy::default(), OperationTimeouts::default());

        let started = Instant::now();
        assert!(dispatcher.confirm(&tag()).await.unwrap());
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        // 1s + 2s + 4s of backoff
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let handler = Arc::new(Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            error: || CancelerError::MissingCredentials("api key".into()),
        });
        let dispatcher = Dispatcher::new(handler.clone(), RetryPolicy::default(), OperationTimeouts::default());

        let err = dispatcher.confirm(&tag()).await.unwrap_err();
        assert!(matches!(err, CancelerError::MissingCredentials(_)));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_end_at_the_call_timeout() {
        let handler = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
            error: || CancelerError::Remote { status: 503, message: "unavailable".into() },
        });
        let timeouts = OperationTimeouts {
            confirm: Duration::from_secs(60),
            ..OperationTimeouts::default()
        };
        let dispatcher = Dispatcher::new(handler, RetryPolicy::default(), timeouts);

        let started = Instant::now();
        let err = dispatcher.confirm(&tag()).await.unwrap_err();
        assert!(matches!(
            err,
            CancelerError::OperationTimedOut { operation: "confirm_drained", .. }
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_times_out() {
        let timeouts = OperationTimeouts {
            query: Duration::from_secs(30),
            ..OperationTimeouts::default()
        };
        let dispatcher = Dispatcher::new(Arc::new(Hanging), RetryPolicy::default(), timeouts);
        let err = dispatcher
            .query_new(&tag(), "2024-01-01T00:00:00.000Z")
            .await
            .unwrap_err();
        assert!(matches!(err, CancelerError::OperationTimedOut { timeout, .. } if timeout == Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn wrong_output_variant_is_fatal() {
        let handler = Arc::new(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
            error: || CancelerError::Transport("unused".into()),
        });
        let dispatcher = Dispatcher::new(handler, RetryPolicy::default(), OperationTimeouts::default());
        let err = dispatcher.terminate(vec![TaskId::from("a")]).await.unwrap_err();
        assert!(matches!(err, CancelerError::UnexpectedOutput("terminate_all")));
    }
}
