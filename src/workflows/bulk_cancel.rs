use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::activities::DEFAULT_REASON;
use crate::config::Settings;
use crate::error::{CancelerError, Result};
use crate::runtime::clock::Clock;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::task::{BatchOperation, WorkloadTag};

pub const DEFAULT_MAX_POLLS: u32 = 60;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The workload was confirmed drained on `attempts`.
    Success { attempts: u32 },
    /// Every reconciliation attempt ran without confirming a drain. The
    /// caller decides whether to run again.
    Exhausted { attempts: u32 },
}

impl CancelOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CancelOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    BatchIssued,
    Reconciling { attempt: u32 },
    Draining { attempt: u32 },
    Done(CancelOutcome),
}

#[derive(Debug, Clone)]
pub struct BulkCancelConfig {
    pub tag: WorkloadTag,
    pub max_polls: u32,
    pub poll_interval: Duration,
    pub reason: String,
}

impl BulkCancelConfig {
    pub fn new(tag: WorkloadTag) -> Self {
        Self {
            tag,
            max_polls: DEFAULT_MAX_POLLS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reason: DEFAULT_REASON.to_string(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            tag: settings.workload_tag(),
            max_polls: settings.max_polls,
            poll_interval: settings.poll_interval(),
            reason: DEFAULT_REASON.to_string(),
        }
    }
}

/// Terminates every running task with a workload tag, then keeps
/// reconciling against tasks that started after the batch was issued
/// until the tag is confirmed drained or attempts run out.
///
/// Re-running with the same batch timestamp is safe: terminating a task
/// that is already terminal counts as success.
pub struct BulkCancelWorkflow {
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    config: BulkCancelConfig,
    phase: Phase,
    batch: Option<BatchOperation>,
}

impl BulkCancelWorkflow {
    pub fn new(dispatcher: Arc<Dispatcher>, clock: Arc<dyn Clock>, config: BulkCancelConfig) -> Self {
        Self {
            dispatcher,
            clock,
            config,
            phase: Phase::Start,
            batch: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn batch(&self) -> Option<&BatchOperation> {
        self.batch.as_ref()
    }

    pub async fn run(&mut self) -> Result<CancelOutcome> {
        let tag = self.config.tag.clone();
        if self.config.max_polls == 0 {
            return Err(CancelerError::Config("max_polls must be at least 1".into()));
        }

        let batch = match self.batch.clone() {
            Some(batch) => batch,
            None => self.issue_batch(&tag).await?,
        };
        let since = batch.query_lower_bound();

        for attempt in 1..=self.config.max_polls {
            self.phase = Phase::Reconciling { attempt };
            let new_ids = self.dispatcher.query_new(&tag, &since).await?;
            if !new_ids.is_empty() {
                let found = new_ids.len();
                let terminated = self.dispatcher.terminate(new_ids).await?;
                info!(workload_tag = %tag, attempt, found, terminated, "terminated executions started after batch");
            }

            self.phase = Phase::Draining { attempt };
            if self.dispatcher.confirm(&tag).await? {
                info!(workload_tag = %tag, attempt, "workload drained");
                return Ok(self.finish(CancelOutcome::Success { attempts: attempt }));
            }

            warn!(workload_tag = %tag, attempt, max_polls = self.config.max_polls, "workload not drained yet");
            if attempt < self.config.max_polls {
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }

        error!(workload_tag = %tag, attempts = self.config.max_polls, "reconciliation exhausted");
        Ok(self.finish(CancelOutcome::Exhausted {
            attempts: self.config.max_polls,
        }))
    }

    async fn issue_batch(&mut self, tag: &WorkloadTag) -> Result<BatchOperation> {
        let issued_at = self.clock.now();
        let job_id = match self.dispatcher.start_batch(tag, &self.config.reason).await {
            Ok(job_id) => Some(job_id),
            // Reconciliation covers the same set, so a lost batch only costs time.
            Err(e) if e.is_retryable() || matches!(e, CancelerError::OperationTimedOut { .. }) => {
                warn!(workload_tag = %tag, error = %e, "batch termination request failed; reconciling anyway");
                None
            }
            Err(e) => return Err(e),
        };
        let batch = BatchOperation::new(job_id, issued_at);
        info!(
            workload_tag = %tag,
            job_id = batch.job_id.as_deref().unwrap_or("-"),
            since = %batch.query_lower_bound(),
            "batch issued"
        );
        self.batch = Some(batch.clone());
        self.phase = Phase::BatchIssued;
        Ok(batch)
    }

    fn finish(&mut self, outcome: CancelOutcome) -> CancelOutcome {
        self.phase = Phase::Done(outcome);
        outcome
    }
}
