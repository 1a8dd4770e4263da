use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client::{TaskClient, TaskQuery};
use crate::error::{CancelerError, Result};
use crate::runtime::child::{ChildSpec, ParentClosePolicy, Signal};
use crate::runtime::clock::Clock;
use crate::runtime::task::{TaskId, TaskInfo, TaskStatus, WorkloadTag};

struct TaskRecord {
    info: TaskInfo,
    close_policy: ParentClosePolicy,
    status_tx: watch::Sender<TaskStatus>,
    abort: Option<AbortHandle>,
    signals: Option<mpsc::UnboundedSender<Signal>>,
}

#[derive(Default)]
struct Registry {
    tasks: DashMap<TaskId, TaskRecord>,
    // parent -> direct children
    children: DashMap<TaskId, Vec<TaskId>>,
    failing: DashSet<TaskId>,
    terminate_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    batches: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Behaviour {
    batch_latency: Duration,
    batch_lag: Option<Duration>,
    terminate_latency: Duration,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            batch_latency: Duration::ZERO,
            batch_lag: Some(Duration::ZERO),
            terminate_latency: Duration::ZERO,
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process task registry standing in for the remote task API.
///
/// Also acts as the lifecycle owner for tasks started by
/// [`LocalLauncher`](crate::runtime::launcher::LocalLauncher): closing a task
/// applies each child's [`ParentClosePolicy`].
#[derive(Clone)]
pub struct InMemoryTaskClient {
    inner: Arc<Registry>,
    clock: Arc<dyn Clock>,
    behaviour: Behaviour,
}

impl InMemoryTaskClient {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Registry::default()),
            clock,
            behaviour: Behaviour::default(),
        }
    }

    /// Time the batch request itself takes before returning a job id.
    pub fn with_batch_latency(mut self, latency: Duration) -> Self {
        self.behaviour.batch_latency = latency;
        self
    }

    /// Delay between accepting a batch and terminating its snapshot.
    pub fn with_batch_lag(mut self, lag: Duration) -> Self {
        self.behaviour.batch_lag = Some(lag);
        self
    }

    /// Batches are accepted but never executed.
    pub fn with_inert_batches(mut self) -> Self {
        self.behaviour.batch_lag = None;
        self
    }

    pub fn with_terminate_latency(mut self, latency: Duration) -> Self {
        self.behaviour.terminate_latency = latency;
        self
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn insert(&self, info: TaskInfo) {
        let (status_tx, _) = watch::channel(info.status);
        self.inner.tasks.insert(
            info.id.clone(),
            TaskRecord {
                info,
                close_policy: ParentClosePolicy::Abandon,
                status_tx,
                abort: None,
                signals: None,
            },
        );
    }

    /// Registers a running task that started now.
    pub fn start_task(&self, id: impl Into<TaskId>, tag: WorkloadTag, sequence: Option<u32>) -> TaskInfo {
        let info = TaskInfo {
            id: id.into(),
            sequence,
            tag,
            status: TaskStatus::Running,
            start_time: self.clock.now(),
        };
        self.insert(info.clone());
        info
    }

    pub(crate) fn register_child(
        &self,
        spec: &ChildSpec,
        signals: mpsc::UnboundedSender<Signal>,
    ) -> watch::Receiver<TaskStatus> {
        let (status_tx, status_rx) = watch::channel(TaskStatus::Running);
        let info = TaskInfo {
            id: spec.id.clone(),
            sequence: spec.sequence,
            tag: spec.tag.clone(),
            status: TaskStatus::Running,
            start_time: self.clock.now(),
        };
        self.inner.tasks.insert(
            spec.id.clone(),
            TaskRecord {
                info,
                close_policy: spec.parent_close_policy,
                status_tx,
                abort: None,
                signals: Some(signals),
            },
        );
        if let Some(parent) = &spec.parent {
            self.inner
                .children
                .entry(parent.clone())
                .or_default()
                .push(spec.id.clone());
        }
        status_rx
    }

    pub(crate) fn attach_abort(&self, id: &TaskId, abort: AbortHandle) {
        if let Some(mut record) = self.inner.tasks.get_mut(id)
            && !record.info.status.is_terminal()
        {
            record.abort = Some(abort);
            return;
        }
        // Closed before the handle arrived.
        abort.abort();
    }

    pub fn get(&self, id: &TaskId) -> Option<TaskInfo> {
        self.inner.tasks.get(id).map(|r| r.info.clone())
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.inner.tasks.get(id).map(|r| r.info.status)
    }

    pub fn subscribe(&self, id: &TaskId) -> Option<watch::Receiver<TaskStatus>> {
        self.inner.tasks.get(id).map(|r| r.status_tx.subscribe())
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.tasks.is_empty()
    }

    pub fn running_count(&self, tag: &WorkloadTag) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|r| &r.info.tag == tag && r.info.status == TaskStatus::Running)
            .count()
    }

    /// Moves a task to `status`. Terminal statuses close it, as a natural
    /// completion would.
    pub fn set_status(&self, id: &TaskId, status: TaskStatus) {
        if status.is_terminal() {
            self.close(id, status);
        } else if let Some(mut record) = self.inner.tasks.get_mut(id) {
            record.info.status = status;
            record.status_tx.send_replace(status);
        }
    }

    /// Every later `terminate(id)` fails with a transport error.
    pub fn fail_terminations_for(&self, id: impl Into<TaskId>) {
        self.inner.failing.insert(id.into());
    }

    pub fn terminate_calls(&self) -> usize {
        self.inner.terminate_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_terminations(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn batches_started(&self) -> usize {
        self.inner.batches.load(Ordering::SeqCst)
    }

    pub fn signal(&self, id: &TaskId, signal: Signal) -> Result<()> {
        let sender = self
            .inner
            .tasks
            .get(id)
            .and_then(|r| r.signals.clone())
            .ok_or_else(|| CancelerError::TaskNotFound(id.clone()))?;
        sender
            .send(signal)
            .map_err(|_| CancelerError::TaskNotFound(id.clone()))
    }

    /// Closes `id` with `status` and applies the close policy of each of its
    /// children, transitively for `Terminate`. Returns false if `id` was
    /// missing or already terminal.
    pub(crate) fn close(&self, id: &TaskId, status: TaskStatus) -> bool {
        let mut changed = false;
        let mut pending = vec![(id.clone(), status)];

        while let Some((id, status)) = pending.pop() {
            let abort = {
                let Some(mut record) = self.inner.tasks.get_mut(&id) else {
                    continue;
                };
                if record.info.status.is_terminal() {
                    continue;
                }
                record.info.status = status;
                record.status_tx.send_replace(status);
                record.signals = None;
                record.abort.take()
            };
            changed = true;
            if let Some(abort) = abort {
                abort.abort();
            }

            let children = self
                .inner
                .children
                .get(&id)
                .map(|c| c.value().clone())
                .unwrap_or_default();
            for child in children {
                let policy = match self.inner.tasks.get(&child) {
                    Some(r) if !r.info.status.is_terminal() => r.close_policy,
                    _ => continue,
                };
                match policy {
                    ParentClosePolicy::Terminate => pending.push((child, TaskStatus::Terminated)),
                    ParentClosePolicy::RequestCancel => {
                        if let Err(e) = self.signal(&child, Signal::Cancel) {
                            debug!(task_id = %child, error = %e, "cancel request on parent close dropped");
                        }
                    }
                    ParentClosePolicy::Abandon => {}
                }
            }
        }
        changed
    }

    async fn terminate_one(&self, id: &TaskId, reason: &str) -> Result<()> {
        if !self.behaviour.terminate_latency.is_zero() {
            tokio::time::sleep(self.behaviour.terminate_latency).await;
        }
        if self.inner.failing.contains(id) {
            return Err(CancelerError::Transport(format!("injected failure terminating {id}")));
        }
        match self.status(id) {
            None => Err(CancelerError::TaskNotFound(id.clone())),
            Some(status) if status.is_terminal() => {
                debug!(task_id = %id, %status, "terminate on closed task is a no-op");
                Ok(())
            }
            Some(_) => {
                self.close(id, TaskStatus::Terminated);
                debug!(task_id = %id, reason, "terminated");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl TaskClient for InMemoryTaskClient {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskId>> {
        let mut ids: Vec<TaskId> = self
            .inner
            .tasks
            .iter()
            .filter(|r| query.matches(&r.info))
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn any_task(&self, query: &TaskQuery) -> Result<bool> {
        Ok(self.inner.tasks.iter().any(|r| query.matches(&r.info)))
    }

    async fn terminate(&self, id: &TaskId, reason: &str) -> Result<()> {
        self.inner.terminate_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.inner.in_flight);
        self.terminate_one(id, reason).await
    }

    async fn start_batch_termination(&self, query: &TaskQuery, reason: &str) -> Result<String> {
        // The batch covers what matched when the request was made.
        let snapshot = self.list_tasks(query).await?;
        let job_id = Uuid::new_v4().to_string();
        self.inner.batches.fetch_add(1, Ordering::SeqCst);

        if !self.behaviour.batch_latency.is_zero() {
            tokio::time::sleep(self.behaviour.batch_latency).await;
        }

        if let Some(lag) = self.behaviour.batch_lag {
            let client = self.clone();
            let job = job_id.clone();
            let reason = reason.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(lag).await;
                let mut terminated = 0;
                for id in &snapshot {
                    if client.close(id, TaskStatus::Terminated) {
                        terminated += 1;
                    }
                }
                info!(job_id = %job, terminated, reason = %reason, "batch termination finished");
            });
        }
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::clock::TokioClock;

    fn client() -> InMemoryTaskClient {
        InMemoryTaskClient::new(Arc::new(TokioClock::new()))
    }

    fn tag() -> WorkloadTag {
        WorkloadTag::from("1")
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let client = client();
        let task = client.start_task("a", tag(), None);

        client.terminate(&task.id, "test").await.unwrap();
        client.terminate(&task.id, "test").await.unwrap();
        assert_eq!(client.status(&task.id), Some(TaskStatus::Terminated));
        assert_eq!(client.terminate_calls(), 2);
    }

    #[tokio::test]
    async fn terminate_unknown_task_fails() {
        let client = client();
        let err = client.terminate(&TaskId::from("ghost"), "test").await.unwrap_err();
        assert!(matches!(err, CancelerError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn closing_a_parent_applies_child_policies() {
        let client = client();
        let parent = ChildSpec {
            id: TaskId::from("root"),
            parent: None,
            sequence: None,
            tag: tag(),
            spawn: true,
            parent_close_policy: ParentClosePolicy::Terminate,
        };
        let (tx, _rx_root) = mpsc::unbounded_channel();
        client.register_child(&parent, tx);

        let mut specs = Vec::new();
        let mut receivers = Vec::new();
        for (name, policy) in [
            ("terminated", ParentClosePolicy::Terminate),
            ("requested", ParentClosePolicy::RequestCancel),
            ("abandoned", ParentClosePolicy::Abandon),
        ] {
            let spec = ChildSpec {
                id: TaskId::from(name),
                parent: Some(parent.id.clone()),
                sequence: Some(0),
                tag: tag(),
                spawn: false,
                parent_close_policy: policy,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            client.register_child(&spec, tx);
            specs.push(spec);
            receivers.push(rx);
        }

        assert!(client.close(&parent.id, TaskStatus::Terminated));
        assert_eq!(client.status(&specs[0].id), Some(TaskStatus::Terminated));
        assert_eq!(client.status(&specs[1].id), Some(TaskStatus::Running));
        assert_eq!(receivers[1].try_recv().unwrap(), Signal::Cancel);
        assert_eq!(client.status(&specs[2].id), Some(TaskStatus::Running));
        assert!(!client.close(&parent.id, TaskStatus::Terminated));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_terminates_only_its_snapshot() {
        let client = client().with_batch_lag(Duration::from_secs(10));
        client.start_task("a", tag(), None);
        client.start_task("b", tag(), None);

        let query = TaskQuery::running("WorkloadId", tag());
        client.start_batch_termination(&query, "test").await.unwrap();
        let late = client.start_task("late", tag(), None);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(client.list_tasks(&query).await.unwrap(), vec![late.id]);
        assert_eq!(client.batches_started(), 1);
    }
}
