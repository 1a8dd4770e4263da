use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::client::InMemoryTaskClient;
use crate::error::{CancelerError, Result};
use crate::runtime::child::{ChildBody, ChildContext, ChildHandle, ChildLauncher, ChildSpec, Signal};
use crate::runtime::task::{TaskId, TaskStatus};

/// Runs each child as a tokio task registered in an [`InMemoryTaskClient`],
/// so local spawn trees are visible to queries and terminations.
#[derive(Clone)]
pub struct LocalLauncher {
    registry: InMemoryTaskClient,
    body: Arc<dyn ChildBody>,
}

impl LocalLauncher {
    pub fn new(registry: InMemoryTaskClient, body: Arc<dyn ChildBody>) -> Self {
        Self { registry, body }
    }

    pub fn registry(&self) -> &InMemoryTaskClient {
        &self.registry
    }
}

#[async_trait]
impl ChildLauncher for LocalLauncher {
    async fn start_child(&self, spec: ChildSpec) -> Result<Arc<dyn ChildHandle>> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let status = self.registry.register_child(&spec, signal_tx);
        let id = spec.id.clone();

        let ctx = ChildContext {
            spec,
            signals: signal_rx,
            launcher: Arc::new(self.clone()),
        };
        let body = self.body.clone();
        let registry = self.registry.clone();
        let task_id = id.clone();
        let join = tokio::spawn(async move {
            let final_status = match body.run(ctx).await {
                Ok(()) => TaskStatus::Closed,
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "task failed");
                    TaskStatus::Failed
                }
            };
            registry.close(&task_id, final_status);
            debug!(task_id = %task_id, status = %final_status, "task closed");
        });
        self.registry.attach_abort(&id, join.abort_handle());

        Ok(Arc::new(LocalChildHandle {
            id,
            status,
            registry: self.registry.clone(),
        }))
    }
}

struct LocalChildHandle {
    id: TaskId,
    status: watch::Receiver<TaskStatus>,
    registry: InMemoryTaskClient,
}

#[async_trait]
impl ChildHandle for LocalChildHandle {
    fn id(&self) -> &TaskId {
        &self.id
    }

    async fn wait_result(&self) -> Result<()> {
        let mut status = self.status.clone();
        let closed = *status
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| CancelerError::Transport(format!("status channel for {} closed", self.id)))?;
        match closed {
            TaskStatus::Closed => Ok(()),
            other => Err(CancelerError::ChildClosed {
                id: self.id.clone(),
                status: other,
            }),
        }
    }

    async fn signal(&self, signal: Signal) -> Result<()> {
        self.registry.signal(&self.id, signal)
    }
}
