use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::runtime::task::{TaskId, WorkloadTag};

/// What happens to a child when its parent closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentClosePolicy {
    #[default]
    Terminate,
    RequestCancel,
    Abandon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Cancel,
}

/// Cooperative cancellation. A signal moves `Running` to `CancelRequested`;
/// the node's own loop moves it to `Cancelled` at its next checkpoint.
/// Nothing in flight is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelState {
    #[default]
    Running,
    CancelRequested,
    Cancelled,
}

impl CancelState {
    pub fn request(&mut self) {
        if *self == CancelState::Running {
            *self = CancelState::CancelRequested;
        }
    }

    /// Returns true once cancellation has been observed.
    pub fn checkpoint(&mut self) -> bool {
        if *self == CancelState::CancelRequested {
            *self = CancelState::Cancelled;
        }
        *self == CancelState::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChildSpec {
    pub id: TaskId,
    pub parent: Option<TaskId>,
    pub sequence: Option<u32>,
    pub tag: WorkloadTag,
    /// Whether the child runs its own one-time spawn phase.
    pub spawn: bool,
    pub parent_close_policy: ParentClosePolicy,
}

/// Non-owning reference to a started child: used for signalling and
/// result-waiting only. The runtime owns the child's lifecycle.
#[async_trait]
pub trait ChildHandle: Send + Sync {
    fn id(&self) -> &TaskId;
    /// Resolves once the child is terminal; `Err` unless it completed normally.
    async fn wait_result(&self) -> Result<()>;
    async fn signal(&self, signal: Signal) -> Result<()>;
}

#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn start_child(&self, spec: ChildSpec) -> Result<Arc<dyn ChildHandle>>;
}

/// Everything a started child receives from the runtime.
pub struct ChildContext {
    pub spec: ChildSpec,
    pub signals: mpsc::UnboundedReceiver<Signal>,
    pub launcher: Arc<dyn ChildLauncher>,
}

/// The code a launcher runs for each child it starts.
#[async_trait]
pub trait ChildBody: Send + Sync {
    async fn run(&self, ctx: ChildContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_observed_only_at_checkpoints() {
        let mut state = CancelState::default();
        assert!(!state.checkpoint());
        state.request();
        assert_eq!(state, CancelState::CancelRequested);
        assert!(state.checkpoint());
        assert_eq!(state, CancelState::Cancelled);
        state.request();
        assert_eq!(state, CancelState::Cancelled);
    }
}
