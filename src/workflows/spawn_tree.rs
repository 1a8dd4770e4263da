use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{CancelerError, Result};
use crate::runtime::child::{
    CancelState, ChildBody, ChildContext, ChildHandle, ChildLauncher, ChildSpec, ParentClosePolicy, Signal,
};
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::task::{TaskId, WorkloadTag};

pub const DEFAULT_CHILDREN: u32 = 2000;
pub const DEFAULT_GRANDCHILDREN: u32 = 500;
pub const DEFAULT_SPAWN_CONCURRENCY: usize = 100;
pub const DEFAULT_PARK_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Forwards cancellation to its direct children.
    Root,
    Child,
}

#[derive(Debug, Clone)]
pub struct SpawnTreeConfig {
    /// Fan-out of the root.
    pub children: u32,
    /// Fan-out of each spawning child.
    pub grandchildren: u32,
    /// In-flight spawn operations per node.
    pub concurrency: usize,
    pub park_interval: Duration,
    pub tag: WorkloadTag,
    pub close_policy: ParentClosePolicy,
}

impl SpawnTreeConfig {
    pub fn new(tag: WorkloadTag) -> Self {
        Self {
            children: DEFAULT_CHILDREN,
            grandchildren: DEFAULT_GRANDCHILDREN,
            concurrency: DEFAULT_SPAWN_CONCURRENCY,
            park_interval: DEFAULT_PARK_INTERVAL,
            tag,
            close_policy: ParentClosePolicy::default(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            concurrency: settings.child_spawn_semaphore,
            ..Self::new(settings.workload_tag())
        }
    }

    fn fanout(&self, role: NodeRole) -> u32 {
        match role {
            NodeRole::Root => self.children,
            NodeRole::Child => self.grandchildren,
        }
    }
}

/// Where a node's run loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    NotStarted,
    SpawningChildren,
    WaitingForChildren,
    Parked,
    Cancelled,
}

type Children = Arc<Mutex<Vec<Arc<dyn ChildHandle>>>>;

/// One node of a spawn tree.
///
/// Runs a one-time spawn phase (bounded by a per-node semaphore), waits for
/// every spawned child to close, then parks in fixed cycles until cancelled.
/// Cancellation is cooperative: a signal only requests it, and the loop
/// observes it at its next checkpoint. In-flight spawns are never
/// interrupted, but a requested cancel ends the wait for children.
pub struct SpawnTreeNode {
    id: TaskId,
    role: NodeRole,
    spawn: bool,
    config: SpawnTreeConfig,
    dispatcher: Arc<Dispatcher>,
    launcher: Arc<dyn ChildLauncher>,
    children: Children,
    state: watch::Sender<CancelState>,
    phase: Mutex<NodePhase>,
}

impl SpawnTreeNode {
    pub fn new(
        id: TaskId,
        role: NodeRole,
        spawn: bool,
        config: SpawnTreeConfig,
        dispatcher: Arc<Dispatcher>,
        launcher: Arc<dyn ChildLauncher>,
    ) -> Self {
        let (state, _) = watch::channel(CancelState::Running);
        Self {
            id,
            role,
            spawn,
            config,
            dispatcher,
            launcher,
            children: Arc::new(Mutex::new(Vec::new())),
            state,
            phase: Mutex::new(NodePhase::NotStarted),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn state(&self) -> CancelState {
        *self.state.borrow()
    }

    pub fn phase(&self) -> NodePhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&self, phase: NodePhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    pub fn children(&self) -> Vec<Arc<dyn ChildHandle>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Runs the node until it observes cancellation, handling signals from
    /// `signals` concurrently.
    pub async fn run(&self, mut signals: mpsc::UnboundedReceiver<Signal>) -> Result<()> {
        let main = self.main_loop();
        tokio::pin!(main);
        tokio::select! {
            res = &mut main => res,
            // No more signals can arrive; keep running until torn down.
            () = self.handle_signals(&mut signals) => main.await,
        }
    }

    async fn main_loop(&self) -> Result<()> {
        let mut spawn = self.spawn;
        info!(task_id = %self.id, role = ?self.role, spawn, "spawn tree node started");

        loop {
            if self.checkpoint() {
                self.enter(NodePhase::Cancelled);
                info!(task_id = %self.id, "spawn tree node cancelled");
                return Ok(());
            }

            if spawn {
                spawn = false;
                self.enter(NodePhase::SpawningChildren);
                self.spawn_children().await?;
                self.enter(NodePhase::WaitingForChildren);
                self.wait_for_children().await;
                continue;
            }

            self.enter(NodePhase::Parked);
            debug!(task_id = %self.id, interval = ?self.config.park_interval, "parking");
            tokio::select! {
                _ = tokio::time::sleep(self.config.park_interval) => {}
                _ = self.cancel_requested() => {}
            }
        }
    }

    fn checkpoint(&self) -> bool {
        let mut cancelled = false;
        self.state.send_modify(|state| cancelled = state.checkpoint());
        cancelled
    }

    async fn cancel_requested(&self) {
        let mut state = self.state.subscribe();
        let closed = state.wait_for(|s| *s != CancelState::Running).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }

    async fn spawn_children(&self) -> Result<()> {
        let fanout = self.config.fanout(self.role);
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut set = JoinSet::new();

        for sequence in 0..fanout {
            let semaphore = semaphore.clone();
            let dispatcher = self.dispatcher.clone();
            let launcher = self.launcher.clone();
            let children = self.children.clone();
            let parent = self.id.clone();
            let tag = self.config.tag.clone();
            // Only the root's children spawn a further level.
            let spawn = self.role == NodeRole::Root;
            let parent_close_policy = self.config.close_policy;
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| CancelerError::Config("spawn semaphore closed".into()))?;
                let uuid = dispatcher.generate_id().await?;
                let spec = ChildSpec {
                    id: TaskId::new(format!("workflow-{uuid}")),
                    parent: Some(parent),
                    sequence: Some(sequence),
                    tag,
                    spawn,
                    parent_close_policy,
                };
                let handle = launcher.start_child(spec).await?;
                debug!(sequence, task_id = %handle.id(), "started child");
                children.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
                Ok::<_, CancelerError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.map_err(|e| CancelerError::Transport(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                warn!(task_id = %self.id, error = %e, "child spawn failed");
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        info!(task_id = %self.id, spawned = fanout, "spawn phase complete");
        Ok(())
    }

    /// Waits for every child to close. Individual child errors are logged
    /// and discarded; one failed branch never stops the wait on its siblings.
    async fn wait_for_children(&self) {
        let mut set = JoinSet::new();
        for handle in self.children() {
            set.spawn(async move { (handle.id().clone(), handle.wait_result().await) });
        }
        let waiting = set.len();

        let drain = async {
            let mut failed = 0usize;
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((id, Err(e))) => {
                        failed += 1;
                        debug!(task_id = %id, error = %e, "child closed with error; discarded");
                    }
                    Err(e) => warn!(error = %e, "child wait aborted; discarded"),
                }
            }
            failed
        };

        tokio::select! {
            failed = drain => info!(task_id = %self.id, waiting, failed, "all children closed"),
            _ = self.cancel_requested() => info!(task_id = %self.id, waiting, "stopped waiting for children on cancel"),
        }
    }

    async fn handle_signals(&self, signals: &mut mpsc::UnboundedReceiver<Signal>) {
        while let Some(signal) = signals.recv().await {
            match signal {
                Signal::Cancel => {
                    if self.state() != CancelState::Running {
                        debug!(task_id = %self.id, "cancel already requested; ignored");
                        continue;
                    }
                    info!(task_id = %self.id, role = ?self.role, "cancel received");
                    // Forward before requesting: once requested, the main loop
                    // may finish and drop this handler.
                    if self.role == NodeRole::Root {
                        self.forward_cancel().await;
                    }
                    self.state.send_modify(CancelState::request);
                }
            }
        }
    }

    /// Sends `Cancel` to each direct child. Per-child failures are logged
    /// and discarded. Returns how many signals were delivered.
    pub async fn forward_cancel(&self) -> usize {
        let mut set = JoinSet::new();
        for handle in self.children() {
            set.spawn(async move { (handle.id().clone(), handle.signal(Signal::Cancel).await) });
        }

        let mut delivered = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(()))) => delivered += 1,
                Ok((id, Err(e))) => warn!(task_id = %id, error = %e, "cancel signal dropped"),
                Err(e) => warn!(error = %e, "cancel signal task aborted"),
            }
        }
        info!(task_id = %self.id, delivered, "cancel forwarded to children");
        delivered
    }
}

/// Runs a [`SpawnTreeNode`] for every task a launcher starts. A [`ChildSpec`] without
/// a parent is the root.
pub struct SpawnTreeBody {
    config: SpawnTreeConfig,
    dispatcher: Arc<Dispatcher>,
}

impl SpawnTreeBody {
    pub fn new(config: SpawnTreeConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }
}

#[async_trait]
impl ChildBody for SpawnTreeBody {
    async fn run(&self, ctx: ChildContext) -> Result<()> {
        let role = if ctx.spec.parent.is_none() {
            NodeRole::Root
        } else {
            NodeRole::Child
        };
        let node = SpawnTreeNode::new(
            ctx.spec.id,
            role,
            ctx.spec.spawn,
            self.config.clone(),
            self.dispatcher.clone(),
            ctx.launcher,
        );
        node.run(ctx.signals).await
    }
}
