//! Top-level orchestrations. They share the task model and the dispatcher
//! but never nest.

pub mod bulk_cancel;
pub mod spawn_tree;

pub use bulk_cancel::{BulkCancelConfig, BulkCancelWorkflow, CancelOutcome, Phase};
pub use spawn_tree::{NodePhase, NodeRole, SpawnTreeBody, SpawnTreeConfig, SpawnTreeNode};
