//! Bulk cancellation and spawn-tree orchestration of remote tasks grouped by
//! a workload tag, plus an oversized-payload codec for messages crossing the
//! orchestration boundary.

pub mod activities;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod runtime;
pub mod workflows;

pub use error::{CancelerError, Result};
