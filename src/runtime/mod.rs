//! Boundary to the durable-execution runtime: time, retries, typed
//! operation dispatch, child lifecycle and blob storage.

pub mod child;
pub mod clock;
pub mod dispatch;
pub mod launcher;
pub mod operation;
pub mod redis_storage;
pub mod retry;
pub mod storage;
pub mod task;
