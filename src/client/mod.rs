//! Remote task API: list, terminate and batch-terminate executions.

use async_trait::async_trait;

use crate::error::Result;
use crate::runtime::task::TaskId;

pub mod http;
pub mod memory;
pub mod query;

pub use http::HttpTaskClient;
pub use memory::InMemoryTaskClient;
pub use query::TaskQuery;

#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn list_tasks(&self, query: &TaskQuery) -> Result<Vec<TaskId>>;

    /// Cheaper existence check; implementations may stop at the first hit.
    async fn any_task(&self, query: &TaskQuery) -> Result<bool> {
        Ok(!self.list_tasks(query).await?.is_empty())
    }

    /// Terminating an already terminal task succeeds as a no-op.
    async fn terminate(&self, id: &TaskId, reason: &str) -> Result<()>;

    /// Issue a server-side bulk termination for `query`; returns the job id.
    async fn start_batch_termination(&self, query: &TaskQuery, reason: &str) -> Result<String>;
}
