use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::runtime::task::{TaskInfo, TaskStatus, WorkloadTag, parse_query_timestamp};

pub const DEFAULT_WORKLOAD_ATTRIBUTE: &str = "WorkloadId";

/// Visibility predicate: tag equality, optional status equality and an
/// optional `StartTime >=` lower bound.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskQuery {
    attribute: String,
    tag: WorkloadTag,
    status: Option<TaskStatus>,
    started_at_or_after: Option<(String, DateTime<Utc>)>,
}

impl TaskQuery {
    pub fn tagged(attribute: impl Into<String>, tag: WorkloadTag) -> Self {
        Self {
            attribute: attribute.into(),
            tag,
            status: None,
            started_at_or_after: None,
        }
    }

    pub fn running(attribute: impl Into<String>, tag: WorkloadTag) -> Self {
        Self::tagged(attribute, tag).with_status(TaskStatus::Running)
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// `ts` is kept verbatim for rendering and parsed once for local matching.
    pub fn started_at_or_after(mut self, ts: &str) -> Result<Self> {
        let parsed = parse_query_timestamp(ts)?;
        self.started_at_or_after = Some((ts.to_string(), parsed));
        Ok(self)
    }

    pub fn tag(&self) -> &WorkloadTag {
        &self.tag
    }

    pub fn matches(&self, task: &TaskInfo) -> bool {
        if task.tag != self.tag {
            return false;
        }
        if let Some(status) = self.status
            && task.status != status
        {
            return false;
        }
        match &self.started_at_or_after {
            Some((_, lower)) => task.start_time >= *lower,
            None => true,
        }
    }
}

impl fmt::Display for TaskQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = \"{}\"", self.attribute, self.tag)?;
        if let Some(status) = self.status {
            write!(f, " AND ExecutionStatus = \"{}\"", status)?;
        }
        if let Some((raw, _)) = &self.started_at_or_after {
            write!(f, " AND StartTime >= \"{}\"", raw)?;
        }
        Ok(())
    }
}
