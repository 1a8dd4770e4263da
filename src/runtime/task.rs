use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CancelerError, Result};

/// Identifier of a remote task (an "execution").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Grouping key shared by every task of one workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadTag(String);

impl WorkloadTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkloadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkloadTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkloadTag {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for WorkloadTag {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Running,
    Closed,
    Canceled,
    Terminated,
    Failed,
    Unknown,
}

impl TaskStatus {
    /// Terminal tasks never change again and drop out of every query.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Closed | TaskStatus::Canceled | TaskStatus::Terminated | TaskStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "Running",
            TaskStatus::Closed => "Completed",
            TaskStatus::Canceled => "Canceled",
            TaskStatus::Terminated => "Terminated",
            TaskStatus::Failed => "Failed",
            TaskStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    /// Fan-out label; only meaningful for spawn-tree children.
    pub sequence: Option<u32>,
    pub tag: WorkloadTag,
    pub status: TaskStatus,
    pub start_time: DateTime<Utc>,
}

/// Marks when a bulk action was issued. Created once per orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOperation {
    /// Remote job id, absent when the batch request itself failed.
    pub job_id: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl BatchOperation {
    pub fn new(job_id: Option<String>, issued_at: DateTime<Utc>) -> Self {
        Self { job_id, issued_at }
    }

    /// Lower bound for "started after the batch" queries.
    pub fn query_lower_bound(&self) -> String {
        format_query_timestamp(self.issued_at)
    }
}

/// `2024-01-01T12:00:00.123Z`: UTC, millisecond precision, `Z` suffix.
pub fn format_query_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn parse_query_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| CancelerError::InvalidQuery(format!("bad timestamp {raw:?}: {e}")))
}
