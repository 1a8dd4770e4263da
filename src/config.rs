//! Settings from environment variables or a YAML file.
//!
//! Environment variables (all optional; `.env` is loaded first if present):
//! - `CANCELER_API_ADDRESS`: task API base URL (default: http://127.0.0.1:7243)
//! - `CANCELER_NAMESPACE`: task namespace (default: default)
//! - `CANCELER_API_KEY`: bearer token, required by the HTTP client only
//! - `CANCEL_CONCURRENCY`: in-flight terminations (default: 750)
//! - `CONFIRM_TIMEOUT_SECONDS` / `CONFIRM_POLL_SECONDS`: drain confirmation deadline and poll (default: 240 / 5)
//! - `MAX_POLLS` / `POLL_INTERVAL_SECONDS`: reconciliation attempts and the sleep between them (default: 60 / 5)
//! - `PAYLOAD_MIN_BYTES`: codec externalization threshold (default: 1000000)
//! - `PAYLOAD_PATH`: blob directory for the file store (default: /tmp/payloads)
//! - `PAYLOAD_REDIS_URL`: use Redis for blobs instead of the file store
//! - `WORKLOAD_ATTRIBUTE` / `WORKLOAD_ID`: tag attribute name and value (default: WorkloadId / 1)
//! - `CHILD_SPAWN_SEMAPHORE`: in-flight spawns per spawn-tree node (default: 100)
//! - `RETRY_INITIAL_MS` / `RETRY_MAX_MS` / `RETRY_BACKOFF`: dispatcher backoff (default: 1000 / 10000 / 2.0)
//! - `QUERY_TIMEOUT_SECONDS` / `CANCEL_TIMEOUT_SECONDS` / `CONFIRM_CALL_TIMEOUT_SECONDS`:
//!   per-call hard timeouts (default: 600 / 1500 / 900)

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CancelerError, Result};
use crate::runtime::operation::OperationTimeouts;
use crate::runtime::retry::RetryPolicy;
use crate::runtime::task::WorkloadTag;

pub const DEFAULT_API_ADDRESS: &str = "http://127.0.0.1:7243";
pub const DEFAULT_PAYLOAD_PATH: &str = "/tmp/payloads";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_address: String,
    pub namespace: String,
    pub api_key: Option<String>,

    pub cancel_concurrency: usize,
    pub confirm_timeout_seconds: u64,
    pub confirm_poll_seconds: u64,
    pub max_polls: u32,
    pub poll_interval_seconds: u64,

    pub payload_min_bytes: usize,
    pub payload_path: PathBuf,
    pub payload_redis_url: Option<String>,

    pub workload_attribute: String,
    pub workload_id: String,
    pub child_spawn_semaphore: usize,

    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub retry_backoff: f64,

    pub query_timeout_seconds: u64,
    pub cancel_timeout_seconds: u64,
    pub confirm_call_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_address: DEFAULT_API_ADDRESS.to_string(),
            namespace: "default".to_string(),
            api_key: None,
            cancel_concurrency: 750,
            confirm_timeout_seconds: 240,
            confirm_poll_seconds: 5,
            max_polls: 60,
            poll_interval_seconds: 5,
            payload_min_bytes: 1_000_000,
            payload_path: PathBuf::from(DEFAULT_PAYLOAD_PATH),
            payload_redis_url: None,
            workload_attribute: "WorkloadId".to_string(),
            workload_id: "1".to_string(),
            child_spawn_semaphore: 100,
            retry_initial_ms: 1000,
            retry_max_ms: 10_000,
            retry_backoff: 2.0,
            query_timeout_seconds: 600,
            cancel_timeout_seconds: 1500,
            confirm_call_timeout_seconds: 900,
        }
    }
}

impl Settings {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads settings through `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut s = Self::default();

        if let Some(v) = lookup("CANCELER_API_ADDRESS") {
            s.api_address = v;
        }
        if let Some(v) = lookup("CANCELER_NAMESPACE") {
            s.namespace = v;
        }
        s.api_key = lookup("CANCELER_API_KEY").filter(|v| !v.is_empty());

        parse_into(&lookup, "CANCEL_CONCURRENCY", &mut s.cancel_concurrency)?;
        parse_into(&lookup, "CONFIRM_TIMEOUT_SECONDS", &mut s.confirm_timeout_seconds)?;
        parse_into(&lookup, "CONFIRM_POLL_SECONDS", &mut s.confirm_poll_seconds)?;
        parse_into(&lookup, "MAX_POLLS", &mut s.max_polls)?;
        parse_into(&lookup, "POLL_INTERVAL_SECONDS", &mut s.poll_interval_seconds)?;

        parse_into(&lookup, "PAYLOAD_MIN_BYTES", &mut s.payload_min_bytes)?;
        if let Some(v) = lookup("PAYLOAD_PATH") {
            s.payload_path = PathBuf::from(v);
        }
        s.payload_redis_url = lookup("PAYLOAD_REDIS_URL").filter(|v| !v.is_empty());

        if let Some(v) = lookup("WORKLOAD_ATTRIBUTE") {
            s.workload_attribute = v;
        }
        if let Some(v) = lookup("WORKLOAD_ID") {
            s.workload_id = v;
        }
        parse_into(&lookup, "CHILD_SPAWN_SEMAPHORE", &mut s.child_spawn_semaphore)?;

        parse_into(&lookup, "RETRY_INITIAL_MS", &mut s.retry_initial_ms)?;
        parse_into(&lookup, "RETRY_MAX_MS", &mut s.retry_max_ms)?;
        parse_into(&lookup, "RETRY_BACKOFF", &mut s.retry_backoff)?;

        parse_into(&lookup, "QUERY_TIMEOUT_SECONDS", &mut s.query_timeout_seconds)?;
        parse_into(&lookup, "CANCEL_TIMEOUT_SECONDS", &mut s.cancel_timeout_seconds)?;
        parse_into(&lookup, "CONFIRM_CALL_TIMEOUT_SECONDS", &mut s.confirm_call_timeout_seconds)?;

        s.validate()?;
        Ok(s)
    }

    /// Loads a YAML file whose keys mirror the field names.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CancelerError::Config(format!("reading {}: {e}", path.display())))?;
        let settings: Settings = serde_yaml::from_str(&raw)
            .map_err(|e| CancelerError::Config(format!("parsing {}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.confirm_poll_seconds == 0 {
            return Err(CancelerError::Config("CONFIRM_POLL_SECONDS must be positive".into()));
        }
        if self.max_polls == 0 {
            return Err(CancelerError::Config("MAX_POLLS must be at least 1".into()));
        }
        if self.retry_backoff < 1.0 {
            return Err(CancelerError::Config("RETRY_BACKOFF must be at least 1.0".into()));
        }
        if self.retry_initial_ms == 0 || self.retry_max_ms < self.retry_initial_ms {
            return Err(CancelerError::Config(
                "RETRY_INITIAL_MS must be positive and not above RETRY_MAX_MS".into(),
            ));
        }
        Ok(())
    }

    pub fn workload_tag(&self) -> WorkloadTag {
        WorkloadTag::new(self.workload_id.clone())
    }

    pub fn confirm_deadline(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_seconds)
    }

    pub fn confirm_poll(&self) -> Duration {
        Duration::from_secs(self.confirm_poll_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(self.retry_initial_ms),
            maximum_interval: Duration::from_millis(self.retry_max_ms),
            backoff_coefficient: self.retry_backoff,
            maximum_attempts: None,
        }
    }

    pub fn operation_timeouts(&self) -> OperationTimeouts {
        OperationTimeouts {
            query: Duration::from_secs(self.query_timeout_seconds),
            terminate: Duration::from_secs(self.cancel_timeout_seconds),
            confirm: Duration::from_secs(self.confirm_call_timeout_seconds),
            ..OperationTimeouts::default()
        }
    }
}

fn parse_into<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| CancelerError::Config(format!("invalid {key}={raw:?}: {e}")))?;
    }
    Ok(())
}
