//! Job protocol messages carried in envelope payloads.
//!
//! | Topic                          | Policy    | Ordered | Payload          |
//! |--------------------------------|-----------|---------|------------------|
//! | `job-request`                  | Pooled    | no      | [`JobRequest`]   |
//! | `job-cancel`                   | Dedicated | no      | [`CancelRequest`]|
//! | `job-response/{job}/{node}`    | Pooled    | yes     | [`JobResponse`]  |

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cluster::NodeId;
use crate::error::{GridError, Result};
use crate::scheduler::{JobId, SessionId};
use crate::worker::deployment::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The deployment, task or job instance could not be resolved.
    ClassLoading,
    Runtime,
    ExecutionRejected,
    Cancelled,
    Timeout,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::ClassLoading => write!(f, "class loading"),
            FailureKind::Runtime => write!(f, "runtime"),
            FailureKind::ExecutionRejected => write!(f, "execution rejected"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub job_id: JobId,
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(job_id: JobId, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            message: message.into(),
        }
    }

    /// Resource-loading errors raised by user code are classified with class
    /// loading problems; everything else is a runtime failure.
    pub fn from_job_error(job_id: JobId, error: JobError) -> Self {
        let kind = match error {
            JobError::ResourceLoading(_) => FailureKind::ClassLoading,
            JobError::Failed(_) => FailureKind::Runtime,
        };
        Self::new(job_id, kind, error.to_string())
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job {} failed ({}): {}", self.job_id, self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub session_id: SessionId,
    pub deployment: String,
    pub task: String,
    pub argument: Value,
    pub timeout_ms: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub job_id: JobId,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(Value),
    Failed(JobFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResponse {
    pub job_id: JobId,
    pub session_id: SessionId,
    /// Node that executed the job.
    pub node_id: NodeId,
    pub outcome: JobOutcome,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl JobResponse {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Completed(_))
    }

    pub fn failure(&self) -> Option<&JobFailure> {
        match &self.outcome {
            JobOutcome::Failed(failure) => Some(failure),
            JobOutcome::Completed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self.outcome {
            JobOutcome::Completed(value) => Ok(value),
            JobOutcome::Failed(failure) => Err(failure.into()),
        }
    }
}

/// What a caller wants run on a remote node.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub deployment: String,
    pub task: String,
    pub argument: Value,
    /// Falls back to the submitting node's default job timeout.
    pub timeout: Option<Duration>,
    pub attributes: BTreeMap<String, String>,
}

impl JobSpec {
    pub fn new(deployment: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            deployment: deployment.into(),
            task: task.into(),
            argument: Value::Null,
            timeout: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_argument(mut self, argument: Value) -> Self {
        self.argument = argument;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| GridError::DeserializationFailure {
            what: std::any::type_name::<T>(),
            reason: e.to_string(),
        })
}

pub fn decode<T: DeserializeOwned>(what: &'static str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| GridError::DeserializationFailure {
        what,
        reason: e.to_string(),
    })
}
