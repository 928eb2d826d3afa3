use thiserror::Error;

use crate::cluster::NodeId;
use crate::scheduler::JobId;
use crate::worker::protocol::{FailureKind, JobFailure};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("Transport failure sending to {node}: {reason}")]
    TransportFailure { node: NodeId, reason: String },

    #[error("Failed to deserialize {what}: {reason}")]
    DeserializationFailure { what: &'static str, reason: String },

    #[error("Duplicate job id: {0}")]
    DuplicateJobId(JobId),

    #[error("Node {0} is not a cluster member")]
    StaleTopology(NodeId),

    #[error("Execution rejected for job {0}: execution pool saturated")]
    ExecutionRejected(JobId),

    #[error("User code failure ({kind}): {message}")]
    UserCodeFailure { kind: FailureKind, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Component is stopping")]
    Stopping,
}

impl From<JobFailure> for GridError {
    fn from(failure: JobFailure) -> Self {
        match failure.kind {
            FailureKind::ExecutionRejected => GridError::ExecutionRejected(failure.job_id),
            FailureKind::Timeout => GridError::Timeout(failure.message),
            kind => GridError::UserCodeFailure {
                kind,
                message: failure.message,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
