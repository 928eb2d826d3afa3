//! Well-known topic names.
//!
//! Topics are opaque strings to the dispatcher. Per-job topics are built from
//! a category, the job id and the node id so that responses from different
//! nodes for the same job never share a sequence.

use std::fmt;

use crate::cluster::NodeId;
use crate::scheduler::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicCategory {
    JobRequest,
    JobCancel,
    JobResponse,
}

impl TopicCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopicCategory::JobRequest => "job-request",
            TopicCategory::JobCancel => "job-cancel",
            TopicCategory::JobResponse => "job-response",
        }
    }
}

impl fmt::Display for TopicCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn job_request() -> String {
    TopicCategory::JobRequest.to_string()
}

pub fn job_cancel() -> String {
    TopicCategory::JobCancel.to_string()
}

/// Topic a node answers on for `job_id`.
pub fn job_response(job_id: JobId, responder: NodeId) -> String {
    scoped(TopicCategory::JobResponse, job_id, responder)
}

pub fn scoped(category: TopicCategory, job_id: JobId, node: NodeId) -> String {
    format!("{category}/{job_id}/{node}")
}
