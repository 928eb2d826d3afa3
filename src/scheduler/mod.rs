//! Job lifecycle bookkeeping and admission control on the executing node.

pub mod admission;
pub mod collision;
pub mod job;
pub mod metrics;
pub mod store;

pub use admission::AdmissionController;
pub use collision::{
    CollisionContext, CollisionPolicy, Decision, ExternalCollisionListener, FifoQueuePolicy,
};
pub use job::{JobId, JobState, SessionId};
pub use metrics::{JobMetricsSnapshot, MetricsCollector};
pub use store::{JobCensus, JobStore, Placement};
