//! Job execution on the receiving node.
//!
//! # Components
//!
//! - [`JobWorker`]: per-job state machine and completion protocol
//! - [`JobExecutor`]: bounded pool that runs job bodies
//! - [`deployment`]: the code jobs are built from, and the context they run in
//! - [`protocol`]: request, cancel and response payloads
//!
//! # Execution Flow
//!
//! 1. A `job-request` envelope is resolved against the [`DeploymentRegistry`]
//! 2. The worker is queued as passive until the collision policy activates it
//! 3. [`JobWorker::run`] executes the body inside its deployment context
//! 4. The completion protocol sends an ordered [`JobResponse`] to the origin

pub mod deployment;
pub mod executor;
pub mod job_worker;
pub mod protocol;

pub use deployment::{
    current_deployment, ComputeJob, Deployment, DeploymentRegistry, JobContext, JobError,
    JobFactory, LoadedJob,
};
pub use executor::JobExecutor;
pub use job_worker::{Completion, JobWorker, WorkerListener, WorkerServices};
pub use protocol::{
    CancelRequest, FailureKind, JobFailure, JobOutcome, JobRequest, JobResponse, JobSpec,
};
