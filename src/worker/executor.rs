use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::config::ExecutionConfig;
use crate::error::{GridError, Result};
use crate::scheduler::JobId;
use crate::worker::deployment::{JobContext, LoadedJob, CURRENT_DEPLOYMENT};
use crate::worker::protocol::{FailureKind, JobFailure};

/// Bounded pool that runs job bodies.
///
/// A submission takes one of `pool_size` slots for as long as the job runs.
/// When every slot is taken the submission is rejected immediately instead of
/// being queued; waiting is the collision policy's business.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    slots: Arc<Semaphore>,
    pool_size: usize,
}

impl JobExecutor {
    pub fn new(config: &ExecutionConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        Self {
            slots: Arc::new(Semaphore::new(pool_size)),
            pool_size,
        }
    }

    pub fn submit<F>(&self, job_id: JobId, work: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| GridError::ExecutionRejected(job_id))?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            work.await;
        }))
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Runs a job body inside its deployment context.
///
/// Errors and panics raised by user code come back as a classified
/// [`JobFailure`]; nothing escapes to the caller's task.
pub async fn execute(loaded: LoadedJob, ctx: JobContext) -> std::result::Result<Value, JobFailure> {
    let job_id = ctx.job_id();
    let LoadedJob { deployment, job } = loaded;
    tracing::debug!(job_id = %job_id, deployment = deployment.name(), "Executing job");

    let body = async move { job.execute(&ctx).await };
    let outcome = CURRENT_DEPLOYMENT
        .scope(deployment, AssertUnwindSafe(body).catch_unwind())
        .await;

    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(JobFailure::from_job_error(job_id, e)),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(job_id = %job_id, panic = %message, "Job body panicked");
            Err(JobFailure::new(job_id, FailureKind::Runtime, message))
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "job panicked".to_string()
    }
}
