//! Collision (admission) policies.
//!
//! On every admission pass the policy sees the passive and active jobs as
//! [`CollisionContext`]s and decides which passive jobs to activate and which
//! jobs to cancel. Anything it leaves alone stays where it is.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CollisionConfig;
use crate::scheduler::job::{JobId, SessionId};
use crate::scheduler::store::JobStore;
use crate::worker::JobWorker;

/// Lets a policy ask for an admission pass on its own initiative, e.g. after
/// its limits changed.
pub trait ExternalCollisionListener: Send + Sync {
    fn on_external_collision(&self);
}

pub trait CollisionPolicy: Send + Sync {
    fn on_collision(&self, passive: &[CollisionContext], active: &[CollisionContext]);

    fn set_external_listener(&self, _listener: Option<Arc<dyn ExternalCollisionListener>>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Untouched,
    Activated,
    Cancelled,
}

/// A job as seen by the collision policy.
///
/// [`activate`](Self::activate) and [`cancel`](Self::cancel) move the job
/// between the store's maps right away and report whether the move happened.
/// Repeating a call is a no-op that returns `false`.
pub struct CollisionContext {
    worker: Arc<JobWorker>,
    store: Arc<JobStore>,
    decision: Mutex<Decision>,
}

impl CollisionContext {
    pub fn new(worker: Arc<JobWorker>, store: Arc<JobStore>) -> Self {
        Self {
            worker,
            store,
            decision: Mutex::new(Decision::Untouched),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.worker.job_id()
    }

    pub fn session_id(&self) -> SessionId {
        self.worker.session_id()
    }

    pub fn queued_time(&self) -> Duration {
        self.worker.queued_time()
    }

    pub fn execution_time(&self) -> Duration {
        self.worker.execution_time()
    }

    pub fn activate(&self) -> bool {
        let mut decision = self.lock();
        if *decision != Decision::Untouched {
            return false;
        }
        if self.store.activate(&self.job_id()) {
            *decision = Decision::Activated;
            true
        } else {
            false
        }
    }

    pub fn cancel(&self) -> bool {
        let mut decision = self.lock();
        if *decision == Decision::Cancelled {
            return false;
        }
        if self.store.cancel(&self.job_id()).is_some() {
            *decision = Decision::Cancelled;
            true
        } else {
            false
        }
    }

    pub fn decision(&self) -> Decision {
        *self.lock()
    }

    pub fn worker(&self) -> &Arc<JobWorker> {
        &self.worker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Decision> {
        self.decision.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CollisionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollisionContext")
            .field("job_id", &self.job_id())
            .field("decision", &self.decision())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct FifoLimits {
    parallel_jobs: usize,
    max_waiting_jobs: Option<usize>,
}

/// Activates passive jobs oldest first while fewer than `parallel_jobs` are
/// active, and cancels waiting jobs beyond `max_waiting_jobs` (newest first).
pub struct FifoQueuePolicy {
    limits: Mutex<FifoLimits>,
    listener: Mutex<Option<Arc<dyn ExternalCollisionListener>>>,
}

impl FifoQueuePolicy {
    pub fn new(config: &CollisionConfig) -> Self {
        Self {
            limits: Mutex::new(FifoLimits {
                parallel_jobs: config.parallel_jobs,
                max_waiting_jobs: config.max_waiting_jobs,
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn parallel_jobs(&self) -> usize {
        self.limits().parallel_jobs
    }

    pub fn max_waiting_jobs(&self) -> Option<usize> {
        self.limits().max_waiting_jobs
    }

    /// Changes the activation limit and requests a new admission pass.
    pub fn set_parallel_jobs(&self, parallel_jobs: usize) {
        lock(&self.limits).parallel_jobs = parallel_jobs;
        self.notify_external();
    }

    pub fn set_max_waiting_jobs(&self, max: Option<usize>) {
        lock(&self.limits).max_waiting_jobs = max;
        self.notify_external();
    }

    fn notify_external(&self) {
        let listener = lock(&self.listener).clone();
        if let Some(listener) = listener {
            listener.on_external_collision();
        }
    }

    fn limits(&self) -> FifoLimits {
        *lock(&self.limits)
    }
}

impl CollisionPolicy for FifoQueuePolicy {
    fn on_collision(&self, passive: &[CollisionContext], active: &[CollisionContext]) {
        let limits = self.limits();

        let mut waiting: Vec<&CollisionContext> = passive.iter().collect();
        waiting.sort_by_key(|ctx| std::cmp::Reverse(ctx.queued_time()));

        let mut running = active.len();
        let mut still_waiting = Vec::with_capacity(waiting.len());
        for ctx in waiting {
            if running < limits.parallel_jobs && ctx.activate() {
                running += 1;
            } else {
                still_waiting.push(ctx);
            }
        }

        if let Some(max) = limits.max_waiting_jobs {
            for ctx in still_waiting.iter().skip(max) {
                if ctx.cancel() {
                    tracing::debug!(job_id = %ctx.job_id(), max, "Wait queue full, job rejected");
                }
            }
        }
    }

    fn set_external_listener(&self, listener: Option<Arc<dyn ExternalCollisionListener>>) {
        *lock(&self.listener) = listener;
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
