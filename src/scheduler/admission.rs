use std::sync::{Arc, Weak};

use tokio::sync::watch;

use crate::events::{EventBus, EventKind, GridEvent};
use crate::scheduler::collision::{
    CollisionContext, CollisionPolicy, Decision, ExternalCollisionListener,
};
use crate::scheduler::job::JobId;
use crate::scheduler::metrics::{JobMetricsSnapshot, MetricsCollector};
use crate::scheduler::store::JobStore;
use crate::worker::{Completion, FailureKind, JobExecutor, JobFailure, JobWorker};

/// Runs admission passes over the [`JobStore`].
///
/// A pass only happens when the store is dirty. The policy runs on a snapshot
/// of contexts; its decisions are applied after it returns, with no store lock
/// held, and a metrics snapshot is published at the end of every pass.
pub struct AdmissionController {
    store: Arc<JobStore>,
    policy: Arc<dyn CollisionPolicy>,
    executor: JobExecutor,
    events: EventBus,
    metrics: MetricsCollector,
    snapshots: watch::Sender<JobMetricsSnapshot>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<JobStore>,
        policy: Arc<dyn CollisionPolicy>,
        executor: JobExecutor,
        events: EventBus,
    ) -> Arc<Self> {
        let (snapshots, _rx) = watch::channel(JobMetricsSnapshot::default());
        let controller = Arc::new(Self {
            store,
            policy,
            executor,
            events,
            metrics: MetricsCollector::default(),
            snapshots,
        });
        controller
            .policy
            .set_external_listener(Some(Arc::new(ExternalHook(Arc::downgrade(&controller)))));
        controller
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    pub fn handle_collisions(&self) {
        if self.store.is_stopping() {
            return;
        }
        let Some((passive, active)) = self.store.take_snapshot() else {
            return;
        };

        let passive: Vec<CollisionContext> = passive
            .into_iter()
            .map(|w| CollisionContext::new(w, self.store.clone()))
            .collect();
        let active: Vec<CollisionContext> = active
            .into_iter()
            .map(|w| CollisionContext::new(w, self.store.clone()))
            .collect();

        self.policy.on_collision(&passive, &active);

        for ctx in passive.iter().chain(active.iter()) {
            match ctx.decision() {
                Decision::Activated => self.submit(ctx.worker()),
                Decision::Cancelled => {
                    self.cancel_worker(ctx.worker());
                }
                Decision::Untouched => {}
            }
        }

        self.publish_metrics();
    }

    /// Cancels a passive or active job. Repeated calls for one job count once.
    pub fn cancel_job(&self, job_id: &JobId) -> bool {
        let cancelled = match self.store.cancel(job_id) {
            Some(worker) => self.cancel_worker(&worker),
            None => false,
        };
        if cancelled {
            // The worker may already have finished and run its own pass.
            self.store.mark_dirty();
        }
        self.handle_collisions();
        cancelled
    }

    /// Bookkeeping once a worker has run its completion protocol.
    pub fn on_job_finished(&self, worker: &JobWorker) {
        if self.store.remove(&worker.job_id()).is_some() {
            self.metrics.record_finished(worker.execution_time());
        }
        self.handle_collisions();
    }

    pub fn on_metrics_updated(&self) {
        self.store.mark_dirty();
        self.handle_collisions();
    }

    pub fn on_external_collision(&self) {
        self.store.mark_dirty();
        self.handle_collisions();
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<JobMetricsSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn latest_metrics(&self) -> JobMetricsSnapshot {
        self.snapshots.borrow().clone()
    }

    fn submit(&self, worker: &Arc<JobWorker>) {
        let job_id = worker.job_id();
        match self.executor.submit(job_id, worker.clone().run()) {
            Ok(_) => {
                self.metrics.record_started();
                tracing::debug!(job_id = %job_id, "Job activated");
            }
            Err(e) => {
                self.metrics.record_rejected();
                tracing::warn!(job_id = %job_id, error = %e, "Execution rejected");
                self.events
                    .publish(GridEvent::new(EventKind::JobRejected).with_job(job_id));
                let failure = JobFailure::new(job_id, FailureKind::ExecutionRejected, e.to_string());
                worker.finish(Completion::Done(Err(failure)));
            }
        }
    }

    fn cancel_worker(&self, worker: &Arc<JobWorker>) -> bool {
        if worker.cancel() {
            self.metrics.record_cancelled();
            true
        } else {
            false
        }
    }

    fn publish_metrics(&self) {
        let snapshot = self.metrics.snapshot(self.store.census());
        self.snapshots.send_replace(snapshot);
    }
}

struct ExternalHook(Weak<AdmissionController>);

impl ExternalCollisionListener for ExternalHook {
    fn on_external_collision(&self) {
        if let Some(controller) = self.0.upgrade() {
            controller.on_external_collision();
        }
    }
}
