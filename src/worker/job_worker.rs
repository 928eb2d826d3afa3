use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::cluster::{NodeId, TimeoutId};
use crate::events::{EventBus, EventKind, GridEvent};
use crate::messaging::{topic, TopicDispatcher};
use crate::scheduler::{JobId, JobState, SessionId};
use crate::worker::deployment::{JobContext, LoadedJob, CURRENT_DEPLOYMENT};
use crate::worker::executor;
use crate::worker::protocol::{self, FailureKind, JobFailure, JobOutcome, JobResponse};

/// Smallest time-to-live a response is sent with.
pub const MIN_RESPONSE_TTL: Duration = Duration::from_millis(1);

/// Lifecycle callbacks from workers to whoever tracks them.
pub trait WorkerListener: Send + Sync {
    fn on_started(&self, _worker: &JobWorker) {}

    /// Called exactly once per worker, after the response (if any) was sent.
    fn on_finished(&self, worker: &JobWorker);
}

/// Collaborators shared by every worker of a node.
pub struct WorkerServices {
    pub dispatcher: Arc<TopicDispatcher>,
    pub events: EventBus,
    pub listener: Arc<dyn WorkerListener>,
}

#[derive(Debug, Clone, Copy)]
struct Timeline {
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

/// How a worker reached its end.
#[derive(Debug)]
pub enum Completion {
    Done(Result<Value, JobFailure>),
    TimedOut,
}

/// Execution state machine of one job on this node.
pub struct JobWorker {
    ctx: JobContext,
    local: NodeId,
    loaded: Option<LoadedJob>,
    timeout: Duration,
    created_at: Instant,
    timeout_id: TimeoutId,
    state: Mutex<JobState>,
    timeline: Mutex<Timeline>,
    cancelled: AtomicBool,
    finishing: AtomicBool,
    services: Arc<WorkerServices>,
}

impl JobWorker {
    /// `loaded` is `None` when the job could not be resolved; such a worker can
    /// only be finished with its load failure.
    pub fn new(
        ctx: JobContext,
        loaded: Option<LoadedJob>,
        timeout: Duration,
        services: Arc<WorkerServices>,
    ) -> Arc<Self> {
        let local = services.dispatcher.local_node_id();
        Arc::new(Self {
            ctx,
            local,
            loaded,
            timeout,
            created_at: Instant::now(),
            timeout_id: TimeoutId::new(),
            state: Mutex::new(JobState::Initialized),
            timeline: Mutex::new(Timeline {
                queued_at: None,
                started_at: None,
                finished_at: None,
            }),
            cancelled: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            services,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.ctx.job_id()
    }

    pub fn session_id(&self) -> SessionId {
        self.ctx.session_id()
    }

    pub fn origin(&self) -> NodeId {
        self.ctx.origin()
    }

    pub fn state(&self) -> JobState {
        *lock(&self.state)
    }

    pub fn timeout_id(&self) -> TimeoutId {
        self.timeout_id
    }

    pub fn deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    /// Time spent waiting for activation so far (or in total once started).
    pub fn queued_time(&self) -> Duration {
        let t = *lock(&self.timeline);
        match (t.queued_at, t.started_at) {
            (Some(q), Some(s)) => s.saturating_duration_since(q),
            (Some(q), None) => q.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Zero until the job starts running.
    pub fn execution_time(&self) -> Duration {
        let t = *lock(&self.timeline);
        match (t.started_at, t.finished_at) {
            (Some(s), Some(f)) => f.saturating_duration_since(s),
            (Some(s), None) => s.elapsed(),
            _ => Duration::ZERO,
        }
    }

    pub fn mark_queued(&self) {
        let mut state = lock(&self.state);
        if *state == JobState::Initialized {
            *state = JobState::Queued;
            lock(&self.timeline).queued_at = Some(Instant::now());
        }
    }

    /// Body of the execution pool task.
    pub async fn run(self: Arc<Self>) {
        {
            let mut state = lock(&self.state);
            if *state != JobState::Queued || self.is_cancelled() {
                return;
            }
            *state = JobState::Running;
            lock(&self.timeline).started_at = Some(Instant::now());
        }
        let Some(loaded) = self.loaded.clone() else {
            let failure = JobFailure::new(self.job_id(), FailureKind::ClassLoading, "job not loaded");
            self.finish(Completion::Done(Err(failure)));
            return;
        };

        tracing::info!(job_id = %self.job_id(), origin = %self.origin(), "Job started");
        self.services.listener.on_started(&self);
        self.services
            .events
            .publish(GridEvent::new(EventKind::JobStarted).with_job(self.job_id()));

        let result = executor::execute(loaded, self.ctx.clone()).await;
        self.finish(Completion::Done(result));
    }

    /// Requests cancellation. Returns `false` if the job was already cancelled
    /// or has already completed.
    pub fn cancel(&self) -> bool {
        if self.is_finishing() || self.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }
        tracing::info!(job_id = %self.job_id(), "Cancelling job");
        self.interrupt();

        let not_started = matches!(
            *lock(&self.state),
            JobState::Initialized | JobState::Queued
        );
        if not_started {
            let failure = JobFailure::new(self.job_id(), FailureKind::Cancelled, "job cancelled");
            self.finish(Completion::Done(Err(failure)));
        }
        true
    }

    /// Timeout callback: the job ends as timed out and no response is sent.
    pub fn on_timeout(&self) {
        if self.is_finishing() {
            return;
        }
        tracing::warn!(
            job_id = %self.job_id(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Job timed out"
        );
        if self.finish(Completion::TimedOut) {
            self.interrupt();
        }
    }

    /// Runs the completion protocol. Only the first call has any effect.
    pub fn finish(&self, completion: Completion) -> bool {
        if self.finishing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let job_id = self.job_id();

        let result = match completion {
            Completion::TimedOut => None,
            Completion::Done(_) if self.is_cancelled() => Some(Err(JobFailure::new(
                job_id,
                FailureKind::Cancelled,
                "job cancelled",
            ))),
            Completion::Done(result) => Some(result),
        };

        let final_state = match &result {
            None => JobState::TimedOut,
            Some(Ok(_)) => JobState::Finished,
            Some(Err(f)) if f.kind == FailureKind::Cancelled => JobState::Cancelled,
            Some(Err(_)) => JobState::Failed,
        };
        *lock(&self.state) = final_state;
        lock(&self.timeline).finished_at = Some(Instant::now());

        let (kind, reason) = match &result {
            None => (EventKind::JobTimedOut, None),
            Some(Ok(_)) => (EventKind::JobFinished, None),
            Some(Err(f)) if f.kind == FailureKind::Cancelled => (EventKind::JobCancelled, None),
            Some(Err(f)) => (EventKind::JobFailed, Some(f.to_string())),
        };
        match &reason {
            Some(reason) => tracing::warn!(job_id = %job_id, error = %reason, "Job failed"),
            None => tracing::info!(job_id = %job_id, state = %final_state, "Job completed"),
        }
        let mut event = GridEvent::new(kind).with_job(job_id).with_node(self.origin());
        if let Some(reason) = reason {
            event = event.with_reason(reason);
        }
        self.services.events.publish(event);

        if let Some(result) = result {
            self.send_response(result);
        }
        self.services.listener.on_finished(self);
        true
    }

    fn send_response(&self, result: Result<Value, JobFailure>) {
        let job_id = self.job_id();
        let origin = self.origin();
        let dispatcher = &self.services.dispatcher;

        if origin != self.local && !dispatcher.membership().is_member(&origin) {
            tracing::warn!(job_id = %job_id, origin = %origin, "Origin node left, response suppressed");
            self.services.events.publish(
                GridEvent::new(EventKind::ResponseSuppressed)
                    .with_job(job_id)
                    .with_node(origin),
            );
            return;
        }

        let response = JobResponse {
            job_id,
            session_id: self.session_id(),
            node_id: self.local,
            outcome: match result {
                Ok(value) => JobOutcome::Completed(value),
                Err(failure) => JobOutcome::Failed(failure),
            },
            attributes: self.ctx.attributes().clone(),
        };
        let payload = match protocol::encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to encode job response");
                return;
            }
        };

        let topic = topic::job_response(job_id, self.local);
        let ttl = self
            .deadline()
            .saturating_duration_since(Instant::now())
            .max(MIN_RESPONSE_TTL);
        let sent = dispatcher.send_ordered(origin, &topic, payload, ttl);
        dispatcher.release_sequence(&topic);

        if let Err(e) = sent {
            tracing::error!(job_id = %job_id, origin = %origin, error = %e, "Failed to send job response");
            self.services.events.publish(
                GridEvent::new(EventKind::ResponseSendFailed)
                    .with_job(job_id)
                    .with_node(origin)
                    .with_reason(e.to_string()),
            );
        }
    }

    /// Signals the body and runs the job's cancellation hook in its deployment.
    fn interrupt(&self) {
        self.ctx.interrupt();
        if let Some(loaded) = &self.loaded {
            let hook = || {
                CURRENT_DEPLOYMENT.sync_scope(loaded.deployment.clone(), || loaded.job.cancel())
            };
            if catch_unwind(AssertUnwindSafe(hook)).is_err() {
                tracing::error!(job_id = %self.job_id(), "Job cancellation hook panicked");
            }
        }
    }
}

impl std::fmt::Debug for JobWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWorker")
            .field("job_id", &self.job_id())
            .field("origin", &self.origin())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
