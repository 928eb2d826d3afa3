use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot, watch};

use crate::cluster::{
    MembershipEvent, MembershipEventKind, MembershipListener, MembershipProvider, NodeId,
    SubscriptionId, TimeoutAuthority, TimeoutObject, Transport,
};
use crate::config::NodeConfig;
use crate::error::{GridError, Result};
use crate::events::{EventBus, EventKind, GridEvent};
use crate::messaging::{topic, DispatchPolicy, Envelope, MessageListener, TopicDispatcher};
use crate::scheduler::{
    AdmissionController, CollisionPolicy, FifoQueuePolicy, JobCensus, JobId, JobMetricsSnapshot,
    JobState, JobStore, SessionId,
};
use crate::worker::{
    protocol, CancelRequest, Completion, DeploymentRegistry, JobContext, JobExecutor, JobRequest,
    JobResponse, JobSpec, JobWorker, WorkerListener, WorkerServices,
};

/// Collaborators a node is built from. Nothing is looked up globally.
pub struct NodeContext {
    pub membership: Arc<dyn MembershipProvider>,
    pub transport: Arc<dyn Transport>,
    pub timeouts: Arc<dyn TimeoutAuthority>,
    pub deployments: Arc<DeploymentRegistry>,
    /// Defaults to a [`FifoQueuePolicy`] built from the node's collision config.
    pub policy: Option<Arc<dyn CollisionPolicy>>,
}

impl NodeContext {
    pub fn new(
        membership: Arc<dyn MembershipProvider>,
        transport: Arc<dyn Transport>,
        timeouts: Arc<dyn TimeoutAuthority>,
        deployments: Arc<DeploymentRegistry>,
    ) -> Self {
        Self {
            membership,
            transport,
            timeouts,
            deployments,
            policy: None,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn CollisionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }
}

struct PendingEntry {
    target: NodeId,
    topic: String,
}

type PendingTable = Arc<Mutex<HashMap<JobId, PendingEntry>>>;

/// A cluster node: receives, schedules and runs jobs, and submits jobs to
/// other nodes.
///
/// Wiring:
/// 1. The [`TopicDispatcher`] feeds `job-request` and `job-cancel` envelopes
///    to the node's handlers
/// 2. Accepted requests become [`JobWorker`]s in the [`JobStore`]
/// 3. The [`AdmissionController`] activates them onto the [`JobExecutor`]
/// 4. Finished workers answer on `job-response/{job}/{node}`
pub struct GridNode {
    config: NodeConfig,
    local: NodeId,
    session: SessionId,
    dispatcher: Arc<TopicDispatcher>,
    membership: Arc<dyn MembershipProvider>,
    timeouts: Arc<dyn TimeoutAuthority>,
    deployments: Arc<DeploymentRegistry>,
    store: Arc<JobStore>,
    controller: Arc<AdmissionController>,
    services: Arc<WorkerServices>,
    events: EventBus,
    pending: PendingTable,
    subscription: Mutex<Option<SubscriptionId>>,
    me: Weak<GridNode>,
}

impl GridNode {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: NodeConfig, ctx: NodeContext) -> Arc<Self> {
        let local = ctx.membership.local_node_id();
        if local != config.node_id {
            tracing::warn!(
                configured = %config.node_id,
                membership = %local,
                "Configured node id differs from membership, using membership id"
            );
        }

        let events = EventBus::new(config.event_capacity);
        let dispatcher = TopicDispatcher::new(
            config.dispatcher.clone(),
            ctx.transport,
            ctx.membership.clone(),
            ctx.timeouts.clone(),
            events.clone(),
        );
        let store = JobStore::new();
        let policy: Arc<dyn CollisionPolicy> = match ctx.policy {
            Some(policy) => policy,
            None => Arc::new(FifoQueuePolicy::new(&config.collision)),
        };
        let controller = AdmissionController::new(
            store.clone(),
            policy,
            JobExecutor::new(&config.execution),
            events.clone(),
        );

        Arc::new_cyclic(|me: &Weak<GridNode>| {
            let services = Arc::new(WorkerServices {
                dispatcher: dispatcher.clone(),
                events: events.clone(),
                listener: Arc::new(WorkerHook(me.clone())),
            });
            Self {
                config,
                local,
                session: SessionId::new(),
                dispatcher,
                membership: ctx.membership,
                timeouts: ctx.timeouts,
                deployments: ctx.deployments,
                store,
                controller,
                services,
                events,
                pending: Arc::new(Mutex::new(HashMap::new())),
                subscription: Mutex::new(None),
                me: me.clone(),
            }
        })
    }

    pub fn start(&self) {
        self.dispatcher.start();

        let me = self.me.clone();
        let on_request: Arc<dyn MessageListener> =
            Arc::new(move |sender: NodeId, envelope: &Envelope| {
                if let Some(node) = me.upgrade() {
                    node.on_job_request(sender, envelope);
                }
            });
        self.dispatcher
            .register_listener(&topic::job_request(), on_request);

        let me = self.me.clone();
        let on_cancel: Arc<dyn MessageListener> =
            Arc::new(move |sender: NodeId, envelope: &Envelope| {
                if let Some(node) = me.upgrade() {
                    node.on_cancel_request(sender, envelope);
                }
            });
        self.dispatcher
            .register_listener(&topic::job_cancel(), on_cancel);

        let sub = self
            .membership
            .subscribe(Arc::new(MembershipHook(self.me.clone())));
        *lock(&self.subscription) = Some(sub);

        tracing::info!(node_id = %self.local, name = %self.config.name, "Grid node started");
    }

    /// Drains request handling, cancels every remaining job, then stops the
    /// dispatcher.
    pub async fn stop(&self) {
        self.store.stop().await;
        if let Some(sub) = lock(&self.subscription).take() {
            self.membership.unsubscribe(sub);
        }

        let remaining = self.store.all();
        for worker in &remaining {
            self.controller.cancel_job(&worker.job_id());
        }
        if !remaining.is_empty() {
            tracing::info!(jobs = remaining.len(), "Cancelled remaining jobs on shutdown");
            self.await_drained().await;
        }

        self.dispatcher.remove_listener(&topic::job_request(), None);
        self.dispatcher.remove_listener(&topic::job_cancel(), None);
        let pending: Vec<PendingEntry> = lock(&self.pending).drain().map(|(_, e)| e).collect();
        for entry in pending {
            self.dispatcher.remove_listener(&entry.topic, None);
        }

        self.dispatcher.stop().await;
        tracing::info!(node_id = %self.local, "Grid node stopped");
    }

    /// Sends a job to `target` and returns a handle to its eventual response.
    pub fn submit_job(&self, target: NodeId, spec: JobSpec) -> Result<PendingJob> {
        if self.store.is_stopping() {
            return Err(GridError::Stopping);
        }
        let job_id = JobId::new();
        let response_topic = topic::job_response(job_id, target);

        let (tx, rx) = oneshot::channel::<JobResponse>();
        let slot = Mutex::new(Some(tx));
        let on_response: Arc<dyn MessageListener> =
            Arc::new(move |sender: NodeId, envelope: &Envelope| {
                match protocol::decode::<JobResponse>("job response", envelope.payload()) {
                    Ok(response) => {
                        if let Some(tx) = lock(&slot).take() {
                            let _ = tx.send(response);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(sender = %sender, error = %e, "Dropping undecodable job response")
                    }
                }
            });
        self.dispatcher
            .register_listener(&response_topic, on_response);
        lock(&self.pending).insert(
            job_id,
            PendingEntry {
                target,
                topic: response_topic.clone(),
            },
        );

        let timeout = spec
            .timeout
            .unwrap_or(self.config.execution.default_job_timeout);
        let request = JobRequest {
            job_id,
            session_id: self.session,
            deployment: spec.deployment,
            task: spec.task,
            argument: spec.argument,
            timeout_ms: timeout.as_millis() as u64,
            attributes: spec.attributes,
        };
        let sent = protocol::encode(&request).and_then(|payload| {
            self.dispatcher
                .send(&[target], &topic::job_request(), payload, DispatchPolicy::Pooled)
        });
        if let Err(e) = sent {
            lock(&self.pending).remove(&job_id);
            self.dispatcher.remove_listener(&response_topic, None);
            return Err(e);
        }

        tracing::debug!(job_id = %job_id, target = %target, "Job submitted");
        Ok(PendingJob {
            job_id,
            session_id: self.session,
            target,
            topic: response_topic,
            rx,
            dispatcher: self.dispatcher.clone(),
            pending: self.pending.clone(),
        })
    }

    /// Asks `target` to cancel a job this node submitted.
    pub fn request_cancel(&self, target: NodeId, job_id: JobId) -> Result<()> {
        send_cancel(&self.dispatcher, target, job_id, self.session)
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<TopicDispatcher> {
        &self.dispatcher
    }

    pub fn deployments(&self) -> &Arc<DeploymentRegistry> {
        &self.deployments
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<JobMetricsSnapshot> {
        self.controller.subscribe_metrics()
    }

    pub fn latest_metrics(&self) -> JobMetricsSnapshot {
        self.controller.latest_metrics()
    }

    pub fn census(&self) -> JobCensus {
        self.store.census()
    }

    /// State of a job still tracked by this node.
    pub fn job_state(&self, job_id: &JobId) -> Option<JobState> {
        self.store.get(job_id).map(|w| w.state())
    }

    /// Gives interrupted jobs a chance to send their responses before the
    /// dispatcher goes away.
    async fn await_drained(&self) {
        let grace = self.config.execution.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            while !self.store.is_empty() {
                tick.tick().await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = self.store.len(),
                grace_ms = grace.as_millis() as u64,
                "Jobs still running after shutdown grace period"
            );
        }
    }

    fn on_job_request(&self, sender: NodeId, envelope: &Envelope) {
        let Some(_guard) = self.store.enter() else {
            tracing::debug!(sender = %sender, "Node stopping, job request dropped");
            return;
        };
        let request: JobRequest = match protocol::decode("job request", envelope.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "Dropping undecodable job request");
                return;
            }
        };
        let job_id = request.job_id;
        if self.store.get(&job_id).is_some() {
            self.reject_duplicate(sender, job_id);
            return;
        }

        let timeout = if request.timeout_ms == 0 {
            self.config.execution.default_job_timeout
        } else {
            request.timeout()
        };
        let loaded = self
            .deployments
            .load(job_id, &request.deployment, &request.task, &request.argument);
        let ctx = JobContext::new(
            job_id,
            request.session_id,
            sender,
            request.argument,
            request.attributes,
        );

        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(failure) => {
                tracing::warn!(job_id = %job_id, error = %failure, "Failed to load job");
                let worker = JobWorker::new(ctx, None, timeout, self.services.clone());
                worker.finish(Completion::Done(Err(failure)));
                return;
            }
        };

        let worker = JobWorker::new(ctx, Some(loaded), timeout, self.services.clone());
        worker.mark_queued();
        if self.store.insert_passive(worker.clone()).is_err() {
            self.reject_duplicate(sender, job_id);
            return;
        }
        self.register_timeout(&worker);

        tracing::debug!(job_id = %job_id, origin = %sender, "Job queued");
        self.events.publish(
            GridEvent::new(EventKind::JobQueued)
                .with_job(job_id)
                .with_node(sender),
        );
        self.controller.handle_collisions();
    }

    fn on_cancel_request(&self, sender: NodeId, envelope: &Envelope) {
        let Some(_guard) = self.store.enter() else {
            return;
        };
        let request: CancelRequest = match protocol::decode("cancel request", envelope.payload()) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(sender = %sender, error = %e, "Dropping undecodable cancel request");
                return;
            }
        };
        let Some(worker) = self.store.get(&request.job_id) else {
            tracing::debug!(job_id = %request.job_id, "Cancel request for unknown job");
            return;
        };
        if worker.origin() != sender || worker.session_id() != request.session_id {
            tracing::warn!(
                job_id = %request.job_id,
                sender = %sender,
                "Cancel request from a node that did not submit the job"
            );
            return;
        }
        self.controller.cancel_job(&request.job_id);
    }

    fn on_membership_event(&self, event: &MembershipEvent) {
        let Some(_guard) = self.store.enter() else {
            return;
        };
        let node = event.node.id;
        match event.kind {
            MembershipEventKind::Left | MembershipEventKind::Failed => {
                let orphaned = self.store.jobs_from(&node);
                for worker in &orphaned {
                    self.controller.cancel_job(&worker.job_id());
                }
                self.abandon_pending(&node);
                tracing::info!(node_id = %node, cancelled = orphaned.len(), "Node departed");
                self.events
                    .publish(GridEvent::new(EventKind::NodeDeparted).with_node(node));
                self.store.mark_dirty();
                self.controller.handle_collisions();
            }
            MembershipEventKind::MetricsUpdated => self.controller.on_metrics_updated(),
            MembershipEventKind::Joined => {}
        }
    }

    /// Responses from a departed node will never come; dropping the response
    /// listeners wakes their `PendingJob`s.
    fn abandon_pending(&self, node: &NodeId) {
        let abandoned: Vec<(JobId, PendingEntry)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<JobId> = pending
                .iter()
                .filter(|(_, e)| e.target == *node)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (job_id, entry) in abandoned {
            tracing::debug!(job_id = %job_id, target = %node, "Abandoning pending job");
            self.dispatcher.remove_listener(&entry.topic, None);
        }
    }

    fn reject_duplicate(&self, sender: NodeId, job_id: JobId) {
        tracing::warn!(job_id = %job_id, sender = %sender, "Duplicate job id, request dropped");
        self.events.publish(
            GridEvent::new(EventKind::DuplicateJob)
                .with_job(job_id)
                .with_node(sender),
        );
    }

    fn register_timeout(&self, worker: &Arc<JobWorker>) {
        let weak = Arc::downgrade(worker);
        self.timeouts.add_timeout(TimeoutObject::new(
            worker.timeout_id(),
            worker.deadline(),
            move || {
                if let Some(worker) = weak.upgrade() {
                    worker.on_timeout();
                }
            },
        ));
    }

    fn on_worker_finished(&self, worker: &JobWorker) {
        self.timeouts.remove_timeout(worker.timeout_id());
        self.controller.on_job_finished(worker);
    }
}

/// Handle to a job submitted to another node.
pub struct PendingJob {
    job_id: JobId,
    session_id: SessionId,
    target: NodeId,
    topic: String,
    rx: oneshot::Receiver<JobResponse>,
    dispatcher: Arc<TopicDispatcher>,
    pending: PendingTable,
}

impl PendingJob {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Waits for the response. Fails with `StaleTopology` if the target left.
    pub async fn result(mut self) -> Result<JobResponse> {
        let outcome = (&mut self.rx).await;
        self.release();
        outcome.map_err(|_| self.abandoned_error())
    }

    /// Like [`result`](Self::result) but gives up after `limit`.
    pub async fn result_within(mut self, limit: Duration) -> Result<JobResponse> {
        let outcome = tokio::time::timeout(limit, &mut self.rx).await;
        self.release();
        match outcome {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.abandoned_error()),
            Err(_) => Err(GridError::Timeout(format!(
                "no response for job {} within {}ms",
                self.job_id,
                limit.as_millis()
            ))),
        }
    }

    pub fn cancel(&self) -> Result<()> {
        send_cancel(&self.dispatcher, self.target, self.job_id, self.session_id)
    }

    fn release(&self) {
        lock(&self.pending).remove(&self.job_id);
        self.dispatcher.remove_listener(&self.topic, None);
    }

    fn abandoned_error(&self) -> GridError {
        if self.dispatcher.is_stopping() {
            GridError::Stopping
        } else {
            GridError::StaleTopology(self.target)
        }
    }
}

fn send_cancel(
    dispatcher: &TopicDispatcher,
    target: NodeId,
    job_id: JobId,
    session_id: SessionId,
) -> Result<()> {
    let payload = protocol::encode(&CancelRequest { job_id, session_id })?;
    dispatcher.send(
        &[target],
        &topic::job_cancel(),
        payload,
        DispatchPolicy::Dedicated,
    )
}

struct WorkerHook(Weak<GridNode>);

impl WorkerListener for WorkerHook {
    fn on_finished(&self, worker: &JobWorker) {
        if let Some(node) = self.0.upgrade() {
            node.on_worker_finished(worker);
        }
    }
}

struct MembershipHook(Weak<GridNode>);

impl MembershipListener for MembershipHook {
    fn on_event(&self, event: &MembershipEvent) {
        if let Some(node) = self.0.upgrade() {
            node.on_membership_event(event);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
