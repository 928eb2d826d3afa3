use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::time::Instant;

use crate::cluster::{
    MembershipEvent, MembershipEventKind, MembershipListener, MembershipProvider, NodeId,
    SubscriptionId, TimeoutAuthority, TimeoutId, TimeoutObject, Transport, TransportListener,
};
use crate::config::DispatcherConfig;
use crate::error::{GridError, Result};
use crate::events::{EventBus, EventKind, GridEvent};
use crate::messaging::closed_topics::ClosedTopics;
use crate::messaging::envelope::{DispatchPolicy, Envelope};
use crate::messaging::listeners::{ListenerRegistry, ListenerSet, MessageListener, Removal};
use crate::messaging::message_set::{Insert, MessageSet};
use crate::shutdown::ShutdownGate;

#[derive(Debug)]
struct DispatchState {
    sets: HashMap<String, Arc<MessageSet>>,
    closed: ClosedTopics,
    /// Envelopes from senders that are not yet cluster members.
    waiting: HashMap<NodeId, Vec<Envelope>>,
}

/// Routes envelopes between the transport and topic listeners.
///
/// Unordered traffic is fanned out on the shared pool (or the dedicated pool
/// for [`DispatchPolicy::Dedicated`]). Ordered traffic goes through a
/// per-topic [`MessageSet`]; whichever pool thread holds the set's reservation
/// delivers the gap-free prefix, so a topic is never delivered concurrently
/// and never out of order.
pub struct TopicDispatcher {
    local: NodeId,
    config: DispatcherConfig,
    transport: Arc<dyn Transport>,
    membership: Arc<dyn MembershipProvider>,
    timeouts: Arc<dyn TimeoutAuthority>,
    events: EventBus,
    listeners: ListenerRegistry,
    state: Mutex<DispatchState>,
    sequences: Mutex<HashMap<String, u64>>,
    dedicated: DedicatedPool,
    gate: Arc<ShutdownGate>,
    subscription: Mutex<Option<SubscriptionId>>,
    runtime: Handle,
    me: Weak<TopicDispatcher>,
}

impl TopicDispatcher {
    /// Must be called from within a Tokio runtime; pooled delivery runs on its
    /// blocking pool.
    pub fn new(
        config: DispatcherConfig,
        transport: Arc<dyn Transport>,
        membership: Arc<dyn MembershipProvider>,
        timeouts: Arc<dyn TimeoutAuthority>,
        events: EventBus,
    ) -> Arc<Self> {
        let runtime = Handle::current();
        let local = membership.local_node_id();
        Arc::new_cyclic(|me| Self {
            local,
            state: Mutex::new(DispatchState {
                sets: HashMap::new(),
                closed: ClosedTopics::new(config.max_closed_topics),
                waiting: HashMap::new(),
            }),
            dedicated: DedicatedPool::new(config.dedicated_pool_size, &runtime),
            config,
            transport,
            membership,
            timeouts,
            events,
            listeners: ListenerRegistry::new(),
            sequences: Mutex::new(HashMap::new()),
            gate: ShutdownGate::new(),
            subscription: Mutex::new(None),
            runtime,
            me: me.clone(),
        })
    }

    /// Hooks the dispatcher into the transport and membership, then drops
    /// message sets whose owners are already gone.
    pub fn start(&self) {
        self.transport.set_listener(Arc::new(TransportHook(self.me.clone())));
        let sub = self
            .membership
            .subscribe(Arc::new(MembershipHook(self.me.clone())));
        *lock(&self.subscription) = Some(sub);
        self.reconcile_membership();
        tracing::info!(node_id = %self.local, "Topic dispatcher started");
    }

    /// Waits for in-flight handlers, then releases timers and pools.
    pub async fn stop(&self) {
        self.gate.stop().await;

        if let Some(sub) = lock(&self.subscription).take() {
            self.membership.unsubscribe(sub);
        }
        let sets: Vec<Arc<MessageSet>> = {
            let mut state = lock(&self.state);
            state.waiting.clear();
            state.sets.drain().map(|(_, set)| set).collect()
        };
        for set in sets {
            self.timeouts.remove_timeout(set.timeout_id());
        }
        self.dedicated.shutdown();
        tracing::info!(node_id = %self.local, "Topic dispatcher stopped");
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local
    }

    pub fn membership(&self) -> &Arc<dyn MembershipProvider> {
        &self.membership
    }

    pub fn is_stopping(&self) -> bool {
        self.gate.is_stopping()
    }

    pub fn register_listener(&self, topic: &str, listener: Arc<dyn MessageListener>) {
        if !self.listeners.add(topic, listener.clone()) {
            return;
        }
        let pending = {
            let mut state = lock(&self.state);
            state.closed.remove(topic);
            state.sets.get(topic).cloned()
        };
        // Ordered envelopes may have arrived before anyone listened.
        if let Some(set) = pending {
            let only_new: ListenerSet = Arc::from(vec![listener]);
            self.spawn_ordered_delivery(set, only_new);
        }
    }

    /// Removes `listener`, or every listener when `None`. Once a topic has no
    /// listeners its message set is discarded and the topic is closed.
    pub fn remove_listener(&self, topic: &str, listener: Option<&Arc<dyn MessageListener>>) -> bool {
        let (removed, last) = match listener {
            None => (self.listeners.remove_all(topic), true),
            Some(listener) => match self.listeners.remove(topic, listener) {
                Removal::NotFound => (false, false),
                Removal::Partial => (true, false),
                Removal::Last => (true, true),
            },
        };
        if last {
            self.close_topic(topic);
        }
        removed
    }

    /// Entry point for envelopes coming off the transport (or looped back locally).
    pub fn on_message_received(&self, sender: NodeId, envelope: Envelope) {
        if !envelope.is_addressed_to(&self.local) {
            tracing::warn!(
                sender = %sender,
                topic = envelope.topic(),
                "Dropping envelope not addressed to this node"
            );
            return;
        }
        if envelope.sender() != sender {
            tracing::warn!(
                sender = %sender,
                claimed = %envelope.sender(),
                topic = envelope.topic(),
                "Dropping envelope with mismatched sender"
            );
            return;
        }

        let Some(_guard) = self.gate.enter() else {
            tracing::debug!(topic = envelope.topic(), "Dispatcher stopping, envelope dropped");
            return;
        };
        if self.is_closed(envelope.topic()) {
            tracing::debug!(topic = envelope.topic(), "Envelope for closed topic dropped");
            return;
        }

        if sender != self.local && !self.membership.is_member(&sender) {
            self.park(sender, envelope);
            // The JOINED event may have been handled between the check and parking.
            if self.membership.is_member(&sender) {
                self.redrive(sender);
            }
            return;
        }

        self.dispatch(sender, envelope);
    }

    pub fn on_membership_event(&self, event: &MembershipEvent) {
        let Some(_guard) = self.gate.enter() else {
            return;
        };
        match event.kind {
            MembershipEventKind::Joined => self.redrive(event.node.id),
            MembershipEventKind::Left | MembershipEventKind::Failed => {
                self.cleanup_departed(event.node.id)
            }
            MembershipEventKind::MetricsUpdated => {}
        }
    }

    /// Applies departure cleanup to message sets whose owner is no longer a member.
    pub fn reconcile_membership(&self) {
        let owners: Vec<NodeId> = {
            let state = lock(&self.state);
            state.sets.values().map(|set| set.owner()).collect()
        };
        for owner in owners {
            if owner != self.local && !self.membership.is_member(&owner) {
                self.cleanup_departed(owner);
            }
        }
    }

    /// Next id of the strictly increasing per-topic send sequence (starts at 1).
    pub fn next_sequence(&self, topic: &str) -> u64 {
        let mut sequences = lock(&self.sequences);
        let seq = sequences.entry(topic.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Forgets the send sequence of a topic nothing will be sent on again.
    pub fn release_sequence(&self, topic: &str) {
        lock(&self.sequences).remove(topic);
    }

    pub fn send(
        &self,
        nodes: &[NodeId],
        topic: &str,
        payload: impl Into<Bytes>,
        policy: DispatchPolicy,
    ) -> Result<()> {
        let envelope = Envelope::unordered(self.local, nodes.to_vec(), topic, payload, policy)?;
        self.route(envelope)
    }

    /// Sends an ordered envelope to `node`, returning the sequence id used.
    pub fn send_ordered(
        &self,
        node: NodeId,
        topic: &str,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Result<u64> {
        let seq = self.next_sequence(topic);
        let envelope = Envelope::ordered(self.local, vec![node], topic, payload, seq, timeout)?;
        self.route(envelope)?;
        Ok(seq)
    }

    pub fn is_closed(&self, topic: &str) -> bool {
        lock(&self.state).closed.contains(topic)
    }

    pub fn has_message_set(&self, topic: &str) -> bool {
        lock(&self.state).sets.contains_key(topic)
    }

    pub fn message_set_count(&self) -> usize {
        lock(&self.state).sets.len()
    }

    /// Envelopes waiting for `sender` to be discovered.
    pub fn parked(&self, sender: &NodeId) -> usize {
        lock(&self.state).waiting.get(sender).map_or(0, Vec::len)
    }

    fn route(&self, envelope: Envelope) -> Result<()> {
        if self.gate.is_stopping() {
            return Err(GridError::Stopping);
        }
        let remote: Vec<NodeId> = envelope
            .destinations()
            .iter()
            .filter(|d| **d != self.local)
            .copied()
            .collect();
        if !remote.is_empty() {
            self.transport.send(&remote, &envelope)?;
        }
        if envelope.is_addressed_to(&self.local) {
            self.on_message_received(self.local, envelope);
        }
        Ok(())
    }

    fn dispatch(&self, sender: NodeId, envelope: Envelope) {
        if self.is_closed(envelope.topic()) {
            tracing::debug!(topic = envelope.topic(), "Envelope for closed topic dropped");
            return;
        }

        if envelope.is_ordered() {
            self.accept_ordered(sender, envelope);
            return;
        }

        let Some(listeners) = self.listeners.get(envelope.topic()) else {
            tracing::debug!(topic = envelope.topic(), "No listeners for topic, envelope dropped");
            return;
        };
        let policy = envelope.policy();
        let deliver = move || deliver_all(&listeners, sender, &envelope);
        match policy {
            DispatchPolicy::Dedicated => {
                if !self.dedicated.execute(Box::new(deliver)) {
                    tracing::debug!("Dedicated pool shut down, envelope dropped");
                }
            }
            DispatchPolicy::Pooled => {
                self.runtime.spawn_blocking(deliver);
            }
        }
    }

    fn accept_ordered(&self, sender: NodeId, envelope: Envelope) {
        let topic = envelope.topic().to_string();
        let (set, created) = {
            let mut state = lock(&self.state);
            if state.closed.contains(&topic) {
                return;
            }
            match state.sets.get(&topic) {
                Some(set) => (set.clone(), false),
                None => {
                    let timeout = envelope.timeout().unwrap_or_default();
                    let set = Arc::new(MessageSet::new(&topic, sender, Instant::now() + timeout));
                    state.sets.insert(topic.clone(), set.clone());
                    (set, true)
                }
            }
        };
        if created {
            self.schedule_set_timeout(&set);
            // The owner may have departed after the membership check in
            // on_message_received, with its cleanup finding no set yet.
            if sender != self.local && !self.membership.is_member(&sender) {
                self.cleanup_departed(sender);
                return;
            }
        }

        let seq = envelope.sequence();
        if set.insert(envelope) == Insert::Duplicate {
            tracing::debug!(topic = %topic, seq, "Duplicate ordered envelope dropped");
            return;
        }

        match self.listeners.get(&topic) {
            Some(listeners) => self.spawn_ordered_delivery(set, listeners),
            None => tracing::debug!(topic = %topic, seq, "Ordered envelope buffered until a listener registers"),
        }
    }

    fn spawn_ordered_delivery(&self, set: Arc<MessageSet>, listeners: ListenerSet) {
        self.runtime
            .spawn_blocking(move || deliver_ordered(&set, &listeners));
    }

    fn schedule_set_timeout(&self, set: &Arc<MessageSet>) {
        let me = self.me.clone();
        let topic = set.topic().to_string();
        let id = set.timeout_id();
        self.timeouts.add_timeout(TimeoutObject::new(id, set.deadline(), move || {
            if let Some(dispatcher) = me.upgrade() {
                dispatcher.on_set_timeout(&topic, id);
            }
        }));
    }

    /// Drops the set without closing its topic.
    fn on_set_timeout(&self, topic: &str, id: TimeoutId) {
        let Some(_guard) = self.gate.enter() else {
            return;
        };
        let removed = {
            let mut state = lock(&self.state);
            match state.sets.get(topic) {
                Some(set) if set.timeout_id() == id => state.sets.remove(topic),
                _ => None,
            }
        };
        if let Some(set) = removed {
            tracing::warn!(
                topic,
                buffered = set.buffered(),
                next_expected = set.next_expected(),
                "Ordered message set timed out"
            );
            self.events.publish(
                GridEvent::new(EventKind::MessageSetTimedOut)
                    .with_topic(topic)
                    .with_node(set.owner()),
            );
        }
    }

    fn close_topic(&self, topic: &str) {
        let removed = {
            let mut state = lock(&self.state);
            state.closed.insert(topic);
            state.sets.remove(topic)
        };
        if let Some(set) = removed {
            self.timeouts.remove_timeout(set.timeout_id());
        }
        tracing::debug!(topic, "Topic closed");
    }

    fn cleanup_departed(&self, node: NodeId) {
        let removed: Vec<Arc<MessageSet>> = {
            let mut state = lock(&self.state);
            state.waiting.remove(&node);
            let topics: Vec<String> = state
                .sets
                .iter()
                .filter(|(_, set)| set.owner() == node)
                .map(|(topic, _)| topic.clone())
                .collect();
            let mut removed = Vec::with_capacity(topics.len());
            for topic in topics {
                if let Some(set) = state.sets.remove(&topic) {
                    state.closed.insert(&topic);
                    removed.push(set);
                }
            }
            removed
        };

        for set in &removed {
            self.timeouts.remove_timeout(set.timeout_id());
        }
        if !removed.is_empty() {
            tracing::info!(node_id = %node, sets = removed.len(), "Discarded message sets of departed node");
        }
    }

    fn park(&self, sender: NodeId, envelope: Envelope) {
        let window = self.config.discovery_startup_window;
        let mut state = lock(&self.state);
        state.waiting.retain(|_, parked| {
            parked.retain(|e| e.received_at().elapsed() <= window);
            !parked.is_empty()
        });
        tracing::debug!(sender = %sender, topic = envelope.topic(), "Sender not discovered yet, envelope parked");
        state.waiting.entry(sender).or_default().push(envelope);
    }

    fn redrive(&self, sender: NodeId) {
        let parked = lock(&self.state).waiting.remove(&sender).unwrap_or_default();
        let window = self.config.discovery_startup_window;
        for envelope in parked {
            if envelope.received_at().elapsed() > window {
                tracing::debug!(
                    sender = %sender,
                    topic = envelope.topic(),
                    "Parked envelope outlived discovery window, purged"
                );
                continue;
            }
            self.dispatch(sender, envelope);
        }
    }
}

/// Delivery loop of the reservation holder. Listeners run with no lock held.
fn deliver_ordered(set: &MessageSet, listeners: &ListenerSet) {
    if !set.reserve() {
        // The current holder keeps looping until nothing is deliverable.
        return;
    }
    while let Some(batch) = set.unwind_or_release() {
        for envelope in &batch {
            deliver_all(listeners, envelope.sender(), envelope);
        }
    }
}

fn deliver_all(listeners: &ListenerSet, sender: NodeId, envelope: &Envelope) {
    for listener in listeners.iter() {
        let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_message(sender, envelope)));
        if outcome.is_err() {
            tracing::error!(topic = envelope.topic(), sender = %sender, "Listener panicked");
        }
    }
}

struct TransportHook(Weak<TopicDispatcher>);

impl TransportListener for TransportHook {
    fn on_message(&self, sender: NodeId, envelope: Envelope) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.on_message_received(sender, envelope);
        }
    }
}

struct MembershipHook(Weak<TopicDispatcher>);

impl MembershipListener for MembershipHook {
    fn on_event(&self, event: &MembershipEvent) {
        if let Some(dispatcher) = self.0.upgrade() {
            dispatcher.on_membership_event(event);
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads reserved for DEDICATED envelopes.
struct DedicatedPool {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
}

impl DedicatedPool {
    fn new(size: usize, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let rx = Arc::new(Mutex::new(rx));
        for i in 0..size.max(1) {
            let rx = rx.clone();
            let runtime = runtime.clone();
            let spawned = thread::Builder::new()
                .name(format!("dedicated-dispatch-{i}"))
                .spawn(move || {
                    let _rt = runtime.enter();
                    loop {
                        let task = match lock(&rx).recv() {
                            Ok(task) => task,
                            Err(_) => break,
                        };
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            tracing::error!("Dedicated dispatch task panicked");
                        }
                    }
                });
            if let Err(e) = spawned {
                tracing::error!(error = %e, "Failed to spawn dedicated dispatch thread");
            }
        }
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    fn execute(&self, task: Task) -> bool {
        match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    fn shutdown(&self) {
        lock(&self.tx).take();
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
