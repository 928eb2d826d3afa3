use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cluster::node::{ClusterNode, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipEventKind {
    Joined,
    Left,
    Failed,
    MetricsUpdated,
}

impl MembershipEventKind {
    /// True for events after which the node is no longer a member.
    pub fn is_departure(&self) -> bool {
        matches!(self, MembershipEventKind::Left | MembershipEventKind::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct MembershipEvent {
    pub kind: MembershipEventKind,
    pub node: ClusterNode,
}

pub trait MembershipListener: Send + Sync {
    fn on_event(&self, event: &MembershipEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Cluster membership as seen from one node.
pub trait MembershipProvider: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    fn node(&self, id: &NodeId) -> Option<ClusterNode>;

    fn nodes(&self) -> Vec<ClusterNode>;

    fn subscribe(&self, listener: Arc<dyn MembershipListener>) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    fn ping(&self, id: &NodeId) -> bool;

    fn is_member(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }
}

#[derive(Default)]
struct ViewState {
    members: HashMap<NodeId, ClusterNode>,
    listeners: Vec<(SubscriptionId, Arc<dyn MembershipListener>)>,
}

/// Shared in-process membership view.
///
/// Every node of an in-process cluster holds a provider bound to the same view,
/// so joins and departures are observed by all of them. Listeners are notified
/// synchronously on the caller's thread, after the view lock is released.
#[derive(Default)]
pub struct InMemoryMembership {
    state: Mutex<ViewState>,
    next_subscription: AtomicU64,
}

impl InMemoryMembership {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a provider that reports `local` as the local node.
    pub fn provider(self: &Arc<Self>, local: NodeId) -> Arc<dyn MembershipProvider> {
        Arc::new(LocalMembership {
            view: self.clone(),
            local,
        })
    }

    pub fn join(&self, node: ClusterNode) {
        {
            let mut state = self.lock();
            state.members.insert(node.id, node.clone());
        }
        tracing::info!(node_id = %node.id, name = %node.name, "Node joined");
        self.notify(MembershipEventKind::Joined, node);
    }

    pub fn leave(&self, id: &NodeId) {
        self.depart(id, MembershipEventKind::Left);
    }

    pub fn fail(&self, id: &NodeId) {
        self.depart(id, MembershipEventKind::Failed);
    }

    pub fn update_metrics(&self, id: &NodeId) {
        let node = {
            let mut state = self.lock();
            match state.members.get_mut(id) {
                Some(node) => {
                    node.metrics_version += 1;
                    node.clone()
                }
                None => return,
            }
        };
        self.notify(MembershipEventKind::MetricsUpdated, node);
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lock().members.contains_key(id)
    }

    fn depart(&self, id: &NodeId, kind: MembershipEventKind) {
        let removed = self.lock().members.remove(id);
        if let Some(node) = removed {
            tracing::info!(node_id = %node.id, event = ?kind, "Node left cluster");
            self.notify(kind, node);
        }
    }

    fn notify(&self, kind: MembershipEventKind, node: ClusterNode) {
        let listeners: Vec<Arc<dyn MembershipListener>> = self
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        let event = MembershipEvent { kind, node };
        for listener in listeners {
            listener.on_event(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct LocalMembership {
    view: Arc<InMemoryMembership>,
    local: NodeId,
}

impl MembershipProvider for LocalMembership {
    fn local_node_id(&self) -> NodeId {
        self.local
    }

    fn node(&self, id: &NodeId) -> Option<ClusterNode> {
        self.view.lock().members.get(id).cloned()
    }

    fn nodes(&self) -> Vec<ClusterNode> {
        self.view.lock().members.values().cloned().collect()
    }

    fn subscribe(&self, listener: Arc<dyn MembershipListener>) -> SubscriptionId {
        let id = SubscriptionId(self.view.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.view.lock().listeners.push((id, listener));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.view.lock().listeners.retain(|(sub, _)| *sub != id);
    }

    fn ping(&self, id: &NodeId) -> bool {
        self.view.contains(id)
    }
}
