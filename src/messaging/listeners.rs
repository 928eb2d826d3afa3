use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cluster::NodeId;
use crate::messaging::Envelope;

/// Consumer of envelopes delivered on a topic.
///
/// Invoked on pool threads, never while dispatcher locks are held, so a
/// listener may itself send on the topic it listens to.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, sender: NodeId, envelope: &Envelope);
}

impl<F> MessageListener for F
where
    F: Fn(NodeId, &Envelope) + Send + Sync,
{
    fn on_message(&self, sender: NodeId, envelope: &Envelope) {
        self(sender, envelope)
    }
}

pub type ListenerSet = Arc<[Arc<dyn MessageListener>]>;

/// Outcome of removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    NotFound,
    /// Other listeners remain on the topic.
    Partial,
    /// The topic has no listeners left.
    Last,
}

/// Topic → listener sets, updated copy-on-write so readers never block writers
/// for longer than an `Arc` clone.
#[derive(Default)]
pub struct ListenerRegistry {
    topics: Mutex<HashMap<String, ListenerSet>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str) -> Option<ListenerSet> {
        self.lock().get(topic).cloned()
    }

    /// Adds `listener`. Returns false if this exact listener was already registered.
    pub fn add(&self, topic: &str, listener: Arc<dyn MessageListener>) -> bool {
        let mut topics = self.lock();
        let current = topics.get(topic).cloned();
        let merged: ListenerSet = match current {
            Some(set) if set.iter().any(|l| Arc::ptr_eq(l, &listener)) => return false,
            Some(set) => set.iter().cloned().chain(std::iter::once(listener)).collect(),
            None => Arc::from(vec![listener]),
        };
        topics.insert(topic.to_string(), merged);
        true
    }

    pub fn remove(&self, topic: &str, listener: &Arc<dyn MessageListener>) -> Removal {
        let mut topics = self.lock();
        let Some(set) = topics.get(topic).cloned() else {
            return Removal::NotFound;
        };
        if !set.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return Removal::NotFound;
        }

        let remaining: Vec<_> = set
            .iter()
            .filter(|l| !Arc::ptr_eq(*l, listener))
            .cloned()
            .collect();
        if remaining.is_empty() {
            topics.remove(topic);
            Removal::Last
        } else {
            topics.insert(topic.to_string(), Arc::from(remaining));
            Removal::Partial
        }
    }

    /// Drops every listener on `topic`. Returns true if any were registered.
    pub fn remove_all(&self, topic: &str) -> bool {
        self.lock().remove(topic).is_some()
    }

    pub fn topics(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ListenerSet>> {
        self.topics.lock().unwrap_or_else(|e| e.into_inner())
    }
}
