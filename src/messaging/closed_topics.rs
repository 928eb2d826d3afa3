use std::collections::{HashMap, VecDeque};

/// Bounded set of topics whose traffic is suppressed.
///
/// Entries are kept in insertion order; re-closing a topic refreshes it and the
/// least recently closed topic is evicted when the set is full.
#[derive(Debug)]
pub struct ClosedTopics {
    capacity: usize,
    order: VecDeque<(u64, String)>,
    index: HashMap<String, u64>,
    stamp: u64,
}

impl ClosedTopics {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            index: HashMap::new(),
            stamp: 0,
        }
    }

    pub fn insert(&mut self, topic: &str) {
        self.stamp += 1;
        self.index.insert(topic.to_string(), self.stamp);
        self.order.push_back((self.stamp, topic.to_string()));

        while self.index.len() > self.capacity {
            self.evict_oldest();
        }
        // Drop refreshed entries' stale stamps once they dominate the queue.
        if self.order.len() > self.capacity * 2 {
            let index = &self.index;
            self.order
                .retain(|(stamp, topic)| index.get(topic) == Some(stamp));
        }
    }

    pub fn remove(&mut self, topic: &str) -> bool {
        self.index.remove(topic).is_some()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.index.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn evict_oldest(&mut self) {
        while let Some((stamp, topic)) = self.order.pop_front() {
            if self.index.get(&topic) == Some(&stamp) {
                self.index.remove(&topic);
                tracing::trace!(topic = %topic, "Evicted closed topic");
                return;
            }
        }
    }
}
