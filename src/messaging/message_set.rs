use std::sync::Mutex;

use tokio::time::Instant;

use crate::cluster::{NodeId, TimeoutId};
use crate::messaging::Envelope;

/// Outcome of buffering an ordered envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Buffered,
    /// Sequence id already delivered or already buffered.
    Duplicate,
}

#[derive(Debug)]
struct SetState {
    /// Kept sorted by sequence id.
    buffer: Vec<Envelope>,
    next_expected: u64,
    reserved: bool,
}

/// Per-topic buffer sequencing ordered envelopes from one sender.
#[derive(Debug)]
pub struct MessageSet {
    topic: String,
    owner: NodeId,
    deadline: Instant,
    timeout_id: TimeoutId,
    state: Mutex<SetState>,
}

impl MessageSet {
    /// `deadline` is derived from the first envelope's declared timeout.
    pub fn new(topic: impl Into<String>, owner: NodeId, deadline: Instant) -> Self {
        Self {
            topic: topic.into(),
            owner,
            deadline,
            timeout_id: TimeoutId::new(),
            state: Mutex::new(SetState {
                buffer: Vec::new(),
                next_expected: 1,
                reserved: false,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn owner(&self) -> NodeId {
        self.owner
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout_id(&self) -> TimeoutId {
        self.timeout_id
    }

    pub fn insert(&self, envelope: Envelope) -> Insert {
        let Some(seq) = envelope.sequence() else {
            return Insert::Duplicate;
        };

        let mut state = self.lock();
        if seq < state.next_expected {
            return Insert::Duplicate;
        }
        match state
            .buffer
            .binary_search_by_key(&seq, |e| e.sequence().unwrap_or(0))
        {
            Ok(_) => Insert::Duplicate,
            Err(pos) => {
                state.buffer.insert(pos, envelope);
                Insert::Buffered
            }
        }
    }

    /// Removes and returns the gap-free run starting at the next expected id.
    pub fn unwind(&self) -> Vec<Envelope> {
        let mut state = self.lock();
        Self::unwind_locked(&mut state)
    }

    /// Takes the delivery reservation. False if another thread holds it.
    pub fn reserve(&self) -> bool {
        let mut state = self.lock();
        if state.reserved {
            false
        } else {
            state.reserved = true;
            true
        }
    }

    /// Unwinds for the reservation holder; when nothing is deliverable the
    /// reservation is released under the same lock hold and `None` is returned.
    pub fn unwind_or_release(&self) -> Option<Vec<Envelope>> {
        let mut state = self.lock();
        debug_assert!(state.reserved, "unwind_or_release without reservation");
        let batch = Self::unwind_locked(&mut state);
        if batch.is_empty() {
            state.reserved = false;
            None
        } else {
            Some(batch)
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.lock().reserved
    }

    pub fn next_expected(&self) -> u64 {
        self.lock().next_expected
    }

    pub fn buffered(&self) -> usize {
        self.lock().buffer.len()
    }

    fn unwind_locked(state: &mut SetState) -> Vec<Envelope> {
        let mut run = 0;
        for env in &state.buffer {
            if env.sequence() == Some(state.next_expected + run as u64) {
                run += 1;
            } else {
                break;
            }
        }
        state.next_expected += run as u64;
        state.buffer.drain(..run).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn ordered(seq: u64) -> Envelope {
        let node = NodeId::new();
        Envelope::ordered(node, vec![node], "t", Bytes::new(), seq, Duration::from_secs(5)).unwrap()
    }

    fn seqs(batch: &[Envelope]) -> Vec<u64> {
        batch.iter().filter_map(|e| e.sequence()).collect()
    }

    fn set() -> MessageSet {
        MessageSet::new("t", NodeId::new(), Instant::now() + Duration::from_secs(5))
    }

    #[test]
    fn unwind_stops_at_first_gap() {
        let set = set();
        for seq in [3, 1, 2, 5] {
            assert_eq!(set.insert(ordered(seq)), Insert::Buffered);
        }

        assert_eq!(seqs(&set.unwind()), vec![1, 2, 3]);
        assert_eq!(set.next_expected(), 4);
        assert_eq!(set.buffered(), 1);
        assert!(set.unwind().is_empty());

        set.insert(ordered(4));
        assert_eq!(seqs(&set.unwind()), vec![4, 5]);
        assert_eq!(set.next_expected(), 6);
    }

    #[test]
    fn duplicates_are_rejected() {
        let set = set();
        assert_eq!(set.insert(ordered(2)), Insert::Buffered);
        assert_eq!(set.insert(ordered(2)), Insert::Duplicate);
        set.insert(ordered(1));
        set.unwind();
        assert_eq!(set.insert(ordered(1)), Insert::Duplicate);
        assert_eq!(set.buffered(), 0);
    }

    #[test]
    fn reservation_is_exclusive_and_released_when_drained() {
        let set = set();
        assert!(set.reserve());
        assert!(!set.reserve());

        set.insert(ordered(1));
        assert_eq!(set.unwind_or_release().map(|b| seqs(&b)), Some(vec![1]));
        assert!(set.is_reserved());
        assert!(set.unwind_or_release().is_none());
        assert!(!set.is_reserved());
        assert!(set.reserve());
    }
}
