//! Node event stream.
//!
//! [`EventBus`] wraps a [`tokio::sync::broadcast`] channel. Publishing never
//! blocks and events are dropped when nobody is subscribed; slow receivers see
//! `RecvError::Lagged`.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::cluster::NodeId;
use crate::scheduler::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobQueued,
    JobStarted,
    JobFinished,
    JobFailed,
    JobCancelled,
    JobTimedOut,
    /// Rejected by the collision policy or by a saturated execution pool.
    JobRejected,
    DuplicateJob,
    /// The originating node left before the response could be sent.
    ResponseSuppressed,
    ResponseSendFailed,
    MessageSetTimedOut,
    NodeDeparted,
}

#[derive(Debug, Clone)]
pub struct GridEvent {
    pub kind: EventKind,
    pub job_id: Option<JobId>,
    pub node_id: Option<NodeId>,
    pub topic: Option<String>,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

impl GridEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            job_id: None,
            node_id: None,
            topic: None,
            reason: None,
            at: Utc::now(),
        }
    }

    pub fn with_job(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<GridEvent>,
}

impl EventBus {
    /// Capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: GridEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_published_after_subscribing() {
        let bus = EventBus::new(8);
        bus.publish(GridEvent::new(EventKind::JobQueued));

        let mut rx = bus.subscribe();
        let job = JobId::new();
        bus.publish(GridEvent::new(EventKind::JobStarted).with_job(job).with_reason("x"));

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::JobStarted);
        assert_eq!(ev.job_id, Some(job));
        assert_eq!(ev.reason.as_deref(), Some("x"));
    }
}
