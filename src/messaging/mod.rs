//! Topic-based messaging between nodes.
//!
//! Envelopes carry an opaque payload on a string topic. Unordered envelopes
//! are fanned out to listeners as they arrive; ordered envelopes from one
//! sender on one topic are delivered strictly by sequence id, with no gaps,
//! and never concurrently.

pub mod closed_topics;
pub mod dispatcher;
pub mod envelope;
pub mod listeners;
pub mod message_set;
pub mod topic;

pub use closed_topics::ClosedTopics;
pub use dispatcher::TopicDispatcher;
pub use envelope::{DispatchPolicy, Envelope, Sequencing};
pub use listeners::{ListenerRegistry, ListenerSet, MessageListener, Removal};
pub use message_set::{Insert, MessageSet};
