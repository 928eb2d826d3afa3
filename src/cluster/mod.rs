//! Collaborators a node depends on but does not own.
//!
//! - [`MembershipProvider`]: who is in the cluster, with join/leave/fail/metrics events
//! - [`Transport`]: point-to-point envelope delivery
//! - [`TimeoutAuthority`]: deadline callbacks keyed by id
//!
//! Each comes with an in-process implementation ([`InMemoryMembership`],
//! [`LoopbackNetwork`], [`TimeoutProcessor`]) used by the demo binary and tests.

pub mod membership;
pub mod node;
pub mod timeout;
pub mod transport;

pub use membership::{
    InMemoryMembership, MembershipEvent, MembershipEventKind, MembershipListener,
    MembershipProvider, SubscriptionId,
};
pub use node::{ClusterNode, NodeId};
pub use timeout::{TimeoutAuthority, TimeoutId, TimeoutObject, TimeoutProcessor};
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport, TransportListener};
