use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::time::Instant;

use crate::cluster::NodeId;
use crate::error::{GridError, Result};

/// Which executor an inbound envelope is dispatched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPolicy {
    /// Shared pool; ordered envelopes are only allowed here.
    Pooled,
    /// Small dedicated pool kept free for urgent control traffic.
    Dedicated,
}

/// Ordering metadata carried by ordered envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sequencing {
    /// Strictly positive, increasing per topic and sender.
    pub sequence: u64,
    /// How long the receiver keeps buffering out-of-order envelopes for the topic.
    pub timeout: Duration,
}

/// An immutable message addressed to a topic on one or more nodes.
#[derive(Debug, Clone)]
pub struct Envelope {
    sender: NodeId,
    destinations: Vec<NodeId>,
    topic: String,
    payload: Bytes,
    policy: DispatchPolicy,
    sequencing: Option<Sequencing>,
    received_at: Instant,
}

impl Envelope {
    pub fn unordered(
        sender: NodeId,
        destinations: Vec<NodeId>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        policy: DispatchPolicy,
    ) -> Result<Self> {
        Self::build(sender, destinations, topic.into(), payload.into(), policy, None)
    }

    /// Ordered envelopes always use [`DispatchPolicy::Pooled`]. The timeout is
    /// rounded up to whole milliseconds, the resolution it travels with.
    pub fn ordered(
        sender: NodeId,
        destinations: Vec<NodeId>,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        sequence: u64,
        timeout: Duration,
    ) -> Result<Self> {
        Self::build(
            sender,
            destinations,
            topic.into(),
            payload.into(),
            DispatchPolicy::Pooled,
            Some(Sequencing {
                sequence,
                timeout: whole_millis(timeout),
            }),
        )
    }

    fn build(
        sender: NodeId,
        destinations: Vec<NodeId>,
        topic: String,
        payload: Bytes,
        policy: DispatchPolicy,
        sequencing: Option<Sequencing>,
    ) -> Result<Self> {
        if destinations.is_empty() {
            return Err(GridError::InvalidEnvelope(
                "at least one destination is required".to_string(),
            ));
        }
        if let Some(seq) = sequencing {
            if seq.sequence == 0 {
                return Err(GridError::InvalidEnvelope(
                    "sequence id must be positive".to_string(),
                ));
            }
            if seq.timeout.is_zero() {
                return Err(GridError::InvalidEnvelope(
                    "ordered envelope requires a positive timeout".to_string(),
                ));
            }
            if policy != DispatchPolicy::Pooled {
                return Err(GridError::InvalidEnvelope(
                    "ordered envelopes must use the pooled policy".to_string(),
                ));
            }
        }
        Ok(Self {
            sender,
            destinations,
            topic,
            payload,
            policy,
            sequencing,
            received_at: Instant::now(),
        })
    }

    pub fn sender(&self) -> NodeId {
        self.sender
    }

    pub fn destinations(&self) -> &[NodeId] {
        &self.destinations
    }

    pub fn is_addressed_to(&self, node: &NodeId) -> bool {
        self.destinations.contains(node)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    pub fn is_ordered(&self) -> bool {
        self.sequencing.is_some()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequencing.map(|s| s.sequence)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.sequencing.map(|s| s.timeout)
    }

    /// Local time the envelope was built or decoded. Never serialized.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn encode(&self) -> Bytes {
        let frame = EnvelopeFrame {
            sender: Bytes::copy_from_slice(self.sender.as_bytes()),
            destinations: self
                .destinations
                .iter()
                .map(|d| Bytes::copy_from_slice(d.as_bytes()))
                .collect(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            policy: PolicyFrame::from(self.policy) as i32,
            sequence: self.sequence(),
            timeout_ms: self.timeout().map(|t| t.as_millis() as u64),
        };
        Bytes::from(frame.encode_to_vec())
    }

    pub fn decode(frame: Bytes) -> Result<Self> {
        let frame = EnvelopeFrame::decode(frame).map_err(|e| GridError::DeserializationFailure {
            what: "envelope",
            reason: e.to_string(),
        })?;

        let sender = NodeId::from_slice(&frame.sender).ok_or_else(|| {
            GridError::InvalidEnvelope("sender id is not 16 bytes".to_string())
        })?;
        let destinations = frame
            .destinations
            .iter()
            .map(|d| NodeId::from_slice(d))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GridError::InvalidEnvelope("destination id is not 16 bytes".to_string()))?;
        let policy = PolicyFrame::try_from(frame.policy)
            .map_err(|_| GridError::InvalidEnvelope(format!("unknown policy {}", frame.policy)))?
            .into();

        let sequencing = match (frame.sequence, frame.timeout_ms) {
            (None, None) => None,
            (Some(sequence), Some(timeout_ms)) => Some(Sequencing {
                sequence,
                timeout: Duration::from_millis(timeout_ms),
            }),
            _ => {
                return Err(GridError::InvalidEnvelope(
                    "sequence and timeout must be both present or both absent".to_string(),
                ))
            }
        };

        Self::build(sender, destinations, frame.topic, frame.payload, policy, sequencing)
    }
}

fn whole_millis(timeout: Duration) -> Duration {
    let millis = timeout.as_nanos().div_ceil(1_000_000);
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Wire form of [`Envelope`].
#[derive(Clone, PartialEq, Message)]
struct EnvelopeFrame {
    #[prost(bytes = "bytes", tag = "1")]
    sender: Bytes,
    #[prost(bytes = "bytes", repeated, tag = "2")]
    destinations: Vec<Bytes>,
    #[prost(string, tag = "3")]
    topic: String,
    #[prost(bytes = "bytes", tag = "4")]
    payload: Bytes,
    #[prost(enumeration = "PolicyFrame", tag = "5")]
    policy: i32,
    #[prost(uint64, optional, tag = "6")]
    sequence: Option<u64>,
    #[prost(uint64, optional, tag = "7")]
    timeout_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
enum PolicyFrame {
    Pooled = 0,
    Dedicated = 1,
}

impl From<DispatchPolicy> for PolicyFrame {
    fn from(policy: DispatchPolicy) -> Self {
        match policy {
            DispatchPolicy::Pooled => PolicyFrame::Pooled,
            DispatchPolicy::Dedicated => PolicyFrame::Dedicated,
        }
    }
}

impl From<PolicyFrame> for DispatchPolicy {
    fn from(policy: PolicyFrame) -> Self {
        match policy {
            PolicyFrame::Pooled => DispatchPolicy::Pooled,
            PolicyFrame::Dedicated => DispatchPolicy::Dedicated,
        }
    }
}
