use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::cluster::node::NodeId;
use crate::error::{GridError, Result};
use crate::messaging::Envelope;

/// Receives envelopes from the wire. Called on transport threads.
pub trait TransportListener: Send + Sync {
    fn on_message(&self, sender: NodeId, envelope: Envelope);
}

/// Point-to-point delivery of envelopes to other nodes.
pub trait Transport: Send + Sync {
    /// Sends `envelope` to every node in `nodes`. Fails on the first node that
    /// cannot be reached; nothing is retried.
    fn send(&self, nodes: &[NodeId], envelope: &Envelope) -> Result<()>;

    fn set_listener(&self, listener: Arc<dyn TransportListener>);
}

/// In-process network connecting [`LoopbackTransport`] endpoints.
///
/// Envelopes go through the wire codec on every hop, so decoding problems
/// surface exactly as they would on a socket.
pub struct LoopbackNetwork {
    endpoints: Mutex<HashMap<NodeId, Arc<LoopbackTransport>>>,
    runtime: Handle,
}

impl LoopbackNetwork {
    /// Must be called from within a Tokio runtime; deliveries are spawned on it.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            runtime: Handle::current(),
        })
    }

    pub fn endpoint(self: &Arc<Self>, local: NodeId) -> Arc<LoopbackTransport> {
        let transport = Arc::new(LoopbackTransport {
            local,
            network: Arc::downgrade(self),
            listener: Mutex::new(None),
            sent_frames: AtomicU64::new(0),
        });
        self.lock().insert(local, transport.clone());
        transport
    }

    /// Removes the endpoint; later sends to it fail with a transport error.
    pub fn disconnect(&self, node: &NodeId) {
        self.lock().remove(node);
    }

    /// Delivers raw bytes to `to` as if they came off the wire from `from`.
    pub fn inject(&self, from: NodeId, to: &NodeId, frame: Bytes) -> Result<()> {
        let target = self.lock().get(to).cloned().ok_or_else(|| GridError::TransportFailure {
            node: *to,
            reason: "no such endpoint".to_string(),
        })?;
        self.runtime.spawn(async move {
            target.receive(from, frame);
        });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, Arc<LoopbackTransport>>> {
        self.endpoints.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct LoopbackTransport {
    local: NodeId,
    network: Weak<LoopbackNetwork>,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    sent_frames: AtomicU64,
}

impl LoopbackTransport {
    pub fn local_node_id(&self) -> NodeId {
        self.local
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames.load(Ordering::Relaxed)
    }

    fn receive(&self, from: NodeId, frame: Bytes) {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(sender = %from, error = %e, "Dropping undecodable frame");
                return;
            }
        };

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match listener {
            Some(listener) => listener.on_message(from, envelope),
            None => tracing::debug!(sender = %from, "No transport listener, frame dropped"),
        }
    }
}

impl Transport for LoopbackTransport {
    fn send(&self, nodes: &[NodeId], envelope: &Envelope) -> Result<()> {
        let network = self.network.upgrade().ok_or_else(|| GridError::TransportFailure {
            node: self.local,
            reason: "network shut down".to_string(),
        })?;

        let frame = envelope.encode();
        for node in nodes {
            network.inject(self.local, node, frame.clone())?;
            self.sent_frames.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }
}
