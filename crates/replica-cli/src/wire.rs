//! JSON loopback transport
//!
//! Envelopes are encoded to JSON frames on dispatch and decoded again on
//! delivery, so the simulation exercises the wire form end to end.

use parking_lot::Mutex;
use replica_core::{Envelope, Peer, ReplicaError, ReplicationSink, Registry};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct JsonWire {
    frames: Mutex<VecDeque<String>>,
}

/// Outcome of one [`JsonWire::deliver`] pass
#[derive(Debug, Default)]
pub(crate) struct Delivered {
    pub(crate) frames: u64,
    pub(crate) bytes: u64,
    pub(crate) rejected: Vec<(Peer, ReplicaError)>,
}

impl ReplicationSink for JsonWire {
    fn dispatch(&self, envelope: Envelope) {
        match serde_json::to_string(&envelope) {
            Ok(frame) => self.frames.lock().push_back(frame),
            Err(err) => tracing::error!(error = %err, target = %envelope.target, "cannot encode envelope"),
        }
    }
}

impl JsonWire {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route frames until none are left; frames produced while applying are
    /// delivered in the same pass
    pub(crate) fn deliver(&self, authority: &Registry, observers: &[Registry]) -> Delivered {
        let mut delivered = Delivered::default();
        loop {
            let next = self.frames.lock().pop_front();
            let Some(frame) = next else {
                return delivered;
            };
            delivered.frames += 1;
            delivered.bytes += frame.len() as u64;

            let envelope: Envelope = match serde_json::from_str(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::error!(error = %err, "dropping undecodable frame");
                    continue;
                }
            };
            let target = envelope.target;
            let registry = match target {
                Peer::Authority => Some(authority),
                Peer::Observer(_) => observers.iter().find(|registry| registry.local() == target),
            };
            let Some(registry) = registry else {
                tracing::debug!(%target, "no peer for frame");
                continue;
            };
            if let Err(err) = registry.apply_inbound(envelope) {
                delivered.rejected.push((target, err));
            }
        }
    }
}
