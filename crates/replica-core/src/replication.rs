//! Transport seam
//!
//! The core never touches the network. Outbound changes are handed to a
//! [`ReplicationSink`] as [`Envelope`]s; inbound envelopes are given back to
//! [`Registry::apply_inbound`](crate::Registry::apply_inbound). Framing,
//! compression and delivery belong to the sink.

use crate::permission::ObserverId;
use crate::registry::RegistryKey;
use replica_value::{KeyPath, SerializedDiff};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// One end of the replication link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Peer {
    /// The authoritative side
    Authority,
    /// A specific observer
    Observer(ObserverId),
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authority => f.write_str("authority"),
            Self::Observer(id) => Display::fmt(id, f),
        }
    }
}

/// Replication payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Apply `diff` to the node at `key_path` of the tree under `registry_key`
    Update {
        /// Tree the change belongs to
        registry_key: RegistryKey,
        /// Path from the tree root to the changed node
        key_path: KeyPath,
        /// Change, addressed relative to that node
        diff: SerializedDiff,
    },
    /// The tree under `registry_key` is no longer replicated
    Unregister {
        /// Tree that went away
        registry_key: RegistryKey,
    },
}

impl Message {
    /// Registry key the message refers to
    #[must_use]
    pub fn registry_key(&self) -> &RegistryKey {
        match self {
            Self::Update { registry_key, .. } | Self::Unregister { registry_key } => registry_key,
        }
    }
}

/// Addressed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender
    pub origin: Peer,
    /// Recipient
    pub target: Peer,
    /// Payload
    pub message: Message,
}

/// Outbound side of a transport
///
/// Called synchronously from inside mutations; implementations should queue
/// rather than block.
pub trait ReplicationSink: Send + Sync {
    /// Hand one envelope to the transport
    fn dispatch(&self, envelope: Envelope);
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_value::{Key, Value};

    #[test]
    fn envelope_serializes_with_wire_diff() {
        let envelope = Envelope {
            origin: Peer::Authority,
            target: Peer::Observer(ObserverId(3)),
            message: Message::Update {
                registry_key: RegistryKey::from("Player1"),
                key_path: KeyPath::root(),
                diff: SerializedDiff::value(Some(Key::from("health")), Value::from(80)),
            },
        };

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains(r#"["health","Value",80.0]"#));

        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn peers_display() {
        assert_eq!(Peer::Authority.to_string(), "authority");
        assert_eq!(Peer::Observer(ObserverId(4)).to_string(), "observer#4");
    }
}
