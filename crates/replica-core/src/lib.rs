//! Replicated State Trees
//!
//! An authority owns trees of values; observers mirror the parts they are
//! permitted to see. Observers may predict writes locally; predictions are
//! reconciled by the next authoritative update for the same key.
//!
//! # Core Concepts
//!
//! - [`Replicant`]: node of a tree (array, map or factored aggregate)
//! - [`ReplicaConfig`]: who may write a subtree and who may see it
//! - [`PredictionState`]: speculative overlay over authoritative state
//! - [`FactoredOr`] / [`FactoredNor`] / [`FactoredSum`]: derived values over
//!   named factors
//! - [`Registry`]: key to tree lookup, lifecycle signals and replication
//!   fan-out through a [`ReplicationSink`]
//!
//! # Example
//!
//! ```rust
//! use replica_core::{Registry, Replicant, Role, Variant};
//!
//! let registry = Registry::authority();
//! let player = Replicant::new(Variant::Map, Role::Authority);
//! player.set("health", 100)?;
//! registry.register("Player1", &player)?;
//!
//! let diff = player.serialize(Some(&"health".into()), None)?;
//! let mirror = Replicant::new(Variant::Map, Role::Observer);
//! mirror.merge_serialized(&diff)?;
//! assert_eq!(mirror.get_value("health")?, 100.into());
//! # Ok::<(), replica_core::ReplicaError>(())
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

// Core modules
mod error;
mod factored;
mod node;
mod permission;
mod prediction;
mod registry;
mod replication;
mod variant;

// Re-exports
pub use error::ReplicaError;
pub use factored::{FactoredNor, FactoredOr, FactoredSum};
pub use node::{Entry, Replicant};
pub use permission::{ObserverId, ReplicaConfig, Role};
pub use prediction::PredictionState;
pub use registry::{ObjectRef, Registration, Registry, RegistryKey};
pub use replication::{Envelope, Message, Peer, ReplicationSink};
pub use variant::Variant;

pub use replica_signal::{Connection, Signal};
pub use replica_value::{codec, CodecError, Key, KeyPath, SerializedDiff, Value, VariantTag};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
