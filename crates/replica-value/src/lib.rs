//! Replica Value Model
//!
//! Values, addressing and the self-describing diff codec shared by the
//! authority and its observers.
//!
//! # Core Concepts
//!
//! - [`Value`]: scalar, ordered sequence, or keyed mapping
//! - [`Key`] / [`KeyPath`]: addressing of child slots and nodes
//! - [`SerializedDiff`]: `(key, tag, payload)` incremental change
//! - [`VariantTag`]: selects the decoder on the receiving side
//! - [`codec`]: wire encoding (`encode`/`decode`, JSON helpers)
//!
//! # Example
//!
//! ```rust
//! use replica_value::{codec, Key, SerializedDiff, Value};
//!
//! let diff = SerializedDiff::value(Some(Key::from("health")), Value::from(80));
//! let text = codec::to_json(&diff)?;
//! assert_eq!(codec::from_json(&text)?, diff);
//! # Ok::<(), replica_value::CodecError>(())
//! ```

#![warn(unreachable_pub)]
#![warn(missing_docs)]

// Core modules
mod diff;
mod key;
mod value;

/// Wire encoding for diffs
pub mod codec;

// Re-exports
pub use codec::CodecError;
pub use diff::{Payload, SerializedDiff, VariantTag};
pub use key::{Key, KeyPath, PathError};
pub use value::Value;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
