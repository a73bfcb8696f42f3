//! Error types for replicated trees
//!
//! Every failure is local and synchronous: it is reported at the call site
//! and never retried internally. Retry policy belongs to the transport.

use crate::permission::Role;
use crate::registry::RegistryKey;
use crate::variant::Variant;
use replica_value::{CodecError, Key, KeyPath, VariantTag};

/// Main replica error type
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    /// Operation on a destroyed node
    #[error("node at '{path}' is no longer active")]
    InactiveNode {
        /// Key-path the node had when it was destroyed
        path: KeyPath,
    },

    /// Write attempted by a role the node's config does not authorize
    #[error("{role} is not permitted to write '{path}'")]
    PermissionDenied {
        /// Acting role
        role: Role,
        /// Key-path of the written slot
        path: KeyPath,
    },

    /// Diff could not be decoded (including unknown variant tags)
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Registry key already bound to a live node
    #[error("registry key '{0}' is already registered")]
    KeyAlreadyRegistered(RegistryKey),

    /// Inbound update names a registry key nobody registered
    #[error("registry key '{0}' is not registered")]
    NotRegistered(RegistryKey),

    /// Key kind does not address a slot of this variant
    #[error("key '{key}' does not address a slot of a {variant}")]
    InvalidKey {
        /// Offending key
        key: Key,
        /// Variant of the addressed node
        variant: Variant,
    },

    /// Factor value of the wrong kind for the aggregate
    #[error("factor '{factor}' of a {variant} cannot hold a {found}")]
    InvalidFactor {
        /// Factor name
        factor: Key,
        /// Aggregate variant
        variant: Variant,
        /// Kind of the rejected value
        found: &'static str,
    },

    /// Full-node diff produced by a different variant
    #[error("cannot merge a {found} diff into a {expected}")]
    VariantMismatch {
        /// Tag of the receiving node
        expected: VariantTag,
        /// Tag carried by the diff
        found: VariantTag,
    },

    /// Node cannot be attached where requested
    #[error("cannot attach node: {0}")]
    InvalidChild(String),

    /// Only tree roots can be registered
    #[error("node at '{0}' is not a tree root")]
    NotRoot(KeyPath),

    /// Node already registered under another key
    #[error("node is already registered under '{0}'")]
    AlreadyBound(RegistryKey),

    /// Operation not offered by this variant
    #[error("{operation} is not supported on a {variant}")]
    Unsupported {
        /// Operation name
        operation: &'static str,
        /// Variant of the node
        variant: Variant,
    },
}

impl ReplicaError {
    /// Check if the error stems from caller misuse rather than bad input
    /// from the transport
    #[inline]
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            Self::Codec(_) | Self::NotRegistered(_) | Self::VariantMismatch { .. }
        )
    }

    /// Check if error is retryable
    ///
    /// Always `false`: the core never retries, and retrying the same call
    /// cannot succeed without a state change.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Check for the forward-compatibility failure on unknown diff tags
    #[inline]
    #[must_use]
    pub fn is_unknown_variant(&self) -> bool {
        matches!(self, Self::Codec(err) if err.is_unknown_variant())
    }

    pub(crate) fn inactive(path: &KeyPath) -> Self {
        Self::InactiveNode { path: path.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_mentions_role_and_path() {
        let err = ReplicaError::PermissionDenied {
            role: Role::Observer,
            path: KeyPath::root().child("health"),
        };
        assert_eq!(err.to_string(), "observer is not permitted to write 'health'");
        assert!(err.is_user_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn unknown_variant_is_detected_through_codec() {
        let err = ReplicaError::from(CodecError::UnknownVariant("Mystery".into()));
        assert!(err.is_unknown_variant());
        assert!(!err.is_user_error());
    }

    #[test]
    fn inactive_node_display() {
        let err = ReplicaError::inactive(&KeyPath::root());
        assert_eq!(err.to_string(), "node at '<root>' is no longer active");
    }
}
