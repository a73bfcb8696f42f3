//! Serialized diffs for incremental replication
//!
//! Provides [`SerializedDiff`], the `(key, variant tag, payload)` tuple that
//! describes either a whole node or one of its immediate children.

use crate::codec::CodecError;
use crate::key::Key;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Identifies the decoder for a diff payload
///
/// The wire names are stable; an unrecognized name fails decoding with
/// [`CodecError::UnknownVariant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariantTag {
    /// Plain value; payload is a [`Value`]
    Value,
    /// Sequence-flavored node
    Array,
    /// Mapping-flavored node
    Map,
    /// Logical OR over boolean factors
    FactoredOr,
    /// Logical NOR over boolean factors
    FactoredNor,
    /// Arithmetic sum over numeric factors
    FactoredSum,
}

impl VariantTag {
    /// All tags the encoder can produce
    pub const ALL: [VariantTag; 6] = [
        Self::Value,
        Self::Array,
        Self::Map,
        Self::FactoredOr,
        Self::FactoredNor,
        Self::FactoredSum,
    ];

    /// Wire name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Value => "Value",
            Self::Array => "ArrayReplicant",
            Self::Map => "MapReplicant",
            Self::FactoredOr => "FactoredOrReplicant",
            Self::FactoredNor => "FactoredNorReplicant",
            Self::FactoredSum => "FactoredSumReplicant",
        }
    }

    /// Whether the payload is a list of nested diffs
    #[inline]
    #[must_use]
    pub const fn is_composite(self) -> bool {
        !matches!(self, Self::Value)
    }
}

impl Display for VariantTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantTag {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| CodecError::UnknownVariant(s.to_string()))
    }
}

/// Type-specific body of a diff
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain value (tag [`VariantTag::Value`])
    Value(Value),
    /// Nested child diffs of a composite node, each carrying its key
    Entries(Vec<SerializedDiff>),
}

/// One incremental change: `(key | None, tag, payload)`
///
/// `key == None` addresses the node itself (full replace); otherwise the diff
/// addresses one immediate child.
///
/// # Invariants
/// - tag [`VariantTag::Value`] always carries [`Payload::Value`]
/// - composite tags always carry [`Payload::Entries`], every entry keyed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", try_from = "Value")]
pub struct SerializedDiff {
    key: Option<Key>,
    tag: VariantTag,
    payload: Payload,
}

impl SerializedDiff {
    /// Diff carrying a plain value
    #[inline]
    #[must_use]
    pub fn value(key: Option<Key>, value: Value) -> Self {
        Self {
            key,
            tag: VariantTag::Value,
            payload: Payload::Value(value),
        }
    }

    /// Diff carrying a composite node's entries
    ///
    /// # Errors
    /// Returns error if `tag` is not composite or an entry has no key
    pub fn composite(
        key: Option<Key>,
        tag: VariantTag,
        entries: Vec<SerializedDiff>,
    ) -> Result<Self, CodecError> {
        if !tag.is_composite() {
            return Err(CodecError::Malformed(format!(
                "{tag} cannot carry nested entries"
            )));
        }
        if entries.iter().any(|entry| entry.key.is_none()) {
            return Err(CodecError::Malformed(format!(
                "nested entry of {tag} has no key"
            )));
        }
        Ok(Self {
            key,
            tag,
            payload: Payload::Entries(entries),
        })
    }

    /// Composite diff with no entries
    ///
    /// Used as the redacted form of a node hidden from an observer. A
    /// [`VariantTag::Value`] tag yields a `Nil` value diff instead.
    #[must_use]
    pub fn empty(key: Option<Key>, tag: VariantTag) -> Self {
        if tag.is_composite() {
            Self {
                key,
                tag,
                payload: Payload::Entries(Vec::new()),
            }
        } else {
            Self::value(key, Value::Nil)
        }
    }

    /// Target key (`None` for the node itself)
    #[inline]
    #[must_use]
    pub fn key(&self) -> Option<&Key> {
        self.key.as_ref()
    }

    /// Variant tag
    #[inline]
    #[must_use]
    pub fn tag(&self) -> VariantTag {
        self.tag
    }

    /// Payload
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Plain value carried by a [`VariantTag::Value`] diff
    #[inline]
    #[must_use]
    pub fn as_value(&self) -> Option<&Value> {
        match &self.payload {
            Payload::Value(value) => Some(value),
            Payload::Entries(_) => None,
        }
    }

    /// Nested entries carried by a composite diff
    #[inline]
    #[must_use]
    pub fn entries(&self) -> &[SerializedDiff] {
        match &self.payload {
            Payload::Entries(entries) => entries,
            Payload::Value(_) => &[],
        }
    }

    /// Same diff re-addressed to `key`
    #[inline]
    #[must_use]
    pub fn with_key(mut self, key: Option<Key>) -> Self {
        self.key = key;
        self
    }

    /// Split into parts
    #[inline]
    #[must_use]
    pub fn into_parts(self) -> (Option<Key>, VariantTag, Payload) {
        (self.key, self.tag, self.payload)
    }
}
