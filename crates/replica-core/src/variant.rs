//! Closed set of node variants
//!
//! Every node is one [`Variant`]; behavior that differs between variants
//! (key kinds, factor kinds, resolution) dispatches on it instead of going
//! through a trait object.

use replica_value::{Key, Value, VariantTag};
use std::fmt::{self, Display, Formatter};

/// Flavor of a composite node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// Ordered sequence addressed by index
    Array,
    /// Keyed mapping addressed by name
    Map,
    /// True iff some factor is true
    FactoredOr,
    /// True iff no factor is true
    FactoredNor,
    /// Sum of numeric factors
    FactoredSum,
}

impl Variant {
    /// Wire tag of this variant
    #[inline]
    #[must_use]
    pub const fn tag(self) -> VariantTag {
        match self {
            Self::Array => VariantTag::Array,
            Self::Map => VariantTag::Map,
            Self::FactoredOr => VariantTag::FactoredOr,
            Self::FactoredNor => VariantTag::FactoredNor,
            Self::FactoredSum => VariantTag::FactoredSum,
        }
    }

    /// Variant for a composite wire tag
    #[must_use]
    pub const fn from_tag(tag: VariantTag) -> Option<Self> {
        match tag {
            VariantTag::Value => None,
            VariantTag::Array => Some(Self::Array),
            VariantTag::Map => Some(Self::Map),
            VariantTag::FactoredOr => Some(Self::FactoredOr),
            VariantTag::FactoredNor => Some(Self::FactoredNor),
            VariantTag::FactoredSum => Some(Self::FactoredSum),
        }
    }

    /// Whether the node resolves a derived value from its factors
    #[inline]
    #[must_use]
    pub const fn is_factored(self) -> bool {
        matches!(self, Self::FactoredOr | Self::FactoredNor | Self::FactoredSum)
    }

    /// Whether children are addressed by index
    #[inline]
    #[must_use]
    pub const fn is_sequence(self) -> bool {
        matches!(self, Self::Array)
    }

    /// Whether `key` can address a child slot
    #[must_use]
    pub fn accepts_key(self, key: &Key) -> bool {
        match key {
            Key::Index(_) => self.is_sequence(),
            Key::Name(name) => !self.is_sequence() && !name.is_empty(),
        }
    }

    /// Whether `value` is a valid factor contribution
    ///
    /// Non-factored variants accept any value. `Nil` always passes: it
    /// removes the factor.
    #[must_use]
    pub fn accepts_factor(self, value: &Value) -> bool {
        match self {
            Self::FactoredOr | Self::FactoredNor => matches!(value, Value::Nil | Value::Bool(_)),
            Self::FactoredSum => matches!(value, Value::Nil | Value::Number(_)),
            Self::Array | Self::Map => true,
        }
    }

    /// Resolved value over the current factor contributions
    ///
    /// `None` for non-factored variants.
    pub(crate) fn resolve<'a>(self, factors: impl IntoIterator<Item = &'a Value>) -> Option<Value> {
        let mut factors = factors.into_iter();
        match self {
            Self::FactoredOr => Some(Value::Bool(factors.any(|v| v.as_bool() == Some(true)))),
            Self::FactoredNor => Some(Value::Bool(!factors.any(|v| v.as_bool() == Some(true)))),
            Self::FactoredSum => Some(Value::Number(factors.filter_map(Value::as_f64).sum())),
            Self::Array | Self::Map => None,
        }
    }
}

impl Display for Variant {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag().as_str())
    }
}
