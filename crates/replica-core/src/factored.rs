//! Typed factored aggregates
//!
//! Thin wrappers around a [`Replicant`] of a factored variant that expose the
//! resolved state with its natural Rust type.

use crate::error::ReplicaError;
use crate::node::{Entry, Replicant};
use crate::permission::Role;
use crate::variant::Variant;
use replica_signal::Signal;
use replica_value::{Key, Value};

type Result<T> = std::result::Result<T, ReplicaError>;

fn expect_variant(node: &Replicant, expected: Variant) -> Result<()> {
    if node.variant() == expected {
        Ok(())
    } else {
        Err(ReplicaError::VariantMismatch {
            expected: expected.tag(),
            found: node.variant().tag(),
        })
    }
}

macro_rules! boolean_aggregate {
    ($(#[$doc:meta])* $name:ident, $variant:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            node: Replicant,
        }

        impl $name {
            /// Create an aggregate with no factors
            #[must_use]
            pub fn new(role: Role) -> Self {
                Self {
                    node: Replicant::new($variant, role),
                }
            }

            /// Create an aggregate with initial factors
            ///
            /// # Errors
            /// Any error of [`Replicant::set`]
            pub fn with_factors<K: Into<Key>>(
                role: Role,
                factors: impl IntoIterator<Item = (K, bool)>,
            ) -> Result<Self> {
                let aggregate = Self::new(role);
                for (factor, value) in factors {
                    aggregate.node.write(factor.into(), Entry::from(value), crate::node::Touch::REMOTE)?;
                }
                Ok(aggregate)
            }

            /// Set one contributor
            ///
            /// # Errors
            /// Any error of [`Replicant::set`]
            pub fn set(&self, factor: impl Into<Key>, value: bool) -> Result<()> {
                self.node.set(factor, value)
            }

            /// Remove one contributor
            ///
            /// # Errors
            /// Any error of [`Replicant::set`]
            pub fn remove(&self, factor: impl Into<Key>) -> Result<()> {
                self.node.set(factor, Value::Nil)
            }

            /// Flip one contributor
            ///
            /// # Errors
            /// Any error of [`Replicant::set`]
            pub fn toggle(&self, factor: impl Into<Key>) -> Result<()> {
                self.node.toggle(factor)
            }

            /// Remove every contributor
            ///
            /// # Errors
            /// Any error of [`Replicant::set`]
            pub fn reset(&self) -> Result<()> {
                self.node.reset()
            }

            /// Resolved state
            ///
            /// # Errors
            /// [`ReplicaError::InactiveNode`] if the node was destroyed
            pub fn resolve_state(&self) -> Result<bool> {
                Ok(self.node.resolve_state()?.as_bool().unwrap_or_default())
            }

            /// Signal fired with the new resolved state when it changes
            #[must_use]
            pub fn state_changed(&self) -> Signal<Value> {
                self.node.state_changed()
            }

            /// Underlying node
            #[inline]
            #[must_use]
            pub fn replicant(&self) -> &Replicant {
                &self.node
            }

            /// Unwrap the underlying node
            #[inline]
            #[must_use]
            pub fn into_replicant(self) -> Replicant {
                self.node
            }
        }

        impl TryFrom<Replicant> for $name {
            type Error = ReplicaError;

            fn try_from(node: Replicant) -> Result<Self> {
                expect_variant(&node, $variant)?;
                Ok(Self { node })
            }
        }

        impl From<$name> for Entry {
            fn from(aggregate: $name) -> Self {
                Entry::Node(aggregate.node)
            }
        }

        impl From<&$name> for Entry {
            fn from(aggregate: &$name) -> Self {
                Entry::Node(aggregate.node.clone())
            }
        }
    };
}

boolean_aggregate!(
    /// True iff at least one factor is true; empty resolves to `false`
    FactoredOr,
    Variant::FactoredOr
);

boolean_aggregate!(
    /// True iff no factor is true; empty resolves to `true`
    FactoredNor,
    Variant::FactoredNor
);

/// Sum of numeric factors; empty resolves to `0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoredSum {
    node: Replicant,
}

impl FactoredSum {
    /// Create an aggregate with no factors
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self {
            node: Replicant::new(Variant::FactoredSum, role),
        }
    }

    /// Create an aggregate with initial factors
    ///
    /// # Errors
    /// Any error of [`Replicant::set`]
    pub fn with_factors<K: Into<Key>>(
        role: Role,
        factors: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<Self> {
        let aggregate = Self::new(role);
        for (factor, value) in factors {
            aggregate
                .node
                .write(factor.into(), Entry::from(value), crate::node::Touch::REMOTE)?;
        }
        Ok(aggregate)
    }

    /// Set one contributor
    ///
    /// # Errors
    /// Any error of [`Replicant::set`]
    pub fn set(&self, factor: impl Into<Key>, value: f64) -> Result<()> {
        self.node.set(factor, value)
    }

    /// Remove one contributor
    ///
    /// # Errors
    /// Any error of [`Replicant::set`]
    pub fn remove(&self, factor: impl Into<Key>) -> Result<()> {
        self.node.set(factor, Value::Nil)
    }

    /// Remove every contributor
    ///
    /// # Errors
    /// Any error of [`Replicant::set`]
    pub fn reset(&self) -> Result<()> {
        self.node.reset()
    }

    /// Resolved sum
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn resolve_state(&self) -> Result<f64> {
        Ok(self.node.resolve_state()?.as_f64().unwrap_or_default())
    }

    /// Signal fired with the new sum when it changes
    #[must_use]
    pub fn state_changed(&self) -> Signal<Value> {
        self.node.state_changed()
    }

    /// Underlying node
    #[inline]
    #[must_use]
    pub fn replicant(&self) -> &Replicant {
        &self.node
    }

    /// Unwrap the underlying node
    #[inline]
    #[must_use]
    pub fn into_replicant(self) -> Replicant {
        self.node
    }
}

impl TryFrom<Replicant> for FactoredSum {
    type Error = ReplicaError;

    fn try_from(node: Replicant) -> Result<Self> {
        expect_variant(&node, Variant::FactoredSum)?;
        Ok(Self { node })
    }
}

impl From<FactoredSum> for Entry {
    fn from(aggregate: FactoredSum) -> Self {
        Entry::Node(aggregate.node)
    }
}

impl From<&FactoredSum> for Entry {
    fn from(aggregate: &FactoredSum) -> Self {
        Entry::Node(aggregate.node.clone())
    }
}
