//! Factored aggregate operations

use super::{Entry, Replicant, Result};
use crate::error::ReplicaError;
use crate::variant::Variant;
use replica_value::{Key, Value};

impl Replicant {
    /// Resolved value of a factored node
    ///
    /// `Bool` for Or/Nor, `Number` for Sum. Computed from the visible
    /// factors, so pending predictions count.
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::Unsupported`] on non-factored variants
    pub fn resolve_state(&self) -> Result<Value> {
        let variant = self.variant();
        let entries = self.lock_active()?.visible_entries();
        variant
            .resolve(entries.values().filter_map(Entry::as_value))
            .ok_or(ReplicaError::Unsupported {
                operation: "resolve_state",
                variant,
            })
    }

    /// Flip a boolean factor; an absent factor counts as `false`
    ///
    /// # Errors
    /// - [`ReplicaError::Unsupported`] unless the node is a FactoredOr or
    ///   FactoredNor
    /// - any error of [`set`](Self::set)
    pub fn toggle(&self, factor: impl Into<Key>) -> Result<()> {
        let variant = self.variant();
        if !matches!(variant, Variant::FactoredOr | Variant::FactoredNor) {
            return Err(ReplicaError::Unsupported {
                operation: "toggle",
                variant,
            });
        }
        let factor = factor.into();
        let current = self.get(factor.clone())?.as_value().and_then(Value::as_bool).unwrap_or(false);
        self.set(factor, !current)
    }

    /// Remove every factor, as one collated change
    ///
    /// # Errors
    /// - [`ReplicaError::Unsupported`] on non-factored variants
    /// - any error of [`set`](Self::set)
    pub fn reset(&self) -> Result<()> {
        let variant = self.variant();
        if !variant.is_factored() {
            return Err(ReplicaError::Unsupported {
                operation: "reset",
                variant,
            });
        }
        let factors: Vec<Key> = self.lock_active()?.visible_entries().into_keys().collect();
        self.collate(|| {
            factors
                .into_iter()
                .try_for_each(|factor| self.set(factor, Value::Nil))
        })?
    }
}
