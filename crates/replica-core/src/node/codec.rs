//! Serialize and merge
//!
//! Whole nodes encode as `(key, tag, [entries...])`; one child encodes as the
//! entry diff for its key. Diffs produced for an observer are redacted per
//! node: a node the observer cannot see keeps its tag but loses its payload.

use super::{Entry, Replicant, Result, Touch};
use crate::error::ReplicaError;
use crate::permission::{ObserverId, ReplicaConfig, Role};
use crate::variant::Variant;
use replica_value::{CodecError, Key, SerializedDiff, Value};
use std::collections::HashSet;

impl Replicant {
    /// Diff for the whole node (`at_key == None`) or one child
    ///
    /// With `for_observer`, every node the observer cannot see is reduced to
    /// its tag with an empty payload and every hidden plain value to `Nil`.
    /// Pending predictions are never serialized.
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn serialize(
        &self,
        at_key: Option<&Key>,
        for_observer: Option<ObserverId>,
    ) -> Result<SerializedDiff> {
        self.ensure_active()?;
        let visible = for_observer.map_or(true, |observer| self.visible_to_client(observer));

        let Some(key) = at_key else {
            return if visible {
                self.encode_node(None, for_observer)
            } else {
                Ok(SerializedDiff::empty(None, self.variant().tag()))
            };
        };

        let entry = self.lock_active()?.slots.get(key).cloned().unwrap_or_default();
        if visible {
            encode_entry(key.clone(), &entry, for_observer)
        } else {
            Ok(match entry {
                Entry::Node(node) => SerializedDiff::empty(Some(key.clone()), node.variant().tag()),
                Entry::Value(_) => SerializedDiff::value(Some(key.clone()), Value::Nil),
            })
        }
    }

    /// Apply a diff received from the other side
    ///
    /// A keyed diff replaces one child; an unkeyed diff replaces the whole
    /// node as one collated change. Every prediction on a replaced key is
    /// reconciled. Signals fire with `is_local == false`.
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::VariantMismatch`] if an unkeyed diff carries another
    ///   variant's tag
    /// - [`ReplicaError::InvalidKey`] / [`ReplicaError::InvalidFactor`] if a
    ///   nested entry does not fit its node
    pub fn merge_serialized(&self, diff: &SerializedDiff) -> Result<()> {
        self.ensure_active()?;
        match diff.key() {
            None => self.merge_node(diff, Touch::REMOTE),
            Some(key) => self.merge_entry(key.clone(), diff, Touch::REMOTE, None),
        }
    }

    /// Build a detached tree from a whole-node diff
    ///
    /// # Errors
    /// - [`ReplicaError::Codec`] if the diff carries a plain value
    /// - any error of [`merge_serialized`](Self::merge_serialized)
    pub fn from_serialized(
        diff: &SerializedDiff,
        role: Role,
        config: Option<ReplicaConfig>,
    ) -> Result<Replicant> {
        let variant = Variant::from_tag(diff.tag()).ok_or_else(|| {
            CodecError::Malformed(format!("a {} diff does not describe a node", diff.tag()))
        })?;
        let node = match config {
            Some(config) => Self::with_config(variant, role, config),
            None => Self::new(variant, role),
        };
        node.merge_node(diff, Touch::REMOTE)?;
        Ok(node)
    }

    /// Checked write coming from `observer`, applied authoritatively
    ///
    /// A nested node at the target key is rewritten as a whole, so every
    /// node below it must also accept the observer.
    pub(crate) fn apply_observer_write(
        &self,
        observer: ObserverId,
        diff: &SerializedDiff,
    ) -> Result<()> {
        let Some(key) = diff.key() else {
            return Err(ReplicaError::Unsupported {
                operation: "whole-node writes from observers",
                variant: self.variant(),
            });
        };

        let chain = self.config_chain();
        let target_writable = match self.child(key)? {
            Some(child) => child.writable_by(observer),
            None => true,
        };
        if !chain.effective().client_can_set || !chain.admits(observer) || !target_writable {
            return Err(ReplicaError::PermissionDenied {
                role: Role::Observer,
                path: self.key_path().child(key),
            });
        }

        self.merge_entry(key.clone(), diff, Touch::AUTHORITATIVE, None)
    }

    /// Whether `observer` may see and rewrite this node and its subtree
    fn writable_by(&self, observer: ObserverId) -> bool {
        if !self.is_active() {
            return false;
        }
        let chain = self.config_chain();
        if !chain.effective().client_can_set || !chain.admits(observer) {
            return false;
        }
        let children = self.inner.state.lock().slots.nodes();
        children.iter().all(|(_, child)| child.writable_by(observer))
    }

    fn encode_node(&self, key: Option<Key>, for_observer: Option<ObserverId>) -> Result<SerializedDiff> {
        let entries: Vec<(Key, Entry)> = self
            .lock_active()?
            .slots
            .iter()
            .map(|(key, entry)| (key, entry.clone()))
            .collect();
        let diffs = entries
            .into_iter()
            .map(|(key, entry)| encode_entry(key, &entry, for_observer))
            .collect::<Result<Vec<_>>>()?;
        Ok(SerializedDiff::composite(key, self.variant().tag(), diffs)?)
    }

    /// Replace the whole node's content with `diff`'s
    fn merge_node(&self, diff: &SerializedDiff, touch: Touch) -> Result<()> {
        let variant = self.variant();
        if diff.tag() != variant.tag() {
            return Err(ReplicaError::VariantMismatch {
                expected: variant.tag(),
                found: diff.tag(),
            });
        }
        tracing::debug!(path = %self.key_path(), entries = diff.entries().len(), "merging node");

        self.collate(|| {
            let incoming: HashSet<&Key> = diff.entries().iter().filter_map(SerializedDiff::key).collect();
            let (stale, predicted) = {
                let state = self.lock_active()?;
                let stale: Vec<Key> = state
                    .slots
                    .keys()
                    .into_iter()
                    .filter(|key| !incoming.contains(key))
                    .collect();
                let predicted: Vec<Key> = state
                    .overlay
                    .keys()
                    .filter(|key| !incoming.contains(key))
                    .cloned()
                    .collect();
                (stale, predicted)
            };

            // Highest index first so sequences shrink from the end
            for key in stale.into_iter().rev() {
                self.write(key, Entry::default(), touch)?;
            }
            let span = Some(diff.entries().len());
            for entry in diff.entries() {
                if let Some(key) = entry.key() {
                    self.merge_entry(key.clone(), entry, touch, span)?;
                }
            }
            for key in predicted {
                self.commit(&key, touch, None, |state| {
                    state.overlay.reconcile(&key);
                    None
                })?;
            }
            Ok(())
        })?
    }

    fn merge_entry(&self, key: Key, diff: &SerializedDiff, touch: Touch, span: Option<usize>) -> Result<()> {
        let Some(variant) = Variant::from_tag(diff.tag()) else {
            let value = diff.as_value().cloned().unwrap_or_default();
            return self.write_within(key, Entry::Value(value), touch, span);
        };

        if let Some(child) = self.child(&key)?.filter(|child| child.variant() == variant) {
            let predicted = self.lock_active()?.overlay.value(&key).is_some();
            if predicted {
                self.commit(&key, touch, None, |state| {
                    state.overlay.reconcile(&key);
                    None
                })?;
            }
            return child.merge_node(diff, touch);
        }

        let child = Self::new(variant, self.role());
        child.merge_node(diff, Touch::REMOTE)?;
        self.write_within(key, Entry::Node(child), touch, span)
    }
}

fn encode_entry(key: Key, entry: &Entry, for_observer: Option<ObserverId>) -> Result<SerializedDiff> {
    match entry {
        Entry::Value(value) => Ok(SerializedDiff::value(Some(key), value.clone())),
        Entry::Node(node) => {
            if for_observer.is_some_and(|observer| !node.visible_to_client(observer)) {
                Ok(SerializedDiff::empty(Some(key), node.variant().tag()))
            } else {
                node.encode_node(Some(key), for_observer)
            }
        }
    }
}
