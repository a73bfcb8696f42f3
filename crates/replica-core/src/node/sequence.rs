//! Array conveniences
//!
//! Thin helpers over [`Replicant::set`]; they carry the same permission,
//! notification and replication behavior. Shifting inserts and removals are
//! one collated change touching every moved index.

use super::{Entry, Replicant, Result, Slots, Touch};
use crate::error::ReplicaError;
use replica_value::{Key, Value};

impl Replicant {
    /// Number of positions, including holes
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::Unsupported`] unless the node is an array
    pub fn size(&self) -> Result<usize> {
        self.require_sequence("size")?;
        let state = self.lock_active()?;
        Ok(state
            .visible_entries()
            .keys()
            .filter_map(Key::as_index)
            .max()
            .map_or(0, |last| last + 1))
    }

    /// First index holding `value`
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::Unsupported`] unless the node is an array
    pub fn index_of(&self, value: impl Into<Value>) -> Result<Option<usize>> {
        self.require_sequence("index_of")?;
        let value = value.into();
        let state = self.lock_active()?;
        Ok(state
            .visible_entries()
            .into_iter()
            .find(|(_, entry)| entry.as_value() == Some(&value))
            .and_then(|(key, _)| key.as_index()))
    }

    /// Append `entry`, returning its index
    ///
    /// # Errors
    /// Any error of [`set`](Self::set)
    pub fn push(&self, entry: impl Into<Entry>) -> Result<usize> {
        let index = self.size()?;
        self.set(index, entry)?;
        Ok(index)
    }

    /// Alias of [`push`](Self::push)
    ///
    /// # Errors
    /// Any error of [`set`](Self::set)
    pub fn insert(&self, entry: impl Into<Entry>) -> Result<usize> {
        self.push(entry)
    }

    /// Remove the last position, returning its value (`Nil` when empty)
    ///
    /// # Errors
    /// Any error of [`set`](Self::set)
    pub fn pop(&self) -> Result<Value> {
        match self.size()?.checked_sub(1) {
            Some(last) => {
                let value = self.get_value(last)?;
                self.set(last, Value::Nil)?;
                Ok(value)
            }
            None => Ok(Value::Nil),
        }
    }

    /// Insert `entry` at `index`, shifting later positions up
    ///
    /// `index == size()` appends.
    ///
    /// # Errors
    /// Any error of [`set`](Self::set); an index past the end is
    /// [`ReplicaError::InvalidKey`]
    pub fn insert_at(&self, index: usize, entry: impl Into<Entry>) -> Result<()> {
        let entry = entry.into();
        let size = self.size()?;
        if index >= size {
            return self.set(index, entry);
        }
        if self.in_local_scope() {
            return self.collate(|| {
                for i in (index..size).rev() {
                    let moved = self.get_value(i)?;
                    self.set(i + 1, moved)?;
                }
                self.set(index, entry)
            })?;
        }
        self.splice(index, 0, Some(entry)).map(drop)
    }

    /// Remove position `index`, shifting later positions down
    ///
    /// Returns the removed value (`Nil` if out of range). A removed nested
    /// node is destroyed.
    ///
    /// # Errors
    /// Any error of [`set`](Self::set)
    pub fn remove(&self, index: usize) -> Result<Value> {
        let size = self.size()?;
        if index >= size {
            return Ok(Value::Nil);
        }
        if self.in_local_scope() {
            let removed = self.get_value(index)?;
            self.collate(|| {
                for i in index..size {
                    let moved = self.get_value(i + 1)?;
                    self.set(i, moved)?;
                }
                Ok::<(), ReplicaError>(())
            })??;
            return Ok(removed);
        }
        Ok(self
            .splice(index, 1, None)?
            .into_iter()
            .next()
            .unwrap_or_default())
    }

    fn require_sequence(&self, operation: &'static str) -> Result<()> {
        if self.variant().is_sequence() {
            Ok(())
        } else {
            Err(ReplicaError::Unsupported {
                operation,
                variant: self.variant(),
            })
        }
    }

    /// Authoritative in-place splice; `index` must be within the sequence
    fn splice(&self, index: usize, remove: usize, insert: Option<Entry>) -> Result<Vec<Value>> {
        let first = Key::Index(index);
        self.check_write_permission(&first)?;
        if let Some(entry) = &insert {
            self.validate(&first, entry)?;
            if let Some(child) = entry.as_node() {
                self.check_adoptable(child)?;
            }
        }
        let adopted = insert.as_ref().and_then(Entry::as_node).cloned();

        self.collate(|| {
            let old_len = self.lock_active()?.slots.len();
            let touched_end = old_len.max(index) + usize::from(insert.is_some());
            for i in index..touched_end {
                self.begin_touch(&Key::Index(i), Touch::AUTHORITATIVE);
            }

            let (removed, moved) = {
                let mut state = self.lock_active()?;
                let Slots::Sequence(items) = &mut state.slots else {
                    return Err(ReplicaError::Unsupported {
                        operation: "splice",
                        variant: self.variant(),
                    });
                };
                if items.len() < index {
                    items.resize_with(index, Entry::default);
                }
                let end = (index + remove).min(items.len());
                let removed: Vec<Entry> = items.splice(index..end, insert).collect();
                while items.last().is_some_and(Entry::is_nil) {
                    items.pop();
                }
                let moved: Vec<(usize, Replicant)> = items
                    .iter()
                    .enumerate()
                    .skip(index)
                    .filter_map(|(i, entry)| entry.as_node().map(|node| (i, node.clone())))
                    .collect();
                for i in index..touched_end {
                    state.overlay.reconcile(&Key::Index(i));
                }
                (removed, moved)
            };

            tracing::debug!(path = %self.key_path(), index, remove, "splice");
            let role = self.role();
            let path = self.key_path();
            for (i, node) in moved {
                if adopted.as_ref().is_some_and(|child| child.ptr_eq(&node)) {
                    node.attach(self, &Key::Index(i));
                } else {
                    node.relocate(path.child(i), role);
                }
            }

            let values: Vec<Value> = removed.iter().map(Entry::to_value).collect();
            for entry in removed {
                if let Entry::Node(node) = entry {
                    node.destroy();
                }
            }
            Ok(values)
        })?
    }
}

#[cfg(test)]
mod tests {
    use crate::{Entry, ReplicaError, Replicant, Role, Variant};
    use replica_value::{Key, SerializedDiff, Value};

    fn letters() -> Replicant {
        let array = Replicant::array(Role::Authority);
        for letter in ["a", "b", "c"] {
            array.push(letter).unwrap();
        }
        array
    }

    #[test]
    fn push_pop_size() {
        let array = letters();
        assert_eq!(array.size().unwrap(), 3);
        assert_eq!(array.pop().unwrap(), Value::from("c"));
        assert_eq!(array.size().unwrap(), 2);
        assert_eq!(array.index_of("b").unwrap(), Some(1));
        assert_eq!(array.index_of("z").unwrap(), None);
    }

    #[test]
    fn insert_at_shifts_up() {
        let array = letters();
        array.insert_at(1, "x").unwrap();
        assert_eq!(
            array.to_value(),
            Value::Array(vec!["a".into(), "x".into(), "b".into(), "c".into()])
        );
    }

    #[test]
    fn remove_shifts_down_and_relocates_nodes() {
        let array = letters();
        let nested = Replicant::map(Role::Authority);
        array.insert_at(1, &nested).unwrap();
        assert_eq!(nested.key_path().to_string(), "1");

        assert_eq!(array.remove(0).unwrap(), Value::from("a"));
        assert_eq!(nested.key_path().to_string(), "0");
        assert_eq!(array.get(0).unwrap(), Entry::Node(nested.clone()));
        assert_eq!(array.size().unwrap(), 3);
    }

    #[test]
    fn removed_node_is_destroyed() {
        let array = Replicant::array(Role::Authority);
        let nested = Replicant::map(Role::Authority);
        array.push(&nested).unwrap();
        array.push("tail").unwrap();

        array.remove(0).unwrap();
        assert!(!nested.is_active());
        assert_eq!(array.get_value(0).unwrap(), Value::from("tail"));
    }

    #[test]
    fn local_insert_is_predicted() {
        let array = letters();
        array.local(|| array.insert_at(0, "z")).unwrap().unwrap();
        assert_eq!(array.get_value(0).unwrap(), Value::from("z"));
        assert!(array.prediction_state(0).unwrap().is_predicted());

        array.clear_predictions().unwrap();
        assert_eq!(array.get_value(0).unwrap(), Value::from("a"));
    }

    #[test]
    fn writes_past_the_end_are_rejected() {
        let array = letters();
        assert!(matches!(array.set(usize::MAX, 1), Err(ReplicaError::InvalidKey { .. })));
        assert!(matches!(array.set(5usize, 1), Err(ReplicaError::InvalidKey { .. })));
        assert!(matches!(array.predict(9usize, 1), Err(ReplicaError::InvalidKey { .. })));
        assert!(matches!(array.insert_at(7, "x"), Err(ReplicaError::InvalidKey { .. })));
        assert_eq!(array.size().unwrap(), 3);

        array.set(3usize, "d").unwrap();
        assert_eq!(array.size().unwrap(), 4);
    }

    #[test]
    fn inbound_index_past_the_end_is_rejected() {
        let mirror = Replicant::array(Role::Observer);
        let far = SerializedDiff::value(Some(Key::Index(50_000_000)), Value::from(1));
        assert!(matches!(mirror.merge_serialized(&far), Err(ReplicaError::InvalidKey { .. })));
        assert_eq!(mirror.size().unwrap(), 0);

        let sparse = SerializedDiff::composite(
            None,
            Variant::Array.tag(),
            vec![SerializedDiff::value(Some(Key::Index(10)), Value::from(1))],
        )
        .unwrap();
        assert!(matches!(mirror.merge_serialized(&sparse), Err(ReplicaError::InvalidKey { .. })));
        assert_eq!(mirror.size().unwrap(), 0);
    }

    #[test]
    fn holes_survive_a_whole_node_merge() {
        let array = letters();
        array.set(1usize, Value::Nil).unwrap();
        let diff = array.serialize(None, None).unwrap();

        let mirror = Replicant::from_serialized(&diff, Role::Observer, None).unwrap();
        assert_eq!(mirror.to_value(), array.to_value());
        assert_eq!(mirror.size().unwrap(), 3);
    }

    #[test]
    fn array_helpers_reject_maps() {
        let map = Replicant::new(Variant::Map, Role::Authority);
        assert!(matches!(map.size(), Err(ReplicaError::Unsupported { .. })));
    }
}
