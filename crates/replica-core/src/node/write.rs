//! Mutation and notification
//!
//! Every change to a slot, authoritative or predicted, goes through
//! [`Replicant::commit`]:
//!
//! 1. `WillUpdate` for the key (first touch in a batch only), then the
//!    node-wide `WillUpdate` and the same pair on each ancestor
//! 2. the mutation itself
//! 3. `OnUpdate` for the key, node-wide and on ancestors, then replication
//!    and factored re-resolution; inside `collate` this step is deferred
//!    until the outermost callback returns

use super::{Batch, Entry, NodeState, Replicant, Result, Touch};
use crate::error::ReplicaError;
use indexmap::IndexMap;
use replica_value::{Key, Value};

impl Replicant {
    /// Authoritative write of `entry` at `key`
    ///
    /// Inside a [`local`](Self::local) scope the write becomes a
    /// [`predict`](Self::predict). Writing `Nil` removes the slot; replacing
    /// or removing a nested node destroys it. Attaching a node requires a
    /// detached, unregistered root.
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::PermissionDenied`] if the node's config does not let
    ///   this tree's role write
    /// - [`ReplicaError::InvalidKey`] / [`ReplicaError::InvalidFactor`] if
    ///   the key or value does not fit the variant, or an array index lies
    ///   past the end
    /// - [`ReplicaError::InvalidChild`] if a node cannot be attached
    pub fn set(&self, key: impl Into<Key>, entry: impl Into<Entry>) -> Result<()> {
        let key = key.into();
        let entry = entry.into();
        self.ensure_active()?;

        if self.in_local_scope() {
            return match entry {
                Entry::Value(value) => self.predict(key, value),
                Entry::Node(_) => Err(ReplicaError::Unsupported {
                    operation: "predicting a nested node",
                    variant: self.variant(),
                }),
            };
        }

        self.check_write_permission(&key)?;
        self.write(key, entry, Touch::AUTHORITATIVE)
    }

    /// Speculative write into the prediction overlay
    ///
    /// Always permitted. Reads return `value` until an authoritative write
    /// or merge for the same key arrives; a newer prediction replaces a
    /// pending one.
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::InvalidKey`] / [`ReplicaError::InvalidFactor`] if
    ///   the key or value does not fit the variant
    pub fn predict(&self, key: impl Into<Key>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        let entry = Entry::Value(value.clone());
        self.validate(&key, &entry)?;
        self.check_extent(&key, &entry, None)?;

        let authoritative = {
            let state = self.lock_active()?;
            state.slots.get(&key).cloned().unwrap_or_default()
        }
        .to_value();

        tracing::debug!(path = %self.key_path(), %key, %value, "predict");
        self.commit(&key, Touch::LOCAL, None, |state| {
            if state.overlay.predict(key.clone(), value, authoritative) {
                tracing::trace!(%key, "pending prediction overridden");
            }
            None
        })
    }

    /// Run `callback` with notifications deferred
    ///
    /// `WillUpdate` still fires at the first touch of each key. After the
    /// outermost callback returns, every touched key fires `OnUpdate` once,
    /// in first-touched order, followed by one node-wide `OnUpdate`.
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn collate<R>(&self, callback: impl FnOnce() -> R) -> Result<R> {
        self.lock_active()?
            .batch
            .get_or_insert_with(Batch::default)
            .depth += 1;

        let result = callback();

        let touched = {
            let mut state = self.inner.state.lock();
            match state.batch.as_mut() {
                Some(batch) if batch.depth > 1 => {
                    batch.depth -= 1;
                    None
                }
                Some(_) => state.batch.take().map(|batch| batch.touched),
                None => None,
            }
        };
        if let Some(touched) = touched {
            self.flush(touched);
        }
        Ok(result)
    }

    /// Run `callback` with this subtree's writes treated as predictions
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn local<R>(&self, callback: impl FnOnce() -> R) -> Result<R> {
        self.lock_active()?.local_depth += 1;
        let result = callback();
        let mut state = self.inner.state.lock();
        state.local_depth = state.local_depth.saturating_sub(1);
        Ok(result)
    }

    /// Drop the pending prediction for `key`; returns whether one existed
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn clear_prediction(&self, key: impl Into<Key>) -> Result<bool> {
        let key = key.into();
        let pending = self.lock_active()?.overlay.value(&key).is_some();
        if pending {
            self.commit(&key, Touch::LOCAL, None, |state| {
                state.overlay.reconcile(&key);
                None
            })?;
        }
        Ok(pending)
    }

    /// Drop every pending prediction
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn clear_predictions(&self) -> Result<()> {
        let keys: Vec<Key> = self.lock_active()?.overlay.keys().cloned().collect();
        self.collate(|| {
            keys.into_iter()
                .try_for_each(|key| self.clear_prediction(key).map(drop))
        })?
    }

    pub(crate) fn check_write_permission(&self, key: &Key) -> Result<()> {
        let role = self.role();
        if self.config_chain().effective().permits_write(role) {
            Ok(())
        } else {
            Err(ReplicaError::PermissionDenied {
                role,
                path: self.key_path().child(key),
            })
        }
    }

    /// Key kind and factor kind check
    pub(crate) fn validate(&self, key: &Key, entry: &Entry) -> Result<()> {
        let variant = self.variant();
        if !variant.accepts_key(key) {
            return Err(ReplicaError::InvalidKey {
                key: key.clone(),
                variant,
            });
        }
        if variant.is_factored() && !entry.as_value().is_some_and(|v| variant.accepts_factor(v)) {
            return Err(ReplicaError::InvalidFactor {
                factor: key.clone(),
                variant,
                found: entry.kind(),
            });
        }
        Ok(())
    }

    /// Array writes may append but not skip past the end
    ///
    /// A whole-node merge carries its holes as separate entries, so `span`
    /// (the incoming entry count) widens the bound while it is applied.
    pub(crate) fn check_extent(&self, key: &Key, entry: &Entry, span: Option<usize>) -> Result<()> {
        let Key::Index(index) = key else {
            return Ok(());
        };
        if entry.is_nil() {
            return Ok(());
        }
        let extent = {
            let state = self.lock_active()?;
            let predicted = state
                .overlay
                .keys()
                .filter_map(Key::as_index)
                .max()
                .map_or(0, |last| last.saturating_add(1));
            state.slots.len().max(predicted)
        };
        if *index > extent.max(span.unwrap_or(0)) {
            return Err(ReplicaError::InvalidKey {
                key: key.clone(),
                variant: self.variant(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_adoptable(&self, child: &Replicant) -> Result<()> {
        let reason = if !child.is_active() {
            "node is destroyed"
        } else if child.parent().is_some() {
            "node already has a parent"
        } else if child.is_bound() {
            "node is registered"
        } else if self.root().ptr_eq(child) {
            "node would contain itself"
        } else {
            return Ok(());
        };
        Err(ReplicaError::InvalidChild(reason.to_string()))
    }

    /// Write without permission check; clears any prediction on `key`
    pub(crate) fn write(&self, key: Key, entry: Entry, touch: Touch) -> Result<()> {
        self.write_within(key, entry, touch, None)
    }

    /// [`write`](Self::write) with the array bound widened to `span`
    pub(crate) fn write_within(&self, key: Key, entry: Entry, touch: Touch, span: Option<usize>) -> Result<()> {
        self.validate(&key, &entry)?;
        self.check_extent(&key, &entry, span)?;
        let adopted = entry.as_node().cloned();
        if let Some(child) = &adopted {
            self.check_adoptable(child)?;
        }

        tracing::debug!(path = %self.key_path(), %key, kind = entry.kind(), "set");
        self.commit(&key, touch, adopted.as_ref(), |state| {
            if state.overlay.reconcile(&key) {
                tracing::trace!(%key, "prediction reconciled");
            }
            state.slots.put(&key, entry)
        })
    }

    /// Apply one slot change with the notification protocol
    ///
    /// `apply` runs under the node lock and returns the displaced entry.
    /// A displaced node other than `adopted` is destroyed.
    pub(crate) fn commit(
        &self,
        key: &Key,
        touch: Touch,
        adopted: Option<&Replicant>,
        apply: impl FnOnce(&mut NodeState) -> Option<Entry>,
    ) -> Result<()> {
        self.begin_touch(key, touch);

        let displaced = apply(&mut *self.lock_active()?);

        if let Some(child) = adopted {
            child.attach(self, key);
        }
        if let Some(Entry::Node(old)) = displaced {
            if !adopted.is_some_and(|child| child.ptr_eq(&old)) {
                old.destroy();
            }
        }

        self.end_touch(key, touch);
        Ok(())
    }

    /// Fire the `WillUpdate` side of a change to `key`
    pub(crate) fn begin_touch(&self, key: &Key, touch: Touch) {
        let (first_for_key, first_for_batch, signal) = {
            let mut state = self.inner.state.lock();
            if !state.active {
                return;
            }
            let signal = state.key_signals.get(key).map(|s| s.will.clone());
            match state.batch.as_mut() {
                Some(batch) => {
                    let first_for_batch = batch.touched.is_empty();
                    let first_for_key = match batch.touched.get_mut(key) {
                        Some(pending) => {
                            pending.absorb(touch);
                            false
                        }
                        None => {
                            batch.touched.insert(key.clone(), touch);
                            true
                        }
                    };
                    (first_for_key, first_for_batch, signal)
                }
                None => (true, true, signal),
            }
        };

        if first_for_key {
            if let Some(signal) = signal {
                signal.fire(touch.is_local);
            }
        }
        if first_for_batch {
            self.inner.will_update.fire(touch.is_local);
            if let Some((parent, key)) = self.parent_link() {
                parent.begin_touch(&key, touch.bubbled());
            }
        }
    }

    /// Fire the `OnUpdate` side of a change to `key`, unless batching
    pub(crate) fn end_touch(&self, key: &Key, touch: Touch) {
        let signal = {
            let mut state = self.inner.state.lock();
            if !state.active {
                return;
            }
            if let Some(batch) = state.batch.as_mut() {
                batch
                    .touched
                    .entry(key.clone())
                    .and_modify(|pending| pending.absorb(touch))
                    .or_insert(touch);
                return;
            }
            state.key_signals.get(key).map(|s| s.on.clone())
        };

        if let Some(signal) = signal {
            signal.fire(touch.is_local);
        }
        self.inner.on_update.fire(touch.is_local);
        if touch.replicate {
            self.replicate(key);
        }
        if let Some((parent, key)) = self.parent_link() {
            parent.end_touch(&key, touch.bubbled());
        }
        self.settle_state();
    }

    /// Deliver the deferred notifications of a closed batch
    fn flush(&self, touched: IndexMap<Key, Touch>) {
        if touched.is_empty() {
            return;
        }
        let signals: Vec<_> = {
            let state = self.inner.state.lock();
            touched
                .keys()
                .map(|key| state.key_signals.get(key).map(|s| s.on.clone()))
                .collect()
        };
        let all_local = touched.values().all(|touch| touch.is_local);

        for (signal, touch) in signals.into_iter().zip(touched.values()) {
            if let Some(signal) = signal {
                signal.fire(touch.is_local);
            }
        }
        self.inner.on_update.fire(all_local);

        for (key, touch) in &touched {
            if touch.replicate {
                self.replicate(key);
            }
        }
        if let Some((parent, key)) = self.parent_link() {
            parent.end_touch(
                &key,
                Touch {
                    is_local: all_local,
                    replicate: false,
                },
            );
        }
        self.settle_state();
    }

    /// Hand the change at `key` to the registry the tree is bound to
    fn replicate(&self, key: &Key) {
        if let Some((registry_key, registry)) = self.binding() {
            registry.replicate(&registry_key, self, key);
        }
    }

    /// Fire `StateChanged` if the resolved value moved
    fn settle_state(&self) {
        let variant = self.variant();
        if !variant.is_factored() {
            return;
        }
        let changed = {
            let mut state = self.inner.state.lock();
            if !state.active {
                return;
            }
            let entries = state.visible_entries();
            let resolved = variant.resolve(entries.values().filter_map(Entry::as_value));
            if resolved == state.last_resolved {
                None
            } else {
                state.last_resolved.clone_from(&resolved);
                resolved
            }
        };
        if let Some(resolved) = changed {
            tracing::debug!(path = %self.key_path(), %resolved, "resolved state changed");
            self.inner.state_changed.fire(resolved);
        }
    }
}

impl Touch {
    /// Touch reported to an ancestor: replication is the child's job
    fn bubbled(self) -> Self {
        Self {
            is_local: self.is_local,
            replicate: false,
        }
    }
}
