//! State tree nodes
//!
//! A [`Replicant`] is a shared handle to one node of a replicated tree. The
//! node owns its children (plain values or nested nodes), its prediction
//! overlay and its subscription signals.
//!
//! # Locking
//! Each node guards its state with its own mutex. A lock is never held while
//! a signal fires, while another node is called, or while the registry is
//! called, so subscribers may freely re-enter the tree.

mod aggregate;
mod codec;
mod entry;
mod inspect;
mod sequence;
mod write;

pub use entry::Entry;

use crate::error::ReplicaError;
use crate::permission::{ConfigChain, ObserverId, ReplicaConfig, Role};
use crate::prediction::{PredictionOverlay, PredictionState};
use crate::registry::{RegistryKey, RegistryShared};
use crate::variant::Variant;
use entry::Slots;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use replica_signal::Signal;
use replica_value::{Key, KeyPath, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

type Result<T> = std::result::Result<T, ReplicaError>;

/// How a touched key is reported once its batch closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Touch {
    pub(crate) is_local: bool,
    pub(crate) replicate: bool,
}

impl Touch {
    /// Authoritative write made on this side
    pub(crate) const AUTHORITATIVE: Self = Self {
        is_local: false,
        replicate: true,
    };
    /// Authoritative change received from the other side
    pub(crate) const REMOTE: Self = Self {
        is_local: false,
        replicate: false,
    };
    /// Prediction
    pub(crate) const LOCAL: Self = Self {
        is_local: true,
        replicate: false,
    };

    fn absorb(&mut self, other: Self) {
        self.is_local &= other.is_local;
        self.replicate |= other.replicate;
    }
}

#[derive(Clone, Default)]
struct KeySignals {
    will: Signal<bool>,
    on: Signal<bool>,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    touched: IndexMap<Key, Touch>,
}

struct Binding {
    key: RegistryKey,
    registry: Weak<RegistryShared>,
}

struct NodeState {
    active: bool,
    key_path: KeyPath,
    parent: Option<Weak<NodeInner>>,
    role: Role,
    config: Option<ReplicaConfig>,
    slots: Slots,
    overlay: PredictionOverlay,
    key_signals: HashMap<Key, KeySignals>,
    batch: Option<Batch>,
    local_depth: usize,
    binding: Option<Binding>,
    last_resolved: Option<Value>,
}

impl NodeState {
    /// Entry at `key` as reads see it: prediction first, then the slot
    fn visible(&self, key: &Key) -> Entry {
        match self.overlay.value(key) {
            Some(predicted) => Entry::Value(predicted.clone()),
            None => self.slots.get(key).cloned().unwrap_or_default(),
        }
    }

    /// Non-nil entries as reads see them, in key order
    fn visible_entries(&self) -> BTreeMap<Key, Entry> {
        let mut merged: BTreeMap<Key, Entry> = self
            .slots
            .iter()
            .map(|(key, entry)| (key, entry.clone()))
            .collect();
        for key in self.overlay.keys() {
            merged.insert(key.clone(), self.visible(key));
        }
        merged.retain(|_, entry| !entry.is_nil());
        merged
    }
}

struct NodeInner {
    variant: Variant,
    state: Mutex<NodeState>,
    will_update: Signal<bool>,
    on_update: Signal<bool>,
    state_changed: Signal<Value>,
}

/// Handle to one node of a replicated tree
///
/// Cloning the handle shares the node. Handles compare by identity.
///
/// # Example
/// ```rust
/// use replica_core::{Replicant, Role, Variant};
///
/// let player = Replicant::new(Variant::Map, Role::Authority);
/// player.set("health", 100)?;
/// assert_eq!(player.get_value("health")?, 100.into());
/// # Ok::<(), replica_core::ReplicaError>(())
/// ```
#[derive(Clone)]
pub struct Replicant {
    inner: Arc<NodeInner>,
}

impl Replicant {
    /// Create a detached root node
    #[must_use]
    pub fn new(variant: Variant, role: Role) -> Self {
        let last_resolved = variant.resolve(std::iter::empty());
        Self {
            inner: Arc::new(NodeInner {
                variant,
                state: Mutex::new(NodeState {
                    active: true,
                    key_path: KeyPath::root(),
                    parent: None,
                    role,
                    config: None,
                    slots: Slots::new(variant.is_sequence()),
                    overlay: PredictionOverlay::default(),
                    key_signals: HashMap::new(),
                    batch: None,
                    local_depth: 0,
                    binding: None,
                    last_resolved,
                }),
                will_update: Signal::new(),
                on_update: Signal::new(),
                state_changed: Signal::new(),
            }),
        }
    }

    /// Create a detached root node with its own config
    #[must_use]
    pub fn with_config(variant: Variant, role: Role, config: ReplicaConfig) -> Self {
        let node = Self::new(variant, role);
        node.inner.state.lock().config = Some(config);
        node
    }

    /// Shorthand for an authority-side map
    #[inline]
    #[must_use]
    pub fn map(role: Role) -> Self {
        Self::new(Variant::Map, role)
    }

    /// Shorthand for an authority-side array
    #[inline]
    #[must_use]
    pub fn array(role: Role) -> Self {
        Self::new(Variant::Array, role)
    }

    /// Variant of this node
    #[inline]
    #[must_use]
    pub fn variant(&self) -> Variant {
        self.inner.variant
    }

    /// Role of the tree this node belongs to
    #[must_use]
    pub fn role(&self) -> Role {
        self.inner.state.lock().role
    }

    /// Route from the tree root to this node
    #[must_use]
    pub fn key_path(&self) -> KeyPath {
        self.inner.state.lock().key_path.clone()
    }

    /// Whether the node has not been destroyed
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    /// Whether the node has no parent
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Parent node, if attached
    #[must_use]
    pub fn parent(&self) -> Option<Replicant> {
        let state = self.inner.state.lock();
        state
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// Root of the tree this node belongs to
    #[must_use]
    pub fn root(&self) -> Replicant {
        let mut node = self.clone();
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// Whether both handles refer to the same node
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registry key the tree's root is registered under
    #[must_use]
    pub fn registry_key(&self) -> Option<RegistryKey> {
        self.binding().map(|(key, _)| key)
    }

    /// Current entry at `key` (a prediction if one is pending)
    ///
    /// Absent slots read as `Nil`.
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn get(&self, key: impl Into<Key>) -> Result<Entry> {
        let key = key.into();
        let state = self.lock_active()?;
        Ok(state.visible(&key))
    }

    /// Current value at `key`; nested nodes are flattened into a value
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn get_value(&self, key: impl Into<Key>) -> Result<Value> {
        Ok(self.get(key)?.to_value())
    }

    /// Nested node at `key`
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn child(&self, key: impl Into<Key>) -> Result<Option<Replicant>> {
        let key = key.into();
        let state = self.lock_active()?;
        Ok(state.slots.get(&key).and_then(Entry::as_node).cloned())
    }

    /// Node at `path` relative to this one
    ///
    /// # Errors
    /// [`ReplicaError::InvalidChild`] if some key on the path does not hold a
    /// nested node
    pub fn descendant(&self, path: &KeyPath) -> Result<Replicant> {
        let mut node = self.clone();
        for key in path {
            node = node
                .child(key)?
                .ok_or_else(|| ReplicaError::InvalidChild(format!("no node at '{path}'")))?;
        }
        Ok(node)
    }

    /// Non-nil entries, in key order
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn pairs(&self) -> Result<Vec<(Key, Entry)>> {
        let state = self.lock_active()?;
        Ok(state.visible_entries().into_iter().collect())
    }

    /// Snapshot of the visible state as a plain value
    ///
    /// Arrays become [`Value::Array`], every other variant [`Value::Map`].
    #[must_use]
    pub fn to_value(&self) -> Value {
        let entries = self.inner.state.lock().visible_entries();
        if self.variant().is_sequence() {
            let len = entries
                .keys()
                .filter_map(Key::as_index)
                .max()
                .map_or(0, |last| last + 1);
            let mut items = vec![Value::Nil; len];
            for (key, entry) in entries {
                if let Some(i) = key.as_index() {
                    items[i] = entry.to_value();
                }
            }
            Value::Array(items)
        } else {
            Value::Map(
                entries
                    .into_iter()
                    .filter_map(|(key, entry)| {
                        key.as_name().map(|name| (name.to_string(), entry.to_value()))
                    })
                    .collect(),
            )
        }
    }

    /// Prediction state of `key`
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn prediction_state(&self, key: impl Into<Key>) -> Result<PredictionState> {
        let key = key.into();
        Ok(self.lock_active()?.overlay.state(&key))
    }

    /// Signal fired before `key` changes, with `is_local`
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn get_value_will_update_signal(&self, key: impl Into<Key>) -> Result<Signal<bool>> {
        let key = key.into();
        let mut state = self.lock_active()?;
        Ok(state.key_signals.entry(key).or_default().will.clone())
    }

    /// Signal fired after `key` changed, with `is_local`
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn get_value_on_update_signal(&self, key: impl Into<Key>) -> Result<Signal<bool>> {
        let key = key.into();
        let mut state = self.lock_active()?;
        Ok(state.key_signals.entry(key).or_default().on.clone())
    }

    /// Signal fired before the node (or a descendant) changes
    #[must_use]
    pub fn will_update(&self) -> Signal<bool> {
        self.inner.will_update.clone()
    }

    /// Signal fired after the node (or a descendant) changed
    #[must_use]
    pub fn on_update(&self) -> Signal<bool> {
        self.inner.on_update.clone()
    }

    /// Signal fired with the new resolved value of a factored node
    #[must_use]
    pub fn state_changed(&self) -> Signal<Value> {
        self.inner.state_changed.clone()
    }

    /// Effective config: own, else nearest ancestor's, else the default
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn get_config(&self) -> Result<ReplicaConfig> {
        self.ensure_active()?;
        Ok(self.config_chain().effective())
    }

    /// Config set on this node itself, if any
    #[must_use]
    pub fn own_config(&self) -> Option<ReplicaConfig> {
        self.inner.state.lock().config.clone()
    }

    /// Replace this node's own config
    ///
    /// On a replicating authority tree the node's state is re-sent, so
    /// observers that gained visibility receive it. Observers that lost it
    /// receive the redacted form of a nested node, or an unregister notice
    /// for a root.
    ///
    /// # Errors
    /// [`ReplicaError::InactiveNode`] if the node was destroyed
    pub fn set_config(&self, config: ReplicaConfig) -> Result<()> {
        let binding = self.binding();
        let saw_root = match (&binding, self.is_root()) {
            (Some((_, registry)), true) => registry.observers_seeing(self),
            _ => Vec::new(),
        };
        self.lock_active()?.config = Some(config);
        tracing::debug!(path = %self.key_path(), "config replaced");

        if let Some((registry_key, registry)) = binding {
            match self.parent_link() {
                Some((parent, key)) => registry.fan_out(&registry_key, &parent, Some(&key)),
                None => {
                    for observer in saw_root {
                        if !self.visible_to_client(observer) {
                            registry.withdraw(&registry_key, observer);
                        }
                    }
                    registry.fan_out(&registry_key, self, None);
                }
            }
        }
        Ok(())
    }

    /// Whether `observer` may see this node
    ///
    /// Requires every node from the root down to admit the observer.
    #[must_use]
    pub fn visible_to_client(&self, observer: ObserverId) -> bool {
        self.is_active() && self.config_chain().admits(observer)
    }

    /// Whether every observer may see this node
    #[must_use]
    pub fn visible_to_all_clients(&self) -> bool {
        self.is_active() && self.config_chain().admits_everyone()
    }

    /// Whether writes to this node are sent to observers
    ///
    /// True for active authority-side nodes whose root is registered.
    #[must_use]
    pub fn can_replicate(&self) -> bool {
        self.is_active() && self.role() == Role::Authority && self.binding().is_some()
    }

    /// Destroy the node and its subtree
    ///
    /// Idempotent. Cancels pending signal waits, disconnects subscribers,
    /// removes the registry binding and detaches the node from its parent.
    pub fn destroy(&self) {
        let (path, children, key_signals, binding, parent) = {
            let mut state = self.inner.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.batch = None;
            state.overlay.clear();
            let children: Vec<Replicant> = state
                .slots
                .drain()
                .into_iter()
                .filter_map(|entry| match entry {
                    Entry::Node(node) => Some(node),
                    Entry::Value(_) => None,
                })
                .collect();
            (
                state.key_path.clone(),
                children,
                std::mem::take(&mut state.key_signals),
                state.binding.take(),
                state.parent.as_ref().and_then(Weak::upgrade),
            )
        };
        tracing::debug!(%path, variant = %self.variant(), "destroying node");

        for child in children {
            child.destroy();
        }
        for signals in key_signals.into_values() {
            signals.will.destroy();
            signals.on.destroy();
        }
        self.inner.will_update.destroy();
        self.inner.on_update.destroy();
        self.inner.state_changed.destroy();

        if let Some(binding) = binding {
            if let Some(registry) = binding.registry.upgrade() {
                registry.release(&binding.key, self);
            }
        }
        if let Some(parent) = parent {
            Self { inner: parent }.detach_destroyed(self);
        }
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        self.lock_active().map(drop)
    }

    fn lock_active(&self) -> Result<MutexGuard<'_, NodeState>> {
        let state = self.inner.state.lock();
        if state.active {
            Ok(state)
        } else {
            Err(ReplicaError::inactive(&state.key_path))
        }
    }

    /// Parent and the key this node occupies in it
    fn parent_link(&self) -> Option<(Replicant, Key)> {
        let state = self.inner.state.lock();
        let parent = state.parent.as_ref().and_then(Weak::upgrade)?;
        let key = state.key_path.last()?.clone();
        Some((Self { inner: parent }, key))
    }

    /// Own configs from the root down to this node
    pub(crate) fn config_chain(&self) -> ConfigChain {
        let mut levels = Vec::new();
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            levels.push(node.own_config());
            cursor = node.parent();
        }
        levels.reverse();
        ConfigChain::new(levels)
    }

    /// Whether this node or an ancestor is inside a `local` scope
    fn in_local_scope(&self) -> bool {
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            if node.inner.state.lock().local_depth > 0 {
                return true;
            }
            cursor = node.parent();
        }
        false
    }

    /// Attach as the child of `parent` at `key`
    fn attach(&self, parent: &Replicant, key: &Key) {
        let (path, role) = {
            let state = parent.inner.state.lock();
            (state.key_path.child(key), state.role)
        };
        self.inner.state.lock().parent = Some(Arc::downgrade(&parent.inner));
        self.relocate(path, role);
    }

    /// Move the subtree to `path`, adopting `role`
    fn relocate(&self, path: KeyPath, role: Role) {
        let children = {
            let mut state = self.inner.state.lock();
            state.key_path = path.clone();
            state.role = role;
            state.slots.nodes()
        };
        for (key, child) in children {
            child.relocate(path.child(key), role);
        }
    }

    /// Remove a destroyed child from its slot
    fn detach_destroyed(&self, child: &Replicant) {
        let key = {
            let state = self.inner.state.lock();
            if !state.active {
                return;
            }
            let found = state
                .slots
                .iter()
                .find(|(_, entry)| entry.as_node().is_some_and(|node| node.ptr_eq(child)))
                .map(|(key, _)| key);
            found
        };
        let Some(key) = key else {
            return;
        };
        // Only the authority replicates the removal; a mirror drops it locally
        let touch = match self.role() {
            Role::Authority => Touch::AUTHORITATIVE,
            Role::Observer => Touch::REMOTE,
        };
        if let Err(err) = self.commit(&key, touch, None, |state| state.slots.put(&key, Entry::default())) {
            tracing::warn!(path = %self.key_path(), %key, error = %err, "cannot detach destroyed child");
        }
    }

    pub(crate) fn bind(&self, key: RegistryKey, registry: Weak<RegistryShared>) {
        self.inner.state.lock().binding = Some(Binding { key, registry });
    }

    pub(crate) fn unbind(&self, key: &RegistryKey) {
        let mut state = self.inner.state.lock();
        if state.binding.as_ref().is_some_and(|b| &b.key == key) {
            state.binding = None;
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.inner.state.lock().binding.is_some()
    }

    /// Registry binding of the tree's root
    fn binding(&self) -> Option<(RegistryKey, Arc<RegistryShared>)> {
        let root = self.root();
        let state = root.inner.state.lock();
        let binding = state.binding.as_ref()?;
        Some((binding.key.clone(), binding.registry.upgrade()?))
    }
}

impl PartialEq for Replicant {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Replicant {}

impl fmt::Debug for Replicant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Replicant");
        out.field("variant", &self.inner.variant);
        match self.inner.state.try_lock() {
            Some(state) => out
                .field("path", &state.key_path.to_string())
                .field("role", &state.role)
                .field("active", &state.active)
                .field("slots", &state.slots.len()),
            None => out.field("state", &"<locked>"),
        };
        out.finish()
    }
}
