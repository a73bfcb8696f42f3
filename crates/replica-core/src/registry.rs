//! Registry of replicated trees
//!
//! Maps an opaque [`RegistryKey`] to a live root node and owns the
//! replication fan-out for the trees registered in it.
//!
//! # Lifecycle
//! - `register`: `will_register` fires, the binding becomes visible to
//!   lookups, pending waits resolve, then `registered` fires
//! - `unregister` (or destroying the root): the binding goes away, then
//!   `unregistered` fires
//! - `clear`: unregisters everything and cancels pending waits
//!
//! A registry is an explicit service object: create one per side of the
//! replication link and pass it where trees are registered.

use crate::error::ReplicaError;
use crate::node::Replicant;
use crate::permission::{ObserverId, Role};
use crate::replication::{Envelope, Message, Peer, ReplicationSink};
use futures::channel::oneshot;
use parking_lot::Mutex;
use replica_signal::Signal;
use replica_value::{Key, KeyPath, SerializedDiff};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

type Result<T> = std::result::Result<T, ReplicaError>;

/// Opaque reference to a host object used as a registry key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub u64);

/// Key a tree root is registered under
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegistryKey {
    /// String key
    Name(String),
    /// Numeric key
    Number(i64),
    /// Host object reference
    Object(ObjectRef),
}

impl Display for RegistryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.write_str(name),
            Self::Number(n) => write!(f, "{n}"),
            Self::Object(object) => write!(f, "object#{}", object.0),
        }
    }
}

impl From<&str> for RegistryKey {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for RegistryKey {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl From<i64> for RegistryKey {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RegistryKey {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<ObjectRef> for RegistryKey {
    fn from(object: ObjectRef) -> Self {
        Self::Object(object)
    }
}

impl From<&RegistryKey> for RegistryKey {
    fn from(key: &RegistryKey) -> Self {
        key.clone()
    }
}

/// Arguments of the lifecycle signals
pub type Registration = (Replicant, RegistryKey);

#[derive(Default)]
struct RegistryState {
    entries: HashMap<RegistryKey, Replicant>,
    waiters: HashMap<RegistryKey, Vec<oneshot::Sender<Replicant>>>,
    observers: BTreeSet<ObserverId>,
}

pub(crate) struct RegistryShared {
    local: Peer,
    sink: Option<Arc<dyn ReplicationSink>>,
    state: Mutex<RegistryState>,
    will_register: Signal<Registration>,
    registered: Signal<Registration>,
    unregistered: Signal<Registration>,
}

/// Process-wide lookup from [`RegistryKey`] to live root nodes
///
/// Cloning shares the registry.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<RegistryShared>,
}

impl Registry {
    /// Create an empty registry for the `local` side, without transport
    #[must_use]
    pub fn new(local: Peer) -> Self {
        Self::build(local, None)
    }

    /// Create an empty registry that replicates through `sink`
    #[must_use]
    pub fn with_sink(local: Peer, sink: Arc<dyn ReplicationSink>) -> Self {
        Self::build(local, Some(sink))
    }

    /// Authority-side registry without transport
    #[inline]
    #[must_use]
    pub fn authority() -> Self {
        Self::new(Peer::Authority)
    }

    /// Observer-side registry without transport
    #[inline]
    #[must_use]
    pub fn observer(id: ObserverId) -> Self {
        Self::new(Peer::Observer(id))
    }

    fn build(local: Peer, sink: Option<Arc<dyn ReplicationSink>>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                local,
                sink,
                state: Mutex::new(RegistryState::default()),
                will_register: Signal::new(),
                registered: Signal::new(),
                unregistered: Signal::new(),
            }),
        }
    }

    /// Side of the link this registry serves
    #[inline]
    #[must_use]
    pub fn local(&self) -> Peer {
        self.shared.local
    }

    /// Fired before a node becomes visible to lookups
    #[must_use]
    pub fn will_register(&self) -> &Signal<Registration> {
        &self.shared.will_register
    }

    /// Fired after a node became visible to lookups
    #[must_use]
    pub fn registered(&self) -> &Signal<Registration> {
        &self.shared.registered
    }

    /// Fired after a binding went away
    #[must_use]
    pub fn unregistered(&self) -> &Signal<Registration> {
        &self.shared.unregistered
    }

    /// Bind `node` under `key`
    ///
    /// On an authority registry the tree's full state is sent to every
    /// connected observer that can see it.
    ///
    /// # Errors
    /// - [`ReplicaError::InactiveNode`] if the node was destroyed
    /// - [`ReplicaError::NotRoot`] if the node has a parent
    /// - [`ReplicaError::AlreadyBound`] if the node is registered elsewhere
    /// - [`ReplicaError::KeyAlreadyRegistered`] if `key` is bound to a live
    ///   node
    pub fn register(&self, key: impl Into<RegistryKey>, node: &Replicant) -> Result<()> {
        let key = key.into();
        node.ensure_active()?;
        if !node.is_root() {
            return Err(ReplicaError::NotRoot(node.key_path()));
        }
        if let Some(bound) = node.registry_key() {
            return Err(ReplicaError::AlreadyBound(bound));
        }
        if self.get_registered(key.clone()).is_some() {
            return Err(ReplicaError::KeyAlreadyRegistered(key));
        }

        self.shared.will_register.fire((node.clone(), key.clone()));

        let live = self.get_registered(key.clone());
        let waiters = {
            let mut state = self.shared.state.lock();
            if live.is_some() {
                return Err(ReplicaError::KeyAlreadyRegistered(key));
            }
            state.entries.insert(key.clone(), node.clone());
            state.waiters.remove(&key).unwrap_or_default()
        };
        node.bind(key.clone(), Arc::downgrade(&self.shared));
        tracing::debug!(%key, local = %self.shared.local, "registered");

        for waiter in waiters {
            let _ = waiter.send(node.clone());
        }
        self.shared.registered.fire((node.clone(), key.clone()));
        self.shared.fan_out(&key, node, None);
        Ok(())
    }

    /// Remove the binding for `key`, returning the node it held
    ///
    /// Unregistering a key with no binding is a no-op. The node itself is
    /// left alive.
    pub fn unregister(&self, key: impl Into<RegistryKey>) -> Option<Replicant> {
        let key = key.into();
        let node = self.shared.remove(&key, None)?;
        node.unbind(&key);
        Some(node)
    }

    /// Current live binding for `key`; never blocks
    #[must_use]
    pub fn get_registered(&self, key: impl Into<RegistryKey>) -> Option<Replicant> {
        let key = key.into();
        let node = self.shared.state.lock().entries.get(&key).cloned()?;
        node.is_active().then_some(node)
    }

    /// Future resolving once `key` is bound, or `None` after `timeout`
    ///
    /// The wait is registered when this method is called. Without a timeout
    /// the future resolves to `None` only if the registry is cleared or
    /// dropped. Timeouts need a Tokio runtime with the time driver.
    pub fn wait_for_registered(
        &self,
        key: impl Into<RegistryKey>,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Option<Replicant>> + Send + 'static {
        let key = key.into();
        let pending = match self.get_registered(key.clone()) {
            Some(node) => Pending::Ready(node),
            None => {
                let (sender, receiver) = oneshot::channel();
                let mut state = self.shared.state.lock();
                let waiters = state.waiters.entry(key).or_default();
                // Timed-out or dropped waits leave cancelled senders behind
                waiters.retain(|waiter| !waiter.is_canceled());
                waiters.push(sender);
                Pending::Waiting(receiver)
            }
        };

        async move {
            let receiver = match pending {
                Pending::Ready(node) => return Some(node),
                Pending::Waiting(receiver) => receiver,
            };
            match timeout {
                Some(limit) => tokio::time::timeout(limit, receiver).await.ok()?.ok(),
                None => receiver.await.ok(),
            }
        }
    }

    /// Registered keys
    #[must_use]
    pub fn keys(&self) -> Vec<RegistryKey> {
        let mut keys: Vec<RegistryKey> = self.shared.state.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Unregister everything and cancel pending waits
    pub fn clear(&self) {
        let waiters = std::mem::take(&mut self.shared.state.lock().waiters);
        drop(waiters);
        for key in self.keys() {
            self.unregister(key);
        }
    }

    /// Start replicating to `observer`
    ///
    /// On an authority registry every registered tree the observer can see
    /// is sent in full.
    pub fn connect_observer(&self, observer: ObserverId) {
        let roots: Vec<(RegistryKey, Replicant)> = {
            let mut state = self.shared.state.lock();
            state.observers.insert(observer);
            state
                .entries
                .iter()
                .map(|(key, node)| (key.clone(), node.clone()))
                .collect()
        };
        tracing::debug!(%observer, trees = roots.len(), "observer connected");
        for (key, node) in roots {
            self.shared.send_node(&key, &node, None, observer);
        }
    }

    /// Stop replicating to `observer`; returns whether it was connected
    pub fn disconnect_observer(&self, observer: ObserverId) -> bool {
        let removed = self.shared.state.lock().observers.remove(&observer);
        if removed {
            tracing::debug!(%observer, "observer disconnected");
        }
        removed
    }

    /// Connected observers
    #[must_use]
    pub fn observers(&self) -> Vec<ObserverId> {
        self.shared.state.lock().observers.iter().copied().collect()
    }

    /// Apply an envelope received from the other side
    ///
    /// - observer side: updates from the authority merge into the mirror;
    ///   an unknown tree is created and registered from a whole-tree diff
    /// - authority side: updates from a connected observer are written
    ///   authoritatively if the target allows `ClientCanSet` and is visible
    ///   to that observer, then fanned out; a rejected write is answered
    ///   with the authoritative state of the slot so the mirror converges
    ///
    /// # Errors
    /// - [`ReplicaError::PermissionDenied`] for rejected observer writes and
    ///   envelopes between two peers of the same side
    /// - [`ReplicaError::NotRegistered`] for updates to unknown trees
    /// - any merge error
    pub fn apply_inbound(&self, envelope: Envelope) -> Result<()> {
        let Envelope {
            origin,
            target,
            message,
        } = envelope;
        let local = self.shared.local;
        if target != local {
            tracing::debug!(%origin, %target, %local, "ignoring envelope for another peer");
            return Ok(());
        }

        match (local, origin) {
            (Peer::Observer(_), Peer::Authority) => self.apply_from_authority(message),
            (Peer::Authority, Peer::Observer(observer)) => {
                let result = self.apply_from_observer(observer, message);
                if let Err(err) = &result {
                    tracing::warn!(%observer, error = %err, "rejected inbound write");
                }
                result
            }
            (_, origin) => {
                tracing::warn!(%origin, %local, "dropping envelope between peers of the same side");
                Err(ReplicaError::PermissionDenied {
                    role: peer_role(origin),
                    path: KeyPath::root(),
                })
            }
        }
    }

    fn apply_from_authority(&self, message: Message) -> Result<()> {
        match message {
            Message::Update {
                registry_key,
                key_path,
                diff,
            } => match self.get_registered(registry_key.clone()) {
                Some(root) => root.descendant(&key_path)?.merge_serialized(&diff),
                None if key_path.is_root() && diff.key().is_none() => {
                    let mirror = Replicant::from_serialized(&diff, Role::Observer, None)?;
                    self.register(registry_key, &mirror)
                }
                None => Err(ReplicaError::NotRegistered(registry_key)),
            },
            Message::Unregister { registry_key } => {
                if let Some(mirror) = self.unregister(registry_key) {
                    mirror.destroy();
                }
                Ok(())
            }
        }
    }

    fn apply_from_observer(&self, observer: ObserverId, message: Message) -> Result<()> {
        let connected = self.shared.state.lock().observers.contains(&observer);
        match message {
            Message::Update {
                registry_key,
                key_path,
                diff,
            } => {
                if !connected {
                    return Err(ReplicaError::PermissionDenied {
                        role: Role::Observer,
                        path: key_path,
                    });
                }
                let root = self
                    .get_registered(registry_key.clone())
                    .ok_or_else(|| ReplicaError::NotRegistered(registry_key.clone()))?;
                let target = root.descendant(&key_path)?;
                let result = target.apply_observer_write(observer, &diff);
                if result.is_err() {
                    self.shared.correct(&registry_key, &root, &target, diff.key(), observer);
                }
                result
            }
            Message::Unregister { .. } => Err(ReplicaError::PermissionDenied {
                role: Role::Observer,
                path: KeyPath::root(),
            }),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("local", &self.shared.local)
            .field("keys", &self.keys())
            .field("observers", &self.observers())
            .finish_non_exhaustive()
    }
}

enum Pending {
    Ready(Replicant),
    Waiting(oneshot::Receiver<Replicant>),
}

fn peer_role(peer: Peer) -> Role {
    match peer {
        Peer::Authority => Role::Authority,
        Peer::Observer(_) => Role::Observer,
    }
}

impl RegistryShared {
    /// Drop the binding for `key` (only if it holds `expected`, when given)
    fn remove(&self, key: &RegistryKey, expected: Option<&Replicant>) -> Option<Replicant> {
        let (node, observers) = {
            let mut state = self.state.lock();
            if let Some(expected) = expected {
                if !state.entries.get(key).is_some_and(|node| node.ptr_eq(expected)) {
                    return None;
                }
            }
            let node = state.entries.remove(key)?;
            (node, state.observers.iter().copied().collect::<Vec<_>>())
        };
        tracing::debug!(%key, local = %self.local, "unregistered");
        self.unregistered.fire((node.clone(), key.clone()));

        for observer in observers {
            self.withdraw(key, observer);
        }
        Some(node)
    }

    /// Tell `observer` to drop its mirror of `registry_key`
    pub(crate) fn withdraw(&self, registry_key: &RegistryKey, observer: ObserverId) {
        let (Peer::Authority, Some(sink)) = (self.local, &self.sink) else {
            return;
        };
        tracing::trace!(%registry_key, %observer, "withdrawing tree");
        sink.dispatch(Envelope {
            origin: self.local,
            target: Peer::Observer(observer),
            message: Message::Unregister {
                registry_key: registry_key.clone(),
            },
        });
    }

    /// Connected observers that can currently see `node`
    pub(crate) fn observers_seeing(&self, node: &Replicant) -> Vec<ObserverId> {
        let observers: Vec<ObserverId> = self.state.lock().observers.iter().copied().collect();
        observers
            .into_iter()
            .filter(|observer| node.visible_to_client(*observer))
            .collect()
    }

    /// Re-send the authoritative slot an observer's rejected write targeted
    fn correct(
        &self,
        registry_key: &RegistryKey,
        root: &Replicant,
        target: &Replicant,
        at: Option<&Key>,
        observer: ObserverId,
    ) {
        let (Peer::Authority, Some(sink)) = (self.local, &self.sink) else {
            return;
        };
        if !root.visible_to_client(observer) {
            self.withdraw(registry_key, observer);
            return;
        }
        match target.serialize(at, Some(observer)) {
            Ok(diff) => {
                tracing::debug!(%registry_key, %observer, "correcting rejected write");
                sink.dispatch(update(self.local, Peer::Observer(observer), registry_key, target, diff));
            }
            Err(err) => tracing::warn!(%registry_key, %observer, error = %err, "cannot serialize correction"),
        }
    }

    /// Binding removal on destruction of a registered root
    pub(crate) fn release(&self, key: &RegistryKey, node: &Replicant) {
        self.remove(key, Some(node));
    }

    /// Route a write at `key` of `node` to the other side
    pub(crate) fn replicate(&self, registry_key: &RegistryKey, node: &Replicant, key: &Key) {
        match self.local {
            Peer::Authority => self.fan_out(registry_key, node, Some(key)),
            Peer::Observer(_) => self.forward(registry_key, node, key),
        }
    }

    /// Send `node` (or its child at `at`) to every observer that can see it
    pub(crate) fn fan_out(&self, registry_key: &RegistryKey, node: &Replicant, at: Option<&Key>) {
        if self.local != Peer::Authority || self.sink.is_none() {
            return;
        }
        let observers: Vec<ObserverId> = self.state.lock().observers.iter().copied().collect();
        for observer in observers {
            self.send_node(registry_key, node, at, observer);
        }
    }

    fn send_node(&self, registry_key: &RegistryKey, node: &Replicant, at: Option<&Key>, observer: ObserverId) {
        let (Peer::Authority, Some(sink)) = (self.local, &self.sink) else {
            return;
        };
        if !node.visible_to_client(observer) {
            return;
        }
        match node.serialize(at, Some(observer)) {
            Ok(diff) => {
                tracing::trace!(%registry_key, %observer, "dispatching update");
                sink.dispatch(update(self.local, Peer::Observer(observer), registry_key, node, diff));
            }
            Err(err) => tracing::warn!(%registry_key, %observer, error = %err, "cannot serialize update"),
        }
    }

    /// Send an observer-side write to the authority
    fn forward(&self, registry_key: &RegistryKey, node: &Replicant, key: &Key) {
        let Some(sink) = &self.sink else {
            return;
        };
        match node.serialize(Some(key), None) {
            Ok(diff) => {
                tracing::trace!(%registry_key, %key, "forwarding write to authority");
                sink.dispatch(update(self.local, Peer::Authority, registry_key, node, diff));
            }
            Err(err) => tracing::warn!(%registry_key, error = %err, "cannot serialize write"),
        }
    }
}

fn update(origin: Peer, target: Peer, registry_key: &RegistryKey, node: &Replicant, diff: SerializedDiff) -> Envelope {
    Envelope {
        origin,
        target,
        message: Message::Update {
            registry_key: registry_key.clone(),
            key_path: node.key_path(),
            diff,
        },
    }
}
