//! Testing utilities for the replica workspace
//!
//! Loopback transport, cluster setup and canned trees.

#![allow(missing_docs)]

use parking_lot::Mutex;
use replica_core::{
    Envelope, FactoredOr, ObserverId, Peer, ReplicaError, ReplicationSink, Registry, Replicant,
    Role, Variant,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// In-memory transport: every dispatched envelope waits in one queue until
/// [`deliver`](LoopbackTransport::deliver) routes it by target
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    queue: Mutex<VecDeque<Envelope>>,
}

impl ReplicationSink for LoopbackTransport {
    fn dispatch(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
    }
}

#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub failures: Vec<(Envelope, ReplicaError)>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Take every queued envelope without delivering it
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.lock().drain(..).collect()
    }

    /// Deliver until the queue is empty, including envelopes dispatched
    /// while delivering
    pub fn deliver(&self, authority: &Registry, observers: &[&Registry]) -> Delivery {
        let mut delivery = Delivery::default();
        loop {
            let next = self.queue.lock().pop_front();
            let Some(envelope) = next else {
                return delivery;
            };
            let destination = match envelope.target {
                Peer::Authority => Some(authority),
                Peer::Observer(id) => observers
                    .iter()
                    .copied()
                    .find(|registry| registry.local() == Peer::Observer(id)),
            };
            let Some(registry) = destination else {
                continue;
            };
            match registry.apply_inbound(envelope.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => delivery.failures.push((envelope, err)),
            }
        }
    }
}

/// One authority registry and N connected observer registries sharing a
/// loopback transport
pub struct Cluster {
    pub transport: Arc<LoopbackTransport>,
    pub authority: Registry,
    pub observers: Vec<Registry>,
}

impl Cluster {
    /// Observers get ids `1..=count`
    pub fn new(count: u64) -> Self {
        let transport = LoopbackTransport::new();
        let sink: Arc<dyn ReplicationSink> = transport.clone();
        let authority = Registry::with_sink(Peer::Authority, sink.clone());
        let observers = (1..=count)
            .map(|id| Registry::with_sink(Peer::Observer(ObserverId(id)), sink.clone()))
            .collect();
        let cluster = Self {
            transport,
            authority,
            observers,
        };
        for id in 1..=count {
            cluster.authority.connect_observer(ObserverId(id));
        }
        cluster
    }

    pub fn observer(&self, id: u64) -> &Registry {
        let index = usize::try_from(id - 1).unwrap();
        &self.observers[index]
    }

    /// Deliver everything queued; panics on a rejected envelope
    pub fn sync(&self) -> usize {
        let delivery = self.deliver();
        assert!(
            delivery.failures.is_empty(),
            "rejected envelopes: {:?}",
            delivery.failures
        );
        delivery.delivered
    }

    pub fn deliver(&self) -> Delivery {
        let observers: Vec<&Registry> = self.observers.iter().collect();
        self.transport.deliver(&self.authority, &observers)
    }
}

/// `{health: 100, status: FactoredOr{poisoned: false}, inventory: ["sword"]}`
pub fn player_tree() -> Replicant {
    let root = Replicant::new(Variant::Map, Role::Authority);
    root.set("health", 100).unwrap();

    let status = FactoredOr::new(Role::Authority);
    status.set("poisoned", false).unwrap();
    root.set("status", status).unwrap();

    let inventory = Replicant::array(Role::Authority);
    inventory.push("sword").unwrap();
    root.set("inventory", inventory).unwrap();
    root
}

/// Map with `count` numeric fields `f0..`
pub fn flat_map(count: usize) -> Replicant {
    let root = Replicant::new(Variant::Map, Role::Authority);
    for i in 0..count {
        root.set(format!("f{i}"), f64::from(u32::try_from(i).unwrap())).unwrap();
    }
    root
}
