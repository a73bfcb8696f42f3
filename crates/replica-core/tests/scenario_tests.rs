use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use replica_core::{
    FactoredOr, Key, ReplicaError, Registry, Replicant, Role, SerializedDiff, Value, Variant,
};
use replica_test_utils::Cluster;
use std::sync::Arc;

#[test]
fn test_authority_write_reaches_mirror() {
    let cluster = Cluster::new(1);
    let player = Replicant::map(Role::Authority);
    player.set("health", 100).unwrap();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();

    let mirror = cluster.observer(1).get_registered("Player1").unwrap();
    assert_eq!(mirror.get_value("health").unwrap(), Value::from(100));
    assert_eq!(mirror.role(), Role::Observer);

    player.set("health", 80).unwrap();
    let envelopes = cluster.transport.drain();
    assert_eq!(envelopes.len(), 1);
    let replica_core::Message::Update { diff, key_path, .. } = &envelopes[0].message else {
        panic!("expected an update, got {:?}", envelopes[0].message);
    };
    assert!(key_path.is_root());
    assert_eq!(diff, &SerializedDiff::value(Some(Key::from("health")), Value::from(80)));

    cluster.observer(1).apply_inbound(envelopes[0].clone()).unwrap();
    assert_eq!(mirror.get_value("health").unwrap(), Value::from(80));
}

#[test]
fn test_factored_or_fires_once_on_resolution_change() {
    let status =
        FactoredOr::with_factors(Role::Authority, [("poisoned", true), ("stunned", false)]).unwrap();
    assert!(status.resolve_state().unwrap());

    let fired = Arc::new(Mutex::new(Vec::new()));
    let sink = fired.clone();
    status
        .state_changed()
        .connect(move |v| sink.lock().push(v.clone()));

    status.set("poisoned", false).unwrap();
    assert!(!status.resolve_state().unwrap());
    assert_eq!(*fired.lock(), vec![Value::Bool(false)]);
}

#[test]
fn test_registry_key_collision_and_reuse() {
    let registry = Registry::authority();
    let node_a = Replicant::map(Role::Authority);
    let node_b = Replicant::map(Role::Authority);

    registry.register("X", &node_a).unwrap();
    let err = registry.register("X", &node_b).unwrap_err();
    assert!(matches!(err, ReplicaError::KeyAlreadyRegistered(ref key) if key.to_string() == "X"));

    assert!(registry.unregister("X").unwrap().ptr_eq(&node_a));
    registry.register("X", &node_b).unwrap();
    assert!(registry.get_registered("X").unwrap().ptr_eq(&node_b));
}

#[test]
fn test_destroyed_node_rejects_access() {
    let registry = Registry::authority();
    let node = Replicant::map(Role::Authority);
    let child = Replicant::map(Role::Authority);
    node.set("child", &child).unwrap();
    registry.register("X", &node).unwrap();

    node.destroy();
    node.destroy();

    assert!(matches!(node.get("health"), Err(ReplicaError::InactiveNode { .. })));
    assert!(matches!(node.set("health", 1), Err(ReplicaError::InactiveNode { .. })));
    assert!(matches!(child.get("x"), Err(ReplicaError::InactiveNode { .. })));
    assert!(registry.get_registered("X").is_none());
}

#[test]
fn test_observer_cannot_set_without_permission() {
    let mirror = Replicant::new(Variant::Map, Role::Observer);
    let err = mirror.set("health", 10).unwrap_err();
    assert!(matches!(err, ReplicaError::PermissionDenied { role: Role::Observer, .. }));
    assert_eq!(err.to_string(), "observer is not permitted to write 'health'");

    // Prediction is always allowed
    mirror.predict("health", 10).unwrap();
    assert_eq!(mirror.get_value("health").unwrap(), Value::from(10));
}

#[test]
fn test_unknown_variant_fails_loudly() {
    let err = replica_core::codec::from_json(r#"["hp","VectorReplicant",[]]"#).unwrap_err();
    let err = ReplicaError::from(err);
    assert!(err.is_unknown_variant());
}

#[test]
fn test_full_merge_of_other_variant_is_rejected() {
    let map = Replicant::map(Role::Observer);
    let diff = Replicant::array(Role::Authority).serialize(None, None).unwrap();
    assert!(matches!(
        map.merge_serialized(&diff),
        Err(ReplicaError::VariantMismatch { .. })
    ));
}

#[test]
fn test_invalid_keys_and_factors() {
    let array = Replicant::array(Role::Authority);
    assert!(matches!(array.set("name", 1), Err(ReplicaError::InvalidKey { .. })));

    let map = Replicant::map(Role::Authority);
    assert!(matches!(map.set(0usize, 1), Err(ReplicaError::InvalidKey { .. })));

    let sum = Replicant::new(Variant::FactoredSum, Role::Authority);
    assert!(matches!(sum.set("bonus", "x"), Err(ReplicaError::InvalidFactor { .. })));
}
