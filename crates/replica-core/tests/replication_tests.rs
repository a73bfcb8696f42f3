use pretty_assertions::assert_eq;
use proptest::prelude::*;
use replica_core::{
    Message, ObserverId, Peer, ReplicaConfig, ReplicaError, ReplicationSink, Registry, Replicant,
    Role, Value, Variant,
};
use replica_test_utils::{player_tree, Cluster, LoopbackTransport};
use std::sync::Arc;

#[test]
fn test_registration_sends_full_tree() {
    let cluster = Cluster::new(2);
    let player = player_tree();
    cluster.authority.register("Player1", &player).unwrap();
    assert_eq!(cluster.transport.pending(), 2);
    cluster.sync();

    for id in [1, 2] {
        let mirror = cluster.observer(id).get_registered("Player1").unwrap();
        assert_eq!(mirror.to_value(), player.to_value());
        assert_eq!(mirror.role(), Role::Observer);
        let status = mirror.child("status").unwrap().unwrap();
        assert_eq!(status.variant(), Variant::FactoredOr);
    }
}

#[test]
fn test_private_child_is_redacted_for_other_observers() {
    let cluster = Cluster::new(2);
    let player = player_tree();
    let secret = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::private_to([ObserverId(1)]),
    );
    secret.set("pin", 1234).unwrap();
    player.set("secret", &secret).unwrap();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();

    let trusted = cluster.observer(1).get_registered("Player1").unwrap();
    let other = cluster.observer(2).get_registered("Player1").unwrap();
    let trusted_secret = trusted.child("secret").unwrap().unwrap();
    let other_secret = other.child("secret").unwrap().unwrap();
    assert_eq!(trusted_secret.get_value("pin").unwrap(), Value::from(1234));
    assert_eq!(other_secret.get_value("pin").unwrap(), Value::Nil);
    assert_eq!(other_secret.variant(), Variant::Map);

    // Writes under the hidden node only go to observer 1
    secret.set("pin", 4321).unwrap();
    let envelopes = cluster.transport.drain();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].target, Peer::Observer(ObserverId(1)));
    cluster.observer(1).apply_inbound(envelopes[0].clone()).unwrap();
    assert_eq!(trusted_secret.get_value("pin").unwrap(), Value::from(4321));
}

#[test]
fn test_widening_visibility_resends_subtree() {
    let cluster = Cluster::new(2);
    let player = Replicant::map(Role::Authority);
    let secret = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::private_to([ObserverId(1)]),
    );
    secret.set("pin", 7).unwrap();
    player.set("secret", &secret).unwrap();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();

    let other = cluster.observer(2).get_registered("Player1").unwrap();
    let other_secret = other.child("secret").unwrap().unwrap();
    assert_eq!(other_secret.get_value("pin").unwrap(), Value::Nil);

    secret.set_config(ReplicaConfig::new()).unwrap();
    cluster.sync();
    assert_eq!(other_secret.get_value("pin").unwrap(), Value::from(7));

    // Narrowing again sends the redacted form
    secret
        .set_config(ReplicaConfig::private_to([ObserverId(1)]))
        .unwrap();
    cluster.sync();
    assert_eq!(other_secret.get_value("pin").unwrap(), Value::Nil);
}

#[test]
fn test_observer_write_is_forwarded_and_fanned_out() {
    let cluster = Cluster::new(2);
    let lobby = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::new().with_client_can_set(true),
    );
    cluster.authority.register("Lobby", &lobby).unwrap();
    cluster.sync();

    let mirror = cluster.observer(1).get_registered("Lobby").unwrap();
    mirror
        .set_config(ReplicaConfig::new().with_client_can_set(true))
        .unwrap();
    mirror.set("ready", true).unwrap();

    let forwarded = cluster.transport.drain();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].target, Peer::Authority);
    assert_eq!(forwarded[0].origin, Peer::Observer(ObserverId(1)));
    cluster.authority.apply_inbound(forwarded[0].clone()).unwrap();
    assert_eq!(lobby.get_value("ready").unwrap(), Value::Bool(true));

    cluster.sync();
    let second = cluster.observer(2).get_registered("Lobby").unwrap();
    assert_eq!(second.get_value("ready").unwrap(), Value::Bool(true));
}

#[test]
fn test_authority_rejects_unpermitted_observer_write() {
    let cluster = Cluster::new(1);
    let player = Replicant::map(Role::Authority);
    player.set("hp", 10).unwrap();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();

    // The mirror grants itself the right; the authority does not
    let mirror = cluster.observer(1).get_registered("Player1").unwrap();
    mirror
        .set_config(ReplicaConfig::new().with_client_can_set(true))
        .unwrap();
    mirror.set("hp", 999).unwrap();

    let delivery = cluster.deliver();
    assert_eq!(delivery.failures.len(), 1);
    assert!(matches!(
        delivery.failures[0].1,
        ReplicaError::PermissionDenied { role: Role::Observer, .. }
    ));
    assert_eq!(player.get_value("hp").unwrap(), Value::from(10));
    // The authority answers with its own value and the mirror converges
    assert_eq!(mirror.get_value("hp").unwrap(), Value::from(10));
}

fn open_root() -> Replicant {
    Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::new().with_client_can_set(true),
    )
}

fn writable_mirror(cluster: &Cluster, id: u64, key: &str) -> Replicant {
    let mirror = cluster.observer(id).get_registered(key).unwrap();
    mirror
        .set_config(ReplicaConfig::new().with_client_can_set(true))
        .unwrap();
    mirror
}

fn observer_map() -> Replicant {
    Replicant::with_config(
        Variant::Map,
        Role::Observer,
        ReplicaConfig::new().with_client_can_set(true),
    )
}

#[test]
fn test_observer_cannot_replace_protected_child() {
    let cluster = Cluster::new(1);
    let root = open_root();
    let secret = Replicant::with_config(Variant::Map, Role::Authority, ReplicaConfig::new());
    secret.set("pin", 1234).unwrap();
    root.set("secret", &secret).unwrap();
    cluster.authority.register("Vault", &root).unwrap();
    cluster.sync();

    let mirror = writable_mirror(&cluster, 1, "Vault");
    let fresh = observer_map();
    fresh.set("pin", 0).unwrap();
    mirror.set("secret", &fresh).unwrap();

    let delivery = cluster.deliver();
    assert_eq!(delivery.failures.len(), 1);
    assert!(matches!(
        delivery.failures[0].1,
        ReplicaError::PermissionDenied { role: Role::Observer, .. }
    ));
    assert!(secret.is_active());
    assert_eq!(secret.get_value("pin").unwrap(), Value::from(1234));

    let mirrored = mirror.child("secret").unwrap().unwrap();
    assert_eq!(mirrored.get_value("pin").unwrap(), Value::from(1234));
}

#[test]
fn test_observer_cannot_replace_subtree_hiding_a_node() {
    let cluster = Cluster::new(2);
    let root = open_root();
    let team = Replicant::map(Role::Authority);
    let plans = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::private_to([ObserverId(2)]),
    );
    plans.set("route", "north").unwrap();
    team.set("plans", &plans).unwrap();
    team.set("size", 3).unwrap();
    root.set("team", &team).unwrap();
    cluster.authority.register("Guild", &root).unwrap();
    cluster.sync();

    let mirror = writable_mirror(&cluster, 1, "Guild");
    let fresh = observer_map();
    fresh.set("size", 4).unwrap();
    mirror.set("team", &fresh).unwrap();

    let delivery = cluster.deliver();
    assert_eq!(delivery.failures.len(), 1);
    assert!(plans.is_active());
    assert_eq!(plans.get_value("route").unwrap(), Value::from("north"));
    assert_eq!(team.get_value("size").unwrap(), Value::from(3));

    let mirrored = mirror.child("team").unwrap().unwrap();
    assert_eq!(mirrored.get_value("size").unwrap(), Value::from(3));
    let hidden = mirrored.child("plans").unwrap().unwrap();
    assert_eq!(hidden.get_value("route").unwrap(), Value::Nil);
}

#[test]
fn test_observer_may_replace_open_subtree() {
    let cluster = Cluster::new(1);
    let root = open_root();
    let team = Replicant::map(Role::Authority);
    team.set("size", 3).unwrap();
    root.set("team", &team).unwrap();
    cluster.authority.register("Guild", &root).unwrap();
    cluster.sync();

    let mirror = writable_mirror(&cluster, 1, "Guild");
    let fresh = observer_map();
    fresh.set("size", 4).unwrap();
    mirror.set("team", &fresh).unwrap();
    cluster.sync();

    let written = root.child("team").unwrap().unwrap();
    assert_eq!(written.get_value("size").unwrap(), Value::from(4));
}

#[test]
fn test_narrowing_root_visibility_withdraws_mirror() {
    let cluster = Cluster::new(2);
    let player = Replicant::map(Role::Authority);
    player.set("hp", 10).unwrap();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();
    let lost = cluster.observer(1).get_registered("Player1").unwrap();

    player
        .set_config(ReplicaConfig::private_to([ObserverId(2)]))
        .unwrap();
    cluster.sync();
    assert!(cluster.observer(1).get_registered("Player1").is_none());
    assert!(!lost.is_active());

    player.set("hp", 11).unwrap();
    cluster.sync();
    assert!(cluster.observer(1).get_registered("Player1").is_none());
    let kept = cluster.observer(2).get_registered("Player1").unwrap();
    assert_eq!(kept.get_value("hp").unwrap(), Value::from(11));

    // Widening again sends a fresh mirror
    player.set_config(ReplicaConfig::new()).unwrap();
    cluster.sync();
    let regained = cluster.observer(1).get_registered("Player1").unwrap();
    assert_eq!(regained.get_value("hp").unwrap(), Value::from(11));
}

#[test]
fn test_destroying_mirror_child_is_not_forwarded() {
    let cluster = Cluster::new(1);
    let player = player_tree();
    cluster.authority.register("Player1", &player).unwrap();
    cluster.sync();

    let mirror = cluster.observer(1).get_registered("Player1").unwrap();
    mirror.child("status").unwrap().unwrap().destroy();
    assert!(mirror.child("status").unwrap().is_none());
    assert_eq!(cluster.transport.pending(), 0);
    assert!(player.child("status").unwrap().is_some());
}

#[test]
fn test_disconnected_observer_write_is_rejected() {
    let cluster = Cluster::new(1);
    let lobby = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::new().with_client_can_set(true),
    );
    cluster.authority.register("Lobby", &lobby).unwrap();
    cluster.sync();

    assert!(cluster.authority.disconnect_observer(ObserverId(1)));
    let mirror = cluster.observer(1).get_registered("Lobby").unwrap();
    mirror
        .set_config(ReplicaConfig::new().with_client_can_set(true))
        .unwrap();
    mirror.set("ready", true).unwrap();

    let delivery = cluster.deliver();
    assert_eq!(delivery.failures.len(), 1);
    assert_eq!(lobby.get_value("ready").unwrap(), Value::Nil);
}

#[test]
fn test_unregister_and_destroy_reach_observers() {
    let cluster = Cluster::new(1);
    let player = player_tree();
    let monster = Replicant::map(Role::Authority);
    cluster.authority.register("Player1", &player).unwrap();
    cluster.authority.register("Monster", &monster).unwrap();
    cluster.sync();

    let mirror = cluster.observer(1).get_registered("Player1").unwrap();
    cluster.authority.unregister("Player1");
    cluster.sync();
    assert!(cluster.observer(1).get_registered("Player1").is_none());
    assert!(!mirror.is_active());

    monster.destroy();
    cluster.sync();
    assert!(cluster.observer(1).get_registered("Monster").is_none());
}

#[test]
fn test_late_observer_receives_visible_trees() {
    let transport = LoopbackTransport::new();
    let sink: Arc<dyn ReplicationSink> = transport.clone();
    let authority = Registry::with_sink(Peer::Authority, sink.clone());
    let late = Registry::with_sink(Peer::Observer(ObserverId(3)), sink);

    let public = player_tree();
    let hidden = Replicant::with_config(
        Variant::Map,
        Role::Authority,
        ReplicaConfig::new().blacklist(ObserverId(3)),
    );
    authority.register("Public", &public).unwrap();
    authority.register("Hidden", &hidden).unwrap();
    assert_eq!(transport.pending(), 0);

    authority.connect_observer(ObserverId(3));
    let delivery = transport.deliver(&authority, &[&late]);
    assert!(delivery.failures.is_empty());
    assert_eq!(late.keys().len(), 1);
    assert_eq!(
        late.get_registered("Public").unwrap().to_value(),
        public.to_value()
    );
}

#[test]
fn test_envelopes_between_observers_are_rejected() {
    let cluster = Cluster::new(2);
    let player = Replicant::map(Role::Authority);
    cluster.authority.register("Player1", &player).unwrap();
    let mut envelope = cluster.transport.drain().remove(0);
    envelope.origin = Peer::Observer(ObserverId(2));
    envelope.target = Peer::Observer(ObserverId(1));
    assert!(cluster.observer(1).apply_inbound(envelope).is_err());
}

#[test]
fn test_envelope_survives_json_transport() {
    let cluster = Cluster::new(1);
    let player = player_tree();
    cluster.authority.register("Player1", &player).unwrap();

    let envelope = cluster.transport.drain().remove(0);
    let text = serde_json::to_string(&envelope).unwrap();
    let decoded: replica_core::Envelope = serde_json::from_str(&text).unwrap();
    assert!(matches!(decoded.message, Message::Update { .. }));
    cluster.observer(1).apply_inbound(decoded).unwrap();
    assert_eq!(
        cluster.observer(1).get_registered("Player1").unwrap().to_value(),
        player.to_value()
    );
}

#[derive(Debug, Clone)]
enum Op {
    SetField(usize, Option<i32>),
    Push(i32),
    Pop,
    InsertAt(usize, i32),
    Remove(usize),
    Toggle(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, proptest::option::of(-50..50i32)).prop_map(|(k, v)| Op::SetField(k, v)),
        (-50..50i32).prop_map(Op::Push),
        Just(Op::Pop),
        (0..6usize, -50..50i32).prop_map(|(i, v)| Op::InsertAt(i, v)),
        (0..6usize).prop_map(Op::Remove),
        (0..3usize).prop_map(Op::Toggle),
    ]
}

proptest! {
    #[test]
    fn prop_partial_diffs_keep_mirror_equal(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let cluster = Cluster::new(1);
        let root = Replicant::map(Role::Authority);
        let list = Replicant::array(Role::Authority);
        let flags = replica_core::FactoredOr::new(Role::Authority);
        root.set("list", &list).unwrap();
        root.set("flags", &flags).unwrap();
        cluster.authority.register("Tree", &root).unwrap();
        cluster.sync();

        for op in ops {
            match op {
                Op::SetField(k, v) => root.set(format!("f{k}"), v.map_or(Value::Nil, Value::from)).unwrap(),
                Op::Push(v) => {
                    list.push(v).unwrap();
                }
                Op::Pop => {
                    list.pop().unwrap();
                }
                Op::InsertAt(i, v) => {
                    let len = list.size().unwrap();
                    list.insert_at(i.min(len), v).unwrap();
                }
                Op::Remove(i) => {
                    let len = list.size().unwrap();
                    if len > 0 {
                        list.remove(i % len).unwrap();
                    }
                }
                Op::Toggle(k) => flags.toggle(format!("c{k}")).unwrap(),
            }
            cluster.sync();
            let mirror = cluster.observer(1).get_registered("Tree").unwrap();
            prop_assert_eq!(mirror.to_value(), root.to_value());
        }
    }
}
