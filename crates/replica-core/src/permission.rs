//! Permission model
//!
//! Decides, for a node and an actor, whether a write or a subscription is
//! allowed.
//!
//! # Resolution
//! - `SubscribeAll`: every observer is visible except those in `Blacklist`
//! - otherwise: only `Whitelist` members are visible, minus `Blacklist`
//! - a node's effective config is its own, or the nearest ancestor's; an own
//!   config fully replaces the inherited one for its subtree
//! - a node is visible to an observer only if every node on its path from
//!   the root is, so visibility can only narrow going down the tree

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};

/// Side of the replication link a tree lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the tree; its writes are what every observer converges to
    Authority,
    /// Mirrors (part of) a tree held by the authority
    Observer,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authority => f.write_str("authority"),
            Self::Observer => f.write_str("observer"),
        }
    }
}

/// Opaque identity of one remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObserverId(pub u64);

impl Display for ObserverId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "observer#{}", self.0)
    }
}

/// Permission and visibility settings of a node
///
/// Field names serialize in PascalCase (`ServerCanSet`, `Whitelist`, ...);
/// missing fields take their defaults, so partial documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ReplicaConfig {
    /// Authority role may call `set`
    pub server_can_set: bool,
    /// Observer role may call `set` (otherwise only `predict`)
    pub client_can_set: bool,
    /// Every observer is visible; `whitelist` is ignored
    pub subscribe_all: bool,
    /// Visible observers when `subscribe_all` is off
    pub whitelist: BTreeSet<ObserverId>,
    /// Observers excluded regardless of the other settings
    pub blacklist: BTreeSet<ObserverId>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            server_can_set: true,
            client_can_set: false,
            subscribe_all: true,
            whitelist: BTreeSet::new(),
            blacklist: BTreeSet::new(),
        }
    }
}

impl ReplicaConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Config visible only to `observers`
    #[must_use]
    pub fn private_to(observers: impl IntoIterator<Item = ObserverId>) -> Self {
        Self {
            subscribe_all: false,
            whitelist: observers.into_iter().collect(),
            ..Self::default()
        }
    }

    /// With authority write permission
    #[inline]
    #[must_use]
    pub fn with_server_can_set(mut self, allowed: bool) -> Self {
        self.server_can_set = allowed;
        self
    }

    /// With observer write permission
    #[inline]
    #[must_use]
    pub fn with_client_can_set(mut self, allowed: bool) -> Self {
        self.client_can_set = allowed;
        self
    }

    /// With subscribe-all visibility
    #[inline]
    #[must_use]
    pub fn with_subscribe_all(mut self, all: bool) -> Self {
        self.subscribe_all = all;
        self
    }

    /// Add an observer to the whitelist
    #[inline]
    #[must_use]
    pub fn whitelist(mut self, observer: ObserverId) -> Self {
        self.whitelist.insert(observer);
        self
    }

    /// Add an observer to the blacklist
    #[inline]
    #[must_use]
    pub fn blacklist(mut self, observer: ObserverId) -> Self {
        self.blacklist.insert(observer);
        self
    }

    /// Whether this config alone admits `observer`
    #[must_use]
    pub fn admits(&self, observer: ObserverId) -> bool {
        if self.blacklist.contains(&observer) {
            return false;
        }
        self.subscribe_all || self.whitelist.contains(&observer)
    }

    /// Whether this config alone admits every observer
    #[inline]
    #[must_use]
    pub fn admits_everyone(&self) -> bool {
        self.subscribe_all && self.blacklist.is_empty()
    }

    /// Whether `role` may perform authoritative writes
    #[inline]
    #[must_use]
    pub fn permits_write(&self, role: Role) -> bool {
        match role {
            Role::Authority => self.server_can_set,
            Role::Observer => self.client_can_set,
        }
    }
}

/// Own configs along a path, root first
///
/// `None` entries inherit from the nearest configured ancestor; a chain with
/// no config at all resolves to [`ReplicaConfig::default`].
#[derive(Debug, Clone, Default)]
pub(crate) struct ConfigChain {
    levels: Vec<Option<ReplicaConfig>>,
}

impl ConfigChain {
    pub(crate) fn new(levels: Vec<Option<ReplicaConfig>>) -> Self {
        Self { levels }
    }

    /// Effective config at each level, root first
    fn resolved(&self) -> impl Iterator<Item = ReplicaConfig> + '_ {
        self.levels.iter().scan(ReplicaConfig::default(), |current, own| {
            if let Some(own) = own {
                current.clone_from(own);
            }
            Some(current.clone())
        })
    }

    /// Effective config of the deepest level
    pub(crate) fn effective(&self) -> ReplicaConfig {
        self.resolved().last().unwrap_or_default()
    }

    /// Visible to `observer` at every level
    pub(crate) fn admits(&self, observer: ObserverId) -> bool {
        self.resolved().all(|config| config.admits(observer))
    }

    /// Visible to everyone at every level
    pub(crate) fn admits_everyone(&self) -> bool {
        self.resolved().all(|config| config.admits_everyone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const A: ObserverId = ObserverId(1);
    const B: ObserverId = ObserverId(2);

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ReplicaConfig::default();
        assert!(config.server_can_set);
        assert!(!config.client_can_set);
        assert!(config.subscribe_all);
        assert!(config.admits_everyone());
    }

    #[test]
    fn subscribe_all_ignores_whitelist_but_not_blacklist() {
        let config = ReplicaConfig::new().whitelist(A).blacklist(B);
        assert!(config.admits(A));
        assert!(!config.admits(B));
        assert!(config.admits(ObserverId(3)));
        assert!(!config.admits_everyone());
    }

    #[test]
    fn whitelist_minus_blacklist() {
        let config = ReplicaConfig::private_to([A, B]).blacklist(B);
        assert!(config.admits(A));
        assert!(!config.admits(B));
        assert!(!config.admits(ObserverId(3)));
    }

    #[test]
    fn write_permission_by_role() {
        let config = ReplicaConfig::new().with_client_can_set(true).with_server_can_set(false);
        assert!(!config.permits_write(Role::Authority));
        assert!(config.permits_write(Role::Observer));
    }

    #[test]
    fn own_config_replaces_inherited() {
        let chain = ConfigChain::new(vec![
            Some(ReplicaConfig::new().with_client_can_set(true)),
            None,
            Some(ReplicaConfig::new()),
        ]);
        assert!(!chain.effective().client_can_set);

        let inherited = ConfigChain::new(vec![Some(ReplicaConfig::new().with_client_can_set(true)), None]);
        assert!(inherited.effective().client_can_set);
    }

    #[test]
    fn descendant_cannot_widen_visibility() {
        let chain = ConfigChain::new(vec![
            Some(ReplicaConfig::private_to([A])),
            Some(ReplicaConfig::new()),
        ]);
        assert!(chain.admits(A));
        assert!(!chain.admits(B));
        assert!(!chain.admits_everyone());
    }

    #[test]
    fn config_reads_partial_pascal_case_documents() {
        let config: ReplicaConfig =
            serde_json::from_str(r#"{"ClientCanSet": true, "Blacklist": [7]}"#).unwrap();
        assert!(config.client_can_set);
        assert!(config.server_can_set);
        assert!(config.blacklist.contains(&ObserverId(7)));
    }

    fn arb_config() -> impl Strategy<Value = Option<ReplicaConfig>> {
        let ids = prop::collection::btree_set((0u64..4).prop_map(ObserverId), 0..3);
        prop::option::of(
            (any::<bool>(), ids.clone(), ids).prop_map(|(all, white, black)| ReplicaConfig {
                subscribe_all: all,
                whitelist: white,
                blacklist: black,
                ..ReplicaConfig::default()
            }),
        )
    }

    proptest! {
        #[test]
        fn visibility_is_monotonic_down_the_chain(
            levels in prop::collection::vec(arb_config(), 1..6),
            observer in (0u64..4).prop_map(ObserverId),
        ) {
            let chain = ConfigChain::new(levels.clone());
            for depth in 1..levels.len() {
                let ancestor = ConfigChain::new(levels[..depth].to_vec());
                if chain.admits(observer) {
                    prop_assert!(ancestor.admits(observer));
                }
            }
        }
    }
}
