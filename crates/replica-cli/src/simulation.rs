//! Loopback simulation
//!
//! One authority registry and N observer registries share a [`JsonWire`].
//! Random authoritative writes, observer predictions, observer writes and
//! visibility changes are applied; every mirror is periodically compared
//! against the authority's tree redacted for that observer.

use crate::wire::{Delivered, JsonWire};
use anyhow::{bail, Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use replica_core::{
    FactoredOr, FactoredSum, KeyPath, ObserverId, Peer, ReplicaConfig, ReplicaError,
    ReplicationSink, Registry, Replicant, Role, Value, Variant,
};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const WORLD_KEY: &str = "World";

/// Simulation parameters, readable from TOML or JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct SimulationConfig {
    /// Random seed for reproducibility
    pub(crate) seed: u64,
    /// Number of observers
    pub(crate) observers: u64,
    /// Number of random operations
    pub(crate) steps: u64,
    /// Chance that an observer predicts its move before the authority answers
    pub(crate) predict_chance: f64,
    /// Compare mirrors every N steps; the last step is always checked
    pub(crate) verify_every: u64,
    /// Config of the `lobby` subtree, the one observers write to
    pub(crate) lobby: ReplicaConfig,
    /// How long observers wait for the initial world
    pub(crate) mirror_timeout_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            observers: 3,
            steps: 1000,
            predict_chance: 0.2,
            verify_every: 50,
            lobby: ReplicaConfig::new().with_client_can_set(true),
            mirror_timeout_ms: 1000,
        }
    }
}

impl SimulationConfig {
    /// Read a config file; `.json` is JSON, anything else TOML
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Ok(toml::from_str(&content)?),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct SimulationStats {
    pub(crate) authority_writes: u64,
    pub(crate) predictions: u64,
    pub(crate) observer_writes: u64,
    pub(crate) config_changes: u64,
    pub(crate) frames: u64,
    pub(crate) bytes: u64,
    pub(crate) rejected: u64,
    pub(crate) checks: u64,
}

impl SimulationStats {
    fn absorb(&mut self, delivered: Delivered) {
        self.frames += delivered.frames;
        self.bytes += delivered.bytes;
        for (peer, err) in delivered.rejected {
            tracing::warn!(%peer, error = %err, "envelope rejected");
            self.rejected += 1;
        }
    }
}

/// A mirror that does not match the authority's redacted tree
#[derive(Debug, Clone, Serialize)]
pub(crate) struct Divergence {
    pub(crate) step: u64,
    pub(crate) observer: ObserverId,
    pub(crate) expected: Value,
    pub(crate) actual: Value,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SimulationReport {
    pub(crate) config: SimulationConfig,
    pub(crate) stats: SimulationStats,
    pub(crate) divergences: Vec<Divergence>,
}

impl SimulationReport {
    pub(crate) fn passed(&self) -> bool {
        self.divergences.is_empty()
    }

    pub(crate) fn generate_text(&self) -> String {
        let mut report = String::new();
        let stats = &self.stats;
        let _ = writeln!(report, "=== Replica Simulation Report ===\n");
        let _ = writeln!(report, "Seed: {}", self.config.seed);
        let _ = writeln!(report, "Observers: {}", self.config.observers);
        let _ = writeln!(report, "Steps: {}", self.config.steps);
        let _ = writeln!(report, "Authority Writes: {}", stats.authority_writes);
        let _ = writeln!(report, "Predictions: {}", stats.predictions);
        let _ = writeln!(report, "Observer Writes: {}", stats.observer_writes);
        let _ = writeln!(report, "Config Changes: {}", stats.config_changes);
        let _ = writeln!(report, "Frames: {} ({} bytes)", stats.frames, stats.bytes);
        let _ = writeln!(report, "Rejected: {}", stats.rejected);
        let _ = writeln!(report, "Mirror Checks: {}", stats.checks);
        let _ = writeln!(report, "Divergences: {}", self.divergences.len());
        for divergence in self.divergences.iter().take(5) {
            let _ = writeln!(
                report,
                "  step {} {}: expected {} got {}",
                divergence.step, divergence.observer, divergence.expected, divergence.actual
            );
        }
        let _ = write!(
            report,
            "\nStatus: {}",
            if self.passed() { "PASSED" } else { "FAILED" }
        );
        report
    }
}

struct Player {
    id: ObserverId,
    node: Replicant,
    stash: Replicant,
}

struct World {
    root: Replicant,
    players: Vec<Player>,
    buffs: FactoredSum,
    alarm: FactoredOr,
    log: Replicant,
}

fn player_path(id: ObserverId) -> KeyPath {
    KeyPath::root().child("players").child(format!("p{}", id.0))
}

fn build_world(config: &SimulationConfig) -> Result<World, ReplicaError> {
    let root = Replicant::map(Role::Authority);

    let roster = Replicant::map(Role::Authority);
    let mut players = Vec::new();
    for id in (1..=config.observers).map(ObserverId) {
        let node = Replicant::map(Role::Authority);
        node.set("hp", 100)?;
        node.set("pos", 0)?;
        let stash = Replicant::with_config(Variant::Map, Role::Authority, ReplicaConfig::private_to([id]));
        stash.set("gold", 10)?;
        node.set("stash", &stash)?;
        roster.set(format!("p{}", id.0), &node)?;
        players.push(Player { id, node, stash });
    }
    root.set("players", roster)?;

    let buffs = FactoredSum::with_factors(Role::Authority, [("base", 1.0)])?;
    root.set("buffs", &buffs)?;
    let alarm = FactoredOr::new(Role::Authority);
    root.set("alarm", &alarm)?;

    let log = Replicant::array(Role::Authority);
    log.push("started")?;
    root.set("log", &log)?;

    let lobby = Replicant::with_config(Variant::Map, Role::Authority, config.lobby.clone());
    root.set("lobby", lobby)?;

    Ok(World {
        root,
        players,
        buffs,
        alarm,
        log,
    })
}

/// The simulated world as the authority builds it
pub(crate) fn sample_world(config: &SimulationConfig) -> Result<Replicant, ReplicaError> {
    Ok(build_world(config)?.root)
}

struct Mirror {
    id: ObserverId,
    root: Replicant,
}

impl World {
    fn step(
        &self,
        step: u64,
        rng: &mut StdRng,
        mirrors: &[Mirror],
        config: &SimulationConfig,
        stats: &mut SimulationStats,
    ) -> Result<(), ReplicaError> {
        let player = &self.players[rng.gen_range(0..self.players.len())];
        match rng.gen_range(0..8) {
            0 => {
                player.node.set("hp", rng.gen_range(0..=100_i32))?;
                stats.authority_writes += 1;
            }
            1 => {
                let size = self.log.size()?;
                if size == 0 || rng.gen_bool(0.6) {
                    self.log.push(format!("event {step}"))?;
                } else {
                    self.log.remove(rng.gen_range(0..size))?;
                }
                stats.authority_writes += 1;
            }
            2 => {
                self.alarm.toggle(format!("sensor{}", rng.gen_range(0..3_u32)))?;
                stats.authority_writes += 1;
            }
            3 => {
                let factor = format!("buff{}", rng.gen_range(0..4_u32));
                if rng.gen_bool(0.25) {
                    self.buffs.remove(factor)?;
                } else {
                    self.buffs.set(factor, f64::from(rng.gen_range(-5..=5_i32)))?;
                }
                stats.authority_writes += 1;
            }
            4 => {
                let target = rng.gen_range(0..50_i32);
                if rng.gen_bool(config.predict_chance) {
                    if let Some(mirror) = mirrors.iter().find(|m| m.id == player.id) {
                        mirror.root.descendant(&player_path(player.id))?.predict("pos", target)?;
                        stats.predictions += 1;
                    }
                }
                // The authority occasionally corrects the move
                let confirmed = if rng.gen_bool(0.1) { target + 1 } else { target };
                player.node.set("pos", confirmed)?;
                stats.authority_writes += 1;
            }
            5 => {
                let Some(mirror) = mirrors.iter().find(|m| m.id == player.id) else {
                    return Ok(());
                };
                let lobby = mirror.root.descendant(&KeyPath::root().child("lobby"))?;
                match lobby.set(format!("ready_{}", player.id.0), rng.gen_bool(0.5)) {
                    Ok(()) => stats.observer_writes += 1,
                    Err(ReplicaError::PermissionDenied { .. }) => stats.rejected += 1,
                    Err(err) => return Err(err),
                }
            }
            6 => {
                player.stash.set("gold", rng.gen_range(0..1000_i32))?;
                stats.authority_writes += 1;
            }
            _ => {
                let widened = player.stash.get_config()?.subscribe_all;
                let next = if widened {
                    ReplicaConfig::private_to([player.id])
                } else {
                    ReplicaConfig::new()
                };
                player.stash.set_config(next)?;
                stats.config_changes += 1;
            }
        }
        Ok(())
    }

    /// Compare every mirror against the authority tree redacted for it
    fn verify(&self, step: u64, mirrors: &[Mirror], stats: &mut SimulationStats) -> Result<Vec<Divergence>, ReplicaError> {
        let mut divergences = Vec::new();
        for mirror in mirrors {
            stats.checks += 1;
            let diff = self.root.serialize(None, Some(mirror.id))?;
            let expected = Replicant::from_serialized(&diff, Role::Observer, None)?.to_value();
            let actual = mirror.root.to_value();
            if expected != actual {
                tracing::warn!(step, observer = %mirror.id, "mirror diverged");
                divergences.push(Divergence {
                    step,
                    observer: mirror.id,
                    expected,
                    actual,
                });
            }
        }
        Ok(divergences)
    }
}

/// Run the simulation described by `config`
pub(crate) async fn run_simulation(config: SimulationConfig) -> Result<SimulationReport> {
    tracing::info!(
        seed = config.seed,
        observers = config.observers,
        steps = config.steps,
        "starting simulation"
    );
    if config.observers == 0 {
        bail!("at least one observer is required");
    }
    let wire = JsonWire::new();
    let sink: Arc<dyn ReplicationSink> = wire.clone();
    let authority = Registry::with_sink(Peer::Authority, sink.clone());
    let ids: Vec<ObserverId> = (1..=config.observers).map(ObserverId).collect();
    let observers: Vec<Registry> = ids
        .iter()
        .map(|id| Registry::with_sink(Peer::Observer(*id), sink.clone()))
        .collect();
    for id in &ids {
        authority.connect_observer(*id);
    }

    let world = build_world(&config)?;
    let timeout = Duration::from_millis(config.mirror_timeout_ms);
    let waits: Vec<_> = observers
        .iter()
        .map(|registry| registry.wait_for_registered(WORLD_KEY, Some(timeout)))
        .collect();
    authority.register(WORLD_KEY, &world.root)?;

    let mut stats = SimulationStats::default();
    stats.absorb(wire.deliver(&authority, &observers));

    let mut mirrors = Vec::new();
    for (id, wait) in ids.iter().zip(waits) {
        let root = wait
            .await
            .with_context(|| format!("{id} never received the world"))?;
        // Configs are not replicated; each side states its own
        root.descendant(&KeyPath::root().child("lobby"))?
            .set_config(config.lobby.clone())?;
        mirrors.push(Mirror { id: *id, root });
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut divergences = Vec::new();
    for step in 1..=config.steps {
        world.step(step, &mut rng, &mirrors, &config, &mut stats)?;
        stats.absorb(wire.deliver(&authority, &observers));

        let due = config.verify_every > 0 && step % config.verify_every == 0;
        if due || step == config.steps {
            divergences.extend(world.verify(step, &mirrors, &mut stats)?);
        }
    }

    tracing::info!(
        frames = stats.frames,
        divergences = divergences.len(),
        "simulation finished"
    );
    Ok(SimulationReport {
        config,
        stats,
        divergences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn short_run_keeps_mirrors_converged() {
        let config = SimulationConfig {
            steps: 300,
            verify_every: 10,
            predict_chance: 0.5,
            ..SimulationConfig::default()
        };
        let report = run_simulation(config).await.unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert!(report.stats.frames > 0);
        assert_eq!(report.stats.checks, 30 * 3);
    }

    #[tokio::test]
    async fn same_seed_same_traffic() {
        let config = SimulationConfig {
            steps: 100,
            ..SimulationConfig::default()
        };
        let first = run_simulation(config.clone()).await.unwrap();
        let second = run_simulation(config).await.unwrap();
        assert_eq!(first.stats.bytes, second.stats.bytes);
        assert_eq!(first.stats.authority_writes, second.stats.authority_writes);
    }

    #[tokio::test]
    async fn read_only_lobby_rejects_observer_writes() {
        let config = SimulationConfig {
            steps: 200,
            lobby: ReplicaConfig::new(),
            ..SimulationConfig::default()
        };
        let report = run_simulation(config).await.unwrap();
        assert!(report.passed());
        assert_eq!(report.stats.observer_writes, 0);
        assert!(report.stats.rejected > 0);
    }

    #[test]
    fn config_reads_toml_with_replica_config_table() {
        let config: SimulationConfig = toml::from_str(
            r#"
            seed = 7
            steps = 10

            [lobby]
            ClientCanSet = false
            SubscribeAll = false
            Whitelist = [2]
            "#,
        )
        .unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.observers, 3);
        assert!(!config.lobby.client_can_set);
        assert!(config.lobby.admits(ObserverId(2)));
        assert!(!config.lobby.admits(ObserverId(1)));
    }

    #[test]
    fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("sim.json");
        std::fs::write(&json, r#"{"observers": 5, "lobby": {"ClientCanSet": true}}"#).unwrap();
        let toml_path = dir.path().join("sim.toml");
        std::fs::write(&toml_path, "observers = 2\nverify_every = 0\n").unwrap();

        let from_json = SimulationConfig::load(&json).unwrap();
        assert_eq!(from_json.observers, 5);
        assert!(from_json.lobby.client_can_set);

        let from_toml = SimulationConfig::load(&toml_path).unwrap();
        assert_eq!(from_toml.observers, 2);
        assert_eq!(from_toml.verify_every, 0);
        assert!(SimulationConfig::load(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn report_text_states_outcome() {
        let report = SimulationReport {
            config: SimulationConfig::default(),
            stats: SimulationStats::default(),
            divergences: Vec::new(),
        };
        let text = report.generate_text();
        assert!(text.contains("Seed: 42"));
        assert!(text.ends_with("Status: PASSED"));
    }
}
