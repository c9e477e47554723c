//! Multi-replica session simulator
//!
//! Every replica is a full [`SyncEngine`]. Each step one seeded-random
//! replica edits one entity and broadcasts the operation over per-pair
//! [`ChaosLink`]s. After the run, links are flushed and the replicas
//! exchange full histories (anti-entropy), after which every replica must
//! hold the same state.
//!
//! Engines are driven without a tokio runtime, so every drain runs inline
//! and the simulation is deterministic for a given seed.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::debug;

use concord_core::{ConcordResult, EntityId, EntityType, Operation, OperationDraft, OperationType, Timestamp};
use concord_runtime::{EngineConfig, PolicyConfig, SyncEngine};

use crate::chaos::{ChaosConfig, ChaosLink, ChaosStats};

/// Simulation parameters
#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub replicas: usize,
    pub entities: usize,
    /// Local edits across all replicas
    pub steps: usize,
    /// Simulated time between steps
    pub step_interval: Duration,
    pub chaos: ChaosConfig,
    pub policy: PolicyConfig,
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            replicas: 3,
            entities: 4,
            steps: 200,
            step_interval: Duration::from_millis(20),
            chaos: ChaosConfig::default(),
            policy: PolicyConfig::LastWriterWins,
            seed: 42,
        }
    }
}

impl SimulationConfig {
    pub fn with_policy(mut self, policy: PolicyConfig) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_chaos(mut self, chaos: ChaosConfig) -> Self {
        self.chaos = chaos;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Convergence check result
#[derive(Clone, Debug, PartialEq)]
pub enum ConvergenceResult {
    Converged,
    /// Entities whose value differs on at least one replica
    Diverged(Vec<EntityId>),
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }

    /// Compare materialized states entity by entity
    pub fn check(states: &[BTreeMap<EntityId, Value>]) -> Self {
        let Some((reference, rest)) = states.split_first() else {
            return ConvergenceResult::Converged;
        };

        let mut divergent: Vec<EntityId> = Vec::new();
        for state in rest {
            for id in reference.keys().chain(state.keys()) {
                if reference.get(id) != state.get(id) && !divergent.contains(id) {
                    divergent.push(id.clone());
                }
            }
        }

        if divergent.is_empty() {
            ConvergenceResult::Converged
        } else {
            divergent.sort();
            ConvergenceResult::Diverged(divergent)
        }
    }
}

/// What a simulation run produced
#[derive(Clone, Debug)]
pub struct SimulationReport {
    pub operations: usize,
    /// Network counters summed over every link
    pub network: ChaosStats,
    /// Operations a replica only received during anti-entropy
    pub repaired: usize,
    pub convergence: ConvergenceResult,
}

/// Simulated session
pub struct ReplicaSimulator {
    config: SimulationConfig,
    replicas: Vec<SyncEngine>,
    links: HashMap<(usize, usize), ChaosLink<Operation>>,
    entities: Vec<EntityId>,
    rng: StdRng,
    now: Duration,
    operations: usize,
}

impl ReplicaSimulator {
    pub fn new(config: SimulationConfig) -> ConcordResult<Self> {
        let engine_config = EngineConfig::default().with_policy(config.policy.clone());
        let replicas = (0..config.replicas)
            .map(|i| SyncEngine::new(format!("replica-{i}").as_str(), engine_config.clone()))
            .collect::<ConcordResult<Vec<_>>>()?;

        let mut links = HashMap::new();
        let mut seed = config.seed;
        for from in 0..config.replicas {
            for to in 0..config.replicas {
                if from != to {
                    seed = seed.wrapping_add(1);
                    links.insert((from, to), ChaosLink::new(config.chaos.clone(), seed));
                }
            }
        }

        let entities = (0..config.entities)
            .map(|i| EntityId::new(format!("token-{i}")))
            .collect();

        Ok(ReplicaSimulator {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            replicas,
            links,
            entities,
            now: Duration::ZERO,
            operations: 0,
        })
    }

    pub fn replicas(&self) -> &[SyncEngine] {
        &self.replicas
    }

    /// Run every step, then repair and check convergence
    pub fn run(&mut self) -> ConcordResult<SimulationReport> {
        for _ in 0..self.config.steps {
            self.step()?;
        }
        self.settle()
    }

    /// One local edit, broadcast, then one network tick
    pub fn step(&mut self) -> ConcordResult<()> {
        let author = self.rng.gen_range(0..self.replicas.len());
        let Some(entity) = self.entities.choose(&mut self.rng).cloned() else {
            return Ok(());
        };

        let draft = self.random_edit(author, entity);
        let op = self.replicas[author].apply_local_operation(draft)?;
        self.operations += 1;
        for to in 0..self.replicas.len() {
            if let Some(link) = self.links.get_mut(&(author, to)) {
                link.send(op.clone());
            }
        }

        self.deliver(self.config.step_interval)
    }

    fn random_edit(&mut self, author: usize, entity: EntityId) -> OperationDraft {
        let timestamp = Timestamp::from_millis(self.now.as_millis() as i64);
        let exists = self.replicas[author].entity(&entity).is_some();

        let draft = if !exists {
            OperationDraft::create(
                EntityType::Token,
                entity,
                json!({"x": 0, "y": 0, "hp": 10, "label": "token"}),
            )
        } else {
            match self.rng.gen_range(0..10) {
                0 => OperationDraft::delete(EntityType::Token, entity),
                1..=3 => OperationDraft::new(
                    OperationType::Move,
                    EntityType::Token,
                    entity,
                    json!({"x": self.rng.gen_range(0..50), "y": self.rng.gen_range(0..50)}),
                ),
                4 => OperationDraft::new(
                    OperationType::Transform,
                    EntityType::Token,
                    entity,
                    json!({"rotation": self.rng.gen_range(0..360)}),
                ),
                _ => OperationDraft::update(EntityType::Token, entity, self.random_fields()),
            }
        };
        draft.with_timestamp(timestamp)
    }

    fn random_fields(&mut self) -> Value {
        let mut fields = Map::new();
        if self.rng.gen_bool(0.6) {
            fields.insert("hp".into(), json!(self.rng.gen_range(0..20)));
        }
        if self.rng.gen_bool(0.4) {
            fields.insert("label".into(), json!(format!("t{}", self.rng.gen_range(0..100))));
        }
        if self.rng.gen_bool(0.2) {
            fields.insert(
                "stats".into(),
                json!({"str": self.rng.gen_range(1..20), "dex": self.rng.gen_range(1..20)}),
            );
        }
        if fields.is_empty() {
            fields.insert("hp".into(), json!(0));
        }
        Value::Object(fields)
    }

    /// Advance every link and hand delivered operations to their replica
    fn deliver(&mut self, dt: Duration) -> ConcordResult<()> {
        self.now += dt;
        let mut arrivals: Vec<(usize, Operation)> = Vec::new();
        let mut keys: Vec<(usize, usize)> = self.links.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            if let Some(link) = self.links.get_mut(&key) {
                arrivals.extend(link.tick(dt).into_iter().map(|op| (key.1, op)));
            }
        }
        for (to, op) in arrivals {
            self.replicas[to].apply_remote_operation(op)?;
        }
        Ok(())
    }

    /// Flush links, exchange full histories and compare states
    pub fn settle(&mut self) -> ConcordResult<SimulationReport> {
        let mut keys: Vec<(usize, usize)> = self.links.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let Some(link) = self.links.get_mut(&key) else {
                continue;
            };
            for op in link.flush() {
                self.replicas[key.1].apply_remote_operation(op)?;
            }
        }

        let histories: Vec<Vec<Operation>> = self
            .replicas
            .iter()
            .map(|r| r.operation_history(None))
            .collect();
        let mut repaired = 0;
        for (i, replica) in self.replicas.iter().enumerate() {
            for (j, history) in histories.iter().enumerate() {
                if i != j {
                    repaired += replica.synchronize(history.clone()).accepted;
                }
            }
        }

        let mut network = ChaosStats::default();
        for link in self.links.values() {
            network.absorb(link.stats());
        }

        let states: Vec<_> = self.replicas.iter().map(|r| r.state()).collect();
        let convergence = ConvergenceResult::check(&states);
        debug!(
            operations = self.operations,
            repaired,
            lost = network.lost,
            converged = convergence.is_converged(),
            "simulation settled"
        );

        Ok(SimulationReport {
            operations: self.operations,
            network,
            repaired,
            convergence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_state::PriorityTable;

    #[test]
    fn test_reliable_network_converges_without_repair() {
        let config = SimulationConfig::default().with_chaos(ChaosConfig::reliable());
        let report = ReplicaSimulator::new(config).unwrap().run().unwrap();
        assert_eq!(report.operations, 200);
        assert_eq!(report.repaired, 0);
        assert!(report.convergence.is_converged());
    }

    #[test]
    fn test_lww_converges_under_hostile_network() {
        let config = SimulationConfig::default().with_chaos(ChaosConfig::hostile());
        let report = ReplicaSimulator::new(config).unwrap().run().unwrap();
        assert!(report.network.lost > 0);
        assert!(report.repaired > 0);
        assert_eq!(report.convergence, ConvergenceResult::Converged);
    }

    #[test]
    fn test_merge_converges_under_poor_network() {
        for seed in [1, 2, 3] {
            let config = SimulationConfig::default()
                .with_policy(PolicyConfig::Merge)
                .with_chaos(ChaosConfig::poor())
                .with_seed(seed);
            let report = ReplicaSimulator::new(config).unwrap().run().unwrap();
            assert!(report.convergence.is_converged(), "seed {seed}: {:?}", report.convergence);
        }
    }

    #[test]
    fn test_priority_converges() {
        let table = PriorityTable::default().with_role("replica-0", "game-master");
        let config = SimulationConfig {
            replicas: 4,
            ..SimulationConfig::default()
        }
        .with_policy(PolicyConfig::Priority(table))
        .with_chaos(ChaosConfig::poor());
        let report = ReplicaSimulator::new(config).unwrap().run().unwrap();
        assert!(report.convergence.is_converged());
    }

    #[test]
    fn test_convergence_check_names_divergent_entities() {
        let a: BTreeMap<EntityId, Value> = [(EntityId::new("t1"), json!({"x": 1}))].into();
        let b: BTreeMap<EntityId, Value> = [(EntityId::new("t1"), json!({"x": 2}))].into();
        assert_eq!(
            ConvergenceResult::check(&[a.clone(), a.clone()]),
            ConvergenceResult::Converged
        );
        assert_eq!(
            ConvergenceResult::check(&[a, b]),
            ConvergenceResult::Diverged(vec![EntityId::new("t1")])
        );
    }
}
