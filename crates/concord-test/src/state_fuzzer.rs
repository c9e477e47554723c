//! Convergence fuzzer for the reconciliation pipeline
//!
//! Generates a causally consistent history from several actors who only
//! occasionally hear from each other, then feeds the complete history to
//! independent replicas in shuffled orders (with duplicates). Every replica
//! must end with the same state and the same status for every operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use concord_core::{
    ActorId, EntityId, EntityType, Operation, OperationDraft, OperationId, OperationType, Timestamp,
    VectorClock,
};
use concord_state::{ConflictPolicy, EntryStatus, Reconciler};

use crate::simulator::ConvergenceResult;

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    pub actor_count: usize,
    pub entity_count: usize,
    pub operation_count: usize,
    /// Probability that an actor catches up on part of the history before editing
    pub observe_prob: f64,
    /// Probability that an operation is delivered twice
    pub duplicate_prob: f64,
    /// Independent replicas fed the history
    pub replica_count: usize,
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            actor_count: 4,
            entity_count: 6,
            operation_count: 300,
            observe_prob: 0.3,
            duplicate_prob: 0.05,
            replica_count: 4,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            actor_count: 3,
            entity_count: 3,
            operation_count: 60,
            observe_prob: 0.5,
            duplicate_prob: 0.05,
            replica_count: 3,
            seed: 42,
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            actor_count: 8,
            entity_count: 20,
            operation_count: 3000,
            observe_prob: 0.2,
            duplicate_prob: 0.1,
            replica_count: 6,
            seed: 42,
        }
    }

    /// Few entities, rare catch-ups: nearly every edit conflicts
    pub fn adversarial() -> Self {
        FuzzerConfig {
            actor_count: 6,
            entity_count: 2,
            operation_count: 500,
            observe_prob: 0.05,
            duplicate_prob: 0.2,
            replica_count: 5,
            seed: 42,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Fuzzing result
#[derive(Debug)]
pub struct FuzzResult {
    pub convergence: ConvergenceResult,
    /// Operations whose log status differs between replicas
    pub status_mismatches: Vec<OperationId>,
    pub operations: usize,
    /// Per-replica counters from the first replica
    pub applied: usize,
    pub superseded: usize,
    pub failed: usize,
}

impl FuzzResult {
    pub fn is_valid(&self) -> bool {
        self.convergence.is_converged() && self.status_mismatches.is_empty()
    }
}

/// A fuzzed actor: its clock and which entities it believes exist
struct FuzzActor {
    id: ActorId,
    clock: VectorClock,
    seen: usize,
    live: BTreeSet<EntityId>,
}

/// Convergence fuzzer
pub struct StateFuzzer {
    config: FuzzerConfig,
    rng: StdRng,
}

impl StateFuzzer {
    pub fn new(config: FuzzerConfig) -> Self {
        StateFuzzer {
            rng: StdRng::seed_from_u64(config.seed),
            config,
        }
    }

    /// Generate a history. Actors catch up by observing a prefix of the
    /// global history, so every clock is causally consistent.
    pub fn generate(&mut self) -> Vec<Operation> {
        let mut actors: Vec<FuzzActor> = (0..self.config.actor_count.max(1))
            .map(|i| FuzzActor {
                id: ActorId::new(format!("actor-{i}")),
                clock: VectorClock::new(),
                seen: 0,
                live: BTreeSet::new(),
            })
            .collect();
        let entities: Vec<EntityId> = (0..self.config.entity_count.max(1))
            .map(|i| EntityId::new(format!("entity-{i}")))
            .collect();

        let mut history: Vec<Operation> = Vec::with_capacity(self.config.operation_count);
        for step in 0..self.config.operation_count {
            let index = self.rng.gen_range(0..actors.len());
            if self.rng.gen_bool(self.config.observe_prob) {
                let upto = self.rng.gen_range(actors[index].seen..=history.len());
                let actor = &mut actors[index];
                for op in &history[actor.seen..upto] {
                    actor.clock.merge_from(&op.vector_clock);
                    match op.kind {
                        OperationType::Create => {
                            actor.live.insert(op.entity_id.clone());
                        }
                        OperationType::Delete => {
                            actor.live.remove(&op.entity_id);
                        }
                        _ => {}
                    }
                }
                actor.seen = upto;
            }

            let entity = entities[self.rng.gen_range(0..entities.len())].clone();
            let draft = self.random_edit(&actors[index].live, entity);
            let actor = &mut actors[index];
            actor.clock.increment(&actor.id);
            match draft.kind {
                OperationType::Create => {
                    actor.live.insert(draft.entity_id.clone());
                }
                OperationType::Delete => {
                    actor.live.remove(&draft.entity_id);
                }
                _ => {}
            }
            // Coarse timestamps so ties fall through to the actor id
            let timestamp = Timestamp::from_millis((step / 3) as i64);
            history.push(draft.stamp(actor.id.clone(), actor.clock.clone(), timestamp));
        }
        history
    }

    fn random_edit(&mut self, live: &BTreeSet<EntityId>, entity: EntityId) -> OperationDraft {
        if !live.contains(&entity) {
            let hp = self.rng.gen_range(1..20);
            return OperationDraft::create(EntityType::Token, entity, json!({"x": 0, "y": 0, "hp": hp}));
        }
        match self.rng.gen_range(0..8) {
            0 => OperationDraft::delete(EntityType::Token, entity),
            1 | 2 => OperationDraft::new(
                OperationType::Move,
                EntityType::Token,
                entity,
                json!({"x": self.rng.gen_range(0..10), "y": self.rng.gen_range(0..10)}),
            ),
            3 => OperationDraft::update(EntityType::Token, entity, json!({"hp": self.rng.gen_range(0..20)})),
            4 => OperationDraft::update(
                EntityType::Token,
                entity,
                json!({"hp": self.rng.gen_range(0..20), "label": format!("l{}", self.rng.gen_range(0..5))}),
            ),
            5 => OperationDraft::update(
                EntityType::Token,
                entity,
                json!({"conditions": {"prone": self.rng.gen_bool(0.5)}}),
            ),
            6 => OperationDraft::update(EntityType::Token, entity, json!({"label": null})),
            _ => OperationDraft::new(
                OperationType::Transform,
                EntityType::Token,
                entity,
                json!({"rotation": self.rng.gen_range(0..4) * 90}),
            ),
        }
    }

    /// Shuffled delivery with duplicates
    fn delivery(&mut self, history: &[Operation]) -> Vec<Operation> {
        let mut order: Vec<Operation> = history.to_vec();
        for op in history {
            if self.rng.gen_bool(self.config.duplicate_prob) {
                order.push(op.clone());
            }
        }
        order.shuffle(&mut self.rng);
        order
    }

    /// Fuzz one policy
    pub fn run(&mut self, policy: ConflictPolicy) -> FuzzResult {
        let history = self.generate();

        let mut replicas = Vec::with_capacity(self.config.replica_count);
        for i in 0..self.config.replica_count.max(1) {
            // The first replica sees the history in causal order
            let order = if i == 0 {
                history.clone()
            } else {
                self.delivery(&history)
            };
            let mut replica = Reconciler::new(policy.clone());
            replica.process_batch(order);
            replicas.push(replica);
        }

        let states: Vec<BTreeMap<EntityId, Value>> = replicas.iter().map(|r| r.state()).collect();
        let convergence = ConvergenceResult::check(&states);

        let statuses: Vec<HashMap<&OperationId, &EntryStatus>> = replicas
            .iter()
            .map(|r| {
                r.log()
                    .entries()
                    .iter()
                    .map(|e| (&e.operation.id, &e.status))
                    .collect()
            })
            .collect();
        let status_mismatches: Vec<OperationId> = history
            .iter()
            .filter(|op| {
                let first = statuses.first().and_then(|s| s.get(&op.id));
                statuses.iter().any(|s| s.get(&op.id) != first)
            })
            .map(|op| op.id.clone())
            .collect();

        let count = |pred: fn(&EntryStatus) -> bool| {
            statuses
                .first()
                .map_or(0, |s| s.values().filter(|status| pred(status)).count())
        };

        FuzzResult {
            convergence,
            status_mismatches,
            operations: history.len(),
            applied: count(|s| matches!(s, EntryStatus::Applied)),
            superseded: count(|s| matches!(s, EntryStatus::Superseded { .. })),
            failed: count(|s| matches!(s, EntryStatus::Failed { .. })),
        }
    }
}

/// Property helpers over generated histories
pub mod properties {
    use super::*;

    /// Each actor's own counter strictly increases along its operations
    pub fn own_counters_increase(history: &[Operation]) -> bool {
        let mut last: HashMap<&ActorId, u64> = HashMap::new();
        history.iter().all(|op| {
            let seq = op.sequence();
            let ok = last.get(&op.actor_id).map_or(true, |&prev| seq > prev);
            last.insert(&op.actor_id, seq);
            ok
        })
    }

    /// Sorting by the canonical key never puts an operation before one
    /// that happened before it
    pub fn canonical_order_respects_causality(history: &[Operation]) -> bool {
        let mut sorted: Vec<&Operation> = history.iter().collect();
        sorted.sort_by_cached_key(|op| op.order_key());
        sorted.iter().enumerate().all(|(i, later)| {
            sorted[i + 1..]
                .iter()
                .all(|after| !after.vector_clock.happens_before(&later.vector_clock))
        })
    }

    pub fn merge_commutative(a: &VectorClock, b: &VectorClock) -> bool {
        a.merge(b) == b.merge(a)
    }

    pub fn merge_associative(a: &VectorClock, b: &VectorClock, c: &VectorClock) -> bool {
        a.merge(b).merge(c) == a.merge(&b.merge(c))
    }

    pub fn merge_idempotent(a: &VectorClock) -> bool {
        a.merge(a) == *a
    }
}
