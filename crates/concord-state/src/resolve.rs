//! Conflict resolution policies
//!
//! Every policy is a deterministic function of the incoming operation and
//! the operations it conflicts with, so each replica picks the same winner
//! no matter the order in which it saw them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_core::{ActorId, Operation, OperationType, Timestamp};

use crate::patch::compose;

/// Outcome of resolving a conflict
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// This operation (possibly with a rewritten payload) takes effect
    Winner(Operation),
    /// No synchronous decision; park until resolved externally
    Deferred,
}

/// A user-supplied resolution strategy
pub trait ResolutionStrategy: Send + Sync {
    fn resolve(&self, incoming: &Operation, conflicts: &[Operation]) -> Resolution;
}

impl<F> ResolutionStrategy for F
where
    F: Fn(&Operation, &[Operation]) -> Resolution + Send + Sync,
{
    fn resolve(&self, incoming: &Operation, conflicts: &[Operation]) -> Resolution {
        self(incoming, conflicts)
    }
}

/// Role weights for priority-based resolution
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorityTable {
    /// Actor → role name
    #[serde(default)]
    pub roles: HashMap<ActorId, String>,
    /// Role name → weight
    pub weights: HashMap<String, u32>,
    /// Weight for unknown actors or roles
    #[serde(default)]
    pub default_weight: u32,
}

impl Default for PriorityTable {
    fn default() -> Self {
        let weights = [("game-master", 100), ("player", 10), ("spectator", 1)]
            .into_iter()
            .map(|(role, w)| (role.to_string(), w))
            .collect();
        PriorityTable {
            roles: HashMap::new(),
            weights,
            default_weight: 0,
        }
    }
}

impl PriorityTable {
    /// Assign a role to an actor
    pub fn with_role(mut self, actor: impl Into<ActorId>, role: impl Into<String>) -> Self {
        self.roles.insert(actor.into(), role.into());
        self
    }

    /// Set the weight of a role
    pub fn with_weight(mut self, role: impl Into<String>, weight: u32) -> Self {
        self.weights.insert(role.into(), weight);
        self
    }

    pub fn weight(&self, actor: &ActorId) -> u32 {
        self.roles
            .get(actor)
            .and_then(|role| self.weights.get(role))
            .copied()
            .unwrap_or(self.default_weight)
    }
}

/// Conflict resolution policy
#[derive(Clone, Default)]
pub enum ConflictPolicy {
    #[default]
    LastWriterWins,
    Merge,
    Priority(PriorityTable),
    Manual,
    Custom(Arc<dyn ResolutionStrategy>),
}

impl ConflictPolicy {
    pub fn custom<S: ResolutionStrategy + 'static>(strategy: S) -> Self {
        ConflictPolicy::Custom(Arc::new(strategy))
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConflictPolicy::LastWriterWins => "last-writer-wins",
            ConflictPolicy::Merge => "merge",
            ConflictPolicy::Priority(_) => "priority",
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::Priority(table) => f.debug_tuple("Priority").field(table).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Sort key for last-writer-wins: later timestamp wins, then the
/// lexically greater actor, then the greater operation id
fn lww_key(op: &Operation) -> (Timestamp, &ActorId, &str) {
    (op.timestamp, &op.actor_id, op.id.as_str())
}

/// Winner among the incoming operation and its conflicts under LWW
pub fn last_writer_wins<'a>(incoming: &'a Operation, conflicts: &'a [Operation]) -> &'a Operation {
    std::iter::once(incoming)
        .chain(conflicts.iter())
        .max_by(|a, b| lww_key(a).cmp(&lww_key(b)))
        .unwrap_or(incoming)
}

fn mergeable(op: &Operation) -> bool {
    op.kind == OperationType::Update && op.payload.is_object()
}

/// Field-level merge of Update payloads; anything else falls back to LWW
pub fn merge(incoming: &Operation, conflicts: &[Operation]) -> Operation {
    if !mergeable(incoming) || !conflicts.iter().all(mergeable) {
        return last_writer_wins(incoming, conflicts).clone();
    }

    let mut ordered: Vec<&Operation> = std::iter::once(incoming).chain(conflicts.iter()).collect();
    ordered.sort_by(|a, b| lww_key(a).cmp(&lww_key(b)));

    let payload = ordered
        .iter()
        .fold(Value::Object(Default::default()), |acc, op| compose(&acc, &op.payload));

    let mut winner = incoming.clone();
    winner.payload = payload;
    winner
}

/// Highest role weight wins; ties fall back to LWW
pub fn priority<'a>(
    table: &PriorityTable,
    incoming: &'a Operation,
    conflicts: &'a [Operation],
) -> &'a Operation {
    std::iter::once(incoming)
        .chain(conflicts.iter())
        .max_by(|a, b| {
            table
                .weight(&a.actor_id)
                .cmp(&table.weight(&b.actor_id))
                .then_with(|| lww_key(a).cmp(&lww_key(b)))
        })
        .unwrap_or(incoming)
}

/// Applies the configured policy
#[derive(Clone, Debug, Default)]
pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        ConflictResolver { policy }
    }

    pub fn policy(&self) -> &ConflictPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// Whether the policy decides every conflict from the two operations
    /// alone. Such decisions are recomputed on every replica; manual and
    /// custom decisions are recorded instead.
    pub fn is_pairwise(&self) -> bool {
        matches!(
            self.policy,
            ConflictPolicy::LastWriterWins | ConflictPolicy::Merge | ConflictPolicy::Priority(_)
        )
    }

    /// Rank `a` against `b` under a pairwise policy; the greater one wins
    pub fn rank(&self, a: &Operation, b: &Operation) -> Option<std::cmp::Ordering> {
        match &self.policy {
            ConflictPolicy::LastWriterWins | ConflictPolicy::Merge => {
                Some(lww_key(a).cmp(&lww_key(b)))
            }
            ConflictPolicy::Priority(table) => Some(
                table
                    .weight(&a.actor_id)
                    .cmp(&table.weight(&b.actor_id))
                    .then_with(|| lww_key(a).cmp(&lww_key(b))),
            ),
            ConflictPolicy::Manual | ConflictPolicy::Custom(_) => None,
        }
    }

    /// Whether two conflicting operations both survive, with only their
    /// overlapping fields settled by rank
    pub fn coexist(&self, a: &Operation, b: &Operation) -> bool {
        matches!(self.policy, ConflictPolicy::Merge) && mergeable(a) && mergeable(b)
    }

    /// Resolve `incoming` against the operations it conflicts with
    pub fn resolve(&self, incoming: &Operation, conflicts: &[Operation]) -> Resolution {
        if conflicts.is_empty() {
            return Resolution::Winner(incoming.clone());
        }

        match &self.policy {
            ConflictPolicy::LastWriterWins => {
                Resolution::Winner(last_writer_wins(incoming, conflicts).clone())
            }
            ConflictPolicy::Merge => Resolution::Winner(merge(incoming, conflicts)),
            ConflictPolicy::Priority(table) => {
                Resolution::Winner(priority(table, incoming, conflicts).clone())
            }
            ConflictPolicy::Manual => Resolution::Deferred,
            ConflictPolicy::Custom(strategy) => strategy.resolve(incoming, conflicts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{EntityType, OperationDraft, VectorClock};
    use proptest::prelude::*;
    use serde_json::json;

    fn op(actor: &str, kind: OperationType, ts: i64, payload: Value) -> Operation {
        let actor = ActorId::from(actor);
        OperationDraft::new(kind, EntityType::Token, "t1", payload)
            .with_timestamp(Timestamp(ts))
            .stamp(actor.clone(), VectorClock::new().incremented(&actor), Timestamp(ts))
    }

    fn winner(resolution: Resolution) -> Operation {
        match resolution {
            Resolution::Winner(op) => op,
            Resolution::Deferred => panic!("expected a winner"),
        }
    }

    #[test]
    fn test_no_conflicts_incoming_wins() {
        let incoming = op("a", OperationType::Update, 1, json!({}));
        let resolver = ConflictResolver::new(ConflictPolicy::Manual);
        assert_eq!(resolver.resolve(&incoming, &[]), Resolution::Winner(incoming));
    }

    #[test]
    fn test_lww_picks_latest_timestamp() {
        let early = op("b", OperationType::Update, 10, json!({"x": 1}));
        let late = op("a", OperationType::Update, 20, json!({"x": 2}));
        let resolver = ConflictResolver::default();
        assert_eq!(winner(resolver.resolve(&early, &[late.clone()])).id, late.id);
        assert_eq!(winner(resolver.resolve(&late, &[early])).id, late.id);
    }

    #[test]
    fn test_lww_ties_break_on_actor() {
        let a = op("alice", OperationType::Update, 10, json!({}));
        let b = op("bob", OperationType::Update, 10, json!({}));
        assert_eq!(last_writer_wins(&a, &[b.clone()]).id, b.id);
        assert_eq!(last_writer_wins(&b, &[a]).id, b.id);
    }

    #[test]
    fn test_merge_disjoint_fields() {
        let a = op("a", OperationType::Update, 10, json!({"a": 1}));
        let b = op("b", OperationType::Update, 20, json!({"b": 2}));
        let merged = merge(&a, &[b]);
        assert_eq!(merged.id, a.id);
        assert_eq!(merged.payload, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_merge_leaf_collision_is_lww() {
        let a = op("a", OperationType::Update, 30, json!({"hp": 5, "pos": {"x": 1}}));
        let b = op("b", OperationType::Update, 20, json!({"hp": 9, "pos": {"y": 2}}));
        let merged = merge(&b, &[a]);
        assert_eq!(merged.payload, json!({"hp": 5, "pos": {"x": 1, "y": 2}}));
    }

    #[test]
    fn test_merge_structural_mismatch_falls_back_to_lww() {
        let update = op("a", OperationType::Update, 10, json!({"x": 1}));
        let delete = op("b", OperationType::Delete, 20, json!({}));
        let resolved = merge(&update, &[delete.clone()]);
        assert_eq!(resolved, delete);
    }

    #[test]
    fn test_priority_prefers_game_master() {
        let table = PriorityTable::default()
            .with_role("gm", "game-master")
            .with_role("p1", "player");
        let gm = op("gm", OperationType::Update, 10, json!({}));
        let player = op("p1", OperationType::Update, 99, json!({}));
        let stranger = op("zz", OperationType::Update, 500, json!({}));

        assert_eq!(priority(&table, &player, &[gm.clone(), stranger]).id, gm.id);
    }

    #[test]
    fn test_priority_ties_fall_back_to_lww() {
        let table = PriorityTable::default();
        let a = op("a", OperationType::Update, 10, json!({}));
        let b = op("b", OperationType::Update, 20, json!({}));
        assert_eq!(priority(&table, &a, &[b.clone()]).id, b.id);
    }

    #[test]
    fn test_rank_agrees_with_resolve() {
        let early = op("b", OperationType::Update, 10, json!({"x": 1}));
        let late = op("a", OperationType::Update, 20, json!({"x": 2}));
        let resolver = ConflictResolver::default();
        assert!(resolver.is_pairwise());
        assert_eq!(resolver.rank(&late, &early), Some(std::cmp::Ordering::Greater));

        let manual = ConflictResolver::new(ConflictPolicy::Manual);
        assert!(!manual.is_pairwise());
        assert_eq!(manual.rank(&late, &early), None);
    }

    #[test]
    fn test_only_updates_coexist_under_merge() {
        let a = op("a", OperationType::Update, 10, json!({"x": 1}));
        let b = op("b", OperationType::Update, 20, json!({"y": 1}));
        let d = op("b", OperationType::Delete, 20, json!({}));
        let resolver = ConflictResolver::new(ConflictPolicy::Merge);
        assert!(resolver.coexist(&a, &b));
        assert!(!resolver.coexist(&a, &d));
        assert!(!ConflictResolver::default().coexist(&a, &b));
    }

    #[test]
    fn test_manual_defers() {
        let a = op("a", OperationType::Update, 10, json!({}));
        let b = op("b", OperationType::Update, 20, json!({}));
        let resolver = ConflictResolver::new(ConflictPolicy::Manual);
        assert_eq!(resolver.resolve(&a, &[b]), Resolution::Deferred);
    }

    #[test]
    fn test_custom_strategy_closure() {
        let first_wins = |incoming: &Operation, conflicts: &[Operation]| {
            let earliest = std::iter::once(incoming)
                .chain(conflicts)
                .min_by_key(|op| op.timestamp)
                .unwrap_or(incoming);
            Resolution::Winner(earliest.clone())
        };
        let resolver = ConflictResolver::new(ConflictPolicy::custom(first_wins));
        let a = op("a", OperationType::Update, 10, json!({}));
        let b = op("b", OperationType::Update, 20, json!({}));
        assert_eq!(winner(resolver.resolve(&b, &[a.clone()])).id, a.id);
    }

    proptest! {
        #[test]
        fn prop_lww_is_deterministic(
            stamps in proptest::collection::vec((0i64..5, 0usize..3), 1..6),
            rotate in 0usize..6,
        ) {
            let actors = ["a", "b", "c"];
            let ops: Vec<Operation> = stamps
                .iter()
                .map(|(ts, actor)| op(actors[*actor], OperationType::Update, *ts, json!({})))
                .collect();

            let first = last_writer_wins(&ops[0], &ops[1..]).id.clone();
            let again = last_writer_wins(&ops[0], &ops[1..]).id.clone();
            prop_assert_eq!(&first, &again);

            let mut rotated = ops.clone();
            rotated.rotate_left(rotate % ops.len());
            let other = last_writer_wins(&rotated[0], &rotated[1..]).id.clone();
            prop_assert_eq!(first, other);
        }
    }
}
