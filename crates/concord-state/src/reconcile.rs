//! State reconciliation pipeline
//!
//! Every operation runs through the same stages:
//! 1. Duplicate check against the log and the pruned set
//! 2. Clock observation (the replica has now seen the operation)
//! 3. Conflict detection on the target entity
//! 4. Resolution by the configured policy
//! 5. Application to the store and append to the log
//!
//! Under a pairwise policy (last-writer-wins, merge, priority) the outcome
//! of every conflict is a function of the set of logged operations, never of
//! their arrival order: an entry loses if any concurrent, contending entry
//! outranks it, and under merge it only loses the fields an outranking
//! update also writes. Manual and custom decisions are recorded on the
//! entries they touch (pinned) and replayed as-is.
//!
//! The materialized value of an entity is always the fold of its effective
//! log entries in canonical order on top of its baseline. New entries that
//! sort last and have no rivals are applied incrementally. Anything else
//! re-ranks the entries concurrent with it and refolds the entity from the
//! earliest entry whose contribution changed, resuming at the closest fold
//! checkpoint before it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};

use serde_json::Value;
use tracing::{debug, info, warn};

use concord_core::{
    ActorId, ConcordError, EntityId, Operation, OperationId, OrderKey, Timestamp, VectorClock,
};

use crate::patch::strip_overlap;
use crate::store::transition;
use crate::{
    ConflictDetector, ConflictPolicy, ConflictResolver, EntryStatus, LogEntry, OperationLog,
    Resolution, StateSnapshot, StateStore,
};

/// Folded entries between two fold checkpoints
const CHECKPOINT_INTERVAL: usize = 64;

/// Reconciliation result for a batch of operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationResult {
    pub applied: u32,
    pub superseded: u32,
    pub deferred: u32,
    pub failed: u32,
    pub duplicates: u32,
}

/// What happened to a single operation
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// `operation` took effect; the listed log entries lost to it
    Applied {
        operation: Operation,
        superseded: Vec<OperationId>,
    },
    /// The incoming operation lost its conflict and was logged for audit
    Superseded {
        operation: Operation,
        winner: OperationId,
    },
    /// The policy could not decide; the caller must park the operation
    Deferred {
        operation: Operation,
        conflicts: Vec<Operation>,
    },
    /// Rejected by a manual resolution; logged for audit, store unchanged
    Discarded { operation: Operation },
    /// The payload could not be applied; logged for audit, store unchanged
    Failed {
        operation: Operation,
        error: ConcordError,
    },
    /// Already in the log, or pruned from it
    Duplicate,
}

/// Per-entity lookup state derived from the log
#[derive(Debug, Default, Clone)]
struct EntityIndex {
    /// Every logged operation of the entity, in canonical order
    order: BTreeMap<OrderKey, OperationId>,
    /// Join of every logged clock on the entity
    frontier: VectorClock,
    /// Folded value right after the entry at each key
    checkpoints: BTreeMap<OrderKey, Option<Value>>,
    /// Entries folded since the last checkpoint
    unchecked: usize,
}

/// Effect of re-ranking a set of entries
#[derive(Debug, Default)]
struct Ranking {
    /// Earliest entry whose contribution to the fold changed
    earliest: Option<OrderKey>,
    /// Entries that were effective and lost
    superseded: Vec<OperationId>,
}

impl Ranking {
    fn touch(&mut self, key: OrderKey) {
        self.earliest = Some(match self.earliest.take() {
            Some(earliest) => earliest.min(key),
            None => key,
        });
    }
}

/// State reconciliation engine
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: StateStore,
    log: OperationLog,
    clock: VectorClock,
    baselines: BTreeMap<EntityId, Value>,
    /// Ids of operations pruned from the log
    pruned: BTreeSet<OperationId>,
    index: HashMap<EntityId, EntityIndex>,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    retain_pre_images: bool,
}

impl Reconciler {
    pub fn new(policy: ConflictPolicy) -> Self {
        Reconciler {
            store: StateStore::new(),
            log: OperationLog::new(),
            clock: VectorClock::new(),
            baselines: BTreeMap::new(),
            pruned: BTreeSet::new(),
            index: HashMap::new(),
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(policy),
            retain_pre_images: true,
        }
    }

    /// Keep (or stop keeping) pre-images on applied log entries
    pub fn with_pre_images(mut self, retain: bool) -> Self {
        self.retain_pre_images = retain;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    pub fn policy(&self) -> &ConflictPolicy {
        self.resolver.policy()
    }

    pub fn set_policy(&mut self, policy: ConflictPolicy) {
        self.resolver.set_policy(policy);
    }

    pub fn retains_pre_images(&self) -> bool {
        self.retain_pre_images
    }

    /// Advance the local actor's counter and return the resulting clock
    pub fn tick(&mut self, actor: &ActorId) -> VectorClock {
        self.clock.increment(actor);
        self.clock.clone()
    }

    /// Whether the operation was ever processed here (logged or pruned)
    pub fn contains(&self, id: &OperationId) -> bool {
        self.log.contains(id) || self.pruned.contains(id)
    }

    /// Ids pruned from the log
    pub fn pruned(&self) -> &BTreeSet<OperationId> {
        &self.pruned
    }

    /// Explicit dependencies this replica has never processed
    pub fn missing_dependencies(&self, op: &Operation) -> Vec<OperationId> {
        op.dependencies
            .iter()
            .filter(|dep| !self.contains(dep))
            .cloned()
            .collect()
    }

    /// Process a batch of operations
    pub fn process_batch(&mut self, ops: Vec<Operation>) -> ReconciliationResult {
        let mut result = ReconciliationResult::default();

        for op in ops {
            match self.process(op) {
                ProcessOutcome::Applied { .. } => result.applied += 1,
                ProcessOutcome::Superseded { .. } | ProcessOutcome::Discarded { .. } => {
                    result.superseded += 1
                }
                ProcessOutcome::Deferred { .. } => result.deferred += 1,
                ProcessOutcome::Failed { .. } => result.failed += 1,
                ProcessOutcome::Duplicate => result.duplicates += 1,
            }
        }

        result
    }

    /// Process a single operation through the reconciliation pipeline
    pub fn process(&mut self, op: Operation) -> ProcessOutcome {
        // Stage 1: Duplicate check
        if self.contains(&op.id) {
            debug!(op = %op.id, "duplicate operation ignored");
            return ProcessOutcome::Duplicate;
        }

        // Stage 2: Observe causality
        self.clock.merge_from(&op.vector_clock);

        // Pairwise policies are settled by ranking the whole entity
        if self.resolver.is_pairwise() {
            return self.admit(op);
        }

        // Stage 3: Conflict detection
        let conflicts = self.detector.contending(&self.log, &op);
        if conflicts.is_empty() {
            return self.admit(op);
        }

        // Stage 4: Resolution
        match self.resolver.resolve(&op, &conflicts) {
            Resolution::Deferred => {
                debug!(
                    op = %op.id,
                    entity = %op.entity_id,
                    conflicts = conflicts.len(),
                    "conflict deferred"
                );
                ProcessOutcome::Deferred {
                    operation: op,
                    conflicts,
                }
            }
            // Stage 5: Apply
            Resolution::Winner(winner) => {
                debug!(
                    op = %op.id,
                    winner = %winner.id,
                    policy = self.resolver.policy().name(),
                    conflicts = conflicts.len(),
                    "conflict resolved"
                );
                self.settle(op, winner, conflicts)
            }
        }
    }

    /// Finish an operation previously returned as [`ProcessOutcome::Deferred`].
    ///
    /// `Some(winner)` settles it against its current conflicts; `None`
    /// discards it (it is still logged for audit).
    pub fn resolve_deferred(&mut self, op: Operation, winner: Option<Operation>) -> ProcessOutcome {
        if self.contains(&op.id) {
            return ProcessOutcome::Duplicate;
        }
        self.clock.merge_from(&op.vector_clock);
        match winner {
            Some(winner) => {
                let conflicts = self.detector.contending(&self.log, &op);
                self.settle(op, winner, conflicts)
            }
            None => {
                debug!(op = %op.id, "deferred operation discarded");
                self.record(LogEntry::with_status(op.clone(), EntryStatus::Discarded).pin());
                ProcessOutcome::Discarded { operation: op }
            }
        }
    }

    /// Append to the log and index the entry
    fn record(&mut self, entry: LogEntry) -> bool {
        if self.log.contains(&entry.operation.id) {
            return false;
        }
        let op = &entry.operation;
        let index = self.index.entry(op.entity_id.clone()).or_default();
        index.order.insert(op.order_key(), op.id.clone());
        index.frontier.merge_from(&op.vector_clock);
        self.log.append(entry)
    }

    /// Rebuild every entity index from the log. Checkpoints are dropped.
    fn reindex(&mut self) {
        self.index.clear();
        for entry in self.log.entries() {
            let op = &entry.operation;
            let index = self.index.entry(op.entity_id.clone()).or_default();
            index.order.insert(op.order_key(), op.id.clone());
            index.frontier.merge_from(&op.vector_clock);
        }
    }

    /// Append an operation the policy settles by itself
    fn admit(&mut self, op: Operation) -> ProcessOutcome {
        let entity = op.entity_id.clone();

        if !self.has_rivals(&op) && self.sorts_last(&op) {
            let key = op.order_key();
            let outcome = match self.store.apply(&op, &op.payload) {
                Ok(applied) => {
                    let mut entry = LogEntry::applied(op.clone());
                    if self.retain_pre_images {
                        entry.pre_image = applied.pre_image;
                    }
                    self.record(entry);
                    debug!(op = %op.id, entity = %entity, kind = %op.kind, "operation applied");
                    ProcessOutcome::Applied {
                        operation: op,
                        superseded: Vec::new(),
                    }
                }
                Err(error) => {
                    warn!(op = %op.id, entity = %entity, %error, "operation failed to apply");
                    self.record(LogEntry::with_status(
                        op.clone(),
                        EntryStatus::Failed {
                            reason: failure_reason(&error),
                        },
                    ));
                    ProcessOutcome::Failed {
                        operation: op,
                        error,
                    }
                }
            };
            self.extend_checkpoints(&entity, key);
            return outcome;
        }

        self.record(LogEntry::applied(op.clone()));
        let key = op.order_key();
        let (from, superseded) = if self.resolver.is_pairwise() {
            let ranking = self.rerank_around(&op);
            if !ranking.superseded.is_empty() || ranking.earliest.is_some() {
                debug!(
                    op = %op.id,
                    entity = %entity,
                    policy = self.resolver.policy().name(),
                    "conflict settled by policy"
                );
            }
            let from = ranking.earliest.map_or(key.clone(), |earliest| earliest.min(key));
            let mut superseded = ranking.superseded;
            superseded.retain(|id| id != &op.id);
            (from, superseded)
        } else {
            (key, Vec::new())
        };
        self.refold_from(&entity, Some(&from));
        self.outcome(&op, superseded)
    }

    /// Record a decision made by a manual or custom resolution
    fn settle(&mut self, incoming: Operation, winner: Operation, conflicts: Vec<Operation>) -> ProcessOutcome {
        // The incoming operation wins, possibly with a rewritten payload
        if winner.id == incoming.id {
            let before = self.effective_ids(&[&incoming.entity_id]);
            let effect = (winner.payload != incoming.payload).then_some(winner.payload);
            self.pin_losers(&conflicts, &incoming.id);
            let mut entry = LogEntry::applied(incoming.clone()).pin();
            entry.effect = effect;
            self.record(entry);
            self.refold(&incoming.entity_id);
            let superseded = self.lost_since(&before);
            return self.outcome(&incoming, superseded);
        }

        // An operation already in the log wins
        if conflicts.iter().any(|c| c.id == winner.id) || self.contains(&winner.id) {
            self.record(
                LogEntry::with_status(
                    incoming.clone(),
                    EntryStatus::Superseded {
                        by: winner.id.clone(),
                    },
                )
                .pin(),
            );
            return ProcessOutcome::Superseded {
                operation: incoming,
                winner: winner.id,
            };
        }

        // A brand-new operation replaces the incoming one and its conflicts
        if let Err(error) = winner.validate() {
            warn!(op = %incoming.id, %error, "resolution produced an invalid operation");
            self.record(
                LogEntry::with_status(
                    incoming.clone(),
                    EntryStatus::Failed {
                        reason: failure_reason(&error),
                    },
                )
                .pin(),
            );
            return ProcessOutcome::Failed {
                operation: incoming,
                error,
            };
        }

        let before = self.effective_ids(&[&incoming.entity_id, &winner.entity_id]);
        self.clock.merge_from(&winner.vector_clock);
        self.record(
            LogEntry::with_status(
                incoming.clone(),
                EntryStatus::Superseded {
                    by: winner.id.clone(),
                },
            )
            .pin(),
        );
        self.pin_losers(&conflicts, &winner.id);
        self.record(LogEntry::applied(winner.clone()).pin());
        if incoming.entity_id != winner.entity_id {
            self.refold(&incoming.entity_id);
        }
        self.refold(&winner.entity_id);

        let mut superseded = self.lost_since(&before);
        superseded.push(incoming.id);
        self.outcome(&winner, superseded)
    }

    /// Mark conflicting entries as losers of a recorded decision
    fn pin_losers(&mut self, conflicts: &[Operation], by: &OperationId) {
        for conflict in conflicts {
            if let Some(entry) = self.log.get_mut(&conflict.id) {
                if entry.is_effective() {
                    entry.status = EntryStatus::Superseded { by: by.clone() };
                    entry.effect = None;
                    entry.pre_image = None;
                    entry.pinned = true;
                }
            }
        }
    }

    /// Effective entries of the given entities, in log order
    fn effective_ids(&self, entities: &[&EntityId]) -> Vec<OperationId> {
        let mut ids = Vec::new();
        for entity in entities.iter().copied().collect::<BTreeSet<_>>() {
            ids.extend(
                self.log
                    .entries_for(entity)
                    .filter(|e| e.is_effective())
                    .map(|e| e.operation.id.clone()),
            );
        }
        ids
    }

    /// Which of `before` have been superseded since
    fn lost_since(&self, before: &[OperationId]) -> Vec<OperationId> {
        before
            .iter()
            .filter(|id| {
                self.log
                    .get(id)
                    .is_some_and(|e| matches!(e.status, EntryStatus::Superseded { .. }))
            })
            .cloned()
            .collect()
    }

    /// Outcome of a logged operation, read back from its entry
    fn outcome(&self, op: &Operation, superseded: Vec<OperationId>) -> ProcessOutcome {
        let Some(entry) = self.log.get(&op.id) else {
            return ProcessOutcome::Duplicate;
        };
        match &entry.status {
            EntryStatus::Applied => {
                debug!(op = %op.id, entity = %op.entity_id, kind = %op.kind, "operation applied");
                ProcessOutcome::Applied {
                    operation: op.clone(),
                    superseded,
                }
            }
            EntryStatus::Superseded { by } => ProcessOutcome::Superseded {
                operation: op.clone(),
                winner: by.clone(),
            },
            EntryStatus::Failed { reason } => {
                warn!(op = %op.id, entity = %op.entity_id, %reason, "operation failed to apply");
                ProcessOutcome::Failed {
                    operation: op.clone(),
                    error: ConcordError::Apply {
                        operation: op.id.clone(),
                        entity: op.entity_id.clone(),
                        reason: reason.clone(),
                    },
                }
            }
            EntryStatus::Discarded => ProcessOutcome::Discarded {
                operation: op.clone(),
            },
        }
    }

    /// Whether `op` conflicts with any entry that takes part in ranking
    fn has_rivals(&self, op: &Operation) -> bool {
        // Nothing logged on the entity is concurrent with an operation that
        // has seen all of it
        let seen_all = self
            .index
            .get(&op.entity_id)
            .map_or(true, |index| op.vector_clock.dominates(&index.frontier));
        if seen_all {
            return false;
        }

        self.log
            .entries_for(&op.entity_id)
            .filter(|e| ranks(e))
            .any(|e| {
                ConflictDetector::conflicts(op, &e.operation)
                    && ConflictDetector::contends(op, &e.operation)
            })
    }

    /// Whether `op` sorts after every entry the entity's fold contains
    fn sorts_last(&self, op: &Operation) -> bool {
        let Some(index) = self.index.get(&op.entity_id) else {
            return true;
        };
        let key = op.order_key();
        index
            .order
            .range((Excluded(&key), Unbounded))
            .all(|(_, id)| self.log.get(id).map_or(true, |e| !folds(e)))
    }

    /// Count a folded tail entry and checkpoint the store value when due
    fn extend_checkpoints(&mut self, entity: &EntityId, key: OrderKey) {
        let Some(index) = self.index.get_mut(entity) else {
            return;
        };
        index.unchecked += 1;
        if index.unchecked >= CHECKPOINT_INTERVAL {
            index.checkpoints.insert(key, self.store.get(entity).cloned());
            index.unchecked = 0;
        }
    }

    /// Re-rank and refold one entity from scratch
    fn refold(&mut self, entity: &EntityId) {
        if self.resolver.is_pairwise() {
            self.rank(entity);
        }
        self.refold_from(entity, None);
    }

    /// Refold one entity from the entry at `from` (the whole history when
    /// `None`), resuming at the closest checkpoint before it
    fn refold_from(&mut self, entity: &EntityId, from: Option<&OrderKey>) {
        let index = self.index.entry(entity.clone()).or_default();
        match from {
            Some(from) => {
                index.checkpoints.split_off(from);
            }
            None => index.checkpoints.clear(),
        }

        let (resume, mut value) = match index.checkpoints.last_key_value() {
            Some((key, value)) => (Some(key.clone()), value.clone()),
            None => (None, self.baselines.get(entity).cloned()),
        };
        let tail: Vec<(OrderKey, OperationId)> = match &resume {
            Some(key) => index.order.range((Excluded(key), Unbounded)),
            None => index.order.range::<OrderKey, _>(..),
        }
        .map(|(key, id)| (key.clone(), id.clone()))
        .collect();

        let retain = self.retain_pre_images;
        let mut unchecked = 0;
        for (key, id) in tail {
            let Some(entry) = self.log.get_mut(&id) else {
                continue;
            };
            if !folds(entry) {
                continue;
            }
            match transition(value.as_ref(), &entry.operation, entry.effective_payload()) {
                Ok(t) => {
                    entry.status = EntryStatus::Applied;
                    entry.pre_image = if retain { t.pre_image } else { None };
                    if t.changed {
                        value = t.next;
                    }
                }
                Err(error) => {
                    debug!(op = %id, %error, "entry failed during refold");
                    entry.status = EntryStatus::Failed {
                        reason: failure_reason(&error),
                    };
                    entry.pre_image = None;
                }
            }

            unchecked += 1;
            if unchecked >= CHECKPOINT_INTERVAL {
                index.checkpoints.insert(key, value.clone());
                unchecked = 0;
            }
        }
        index.unchecked = unchecked;
        self.store.put(entity.clone(), value);
    }

    /// Recompute the status and effect of every unpinned entry of an entity
    fn rank(&mut self, entity: &EntityId) -> Ranking {
        let contested: Vec<OperationId> = self
            .log
            .entries_for(entity)
            .filter(|e| !e.pinned && e.status != EntryStatus::Discarded)
            .map(|e| e.operation.id.clone())
            .collect();
        self.decide(entity, &contested)
    }

    /// Re-rank a freshly logged operation and the entries it contests.
    ///
    /// Only entries concurrent with `op` gain a rival, so every other
    /// decision stands.
    fn rerank_around(&mut self, op: &Operation) -> Ranking {
        let contested: Vec<OperationId> = std::iter::once(op.id.clone())
            .chain(
                self.log
                    .entries_for(&op.entity_id)
                    .filter(|e| !e.pinned && e.status != EntryStatus::Discarded)
                    .filter(|e| {
                        ConflictDetector::conflicts(op, &e.operation)
                            && ConflictDetector::contends(op, &e.operation)
                    })
                    .map(|e| e.operation.id.clone()),
            )
            .collect();
        self.decide(&op.entity_id, &contested)
    }

    /// Settle each contested entry against the entity's ranking candidates
    fn decide(&mut self, entity: &EntityId, contested: &[OperationId]) -> Ranking {
        let decisions: Vec<(OperationId, Option<OperationId>, Option<Value>)> = {
            let candidates: Vec<&Operation> = self
                .log
                .entries_for(entity)
                .filter(|e| ranks(e))
                .map(|e| &e.operation)
                .collect();
            contested
                .iter()
                .filter_map(|id| self.log.get(id))
                .map(|e| {
                    let (beaten_by, effect) = self.contest(&e.operation, &candidates);
                    (e.operation.id.clone(), beaten_by, effect)
                })
                .collect()
        };

        let mut ranking = Ranking::default();
        for (id, beaten_by, effect) in decisions {
            let Some(entry) = self.log.get_mut(&id) else {
                continue;
            };
            let was_effective = entry.is_effective();
            let was_folded = folds(entry);
            let old_effect = entry.effect.clone();

            match beaten_by {
                Some(by) => {
                    entry.status = EntryStatus::Superseded { by };
                    entry.effect = None;
                    entry.pre_image = None;
                    if was_effective {
                        ranking.superseded.push(id);
                    }
                }
                None => {
                    // Provisional; the fold decides between applied and failed
                    if !entry.is_effective() && !folds(entry) {
                        entry.status = EntryStatus::Applied;
                    }
                    entry.effect = effect;
                }
            }

            if folds(entry) != was_folded || entry.effect != old_effect {
                ranking.touch(entry.operation.order_key());
            }
        }
        ranking
    }

    /// Rank `op` against every rival. Returns the strongest rival that
    /// replaces it, or the payload left over once outranking merges took
    /// their fields.
    fn contest(&self, op: &Operation, candidates: &[&Operation]) -> (Option<OperationId>, Option<Value>) {
        let mut beaten_by: Option<&Operation> = None;
        let mut effect: Option<Value> = None;

        for &other in candidates {
            if other.id == op.id
                || !ConflictDetector::conflicts(op, other)
                || !ConflictDetector::contends(op, other)
                || self.resolver.rank(other, op) != Some(Ordering::Greater)
            {
                continue;
            }
            if self.resolver.coexist(op, other) {
                let patch = effect.get_or_insert_with(|| op.payload.clone());
                strip_overlap(patch, &other.payload);
            } else if beaten_by
                .map_or(true, |best| self.resolver.rank(other, best) == Some(Ordering::Greater))
            {
                beaten_by = Some(other);
            }
        }

        match beaten_by {
            Some(winner) => (Some(winner.id.clone()), None),
            None => (None, effect.filter(|e| e != &op.payload)),
        }
    }

    fn fold<'a>(base: Option<Value>, entries: impl Iterator<Item = &'a LogEntry>) -> Option<Value> {
        let mut ordered: Vec<&LogEntry> = entries.collect();
        ordered.sort_by_cached_key(|e| e.operation.order_key());

        ordered.into_iter().fold(base, |value, entry| {
            match transition(value.as_ref(), &entry.operation, entry.effective_payload()) {
                Ok(t) if t.changed => t.next,
                _ => value,
            }
        })
    }

    /// Get an entity value
    pub fn entity(&self, id: &EntityId) -> Option<Value> {
        self.store.get(id).cloned()
    }

    /// Full copy of the materialized state
    pub fn state(&self) -> BTreeMap<EntityId, Value> {
        self.store.snapshot()
    }

    /// Prune log entries older than `cutoff`.
    ///
    /// Per entity, only the canonical-order prefix of effective entries that
    /// are all older than the cutoff is removed; its folded value becomes the
    /// entity's baseline so later refolds stay exact. Superseded, failed and
    /// discarded entries older than the cutoff are always removed. Remaining
    /// entries that were ranked against a removed one are pinned, so the
    /// store is never rewound. Removed ids are remembered so a redelivery is
    /// still recognised as a duplicate.
    pub fn prune_before(&mut self, cutoff: Timestamp) -> usize {
        let entities: BTreeSet<EntityId> = self
            .log
            .entries()
            .iter()
            .map(|e| e.operation.entity_id.clone())
            .collect();

        let mut removable = HashSet::new();
        for entity in entities {
            let mut effective: Vec<&LogEntry> = self
                .log
                .entries_for(&entity)
                .filter(|e| e.is_effective())
                .collect();
            effective.sort_by_cached_key(|e| e.operation.order_key());

            let prefix: Vec<&LogEntry> = effective
                .into_iter()
                .take_while(|e| e.operation.timestamp < cutoff)
                .collect();
            if prefix.is_empty() {
                continue;
            }

            let base = Self::fold(self.baselines.get(&entity).cloned(), prefix.iter().copied());
            removable.extend(prefix.iter().map(|e| e.operation.id.clone()));
            match base {
                Some(value) => {
                    self.baselines.insert(entity, value);
                }
                None => {
                    self.baselines.remove(&entity);
                }
            }
        }

        let removed_ops: Vec<Operation> = self
            .log
            .entries()
            .iter()
            .filter(|e| {
                removable.contains(&e.operation.id)
                    || (!e.is_effective() && e.operation.timestamp < cutoff)
            })
            .map(|e| e.operation.clone())
            .collect();
        if removed_ops.is_empty() {
            return 0;
        }

        let removed_ids: HashSet<OperationId> = removed_ops.iter().map(|o| o.id.clone()).collect();
        let frozen: Vec<OperationId> = self
            .log
            .entries()
            .iter()
            .filter(|e| !removed_ids.contains(&e.operation.id))
            .filter(|e| removed_ops.iter().any(|r| ConflictDetector::conflicts(&e.operation, r)))
            .map(|e| e.operation.id.clone())
            .collect();
        for id in frozen {
            if let Some(entry) = self.log.get_mut(&id) {
                entry.pinned = true;
            }
        }

        let removed = self.log.remove_where(|e| removed_ids.contains(&e.operation.id));
        self.pruned.extend(removed_ids);
        self.reindex();
        info!(removed, %cutoff, "pruned operation log");
        removed
    }

    /// Deep copy of clock, state, log and pruned ids
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(
            self.clock.clone(),
            self.store.snapshot(),
            self.log.entries().to_vec(),
            self.baselines.clone(),
        )
        .with_pruned(self.pruned.clone())
    }

    /// Replace clock, state and log with a snapshot.
    ///
    /// The local actor's counter never moves backwards, so operations
    /// stamped after the restore cannot reuse a sequence number.
    pub fn restore(&mut self, snapshot: &StateSnapshot, local: &ActorId) {
        let own = self.clock.get(local);
        self.store = StateStore::from_entities(snapshot.entities.clone());
        self.log = OperationLog::from_entries(snapshot.operations.clone());
        self.baselines = snapshot.baselines.clone();
        self.pruned = snapshot.pruned.clone();
        self.clock = snapshot.vector_clock.clone();
        self.clock.observe(local, own);
        self.reindex();
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ConflictPolicy::default())
    }
}

/// Takes part in the fold: applied, or failed in an earlier fold
fn folds(entry: &LogEntry) -> bool {
    match entry.status {
        EntryStatus::Applied => true,
        EntryStatus::Failed { .. } => !entry.pinned,
        EntryStatus::Superseded { .. } | EntryStatus::Discarded => false,
    }
}

/// Can outrank other entries. Losers of a recorded decision never do.
fn ranks(entry: &LogEntry) -> bool {
    match entry.status {
        EntryStatus::Applied => true,
        EntryStatus::Discarded => false,
        EntryStatus::Superseded { .. } | EntryStatus::Failed { .. } => !entry.pinned,
    }
}

fn failure_reason(error: &ConcordError) -> String {
    match error {
        ConcordError::Apply { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriorityTable;
    use concord_core::{EntityType, OperationDraft, OperationType};
    use proptest::prelude::*;
    use serde_json::json;

    struct Actor {
        id: ActorId,
        clock: VectorClock,
    }

    impl Actor {
        fn new(name: &str) -> Self {
            Actor {
                id: ActorId::from(name),
                clock: VectorClock::new(),
            }
        }

        fn op(&mut self, kind: OperationType, payload: Value, ts: i64) -> Operation {
            self.clock.increment(&self.id);
            OperationDraft::new(kind, EntityType::Token, "T", payload)
                .with_timestamp(Timestamp(ts))
                .stamp(self.id.clone(), self.clock.clone(), Timestamp(ts))
        }

        fn observe(&mut self, op: &Operation) {
            self.clock.merge_from(&op.vector_clock);
        }
    }

    fn scenario() -> (Operation, Operation, Operation) {
        let mut a = Actor::new("A");
        let mut b = Actor::new("B");
        let create = a.op(OperationType::Create, json!({"x": 0, "y": 0}), 1_000);
        let a_update = a.op(OperationType::Update, json!({"y": 9}), 2_000);
        let b_update = b.op(OperationType::Update, json!({"x": 5}), 3_000);
        (create, a_update, b_update)
    }

    fn run(policy: ConflictPolicy, ops: &[Operation]) -> Reconciler {
        let mut replica = Reconciler::new(policy);
        replica.process_batch(ops.to_vec());
        replica
    }

    #[test]
    fn test_reconciliation_basic() {
        let (create, _, _) = scenario();
        let mut replica = Reconciler::default();
        let result = replica.process_batch(vec![create]);
        assert_eq!(result.applied, 1);
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 0, "y": 0})));
    }

    #[test]
    fn test_merge_scenario_converges_in_any_order() {
        let (create, a_update, b_update) = scenario();
        let orders = [
            vec![create.clone(), a_update.clone(), b_update.clone()],
            vec![b_update.clone(), create.clone(), a_update.clone()],
            vec![create.clone(), b_update.clone(), a_update.clone()],
            vec![b_update, a_update, create],
        ];
        for order in orders {
            let replica = run(ConflictPolicy::Merge, &order);
            assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 5, "y": 9})));
        }
    }

    #[test]
    fn test_lww_scenario_discards_losing_update() {
        let (create, a_update, b_update) = scenario();
        let orders = [
            vec![create.clone(), a_update.clone(), b_update.clone()],
            vec![b_update.clone(), create.clone(), a_update.clone()],
            vec![create.clone(), b_update.clone(), a_update.clone()],
        ];
        for order in orders {
            let replica = run(ConflictPolicy::LastWriterWins, &order);
            assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 5, "y": 0})));
            let loser = replica.log().get(&a_update.id).unwrap();
            assert!(matches!(loser.status, EntryStatus::Superseded { .. }));
        }
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let (create, _, _) = scenario();
        let mut replica = Reconciler::default();
        let result = replica.process_batch(vec![create.clone(), create]);
        assert_eq!(result.applied, 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(replica.log().len(), 1);
    }

    #[test]
    fn test_remote_clock_is_observed() {
        let (_, _, b_update) = scenario();
        let mut replica = Reconciler::default();
        replica.process(b_update);
        let local = ActorId::from("C");
        let clock = replica.tick(&local);
        assert_eq!(clock.get(&ActorId::from("B")), 1);
        assert_eq!(clock.get(&local), 1);
    }

    #[test]
    fn test_apply_error_is_logged_and_state_unchanged() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 0}), 1);
        let bad = a.op(OperationType::Update, json!("oops"), 2);
        let mut replica = Reconciler::default();
        replica.process(create);

        let outcome = replica.process(bad.clone());
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 0})));
        assert!(matches!(
            replica.log().get(&bad.id).unwrap().status,
            EntryStatus::Failed { .. }
        ));
    }

    #[test]
    fn test_manual_policy_defers_and_resolves() {
        let (create, a_update, b_update) = scenario();
        let mut replica = Reconciler::new(ConflictPolicy::Manual);
        replica.process(create);
        replica.process(a_update.clone());

        let ProcessOutcome::Deferred { operation, conflicts } = replica.process(b_update.clone()) else {
            panic!("expected deferral");
        };
        assert_eq!(conflicts, vec![a_update.clone()]);
        assert!(!replica.contains(&b_update.id));

        let outcome = replica.resolve_deferred(operation, Some(b_update.clone()));
        assert!(matches!(outcome, ProcessOutcome::Applied { .. }));
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 5, "y": 0})));
    }

    #[test]
    fn test_manual_discard_keeps_audit_entry() {
        let (create, a_update, b_update) = scenario();
        let mut replica = Reconciler::new(ConflictPolicy::Manual);
        replica.process_batch(vec![create, a_update]);
        replica.process(b_update.clone());

        let outcome = replica.resolve_deferred(b_update.clone(), None);
        assert!(matches!(outcome, ProcessOutcome::Discarded { .. }));
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 0, "y": 9})));
        assert_eq!(replica.log().get(&b_update.id).unwrap().status, EntryStatus::Discarded);
    }

    #[test]
    fn test_out_of_order_create_is_refolded() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 0}), 1);
        let update = a.op(OperationType::Update, json!({"x": 1}), 2);
        let replica = run(ConflictPolicy::LastWriterWins, &[update, create]);
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 1})));
    }

    #[test]
    fn test_pre_images_can_be_disabled() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 0}), 1);
        let update = a.op(OperationType::Update, json!({"x": 1}), 2);
        let mut replica = Reconciler::default().with_pre_images(false);
        replica.process_batch(vec![create, update.clone()]);
        assert_eq!(replica.log().get(&update.id).unwrap().pre_image, None);
    }

    #[test]
    fn test_prune_keeps_state_and_refolds_from_baseline() {
        let mut a = Actor::new("A");
        let mut b = Actor::new("B");
        let create = a.op(OperationType::Create, json!({"x": 0, "y": 0}), 1_000);
        let old = a.op(OperationType::Update, json!({"y": 1}), 2_000);
        let mut replica = run(ConflictPolicy::Merge, &[create, old]);

        let removed = replica.prune_before(Timestamp(5_000));
        assert_eq!(removed, 2);
        assert!(replica.log().is_empty());
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 0, "y": 1})));

        // A late update concurrent with nothing left in the log still lands
        // on the pruned baseline.
        let late = b.op(OperationType::Update, json!({"x": 7}), 6_000);
        replica.process(late);
        replica.refold(&"T".into());
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 7, "y": 1})));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let (create, a_update, b_update) = scenario();
        let original = run(ConflictPolicy::Merge, &[create, a_update, b_update]);
        let snapshot = original.snapshot();

        let mut fresh = Reconciler::new(ConflictPolicy::Merge);
        fresh.restore(&snapshot, &ActorId::from("C"));
        assert_eq!(fresh.state(), original.state());
        assert_eq!(fresh.log().history(None), original.log().history(None));
        assert_eq!(fresh.clock(), original.clock());
    }

    /// A1 and A2 are causally ordered, B1 is concurrent with both.
    fn interleaved() -> Vec<Operation> {
        let mut a = Actor::new("A");
        let mut b = Actor::new("B");
        let create = a.op(OperationType::Create, json!({"x": 0, "y": 0, "z": 0}), 1);
        b.observe(&create);
        let a1 = a.op(OperationType::Update, json!({"x": 1, "z": 1}), 10);
        let b1 = b.op(OperationType::Update, json!({"x": 2, "y": 2}), 20);
        let a2 = a.op(OperationType::Update, json!({"y": 3}), 30);
        vec![create, a1, b1, a2]
    }

    #[test]
    fn test_lww_outcome_ignores_arrival_order() {
        let ops = interleaved();
        let in_order = run(ConflictPolicy::LastWriterWins, &ops);
        let reordered = run(
            ConflictPolicy::LastWriterWins,
            &[ops[0].clone(), ops[1].clone(), ops[3].clone(), ops[2].clone()],
        );

        // B1 outranks A1 but loses to A2
        assert_eq!(in_order.entity(&"T".into()), Some(json!({"x": 0, "y": 3, "z": 0})));
        assert_eq!(reordered.state(), in_order.state());
        for op in &ops {
            assert_eq!(
                reordered.log().get(&op.id).map(|e| &e.status),
                in_order.log().get(&op.id).map(|e| &e.status)
            );
        }
    }

    #[test]
    fn test_merge_keeps_fields_nobody_outranks() {
        let ops = interleaved();
        let replica = run(ConflictPolicy::Merge, &ops);
        // x from B1 (outranks A1), y from A2 (outranks B1), z only A1 wrote
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 2, "y": 3, "z": 1})));

        let a1 = replica.log().get(&ops[1].id).unwrap();
        assert!(a1.is_effective());
        assert_eq!(a1.effect, Some(json!({"z": 1})));
    }

    #[test]
    fn test_late_loser_is_superseded_on_arrival() {
        let ops = interleaved();
        let mut replica = run(ConflictPolicy::LastWriterWins, &[ops[0].clone(), ops[2].clone()]);

        let outcome = replica.process(ops[1].clone());
        assert_eq!(
            outcome,
            ProcessOutcome::Superseded {
                operation: ops[1].clone(),
                winner: ops[2].id.clone(),
            }
        );

        let ProcessOutcome::Applied { superseded, .. } = replica.process(ops[3].clone()) else {
            panic!("expected A2 to apply");
        };
        assert_eq!(superseded, vec![ops[2].id.clone()]);
    }

    #[test]
    fn test_priority_outranks_recency() {
        let table = PriorityTable::default().with_role("A", "game-master");
        let ops = interleaved();
        let replica = run(ConflictPolicy::Priority(table), &ops);
        assert!(replica.log().get(&ops[2].id).is_some_and(|e| !e.is_effective()));
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 1, "y": 3, "z": 1})));
    }

    #[test]
    fn test_concurrent_delete_outranked_by_update() {
        let mut a = Actor::new("A");
        let mut b = Actor::new("B");
        let create = a.op(OperationType::Create, json!({"x": 0}), 1);
        b.observe(&create);
        let delete = a.op(OperationType::Delete, json!({}), 5);
        let update = b.op(OperationType::Update, json!({"x": 4}), 9);

        for order in [
            vec![create.clone(), delete.clone(), update.clone()],
            vec![create.clone(), update.clone(), delete.clone()],
        ] {
            let replica = run(ConflictPolicy::LastWriterWins, &order);
            assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 4})));
        }
    }

    #[test]
    fn test_pruned_operation_redelivered_is_duplicate() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 1}), 1_000);
        let update = a.op(OperationType::Update, json!({"x": 2}), 2_000);
        let mut replica = run(ConflictPolicy::LastWriterWins, &[create.clone(), update.clone()]);

        assert_eq!(replica.prune_before(Timestamp(5_000)), 2);
        assert!(replica.contains(&create.id));

        assert_eq!(replica.process(create.clone()), ProcessOutcome::Duplicate);
        assert_eq!(replica.resolve_deferred(update, None), ProcessOutcome::Duplicate);
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 2})));
        assert!(replica.log().is_empty());
    }

    #[test]
    fn test_dependency_on_pruned_operation_is_satisfied() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 1}), 1_000);
        let mut replica = run(ConflictPolicy::LastWriterWins, &[create.clone()]);
        replica.prune_before(Timestamp(5_000));

        let mut dependent = a.op(OperationType::Update, json!({"x": 3}), 6_000);
        dependent.dependencies = vec![create.id.clone()];
        assert!(replica.missing_dependencies(&dependent).is_empty());
        assert!(matches!(replica.process(dependent), ProcessOutcome::Applied { .. }));
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 3})));
    }

    #[test]
    fn test_snapshot_carries_pruned_ids() {
        let mut a = Actor::new("A");
        let create = a.op(OperationType::Create, json!({"x": 1}), 1_000);
        let mut original = run(ConflictPolicy::Merge, &[create.clone()]);
        original.prune_before(Timestamp(5_000));

        let wire = original.snapshot().to_json().unwrap();
        let snapshot = StateSnapshot::from_json(&wire).unwrap();
        assert!(snapshot.pruned.contains(&create.id));

        let mut fresh = Reconciler::new(ConflictPolicy::Merge);
        fresh.restore(&snapshot, &ActorId::from("C"));
        assert_eq!(fresh.process(create), ProcessOutcome::Duplicate);
        assert_eq!(fresh.state(), original.state());
    }

    /// A long run by A, one edit by B that only saw the create, then more
    /// edits by A that have not seen B's
    fn long_history_with_rival(len: usize) -> Vec<Operation> {
        let mut a = Actor::new("A");
        let mut b = Actor::new("B");
        let create = a.op(OperationType::Create, json!({"x": 0, "y": 0, "n": 0}), 0);
        b.observe(&create);
        let mut ops = vec![create];
        for i in 1..=len {
            ops.push(a.op(OperationType::Update, json!({"n": i, "x": i % 7}), i as i64 * 10));
        }
        ops.push(b.op(OperationType::Update, json!({"x": 100, "y": 100}), len as i64 * 5));
        for i in 1..=len / 4 {
            let ts = (len + i) as i64 * 10;
            ops.push(a.op(OperationType::Update, json!({"y": i}), ts));
        }
        ops
    }

    #[test]
    fn test_incremental_refold_matches_full_refold() {
        for policy in [ConflictPolicy::LastWriterWins, ConflictPolicy::Merge] {
            let ops = long_history_with_rival(300);
            let mut replica = run(policy.clone(), &ops);
            let incremental = replica.state();
            let statuses: Vec<EntryStatus> =
                replica.log().entries().iter().map(|e| e.status.clone()).collect();

            replica.refold(&"T".into());
            assert_eq!(replica.state(), incremental, "{policy:?}");
            let refolded: Vec<EntryStatus> =
                replica.log().entries().iter().map(|e| e.status.clone()).collect();
            assert_eq!(refolded, statuses, "{policy:?}");

            let mut reversed = ops.clone();
            reversed.reverse();
            assert_eq!(run(policy.clone(), &reversed).state(), incremental, "{policy:?}");
        }
    }

    #[test]
    fn test_rival_in_long_history_splits_it_by_timestamp() {
        let ops = long_history_with_rival(300);
        let replica = run(ConflictPolicy::LastWriterWins, &ops);
        // B's edit lands mid-history by timestamp and loses to A's later
        // edits; A's earlier edits are outranked by B
        let b_edit = &ops[301];
        assert!(matches!(
            replica.log().get(&b_edit.id).unwrap().status,
            EntryStatus::Superseded { .. }
        ));
        assert!(matches!(
            replica.log().get(&ops[10].id).unwrap().status,
            EntryStatus::Superseded { .. }
        ));
        assert!(replica.log().get(&ops[200].id).unwrap().is_effective());
        assert_eq!(replica.entity(&"T".into()), Some(json!({"x": 6, "y": 75, "n": 300})));
    }

    proptest! {
        #[test]
        fn prop_every_policy_converges(
            order in Just((0..4usize).collect::<Vec<_>>()).prop_shuffle(),
            policy in prop_oneof![
                Just(ConflictPolicy::LastWriterWins),
                Just(ConflictPolicy::Merge),
                Just(ConflictPolicy::Priority(PriorityTable::default().with_role("B", "game-master"))),
            ],
        ) {
            let ops = interleaved();
            let reference = run(policy.clone(), &ops);
            let shuffled: Vec<Operation> = order.iter().map(|&i| ops[i].clone()).collect();
            let replica = run(policy, &shuffled);
            prop_assert_eq!(replica.state(), reference.state());
        }

        #[test]
        fn prop_pipeline_agrees_with_resolver(
            edits in prop::collection::vec(
                (prop::collection::btree_map("[abc]", 0..10i64, 1..3), 1..100i64),
                2..5,
            ),
            policy in prop_oneof![
                Just(ConflictPolicy::LastWriterWins),
                Just(ConflictPolicy::Merge),
                Just(ConflictPolicy::Priority(PriorityTable::default().with_role("p1", "game-master"))),
            ],
        ) {
            let mut gm = Actor::new("gm");
            let create = gm.op(OperationType::Create, json!({"a": -1, "b": -1, "c": -1}), 0);

            // Every edit is by its own actor and has only seen the create
            let concurrent: Vec<Operation> = edits
                .iter()
                .enumerate()
                .map(|(i, (fields, ts))| {
                    let mut actor = Actor::new(&format!("p{i}"));
                    actor.observe(&create);
                    actor.op(OperationType::Update, json!(fields), *ts)
                })
                .collect();

            let resolver = ConflictResolver::new(policy.clone());
            let Resolution::Winner(winner) = resolver.resolve(&concurrent[0], &concurrent[1..]) else {
                panic!("pairwise policies always pick a winner");
            };
            let mut expected = create.payload.clone();
            crate::patch::merge_patch(&mut expected, &winner.payload);

            let mut ops = vec![create];
            ops.extend(concurrent);
            let replica = run(policy, &ops);
            prop_assert_eq!(replica.entity(&"T".into()), Some(expected));
        }
    }
}
