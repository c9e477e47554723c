//! Concord sync engine - the runtime entity
//!
//! Local and remote operations enter the same pending queue. A single
//! drain task per engine pops them in canonical order and runs each one
//! through the reconciler while holding the replica lock, then publishes
//! the resulting events once the lock is released.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use concord_core::{
    ActorId, ConcordError, ConcordResult, EntityId, Operation, OperationDraft, OperationId,
    Timestamp, VectorClock,
};
use concord_state::{ConflictPolicy, ProcessOutcome, Reconciler, StateSnapshot};

use crate::config::{DependencyTimeout, EngineConfig};
use crate::notify::{ChangeNotifier, EngineEvent, SubscriberId, Subscription};
use crate::queue::PendingQueue;
use crate::undo;

/// Runtime counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub local_operations: u64,
    pub remote_operations: u64,
    pub applied: u64,
    pub superseded: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub dependency_deferrals: u64,
    pub dependency_drops: u64,
    pub speculative_applies: u64,
    pub manual_resolutions: u64,
    pub undos: u64,
    pub pruned: u64,
    pub snapshots_loaded: u64,
    /// Operations waiting in the queue
    pub pending: usize,
    /// Operations waiting for dependencies
    pub deferred: usize,
    /// Operations waiting for manual resolution
    pub parked: usize,
}

/// Outcome of [`SyncEngine::synchronize`]
#[derive(Debug, Default)]
pub struct SyncReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: Vec<(OperationId, ConcordError)>,
}

/// A conflicting operation waiting for a manual decision
#[derive(Clone, Debug)]
pub struct ParkedOperation {
    pub operation: Operation,
    pub conflicts: Vec<Operation>,
}

/// Settles one parked conflict. Does not keep the engine alive.
#[derive(Clone)]
pub struct ResolutionHandle {
    engine: Weak<EngineInner>,
    operation: OperationId,
}

impl ResolutionHandle {
    /// The parked operation
    pub fn operation_id(&self) -> &OperationId {
        &self.operation
    }

    /// Settle with `winner`, or discard the parked operation with `None`
    pub fn resolve(&self, winner: Option<Operation>) -> ConcordResult<()> {
        let engine = self.engine.upgrade().ok_or(ConcordError::EngineClosed)?;
        engine.resolve_conflict(&self.operation, winner)
    }

    pub fn discard(&self) -> ConcordResult<()> {
        self.resolve(None)
    }
}

impl fmt::Debug for ResolutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionHandle")
            .field("operation", &self.operation)
            .finish()
    }
}

/// Everything guarded by the replica lock
struct Core {
    reconciler: Reconciler,
    parked: BTreeMap<OperationId, ParkedOperation>,
    /// Operations an inverse has been submitted for but not applied yet
    undone: HashSet<OperationId>,
    stats: EngineStats,
}

pub(crate) struct EngineInner {
    actor: ActorId,
    config: EngineConfig,
    /// Lock order: core, then queue, then notifier
    core: Mutex<Core>,
    queue: Mutex<PendingQueue>,
    notifier: Mutex<ChangeNotifier>,
    draining: AtomicBool,
    idle: Notify,
}

/// Concord sync engine
///
/// Cheap to clone; clones share the same replica.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Create an engine for `actor`
    pub fn new(actor: impl Into<ActorId>, config: EngineConfig) -> ConcordResult<Self> {
        let actor = actor.into();
        if actor.is_empty() {
            return Err(ConcordError::Config("actor id must not be empty".into()));
        }
        config.validate()?;

        let reconciler = Reconciler::new(ConflictPolicy::from(config.policy.clone()))
            .with_pre_images(config.retain_pre_images);

        Ok(SyncEngine {
            inner: Arc::new(EngineInner {
                actor,
                config,
                core: Mutex::new(Core {
                    reconciler,
                    parked: BTreeMap::new(),
                    undone: HashSet::new(),
                    stats: EngineStats::default(),
                }),
                queue: Mutex::new(PendingQueue::new()),
                notifier: Mutex::new(ChangeNotifier::new()),
                draining: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        })
    }

    /// Replace the conflict policy (e.g. with a custom strategy)
    pub fn with_policy(self, policy: ConflictPolicy) -> Self {
        self.set_policy(policy);
        self
    }

    pub fn set_policy(&self, policy: ConflictPolicy) {
        self.inner.core.lock().reconciler.set_policy(policy);
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.inner.core.lock().reconciler.policy().clone()
    }

    pub fn actor_id(&self) -> &ActorId {
        &self.inner.actor
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Stamp a local edit and queue it. Returns the stamped operation.
    pub fn apply_local_operation(&self, draft: OperationDraft) -> ConcordResult<Operation> {
        if draft.entity_id.is_empty() {
            return Err(ConcordError::Validation("entity id is empty".into()));
        }
        let op = {
            let mut core = self.inner.core.lock();
            let op = self.inner.stamp(&mut core, draft);
            op.validate()?;
            core.stats.local_operations += 1;
            self.inner.enqueue(&mut core, op.clone());
            op
        };
        self.inner.schedule_drain();
        Ok(op)
    }

    /// Queue an operation received from another replica
    pub fn apply_remote_operation(&self, op: Operation) -> ConcordResult<()> {
        op.validate()?;
        {
            let mut core = self.inner.core.lock();
            core.stats.remote_operations += 1;
            self.inner.enqueue(&mut core, op);
        }
        self.inner.schedule_drain();
        Ok(())
    }

    /// Queue a batch of remote operations, e.g. after reconnecting.
    ///
    /// Invalid operations are reported and skipped; the rest are queued.
    pub fn synchronize(&self, ops: Vec<Operation>) -> SyncReport {
        let mut report = SyncReport::default();
        {
            let mut core = self.inner.core.lock();
            for op in ops {
                if let Err(error) = op.validate() {
                    report.rejected.push((op.id.clone(), error));
                    continue;
                }
                core.stats.remote_operations += 1;
                if self.inner.enqueue(&mut core, op) {
                    report.accepted += 1;
                } else {
                    report.duplicates += 1;
                }
            }
        }
        debug!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected.len(),
            "synchronize"
        );
        self.inner.schedule_drain();
        report
    }

    /// Wait until the queue is empty and no drain is running.
    ///
    /// Operations deferred on dependencies or parked for manual resolution
    /// do not keep the engine busy.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Full copy of the materialized state
    pub fn state(&self) -> BTreeMap<EntityId, Value> {
        self.inner.core.lock().reconciler.state()
    }

    pub fn entity(&self, id: &EntityId) -> Option<Value> {
        self.inner.core.lock().reconciler.entity(id)
    }

    /// Logged operations in log order, optionally for one entity
    pub fn operation_history(&self, entity: Option<&EntityId>) -> Vec<Operation> {
        self.inner.core.lock().reconciler.log().history(entity)
    }

    /// Logged operations with a timestamp strictly after `since`
    pub fn operations_since(&self, since: Timestamp) -> Vec<Operation> {
        self.inner.core.lock().reconciler.log().operations_since(since)
    }

    pub fn vector_clock(&self) -> VectorClock {
        self.inner.core.lock().reconciler.clock().clone()
    }

    /// Operations parked for manual resolution
    pub fn pending_manual_operations(&self) -> Vec<ParkedOperation> {
        self.inner.core.lock().parked.values().cloned().collect()
    }

    /// Operations waiting for their dependencies
    pub fn deferred_operations(&self) -> Vec<Operation> {
        self.inner
            .queue
            .lock()
            .deferred()
            .iter()
            .map(|d| d.operation.clone())
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let core = self.inner.core.lock();
        let queue = self.inner.queue.lock();
        EngineStats {
            pending: queue.len(),
            deferred: queue.deferred().len(),
            parked: core.parked.len(),
            ..core.stats.clone()
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.notifier.lock().subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.inner.notifier.lock().unsubscribe(id)
    }

    /// `Err(UnresolvableConflict)` while the operation is parked awaiting a
    /// manual decision
    pub fn ensure_resolved(&self, operation: &OperationId) -> ConcordResult<()> {
        if self.inner.core.lock().parked.contains_key(operation) {
            return Err(ConcordError::UnresolvableConflict(operation.clone()));
        }
        Ok(())
    }

    /// Settle a parked conflict with `winner`, or discard it with `None`
    pub fn resolve_conflict(&self, operation: &OperationId, winner: Option<Operation>) -> ConcordResult<()> {
        self.inner.resolve_conflict(operation, winner)
    }

    /// Deep copy of clock, state and log
    pub fn create_snapshot(&self) -> StateSnapshot {
        self.inner.core.lock().reconciler.snapshot()
    }

    /// Replace clock, state and log with `snapshot`.
    ///
    /// Queued, deferred and parked operations are dropped.
    pub fn load_snapshot(&self, snapshot: StateSnapshot) {
        let event = {
            let mut core = self.inner.core.lock();
            core.reconciler.restore(&snapshot, &self.inner.actor);
            core.parked.clear();
            core.undone.clear();
            core.stats.snapshots_loaded += 1;
            self.inner.queue.lock().clear();
            info!(
                snapshot = %snapshot.id,
                entities = snapshot.entities.len(),
                operations = snapshot.operations.len(),
                "snapshot loaded"
            );
            EngineEvent::SnapshotLoaded {
                snapshot: Arc::new(snapshot),
            }
        };
        self.inner.publish(vec![event]);
    }

    /// Whether updates can be undone (pre-images are being captured)
    pub fn can_undo_updates(&self) -> bool {
        self.inner.config.retain_pre_images
    }

    /// Submit the inverse of the most recent local operation that has not
    /// been undone yet. Returns the inverse.
    pub fn undo_last_operation(&self) -> ConcordResult<Operation> {
        let op = {
            let mut core = self.inner.core.lock();
            let log = core.reconciler.log();
            let applied_undos: HashSet<&OperationId> = log
                .entries()
                .iter()
                .filter(|e| e.is_effective())
                .filter_map(|e| e.operation.parent_id.as_ref())
                .collect();

            let target = log
                .entries()
                .iter()
                .rev()
                .find(|e| {
                    e.is_effective()
                        && e.operation.actor_id == self.inner.actor
                        && e.operation.parent_id.is_none()
                        && !applied_undos.contains(&e.operation.id)
                        && !core.undone.contains(&e.operation.id)
                })
                .ok_or(ConcordError::NothingToUndo)?;

            let target_id = target.operation.id.clone();
            let draft = undo::inverse(target)?;

            core.undone.insert(target_id.clone());
            core.stats.undos += 1;
            let op = self.inner.stamp(&mut core, draft);
            debug!(undone = %target_id, inverse = %op.id, "undo submitted");
            self.inner.enqueue(&mut core, op.clone());
            op
        };
        self.inner.schedule_drain();
        Ok(op)
    }

    /// Prune log entries older than `max_age`. Returns how many were removed.
    pub fn clean_old_operations(&self, max_age: Duration) -> usize {
        let cutoff = Timestamp::now().saturating_sub(max_age);
        let mut core = self.inner.core.lock();
        let removed = core.reconciler.prune_before(cutoff);
        core.stats.pruned += removed as u64;
        removed
    }

    /// Prune with the configured retention window, if any
    pub fn prune_expired(&self) -> usize {
        match self.inner.config.retention() {
            Some(retention) => self.clean_old_operations(retention),
            None => 0,
        }
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("actor", &self.inner.actor)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl EngineInner {
    fn stamp(&self, core: &mut Core, draft: OperationDraft) -> Operation {
        let clock = core.reconciler.tick(&self.actor);
        draft.stamp(self.actor.clone(), clock, Timestamp::now())
    }

    /// Queue an operation unless it is already logged, queued, deferred or
    /// parked. Does not start a drain.
    fn enqueue(&self, core: &mut Core, op: Operation) -> bool {
        let fresh = !core.reconciler.contains(&op.id)
            && !core.parked.contains_key(&op.id)
            && self.queue.lock().push(op.clone());
        if !fresh {
            core.stats.duplicates += 1;
            debug!(op = %op.id, "duplicate operation ignored");
        }
        fresh
    }

    fn is_idle(&self) -> bool {
        !self.draining.load(Ordering::Acquire) && self.queue.lock().is_empty()
    }

    /// Start a drain unless one is running. Inline when there is no tokio
    /// runtime on this thread.
    fn schedule_drain(self: &Arc<Self>) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move { inner.drain() });
            }
            Err(_) => self.drain(),
        }
    }

    /// Drain loop; the caller owns the `draining` flag
    fn drain(self: &Arc<Self>) {
        loop {
            self.drain_pass();

            self.draining.store(false, Ordering::Release);
            // An enqueue may have lost the race for the flag after our last pop
            let more = !self.queue.lock().is_empty();
            if !more
                || self
                    .draining
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
        }
        self.idle.notify_waiters();
    }

    fn drain_pass(self: &Arc<Self>) {
        loop {
            loop {
                let events = {
                    let mut core = self.core.lock();
                    let Some(op) = self.queue.lock().pop() else {
                        break;
                    };
                    self.process(&mut core, op)
                };
                self.publish(events);
            }

            let (requeued, events) = {
                let mut core = self.core.lock();
                self.recheck_deferred(&mut core)
            };
            self.publish(events);
            if requeued == 0 {
                break;
            }
        }
    }

    fn process(self: &Arc<Self>, core: &mut Core, op: Operation) -> Vec<EngineEvent> {
        if core.parked.contains_key(&op.id) {
            core.stats.duplicates += 1;
            return Vec::new();
        }

        let missing = core.reconciler.missing_dependencies(&op);
        if !missing.is_empty() {
            debug!(op = %op.id, ?missing, "waiting for dependencies");
            core.stats.dependency_deferrals += 1;
            self.queue.lock().defer(op, missing);
            return Vec::new();
        }

        let outcome = core.reconciler.process(op);
        self.settle(core, outcome)
    }

    /// Record an outcome in the stats and turn it into events
    fn settle(self: &Arc<Self>, core: &mut Core, outcome: ProcessOutcome) -> Vec<EngineEvent> {
        match outcome {
            ProcessOutcome::Applied { operation, .. } => {
                core.stats.applied += 1;
                if let Some(parent) = &operation.parent_id {
                    core.undone.remove(parent);
                }
                if !self.notifier.lock().has_subscribers() {
                    return Vec::new();
                }
                vec![EngineEvent::OperationApplied {
                    operation,
                    state: Arc::new(core.reconciler.state()),
                }]
            }
            ProcessOutcome::Superseded { operation, .. } | ProcessOutcome::Discarded { operation } => {
                core.stats.superseded += 1;
                if let Some(parent) = &operation.parent_id {
                    core.undone.remove(parent);
                }
                Vec::new()
            }
            ProcessOutcome::Deferred {
                operation,
                conflicts,
            } => {
                debug!(
                    op = %operation.id,
                    entity = %operation.entity_id,
                    "parked for manual resolution"
                );
                core.parked.insert(
                    operation.id.clone(),
                    ParkedOperation {
                        operation: operation.clone(),
                        conflicts: conflicts.clone(),
                    },
                );
                vec![EngineEvent::Conflict {
                    resolution: ResolutionHandle {
                        engine: Arc::downgrade(self),
                        operation: operation.id.clone(),
                    },
                    operation,
                    conflicts,
                }]
            }
            ProcessOutcome::Failed { operation, error } => {
                core.stats.failed += 1;
                if let Some(parent) = &operation.parent_id {
                    core.undone.remove(parent);
                }
                vec![EngineEvent::OperationFailed { operation, error }]
            }
            ProcessOutcome::Duplicate => {
                core.stats.duplicates += 1;
                Vec::new()
            }
        }
    }

    fn recheck_deferred(self: &Arc<Self>, core: &mut Core) -> (usize, Vec<EngineEvent>) {
        let recheck = {
            let reconciler = &core.reconciler;
            self.queue
                .lock()
                .recheck(|id| reconciler.contains(id), self.config.max_dependency_retries)
        };

        let mut events = Vec::new();
        for (operation, missing) in recheck.expired {
            match self.config.dependency_timeout {
                DependencyTimeout::Drop => {
                    warn!(op = %operation.id, ?missing, "dropping operation with missing dependencies");
                    core.stats.dependency_drops += 1;
                    if let Some(parent) = &operation.parent_id {
                        core.undone.remove(parent);
                    }
                    let dependency = missing.into_iter().next().unwrap_or_default();
                    events.push(EngineEvent::OperationFailed {
                        error: ConcordError::MissingDependency {
                            operation: operation.id.clone(),
                            dependency,
                        },
                        operation,
                    });
                }
                DependencyTimeout::ApplySpeculatively => {
                    warn!(
                        op = %operation.id,
                        ?missing,
                        "applying operation before its dependencies, ordering is not guaranteed"
                    );
                    core.stats.speculative_applies += 1;
                    let outcome = core.reconciler.process(operation);
                    events.extend(self.settle(core, outcome));
                }
            }
        }
        (recheck.requeued, events)
    }

    fn resolve_conflict(self: &Arc<Self>, id: &OperationId, winner: Option<Operation>) -> ConcordResult<()> {
        if let Some(winner) = &winner {
            winner.validate()?;
        }

        let events = {
            let mut core = self.core.lock();
            let parked = core
                .parked
                .remove(id)
                .ok_or_else(|| ConcordError::NotParked(id.clone()))?;
            core.stats.manual_resolutions += 1;
            debug!(
                op = %id,
                winner = ?winner.as_ref().map(|w| &w.id),
                "manual resolution"
            );
            let outcome = core.reconciler.resolve_deferred(parked.operation, winner);
            self.settle(&mut core, outcome)
        };
        self.publish(events);
        // The resolved operation may satisfy deferred dependents
        self.schedule_drain();
        Ok(())
    }

    fn publish(&self, events: Vec<EngineEvent>) {
        if events.is_empty() {
            return;
        }
        let mut notifier = self.notifier.lock();
        for event in &events {
            notifier.publish(event);
        }
    }
}
