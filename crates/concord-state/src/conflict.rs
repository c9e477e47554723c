//! Conflict detection
//!
//! Only concurrent writes to the same entity from different actors are
//! conflicts. Edits that are merely reordered in transit are causally
//! related and never reach the resolver.

use concord_core::{ClockOrdering, Operation, OperationType};

use crate::OperationLog;

/// Finds log operations concurrent with an incoming one
#[derive(Clone, Copy, Debug, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn new() -> Self {
        ConflictDetector
    }

    /// Effective log operations on the same entity, by a different actor,
    /// whose clocks are concurrent with `op`
    pub fn detect(&self, log: &OperationLog, op: &Operation) -> Vec<Operation> {
        log.entries_for(&op.entity_id)
            .filter(|e| e.is_effective())
            .map(|e| &e.operation)
            .filter(|other| other.id != op.id && Self::conflicts(op, other))
            .cloned()
            .collect()
    }

    /// Pairwise conflict relation (symmetric)
    pub fn conflicts(a: &Operation, b: &Operation) -> bool {
        a.entity_id == b.entity_id
            && a.actor_id != b.actor_id
            && a.vector_clock.compare(&b.vector_clock) == ClockOrdering::Concurrent
    }

    /// Whether two conflicting operations actually compete for the entity.
    ///
    /// A Create only competes with another Create or a Delete: a concurrent
    /// modification never retracts an entity's creation. Symmetric.
    pub fn contends(a: &Operation, b: &Operation) -> bool {
        match (a.kind, b.kind) {
            (OperationType::Create, other) | (other, OperationType::Create) => {
                matches!(other, OperationType::Create | OperationType::Delete)
            }
            _ => true,
        }
    }

    /// Conflicts that contend with `op`
    pub fn contending(&self, log: &OperationLog, op: &Operation) -> Vec<Operation> {
        self.detect(log, op)
            .into_iter()
            .filter(|other| Self::contends(op, other))
            .collect()
    }
}
