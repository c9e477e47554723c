//! Pending queue
//!
//! Operations wait here until the drain loop picks them up. The buffer is a
//! min-heap on the canonical order key, so causally earlier operations are
//! processed first whenever they are queued together. Operations whose
//! explicit dependencies are not in the log yet sit in a quarantine list
//! and are re-checked at the end of every drain pass.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use concord_core::{Operation, OperationId, OrderKey};

struct Queued {
    key: OrderKey,
    operation: Operation,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// An operation waiting for its dependencies
#[derive(Clone, Debug)]
pub struct DeferredOperation {
    pub operation: Operation,
    pub missing: Vec<OperationId>,
    /// Failed re-checks so far
    pub retries: u32,
}

/// Result of re-checking the quarantine
#[derive(Debug, Default)]
pub struct Recheck {
    /// Moved back into the queue
    pub requeued: usize,
    /// Exceeded the retry bound, with the dependencies still missing
    pub expired: Vec<(Operation, Vec<OperationId>)>,
}

/// Pending queue plus dependency quarantine
#[derive(Default)]
pub struct PendingQueue {
    heap: BinaryHeap<Reverse<Queued>>,
    deferred: Vec<DeferredOperation>,
    ids: HashSet<OperationId>,
}

impl PendingQueue {
    pub fn new() -> Self {
        PendingQueue::default()
    }

    /// Queue an operation. Returns false if it is already queued or deferred.
    pub fn push(&mut self, operation: Operation) -> bool {
        if !self.ids.insert(operation.id.clone()) {
            return false;
        }
        self.heap.push(Reverse(Queued {
            key: operation.order_key(),
            operation,
        }));
        true
    }

    /// Lowest operation in canonical order
    pub fn pop(&mut self) -> Option<Operation> {
        let Reverse(queued) = self.heap.pop()?;
        self.ids.remove(&queued.operation.id);
        Some(queued.operation)
    }

    /// Quarantine an operation until `missing` shows up in the log
    pub fn defer(&mut self, operation: Operation, missing: Vec<OperationId>) {
        if !self.ids.insert(operation.id.clone()) {
            return;
        }
        self.deferred.push(DeferredOperation {
            operation,
            missing,
            retries: 0,
        });
    }

    /// Re-check quarantined operations against `present`.
    ///
    /// Satisfied operations are requeued; the rest count one retry and are
    /// expired once their retries exceed `max_retries`.
    pub fn recheck<F>(&mut self, present: F, max_retries: u32) -> Recheck
    where
        F: Fn(&OperationId) -> bool,
    {
        let mut result = Recheck::default();
        let mut still_waiting = Vec::with_capacity(self.deferred.len());

        for mut waiting in std::mem::take(&mut self.deferred) {
            waiting.missing.retain(|dep| !present(dep));
            self.ids.remove(&waiting.operation.id);

            if waiting.missing.is_empty() {
                self.push(waiting.operation);
                result.requeued += 1;
                continue;
            }

            waiting.retries += 1;
            if waiting.retries > max_retries {
                result.expired.push((waiting.operation, waiting.missing));
            } else {
                self.ids.insert(waiting.operation.id.clone());
                still_waiting.push(waiting);
            }
        }

        self.deferred = still_waiting;
        result
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.ids.contains(id)
    }

    /// Operations currently waiting for dependencies
    pub fn deferred(&self) -> &[DeferredOperation] {
        &self.deferred
    }

    /// Number of queued (not deferred) operations
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drop everything, queued and deferred
    pub fn clear(&mut self) {
        self.heap.clear();
        self.deferred.clear();
        self.ids.clear();
    }
}
