//! Operation log - append-only history of every processed operation
//!
//! The log is an arena of entries plus two secondary indexes (by entity and
//! by operation id) so conflict scans only look at one entity's history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_core::{EntityId, Operation, OperationId, Timestamp};

/// What became of a logged operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EntryStatus {
    /// Contributes to the materialized state
    Applied,
    /// Lost a conflict; kept for audit only
    Superseded { by: OperationId },
    /// Payload could not be applied; kept for audit only
    Failed { reason: String },
    /// Rejected during manual conflict resolution
    Discarded,
}

/// A logged operation and the bookkeeping the engine attaches to it
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub operation: Operation,
    pub status: EntryStatus,
    /// Payload actually applied when a resolution policy rewrote it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Value>,
    /// Previous values of the touched fields, captured at apply time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_image: Option<Value>,
    /// Status and effect were decided outside the resolution policy (a
    /// manual or custom decision, or frozen by pruning) and are never
    /// recomputed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pinned: bool,
}

impl LogEntry {
    pub fn applied(operation: Operation) -> Self {
        LogEntry {
            operation,
            status: EntryStatus::Applied,
            effect: None,
            pre_image: None,
            pinned: false,
        }
    }

    pub fn with_status(operation: Operation, status: EntryStatus) -> Self {
        LogEntry {
            operation,
            status,
            effect: None,
            pre_image: None,
            pinned: false,
        }
    }

    pub fn pin(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Payload the materialized state folds in
    pub fn effective_payload(&self) -> &Value {
        self.effect.as_ref().unwrap_or(&self.operation.payload)
    }

    #[inline]
    pub fn is_effective(&self) -> bool {
        self.status == EntryStatus::Applied
    }
}

/// Operation log
#[derive(Clone, Debug, Default)]
pub struct OperationLog {
    entries: Vec<LogEntry>,
    by_entity: HashMap<EntityId, Vec<usize>>,
    by_id: HashMap<OperationId, usize>,
}

impl OperationLog {
    pub fn new() -> Self {
        OperationLog::default()
    }

    /// Rebuild a log (and its indexes) from entries in log order
    pub fn from_entries(entries: Vec<LogEntry>) -> Self {
        let mut log = OperationLog::new();
        for entry in entries {
            log.append(entry);
        }
        log
    }

    /// Append an entry. Entries with an id already present are ignored.
    pub fn append(&mut self, entry: LogEntry) -> bool {
        if self.by_id.contains_key(&entry.operation.id) {
            return false;
        }
        let index = self.entries.len();
        self.by_id.insert(entry.operation.id.clone(), index);
        self.by_entity
            .entry(entry.operation.entity_id.clone())
            .or_default()
            .push(index);
        self.entries.push(entry);
        true
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &OperationId) -> Option<&LogEntry> {
        self.by_id.get(id).and_then(|&i| self.entries.get(i))
    }

    pub fn get_mut(&mut self, id: &OperationId) -> Option<&mut LogEntry> {
        let index = *self.by_id.get(id)?;
        self.entries.get_mut(index)
    }

    /// Entries for one entity, in log order
    pub fn entries_for<'a>(&'a self, entity: &EntityId) -> impl Iterator<Item = &'a LogEntry> + 'a {
        self.by_entity
            .get(entity)
            .into_iter()
            .flatten()
            .filter_map(move |&i| self.entries.get(i))
    }

    /// Every entry, in log order
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Operations newer than `since`
    pub fn operations_since(&self, since: Timestamp) -> Vec<Operation> {
        self.entries
            .iter()
            .filter(|e| e.operation.timestamp > since)
            .map(|e| e.operation.clone())
            .collect()
    }

    /// Operation history, optionally for a single entity
    pub fn history(&self, entity: Option<&EntityId>) -> Vec<Operation> {
        match entity {
            Some(entity) => self
                .entries_for(entity)
                .map(|e| e.operation.clone())
                .collect(),
            None => self.entries.iter().map(|e| e.operation.clone()).collect(),
        }
    }

    /// Drop every entry for which `remove` returns true, returning how many
    /// were dropped. Indexes are rebuilt.
    pub fn remove_where<F>(&mut self, mut remove: F) -> usize
    where
        F: FnMut(&LogEntry) -> bool,
    {
        let before = self.entries.len();
        let kept: Vec<LogEntry> = self.entries.drain(..).filter(|e| !remove(e)).collect();
        let removed = before - kept.len();
        *self = OperationLog::from_entries(kept);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
