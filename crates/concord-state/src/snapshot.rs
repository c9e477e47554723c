//! Point-in-time capture of a replica

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use concord_core::{ConcordError, ConcordResult, EntityId, Operation, OperationId, Timestamp, VectorClock};
use uuid::Uuid;

use crate::LogEntry;

/// Everything needed to rebuild a replica exactly: clock, state and log.
///
/// Always a deep copy; never aliases live engine state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub id: String,
    pub timestamp: Timestamp,
    pub vector_clock: VectorClock,
    pub entities: BTreeMap<EntityId, Value>,
    pub operations: Vec<LogEntry>,
    /// Folded value of pruned log prefixes, per entity
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub baselines: BTreeMap<EntityId, Value>,
    /// Operations pruned from the log; redelivery is still a duplicate
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pruned: BTreeSet<OperationId>,
}

impl StateSnapshot {
    pub fn new(
        vector_clock: VectorClock,
        entities: BTreeMap<EntityId, Value>,
        operations: Vec<LogEntry>,
        baselines: BTreeMap<EntityId, Value>,
    ) -> Self {
        StateSnapshot {
            id: Uuid::new_v4().to_string(),
            timestamp: Timestamp::now(),
            vector_clock,
            entities,
            operations,
            baselines,
            pruned: BTreeSet::new(),
        }
    }

    pub fn with_pruned(mut self, pruned: BTreeSet<OperationId>) -> Self {
        self.pruned = pruned;
        self
    }

    /// Logged operations, in log order
    pub fn operation_history(&self) -> Vec<Operation> {
        self.operations.iter().map(|e| e.operation.clone()).collect()
    }

    /// Serialize for an external storage collaborator
    pub fn to_json(&self) -> ConcordResult<String> {
        serde_json::to_string(self).map_err(|e| ConcordError::MalformedWire(e.to_string()))
    }

    pub fn from_json(json: &str) -> ConcordResult<Self> {
        serde_json::from_str(json).map_err(|e| ConcordError::MalformedWire(e.to_string()))
    }
}
