//! Operation definitions
//!
//! Operations are the only way session state changes. Each one carries its
//! author, target entity, a vector-clock snapshot taken when it was stamped,
//! and an opaque JSON payload. Operations are immutable once stamped.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    ActorId, ConcordError, ConcordResult, EntityId, OperationId, Timestamp, VectorClock,
};

/// Operation type classification
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
    Transform,
}

impl OperationType {
    /// Operations that modify an existing entity in place
    #[inline]
    pub fn is_modification(self) -> bool {
        matches!(
            self,
            OperationType::Update | OperationType::Move | OperationType::Transform
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
            OperationType::Transform => "transform",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of session entity an operation targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Token,
    Scene,
    Condition,
    Initiative,
    Map,
    Note,
}

/// A stamped operation, as stored in the log and sent over the wire
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub kind: OperationType,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    #[serde(rename = "userId")]
    pub actor_id: ActorId,
    /// Wall-clock milliseconds, advisory only
    pub timestamp: Timestamp,
    /// Clock snapshot at creation
    pub vector_clock: VectorClock,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<OperationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<OperationId>,
}

impl Operation {
    /// Parse an operation from its JSON wire form
    pub fn from_json(json: &str) -> ConcordResult<Self> {
        let op: Operation = serde_json::from_str(json)
            .map_err(|e| ConcordError::MalformedWire(e.to_string()))?;
        op.validate()?;
        Ok(op)
    }

    /// Encode to the JSON wire form
    pub fn to_json(&self) -> ConcordResult<String> {
        serde_json::to_string(self).map_err(|e| ConcordError::MalformedWire(e.to_string()))
    }

    /// Structural checks every operation must pass before it is enqueued
    pub fn validate(&self) -> ConcordResult<()> {
        if self.id.is_empty() {
            return Err(ConcordError::Validation("operation id is empty".into()));
        }
        if self.entity_id.is_empty() {
            return Err(ConcordError::Validation(format!(
                "operation {} has an empty entity id",
                self.id
            )));
        }
        if self.actor_id.is_empty() {
            return Err(ConcordError::Validation(format!(
                "operation {} has an empty actor id",
                self.id
            )));
        }
        if self.vector_clock.get(&self.actor_id) == 0 {
            return Err(ConcordError::Validation(format!(
                "operation {} carries no clock entry for its author {}",
                self.id, self.actor_id
            )));
        }
        if self.dependencies.contains(&self.id) {
            return Err(ConcordError::Validation(format!(
                "operation {} depends on itself",
                self.id
            )));
        }
        Ok(())
    }

    /// The author's own counter in the clock snapshot
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.vector_clock.get(&self.actor_id)
    }

    /// Canonical ordering key shared by every replica.
    ///
    /// Clock total first (a linear extension of happens-before), then
    /// timestamp, author and id as deterministic tie breakers.
    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            clock_total: self.vector_clock.total(),
            timestamp: self.timestamp,
            actor: self.actor_id.clone(),
            id: self.id.clone(),
        }
    }
}

/// See [`Operation::order_key`]
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey {
    pub clock_total: u64,
    pub timestamp: Timestamp,
    pub actor: ActorId,
    pub id: OperationId,
}

/// A local edit before the engine stamps identity, clock and author onto it
#[derive(Clone, Debug, PartialEq)]
pub struct OperationDraft {
    pub kind: OperationType,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Value,
    pub parent_id: Option<OperationId>,
    pub dependencies: Vec<OperationId>,
    /// Pin the wall-clock timestamp instead of reading the system clock
    pub timestamp: Option<Timestamp>,
}

impl OperationDraft {
    pub fn new(
        kind: OperationType,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        payload: Value,
    ) -> Self {
        OperationDraft {
            kind,
            entity_type,
            entity_id: entity_id.into(),
            payload,
            parent_id: None,
            dependencies: Vec::new(),
            timestamp: None,
        }
    }

    pub fn create(entity_type: EntityType, entity_id: impl Into<EntityId>, payload: Value) -> Self {
        Self::new(OperationType::Create, entity_type, entity_id, payload)
    }

    pub fn update(entity_type: EntityType, entity_id: impl Into<EntityId>, payload: Value) -> Self {
        Self::new(OperationType::Update, entity_type, entity_id, payload)
    }

    pub fn delete(entity_type: EntityType, entity_id: impl Into<EntityId>) -> Self {
        Self::new(
            OperationType::Delete,
            entity_type,
            entity_id,
            Value::Object(Default::default()),
        )
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_parent(mut self, parent: OperationId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<OperationId>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Stamp identity and causality onto the draft
    pub fn stamp(self, actor: ActorId, clock: VectorClock, now: Timestamp) -> Operation {
        Operation {
            id: OperationId::generate(),
            kind: self.kind,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            actor_id: actor,
            timestamp: self.timestamp.unwrap_or(now),
            vector_clock: clock,
            payload: self.payload,
            parent_id: self.parent_id,
            dependencies: self.dependencies,
        }
    }
}
