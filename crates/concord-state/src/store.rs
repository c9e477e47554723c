//! State store - the materialized value of every live entity

use std::collections::BTreeMap;

use serde_json::Value;

use concord_core::{ConcordError, ConcordResult, EntityId, Operation, OperationType};

use crate::patch::{merge_patch, pre_image, restrict_fields};

/// Result of folding one operation onto an entity value
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// Entity value afterwards (`None` = absent)
    pub next: Option<Value>,
    /// Previous values of the fields the operation touched
    pub pre_image: Option<Value>,
    /// Whether the operation had any effect
    pub changed: bool,
}

/// Fold a single operation onto the current value of its entity.
///
/// Pure: the caller decides whether to commit `next`. `payload` is the
/// effective payload, which differs from `op.payload` when a merge policy
/// rewrote it.
pub fn transition(current: Option<&Value>, op: &Operation, payload: &Value) -> ConcordResult<Transition> {
    match op.kind {
        OperationType::Create => Ok(Transition {
            next: Some(payload.clone()),
            pre_image: current.cloned(),
            changed: true,
        }),
        OperationType::Delete => Ok(Transition {
            next: None,
            pre_image: current.cloned(),
            changed: current.is_some(),
        }),
        OperationType::Update | OperationType::Move | OperationType::Transform => {
            let Value::Object(fields) = payload else {
                return Err(apply_error(op, format!("{} payload must be an object", op.kind)));
            };

            let (fields, dropped) = restrict_fields(op.kind, fields);
            if !dropped.is_empty() {
                tracing::warn!(
                    op = %op.id,
                    kind = %op.kind,
                    ?dropped,
                    "ignoring fields outside the operation's scope"
                );
            }

            let Some(current) = current else {
                return Ok(Transition {
                    next: None,
                    pre_image: None,
                    changed: false,
                });
            };
            if !current.is_object() {
                return Err(apply_error(op, "entity value is not an object".to_string()));
            }

            let patch = Value::Object(fields);
            let mut next = current.clone();
            merge_patch(&mut next, &patch);
            let changed = &next != current;
            Ok(Transition {
                next: Some(next),
                pre_image: Some(pre_image(current, &patch)),
                changed,
            })
        }
    }
}

fn apply_error(op: &Operation, reason: String) -> ConcordError {
    ConcordError::Apply {
        operation: op.id.clone(),
        entity: op.entity_id.clone(),
        reason,
    }
}

/// State store - the local reality
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateStore {
    entities: BTreeMap<EntityId, Value>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::default()
    }

    /// Rebuild a store from a full copy of entity values
    pub fn from_entities(entities: BTreeMap<EntityId, Value>) -> Self {
        StateStore { entities }
    }

    /// Get an entity value
    pub fn get(&self, id: &EntityId) -> Option<&Value> {
        self.entities.get(id)
    }

    /// Check if an entity exists
    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Set or clear an entity value
    pub fn put(&mut self, id: EntityId, value: Option<Value>) {
        match value {
            Some(value) => {
                self.entities.insert(id, value);
            }
            None => {
                self.entities.remove(&id);
            }
        }
    }

    /// Apply an operation with its effective payload.
    ///
    /// On error the store is left untouched. An Update, Move or Transform
    /// against an absent entity is a logged no-op.
    pub fn apply(&mut self, op: &Operation, payload: &Value) -> ConcordResult<Transition> {
        let transition = transition(self.entities.get(&op.entity_id), op, payload)?;

        if op.kind.is_modification() && !self.contains(&op.entity_id) {
            tracing::warn!(
                op = %op.id,
                entity = %op.entity_id,
                kind = %op.kind,
                "entity does not exist, operation has no effect"
            );
        }

        if transition.changed {
            self.put(op.entity_id.clone(), transition.next.clone());
        }
        Ok(transition)
    }

    /// Full copy of every entity
    pub fn snapshot(&self) -> BTreeMap<EntityId, Value> {
        self.entities.clone()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Value)> {
        self.entities.iter()
    }
}
