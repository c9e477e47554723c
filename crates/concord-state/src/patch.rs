//! Structural payload merging
//!
//! Payloads are opaque JSON. The engine only ever merges them structurally,
//! following JSON merge-patch rules: objects merge key by key, any other
//! value replaces, and `null` removes a key.

use serde_json::{Map, Value};

use concord_core::OperationType;

/// Fields a Move operation may touch
pub const POSITION_FIELDS: &[&str] = &["x", "y", "z", "elevation", "position", "sceneId"];

/// Fields a Transform operation may touch
pub const TRANSFORM_FIELDS: &[&str] = &[
    "rotation",
    "scale",
    "scaleX",
    "scaleY",
    "width",
    "height",
    "flipX",
    "flipY",
    "transform",
];

/// Apply a merge patch to a target value in place
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                merge_patch(slot, value);
            }
        }
    }
}

/// Compose two patches into one that has the effect of `first` then `second`.
///
/// Nested objects compose recursively; every other collision is won by
/// `second`. Nulls survive so the composed patch still removes keys.
pub fn compose(first: &Value, second: &Value) -> Value {
    match (first, second) {
        (Value::Object(a), Value::Object(b)) => {
            let mut out = a.clone();
            for (key, value) in b {
                let merged = match out.get(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        compose(existing, value)
                    }
                    _ => value.clone(),
                };
                out.insert(key.clone(), merged);
            }
            Value::Object(out)
        }
        _ => second.clone(),
    }
}

/// Values a patch would overwrite, shaped like the patch itself.
///
/// Applying the result as a merge patch after `patch` restores the touched
/// fields. Keys absent from `target` come back as `null`.
pub fn pre_image(target: &Value, patch: &Value) -> Value {
    let Value::Object(patch_map) = patch else {
        return target.clone();
    };

    let mut out = Map::new();
    for (key, value) in patch_map {
        let previous = target.get(key);
        let restored = match previous {
            Some(prev) if prev.is_object() && value.is_object() => pre_image(prev, value),
            Some(prev) => prev.clone(),
            None => Value::Null,
        };
        out.insert(key.clone(), restored);
    }
    Value::Object(out)
}

/// Remove from `patch` every field that `winner` also writes.
///
/// Where both write an object the two merge and only the overlapping
/// leaves are removed. Returns true if anything was removed.
pub fn strip_overlap(patch: &mut Value, winner: &Value) -> bool {
    let (Value::Object(patch_map), Value::Object(winner_map)) = (patch, winner) else {
        return false;
    };

    let mut stripped = false;
    for (key, theirs) in winner_map {
        let Some(ours) = patch_map.get_mut(key) else {
            continue;
        };
        if ours.is_object() && theirs.is_object() {
            stripped |= strip_overlap(ours, theirs);
        } else {
            patch_map.remove(key);
            stripped = true;
        }
    }
    stripped
}

/// Restrict a Move/Transform payload to the fields that type may touch.
///
/// Returns the filtered object and the keys that were dropped. Other
/// operation types pass through unchanged.
pub fn restrict_fields(kind: OperationType, payload: &Map<String, Value>) -> (Map<String, Value>, Vec<String>) {
    let allowed: &[&str] = match kind {
        OperationType::Move => POSITION_FIELDS,
        OperationType::Transform => TRANSFORM_FIELDS,
        _ => return (payload.clone(), Vec::new()),
    };

    let mut kept = Map::new();
    let mut dropped = Vec::new();
    for (key, value) in payload {
        if allowed.contains(&key.as_str()) {
            kept.insert(key.clone(), value.clone());
        } else {
            dropped.push(key.clone());
        }
    }
    (kept, dropped)
}
