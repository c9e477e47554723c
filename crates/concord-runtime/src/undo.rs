//! Inverse operations for undo

use concord_core::{ConcordError, ConcordResult, OperationDraft, OperationType};
use concord_state::LogEntry;

/// Build the inverse of an applied log entry.
///
/// The inverse points back at the undone operation through `parent_id` and
/// depends on it, so it can never be applied before it.
pub fn inverse(entry: &LogEntry) -> ConcordResult<OperationDraft> {
    let op = &entry.operation;

    let draft = match op.kind {
        OperationType::Create => OperationDraft::delete(op.entity_type, op.entity_id.clone()),
        OperationType::Delete => {
            let previous = entry
                .pre_image
                .clone()
                .ok_or(ConcordError::UndoUnsupported(op.kind))?;
            OperationDraft::create(op.entity_type, op.entity_id.clone(), previous)
        }
        OperationType::Update | OperationType::Move | OperationType::Transform => {
            let previous = entry
                .pre_image
                .clone()
                .ok_or(ConcordError::UndoUnsupported(op.kind))?;
            OperationDraft::new(op.kind, op.entity_type, op.entity_id.clone(), previous)
        }
    };

    Ok(draft
        .with_parent(op.id.clone())
        .with_dependencies(vec![op.id.clone()]))
}
