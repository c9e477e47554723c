//! Error types for Concord

use thiserror::Error;

use crate::{EntityId, OperationId, OperationType};

/// Core Concord errors
///
/// Errors are `Clone` because they also travel inside change events.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConcordError {
    // Submission errors
    #[error("Invalid operation: {0}")]
    Validation(String),

    #[error("Malformed wire format: {0}")]
    MalformedWire(String),

    // Apply errors
    #[error("Cannot apply {operation} to {entity}: {reason}")]
    Apply {
        operation: OperationId,
        entity: EntityId,
        reason: String,
    },

    // Listener errors
    #[error("Listener failed: {0}")]
    Listener(String),

    // Causality errors
    #[error("Operation {operation} is missing dependency {dependency}")]
    MissingDependency {
        operation: OperationId,
        dependency: OperationId,
    },

    // Manual resolution errors
    #[error("Conflict on {0} awaits manual resolution")]
    UnresolvableConflict(OperationId),

    #[error("Operation {0} is not awaiting manual resolution")]
    NotParked(OperationId),

    // Undo errors
    #[error("No local operation left to undo")]
    NothingToUndo,

    #[error("Undo is not supported for {0} operations without a retained pre-image")]
    UndoUnsupported(OperationType),

    // Engine errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Engine has shut down")]
    EngineClosed,
}

/// Result type for Concord operations
pub type ConcordResult<T> = Result<T, ConcordError>;
