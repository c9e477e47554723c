//! Concord Core - Fundamental types and primitives
//!
//! This crate defines the core types used throughout Concord:
//! - Identifiers (ActorId, EntityId, OperationId)
//! - Wall-clock timestamps
//! - Vector clocks and causal comparison
//! - Operations and their JSON wire format
//! - The error taxonomy

pub mod id;
pub mod time;
pub mod clock;
pub mod operation;
pub mod error;

pub use id::*;
pub use time::*;
pub use clock::*;
pub use operation::*;
pub use error::*;
