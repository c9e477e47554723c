//! Concord State Engine - operation log, conflict handling and reconciliation
//!
//! This crate implements the replica-local half of the sync engine:
//! - Entity value store and JSON merge-patch semantics
//! - Append-only operation log with per-entity indexes
//! - Conflict detection over vector clocks
//! - Pluggable conflict resolution policies
//! - Snapshots and log pruning
//! - The reconciliation pipeline tying them together

pub mod conflict;
pub mod log;
pub mod patch;
pub mod reconcile;
pub mod resolve;
pub mod snapshot;
pub mod store;

pub use conflict::*;
pub use log::*;
pub use reconcile::*;
pub use resolve::*;
pub use snapshot::*;
pub use store::*;
