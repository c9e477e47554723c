//! Concord Runtime - the sync engine
//!
//! Every operation, local or remote, goes through the same loop:
//! 1. Validate and (for local edits) stamp id, clock tick and timestamp
//! 2. Queue in canonical order
//! 3. Wait for explicit dependencies
//! 4. Detect conflicts
//! 5. Resolve by policy, or park for manual resolution
//! 6. Apply and log
//! 7. Notify subscribers

pub mod config;
pub mod engine;
pub mod notify;
pub mod queue;
pub mod telemetry;
pub mod undo;

pub use config::*;
pub use engine::*;
pub use notify::*;
pub use queue::*;
pub use telemetry::*;
