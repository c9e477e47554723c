//! Concord Test Harness - simulation and convergence testing
//!
//! This crate provides:
//! - Lossy, reordering, duplicating links between replicas
//! - A seeded multi-replica session simulator
//! - A reconciliation convergence fuzzer
//! - End-to-end session scenarios

pub mod chaos;
pub mod scenarios;
pub mod simulator;
pub mod state_fuzzer;

pub use chaos::*;
pub use scenarios::*;
pub use simulator::*;
pub use state_fuzzer::*;
