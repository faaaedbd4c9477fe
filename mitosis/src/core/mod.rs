//! Deterministic, pure logic shared by the engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! task records and return deterministic outputs suitable for tests.

pub mod aggregate;
pub mod classifier;
pub mod invariants;
pub mod planner;
pub mod retry;
pub mod selector;
pub mod transitions;
pub mod types;
