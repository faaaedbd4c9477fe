//! Task/Step execution engine with bounded retries.
//!
//! A task is an ordered plan of steps, each bound to a named tool. The engine
//! runs steps in plan order, retries failed steps up to a per-task cap, and
//! publishes every transition to subscribers of that task only.
//!
//! - **[`core`]**: Pure, deterministic logic (retry policy, transitions,
//!   status aggregation, selection, planning). No I/O.
//! - **[`io`]**: Side effects (persistence, cache, tools, LLM, config,
//!   processes). Behind traits so tests can swap them.
//!
//! [`engine`], [`worker`], and [`broadcast`] combine the two into the
//! service that the CLI and the HTTP server drive.

pub mod broadcast;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod services;
pub mod task;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;
