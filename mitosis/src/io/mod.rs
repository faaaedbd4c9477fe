//! Side-effecting collaborators of the engine.

pub mod cache;
pub mod config;
pub mod llm;
pub mod memory_store;
pub mod mongo_store;
pub mod planner;
pub mod process;
pub mod store;
pub mod tools;
