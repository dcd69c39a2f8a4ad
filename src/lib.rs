//! Agent core: durable task queue, agent FSM executor, sandboxed tools and
//! a workflow engine.

pub mod audit;
pub mod config;
pub mod constraints;
pub mod context;
pub mod error;
pub mod llm;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod tools;
pub mod worker;
pub mod workflow;
