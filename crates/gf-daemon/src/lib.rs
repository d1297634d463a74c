//! Background daemon for the gaffer task execution service.
//!
//! The daemon hosts the process-wide services:
//! - The scheduler that bounds and dispatches task executors
//! - The DAG orchestrator that gates dependent task groups on events
//! - The resource monitor and breaker maintenance loops
//! - The wiring that ties config, store, and agent layer together

pub mod daemon;
pub mod monitor;
pub mod orchestrator;
pub mod scheduler;
