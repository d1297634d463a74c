//! Agent invocation layer for gaffer.
//!
//! This crate talks to the external coding agent: it models the agent's
//! structured message stream as a tagged enum, spawns the agent CLI as a
//! child process behind a mockable trait, and drives a single task
//! end-to-end through the executor.

pub mod executor;
pub mod message;
pub mod spawner;
