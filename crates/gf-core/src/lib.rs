//! Core library for gaffer — foundational types, configuration, persistent
//! state, and per-task log sinks.
//!
//! This crate is the bottom of the workspace and provides:
//! - The task and orchestration data model with its status state machine
//! - Configuration loading (TOML file + environment overrides)
//! - The serialized SQLite store every mutation flows through
//! - Path utilities for collision-free, cross-platform log filenames
//! - The append-only summary/detailed log sinks

pub mod config;
pub mod paths;
pub mod store;
pub mod task_log;
pub mod types;
