//! Resilience layer for gaffer.
//!
//! - Error classification: maps agent invocation failures onto a closed kind
//!   set and decides transient vs permanent
//! - Circuit breaker: per-key failure counter with persisted state
//! - Retry controller: bounded retries with pluggable backoff schedules
//! - Shutdown signal: cooperative shutdown coordination for daemon loops

pub mod breaker;
pub mod classifier;
pub mod retry;
pub mod shutdown;
