//! Telemetry for gaffer services.
//!
//! Structured logging via the `tracing` ecosystem: human-readable stdout
//! output for interactive use, plus an optional rolling file layer for the
//! persisted service log.

pub mod logging;
