use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Keeps the non-blocking file writer flushing for the process lifetime.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging with human-readable stdout output.
///
/// Uses the `RUST_LOG` environment variable if set, otherwise falls back
/// to `default_level` (e.g. "info", "gf_core=debug,warn").
///
/// Safe to call multiple times (e.g. in tests) — subsequent calls are
/// no-ops.
pub fn init_logging(service_name: &str, default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (stdout)");
}

/// Initialize logging with stdout output plus a rolling service log
/// (`global.log`, rotated daily) under `dir`.
///
/// Safe to call multiple times — subsequent calls are no-ops.
pub fn init_logging_with_file(service_name: &str, default_level: &str, dir: &Path) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let appender = tracing_appender::rolling::daily(dir, "global.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .try_init()
        .ok();

    tracing::info!(
        service = service_name,
        dir = %dir.display(),
        "logging initialised (stdout + rolling file)"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
