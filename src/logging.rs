//! Structured logging for the orchestrator.
//!
//! An orchestration run logs on two layers: machine-readable JSON into a
//! daily-rotated file under the state directory (the durable companion to
//! the attempt and circuit-event audit trails), and human-readable output
//! on stderr. One-shot subcommands get the stderr layer only.
//!
//! The default filter keeps the crate at `info` and dependencies at
//! `warn`; `RUST_LOG` overrides both.

use std::path::Path;

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default directive set: orchestrator at info, everything else at warn.
const DEFAULT_DIRECTIVES: &str = "warn,armitage=info";

/// Keeps the non-blocking file writer alive.
///
/// Dropping the guard flushes pending entries and closes the log file,
/// so the caller must hold it for the whole run.
pub struct LoggingGuard {
    _guard: WorkerGuard,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Initialise dual-layer logging for an orchestration run.
///
/// JSON entries land in `{logs_dir}/run.json.YYYY-MM-DD`; the stderr
/// layer stays human-readable.
///
/// # Errors
///
/// Returns an error if the logs directory cannot be created.
pub fn init_run(logs_dir: &Path) -> anyhow::Result<LoggingGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("cannot create logs directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, "run.json");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_writer(file_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(LoggingGuard { _guard: guard })
}

/// Initialise stderr-only logging for one-shot subcommands.
///
/// No file layer, no guard to hold.
pub fn init_cli() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
