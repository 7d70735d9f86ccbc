//! Structured logging setup. Mirrors the original's `dlog`/`dfatal`
//! severities as `tracing` levels, and fans out to the eight named log
//! files under `$logspath` in addition to stderr.

use std::fs::OpenOptions;
use std::path::Path;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// The eight named logs the original keeps under `$logspath`.
pub const NAMED_LOGS: &[&str] = &[
    "last-results",
    "success-list",
    "failure-list",
    "ignored-list",
    "skipped-list",
    "abnormal-output",
    "obsolete-packages",
    "debug",
];

pub fn init(logs_path: &Path, debug: bool) -> anyhow::Result<()> {
    let debug_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_path.join("debug.log"))?;

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    let writer = std::io::stderr.and(debug_log);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(true)
        .init();

    Ok(())
}
