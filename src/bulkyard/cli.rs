//! Command-line surface: a single executable whose first non-flag argument
//! is a directive, plus a hidden `worker` directive used only for the
//! internal self-exec into WORKER mode.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "bulkyard", version, about = "Parallel bulk build orchestrator")]
pub struct Cli {
    /// Assume yes to any interactive prompt.
    #[arg(short = 'y', global = true)]
    pub assume_yes: bool,

    /// Debug mode: disables the interactive display, logs verbosely.
    #[arg(short = 'd', global = true)]
    pub debug: bool,

    /// Ramp up to MaxWorkers over N seconds instead of starting at full
    /// concurrency immediately.
    #[arg(short = 's', global = true, value_name = "N")]
    pub slow_start: Option<u64>,

    /// Path to the configuration file.
    #[arg(short = 'c', global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub directive: Directive,
}

#[derive(Debug, Subcommand)]
pub enum Directive {
    /// Show the status of the configured profile.
    Status { ports: Vec<String> },
    /// Build the given ports and their dependencies.
    Build { ports: Vec<String> },
    /// Like `build`, but never installs the result into the sandbox.
    JustBuild { ports: Vec<String> },
    /// Build and install the given ports.
    Install { ports: Vec<String> },
    /// Force a rebuild even if PACKAGED.
    Force { ports: Vec<String> },
    /// Build and run the port's test target.
    Test { ports: Vec<String> },
    /// Remove the sandbox template and per-worker scratch.
    Cleanup,
    /// Validate configuration and exit.
    Configure,
    /// Build every out-of-date package in the configured profile.
    UpgradeSystem,
    /// Prepare the base sandbox template.
    PrepareSystem,
    /// Rebuild repository metadata.
    RebuildRepository,
    /// Purge unreferenced distfiles.
    PurgeDistfiles,
    /// Status across every configured profile.
    StatusEverything,
    /// Build across every configured profile.
    Everything,
    /// Print the version and exit.
    Version,
    /// Internal: self-exec into WORKER mode. Not part of the public surface.
    #[command(hide = true, name = "worker")]
    Worker {
        slot: u32,
        fd: i32,
        portdir: String,
        pkgfile: String,
        flags: u32,
    },
}

/// Exit codes used across the binary: 0 success, 1 fatal/missing
/// directive, 2 argument misuse (clap itself already returns 2 for parse
/// errors via `std::process::exit`).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FATAL: i32 = 1;
    pub const USAGE: i32 = 2;
}
