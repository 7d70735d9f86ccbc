//! Error types for each subsystem, following the error kinds in the design
//! document: configuration, graph, build, sandbox, IPC, and a fatal
//! catch-all for conditions that abort the whole run.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0} not found")]
    NotFound(PathBuf),
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle detected through {origin}")]
    Cycle { origin: String },
    #[error("port metadata tool failed for {origin}: {reason}")]
    MetadataFailed { origin: String, reason: String },
    #[error("unknown operating system reported by port tool")]
    UnknownOs,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("mount of {what} at {path} failed: {source}")]
    Mount {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("unmount of {path} failed after {attempts} attempts: {source}")]
    Unmount {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: nix::Error,
    },
    #[error("template tree creation failed: {0}")]
    Template(String),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("socket closed before a terminal message was received")]
    UnexpectedEof,
    #[error("short read of IPC record: got {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error surfaced to `main`, mirroring the original's `dfatal`
/// path: logged, best-effort mount teardown attempted, non-zero exit.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("cannot open log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open CRC database {path}: {source}")]
    CrcDb {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("{0}")]
    Other(String),
}
