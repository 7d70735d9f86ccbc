//! The package graph, its flags and edges, the bulk pool, the IPC wire
//! format, and the worker slot — the data model shared by every
//! orchestrator subsystem.

pub mod bulk;
pub mod flags;
pub mod graph;
pub mod ipc;
pub mod pkg;
pub mod worker;

pub use flags::{DepKind, PkgFlags, Phase, WorkerState};
pub use graph::Graph;
pub use pkg::{Edge, Pkg, PkgIndex};
pub use worker::WorkerSlot;
