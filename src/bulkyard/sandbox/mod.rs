//! Sandbox assembly: the shared template and per-worker layered mounts.

pub mod mount;
pub mod template;

pub use mount::{domount, dounmount, plan, MountKind, MountSpec};
pub use template::Template;
