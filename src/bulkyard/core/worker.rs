//! The master-side worker slot: state, attached package, and the running
//! totals the scheduler and dynamic controller read.

use std::path::PathBuf;
use std::time::Instant;

use nix::unistd::Pid;

use super::flags::{Phase, WorkerState};
use super::pkg::PkgIndex;

pub struct WorkerSlot {
    pub index: usize,
    pub state: WorkerState,
    pub phase: Option<Phase>,
    pub pkg: Option<PkgIndex>,
    pub child_pid: Option<Pid>,
    pub start_time: Option<Instant>,
    pub lines: u64,
    pub memuse: u64,
    pub pkg_dep_size: u64,
    pub basedir: PathBuf,
    pub errors: u32,
}

impl WorkerSlot {
    pub fn new(index: usize, basedir: PathBuf) -> Self {
        Self {
            index,
            state: WorkerState::None,
            phase: None,
            pkg: None,
            child_pid: None,
            start_time: None,
            lines: 0,
            memuse: 0,
            pkg_dep_size: 0,
            basedir,
            errors: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, WorkerState::None | WorkerState::Idle)
    }

    pub fn reset_for_idle(&mut self) {
        self.state = WorkerState::Idle;
        self.phase = None;
        self.pkg = None;
        self.child_pid = None;
        self.start_time = None;
        self.lines = 0;
        self.memuse = 0;
        self.pkg_dep_size = 0;
    }
}
