//! Run-stats fan-out: an ordered chain of *stats sinks*, each offering the
//! same eight callbacks, invoked by the scheduler for every lifecycle
//! event. The scheduler never special-cases a sink; it just walks the
//! chain in registration order.
//!
//! The TUI and HTML/JSON dashboard emitters are external collaborators
//! (out of scope here per the design doc); [`LogSink`] and [`MonitorSink`]
//! are the two sinks this crate actually owns, and any external renderer
//! would plug into the same [`StatsSink`] trait.

pub mod monitor;

use std::path::Path;

pub use monitor::MonitorSink;

/// Final tallies the scheduler reports through [`StatsSink::on_run_end`],
/// mirroring the counters invariant in the design doc
/// (`success + fail + skip + ignore + missing == total`, meta counted
/// separately).
#[derive(Debug, Clone, Copy, Default)]
pub struct Totals {
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub ignored: u32,
    pub missing: u32,
    pub meta: u32,
}

/// A sink that observes scheduler lifecycle events. All eight methods have
/// no-op default bodies so a sink only overrides what it cares about.
pub trait StatsSink: Send {
    fn on_run_start(&mut self, _total: u32) {}
    fn on_run_end(&mut self, _totals: &Totals) {}
    fn on_pkg_success(&mut self, _portdir: &str) {}
    fn on_pkg_failure(&mut self, _portdir: &str) {}
    fn on_pkg_ignored(&mut self, _portdir: &str) {}
    fn on_pkg_skipped(&mut self, _portdir: &str) {}
    fn on_status_update(&mut self, _slot: usize, _portdir: &str, _phase: &str, _lines: u64) {}
    fn on_worker_state_change(&mut self, _slot: usize, _state: &str) {}
}

/// The ordered chain the scheduler actually calls into. Order is
/// registration order; there's no priority beyond that.
#[derive(Default)]
pub struct StatsChain {
    sinks: Vec<Box<dyn StatsSink>>,
}

impl StatsChain {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn push(&mut self, sink: Box<dyn StatsSink>) {
        self.sinks.push(sink);
    }
}

impl StatsSink for StatsChain {
    fn on_run_start(&mut self, total: u32) {
        for sink in &mut self.sinks {
            sink.on_run_start(total);
        }
    }

    fn on_run_end(&mut self, totals: &Totals) {
        for sink in &mut self.sinks {
            sink.on_run_end(totals);
        }
    }

    fn on_pkg_success(&mut self, portdir: &str) {
        for sink in &mut self.sinks {
            sink.on_pkg_success(portdir);
        }
    }

    fn on_pkg_failure(&mut self, portdir: &str) {
        for sink in &mut self.sinks {
            sink.on_pkg_failure(portdir);
        }
    }

    fn on_pkg_ignored(&mut self, portdir: &str) {
        for sink in &mut self.sinks {
            sink.on_pkg_ignored(portdir);
        }
    }

    fn on_pkg_skipped(&mut self, portdir: &str) {
        for sink in &mut self.sinks {
            sink.on_pkg_skipped(portdir);
        }
    }

    fn on_status_update(&mut self, slot: usize, portdir: &str, phase: &str, lines: u64) {
        for sink in &mut self.sinks {
            sink.on_status_update(slot, portdir, phase, lines);
        }
    }

    fn on_worker_state_change(&mut self, slot: usize, state: &str) {
        for sink in &mut self.sinks {
            sink.on_worker_state_change(slot, state);
        }
    }
}

/// Writes terminal transitions into the eight named logs under
/// `$logspath`, pairing with [`crate::log`]'s file set.
pub struct LogSink {
    success: std::fs::File,
    failure: std::fs::File,
    ignored: std::fs::File,
    skipped: std::fs::File,
    last_results: std::fs::File,
}

impl LogSink {
    pub fn open(logs_path: &Path) -> anyhow::Result<Self> {
        let open = |name: &str| -> anyhow::Result<std::fs::File> {
            Ok(std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(logs_path.join(name))?)
        };
        Ok(Self {
            success: open("success-list.log")?,
            failure: open("failure-list.log")?,
            ignored: open("ignored-list.log")?,
            skipped: open("skipped-list.log")?,
            last_results: open("last-results.log")?,
        })
    }
}

impl StatsSink for LogSink {
    fn on_pkg_success(&mut self, portdir: &str) {
        use std::io::Write;
        let _ = writeln!(self.success, "{portdir}");
        let _ = writeln!(self.last_results, "{portdir} success");
    }

    fn on_pkg_failure(&mut self, portdir: &str) {
        use std::io::Write;
        let _ = writeln!(self.failure, "{portdir}");
        let _ = writeln!(self.last_results, "{portdir} failed");
    }

    fn on_pkg_ignored(&mut self, portdir: &str) {
        use std::io::Write;
        let _ = writeln!(self.ignored, "{portdir}");
        let _ = writeln!(self.last_results, "{portdir} ignored");
    }

    fn on_pkg_skipped(&mut self, portdir: &str) {
        use std::io::Write;
        let _ = writeln!(self.skipped, "{portdir}");
        let _ = writeln!(self.last_results, "{portdir} skipped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl StatsSink for RecordingSink {
        fn on_pkg_success(&mut self, portdir: &str) {
            self.0.lock().unwrap().push(format!("success:{portdir}"));
        }
        fn on_pkg_failure(&mut self, portdir: &str) {
            self.0.lock().unwrap().push(format!("failure:{portdir}"));
        }
    }

    #[test]
    fn chain_invokes_every_sink_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut chain = StatsChain::new();
        chain.push(Box::new(RecordingSink(log.clone())));
        chain.push(Box::new(RecordingSink(log.clone())));

        chain.on_pkg_success("lang/a");
        chain.on_pkg_failure("lang/b");

        let events = log.lock().unwrap();
        assert_eq!(
            *events,
            vec!["success:lang/a", "success:lang/a", "failure:lang/b", "failure:lang/b"]
        );
    }
}
