//! The dynamic concurrency controller: every ~5 s, derive
//! `DynamicMaxWorkers` from three independent caps — system load, swap
//! use, and the aggregate installed-dependency footprint of in-flight
//! workers — and apply a slow-start ramp so a footprint spike backs off
//! concurrency gradually rather than in one step.

use std::time::{Duration, Instant};

use sysinfo::System;

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);
const SLOW_START_INTERVAL: Duration = Duration::from_secs(30);

/// Read-only snapshot of the inputs the controller reduces to a cap. Kept
/// separate from the sampling mechanism so the cap arithmetic is testable
/// without touching `/proc`.
#[derive(Debug, Clone, Copy)]
pub struct SystemSample {
    pub load_avg_1min: f64,
    pub swap_pct: f64,
    pub waiting_on_page_faults: u32,
    pub ncpus: u32,
}

pub struct DynamicController {
    max_workers: u32,
    pkg_dep_scale_target: u64,
    dynamic_max_workers: u32,
    last_tick: Option<Instant>,
    last_ramp: Option<Instant>,
    sys: System,
}

impl DynamicController {
    pub fn new(max_workers: u32, pkg_dep_scale_target: u64) -> Self {
        Self {
            max_workers,
            pkg_dep_scale_target,
            dynamic_max_workers: max_workers,
            last_tick: None,
            last_ramp: None,
            sys: System::new(),
        }
    }

    pub fn dynamic_max_workers(&self) -> u32 {
        self.dynamic_max_workers
    }

    /// Whether at least [`TICK_INTERVAL`] has elapsed since the last tick.
    pub fn due(&self, now: Instant) -> bool {
        match self.last_tick {
            None => true,
            Some(last) => now.duration_since(last) >= TICK_INTERVAL,
        }
    }

    /// Sample live system state. Exposed separately from [`Self::tick`] so
    /// a caller (or a test) can supply a synthetic [`SystemSample`]
    /// instead of reading the real machine.
    pub fn sample(&mut self) -> SystemSample {
        self.sys.refresh_memory();
        let load = System::load_average();
        let ncpus = num_cpus::get().max(1) as u32;
        let total_swap = self.sys.total_swap().max(1);
        let used_swap = self.sys.used_swap();
        SystemSample {
            load_avg_1min: load.one,
            swap_pct: used_swap as f64 / total_swap as f64 * 100.0,
            waiting_on_page_faults: 0,
            ncpus,
        }
    }

    /// Recompute `DynamicMaxWorkers` from a sample plus the live
    /// aggregate `running_pkg_dep_size`, gated to run at most once per
    /// [`TICK_INTERVAL`].
    pub fn tick(&mut self, now: Instant, sample: SystemSample, running_pkg_dep_size: u64) -> u32 {
        if !self.due(now) {
            return self.dynamic_max_workers;
        }
        self.last_tick = Some(now);

        let load_cap = load_cap(sample, self.max_workers);
        let swap_cap = swap_cap(sample.swap_pct, self.max_workers);
        let dep_cap = self.dep_size_cap(now, running_pkg_dep_size);

        let mut next = load_cap.min(swap_cap).min(dep_cap);
        // "Allow at most +1 per update when increasing."
        if next > self.dynamic_max_workers {
            next = self.dynamic_max_workers + 1;
        }
        self.dynamic_max_workers = next.clamp(1, self.max_workers);
        self.dynamic_max_workers
    }

    fn dep_size_cap(&mut self, now: Instant, running_pkg_dep_size: u64) -> u32 {
        let target = self.pkg_dep_scale_target;
        if target == 0 {
            return self.max_workers;
        }
        if running_pkg_dep_size > target {
            self.last_ramp = Some(now);
            return self.dynamic_max_workers.saturating_sub(1).max(1);
        }
        if running_pkg_dep_size > target / 2 {
            let ramp_due = match self.last_ramp {
                None => true,
                Some(last) => now.duration_since(last) >= SLOW_START_INTERVAL,
            };
            if ramp_due {
                self.last_ramp = Some(now);
                return (self.dynamic_max_workers + 1).min(self.max_workers);
            }
            return self.dynamic_max_workers;
        }
        self.max_workers
    }
}

/// Full concurrency if load <= 1.5x ncpus; linearly down to 25% at 5x
/// ncpus; clamped below that. Load is padded by processes blocked on page
/// faults so thrashing reduces the cap faster than it reduces load.
fn load_cap(sample: SystemSample, max_workers: u32) -> u32 {
    let ncpus = sample.ncpus as f64;
    let effective_load = sample.load_avg_1min + sample.waiting_on_page_faults as f64;
    let low = 1.5 * ncpus;
    let high = 5.0 * ncpus;

    let fraction = if effective_load <= low {
        1.0
    } else if effective_load >= high {
        0.25
    } else {
        1.0 - 0.75 * (effective_load - low) / (high - low)
    };
    ((max_workers as f64) * fraction).round().max(1.0) as u32
}

/// Full concurrency if swap use <= 10%; linearly down to 25% at 40%;
/// clamped below that.
fn swap_cap(swap_pct: f64, max_workers: u32) -> u32 {
    let fraction = if swap_pct <= 10.0 {
        1.0
    } else if swap_pct >= 40.0 {
        0.25
    } else {
        1.0 - 0.75 * (swap_pct - 10.0) / 30.0
    };
    ((max_workers as f64) * fraction).round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(load: f64, swap_pct: f64, ncpus: u32) -> SystemSample {
        SystemSample {
            load_avg_1min: load,
            swap_pct,
            waiting_on_page_faults: 0,
            ncpus,
        }
    }

    #[test]
    fn light_load_allows_full_concurrency() {
        assert_eq!(load_cap(sample(1.0, 0.0, 4), 8), 8);
    }

    #[test]
    fn heavy_load_reduces_to_quarter() {
        assert_eq!(load_cap(sample(50.0, 0.0, 4), 8), 2);
    }

    #[test]
    fn swap_forced_to_50pct_drops_to_quarter_within_one_tick() {
        let cap = swap_cap(50.0, 8);
        assert_eq!(cap, 2);
    }

    #[test]
    fn dep_size_cap_decrements_when_over_target() {
        let mut ctrl = DynamicController::new(8, 1000);
        ctrl.dynamic_max_workers = 8;
        let now = Instant::now();
        let cap = ctrl.dep_size_cap(now, 1500);
        assert_eq!(cap, 7);
    }

    #[test]
    fn dep_size_cap_ramps_at_most_once_per_30s() {
        let mut ctrl = DynamicController::new(8, 1000);
        ctrl.dynamic_max_workers = 4;
        let t0 = Instant::now();
        assert_eq!(ctrl.dep_size_cap(t0, 600), 5);
        // Immediately after, still within the slow-start window.
        assert_eq!(ctrl.dep_size_cap(t0, 600), 5);
    }

    #[test]
    fn tick_never_increases_by_more_than_one() {
        let mut ctrl = DynamicController::new(8, 0);
        ctrl.dynamic_max_workers = 1;
        let now = Instant::now();
        let next = ctrl.tick(now, sample(0.1, 0.0, 8), 0);
        assert_eq!(next, 2);
    }
}
