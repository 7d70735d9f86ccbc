//! The bulk pool: a small fixed thread pool for short helper jobs (port
//! metadata extraction, package-file probes, completion hooks) that must
//! run off the scheduler's lock.
//!
//! Each job carries four opaque string slots in and four out. The pool
//! commits to a strict two-queue shape: a submit FIFO that worker threads
//! drain, and a response FIFO that `poll` drains in completion order. A
//! single mutex guards both queues and the outstanding-job count; a
//! condvar each for "a submission arrived" and "a response arrived" is
//! how threads block without spinning.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

pub const MAX_BULK: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    Unlisted,
    OnSubmit,
    OnRun,
    IsRunning,
    OnResponse,
}

#[derive(Debug, Clone, Default)]
pub struct BulkJob {
    pub s1: Option<String>,
    pub s2: Option<String>,
    pub s3: Option<String>,
    pub s4: Option<String>,
    pub r1: Option<String>,
    pub r2: Option<String>,
    pub r3: Option<String>,
    pub r4: Option<String>,
}

struct Shared {
    submit: VecDeque<BulkJob>,
    response: VecDeque<BulkJob>,
    in_flight: usize,
    terminate: bool,
}

pub type BulkFunc = dyn Fn(&mut BulkJob) + Send + Sync;

/// A running bulk pool. `done()` (or `Drop`) joins all worker threads.
pub struct BulkPool {
    shared: Arc<Mutex<Shared>>,
    submit_cv: Arc<Condvar>,
    response_cv: Arc<Condvar>,
    threads: Vec<JoinHandle<()>>,
}

impl BulkPool {
    /// Spawn `jobs` worker threads (capped at [`MAX_BULK`]), each running
    /// `func` on whatever job it claims.
    pub fn new(jobs: usize, func: Arc<BulkFunc>) -> Self {
        let jobs = jobs.min(MAX_BULK).max(1);
        let shared = Arc::new(Mutex::new(Shared {
            submit: VecDeque::new(),
            response: VecDeque::new(),
            in_flight: 0,
            terminate: false,
        }));
        let submit_cv = Arc::new(Condvar::new());
        let response_cv = Arc::new(Condvar::new());

        let mut threads = Vec::with_capacity(jobs);
        for i in 0..jobs {
            let shared = shared.clone();
            let submit_cv = submit_cv.clone();
            let response_cv = response_cv.clone();
            let func = func.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("bulk-{i}"))
                    .spawn(move || worker_loop(shared, submit_cv, response_cv, func))
                    .expect("bulk worker thread spawn failed"),
            );
        }

        Self {
            shared,
            submit_cv,
            response_cv,
            threads,
        }
    }

    /// Queue a job; wakes one idle worker.
    pub fn submit(&self, job: BulkJob) {
        let mut shared = self.shared.lock().unwrap();
        shared.in_flight += 1;
        shared.submit.push_back(job);
        self.submit_cv.notify_one();
    }

    /// Block until a completed job is available, or return `None` if
    /// nothing is in flight and nothing is queued.
    pub fn poll(&self) -> Option<BulkJob> {
        let mut shared = self.shared.lock().unwrap();
        loop {
            if let Some(job) = shared.response.pop_front() {
                return Some(job);
            }
            if shared.in_flight == 0 {
                return None;
            }
            shared = self.response_cv.wait(shared).unwrap();
        }
    }

    /// Drain outstanding jobs and join worker threads.
    pub fn done(mut self) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.terminate = true;
            shared.submit.clear();
        }
        self.submit_cv.notify_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn worker_loop(
    shared: Arc<Mutex<Shared>>,
    submit_cv: Arc<Condvar>,
    response_cv: Arc<Condvar>,
    func: Arc<BulkFunc>,
) {
    loop {
        let mut job = {
            let mut guard = shared.lock().unwrap();
            loop {
                if let Some(job) = guard.submit.pop_front() {
                    break job;
                }
                if guard.terminate {
                    return;
                }
                guard = submit_cv.wait(guard).unwrap();
            }
        };

        func(&mut job);

        let mut guard = shared.lock().unwrap();
        guard.in_flight -= 1;
        guard.response.push_back(job);
        drop(guard);
        response_cv.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_come_back_with_results_populated() {
        let pool = BulkPool::new(4, Arc::new(|job: &mut BulkJob| {
            job.r1 = job.s1.clone().map(|s| s.to_uppercase());
        }));

        for i in 0..8 {
            pool.submit(BulkJob {
                s1: Some(format!("origin-{i}")),
                ..Default::default()
            });
        }

        let mut seen = 0;
        while let Some(job) = pool.poll() {
            assert!(job.r1.unwrap().starts_with("ORIGIN-"));
            seen += 1;
        }
        assert_eq!(seen, 8);
        pool.done();
    }

    #[test]
    fn poll_returns_none_when_queue_is_empty() {
        let pool = BulkPool::new(2, Arc::new(|_: &mut BulkJob| {}));
        assert!(pool.poll().is_none());
        pool.done();
    }
}
