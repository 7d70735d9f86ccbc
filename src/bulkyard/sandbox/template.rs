//! The base sandbox template and per-worker discrete directory copies.
//!
//! `$buildbase/Template` is an authoritative minimal root, rebuilt lazily
//! when it's missing, stale (host `/bin/ls` newer than a worker's copy),
//! or the worker count changed. A `.template.good` sentinel marks it
//! consistent so a crash mid-rebuild is detected rather than trusted.

use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::error::SandboxError;

/// Subdirectories copied out per-worker to avoid read contention, as
/// opposed to the rest of the template which is bind-mounted read-only
/// and shared across all workers.
pub const DISCRETE_DIRS: &[&str] = &["bin", "lib", "libexec", "usr/bin"];

pub struct Template {
    pub root: PathBuf,
}

impl Template {
    pub fn new(build_base: &Path) -> Self {
        Self {
            root: build_base.join("Template"),
        }
    }

    fn sentinel(&self) -> PathBuf {
        self.root.join(".template.good")
    }

    pub fn is_good(&self) -> bool {
        self.sentinel().is_file()
    }

    /// Whether the template must be rebuilt: either it was never built, or
    /// the host's `/bin/ls` is newer than the worker `000`'s copy of it,
    /// or an explicit rebuild was requested.
    pub fn needs_rebuild(&self, host_root: &Path, force: bool) -> bool {
        if force || !self.is_good() {
            return true;
        }
        let host_ls = host_root.join("bin/ls");
        let worker_ls = self.root.join("bin.000/ls");
        match (fs::metadata(&host_ls), fs::metadata(&worker_ls)) {
            (Ok(host_meta), Ok(worker_meta)) => {
                FileTime::from_last_modification_time(&host_meta)
                    > FileTime::from_last_modification_time(&worker_meta)
            }
            _ => true,
        }
    }

    /// Create (or recreate) the template tree and sentinel. Real directory
    /// population is environment-specific (it copies a minimal host root);
    /// this lays down the structure and leaves `DISCRETE_DIRS` to be
    /// populated per-worker by [`Template::materialize_worker_copies`].
    pub fn rebuild(&self, host_root: &Path) -> Result<(), SandboxError> {
        let _ = fs::remove_file(self.sentinel());
        fs::create_dir_all(&self.root)
            .map_err(|e| SandboxError::Template(format!("mkdir {}: {e}", self.root.display())))?;

        for dir in DISCRETE_DIRS {
            let src = host_root.join(dir);
            let dst = self.root.join(dir);
            if src.is_dir() {
                copy_dir_shallow(&src, &dst)
                    .map_err(|e| SandboxError::Template(format!("copy {dir}: {e}")))?;
            }
        }

        fs::write(self.sentinel(), b"ok")
            .map_err(|e| SandboxError::Template(format!("write sentinel: {e}")))?;
        Ok(())
    }

    /// Populate `bin.NNN`, `lib.NNN`, `libexec.NNN`, `usr/bin.NNN` for
    /// worker `suffix` by copying the template's canonical copy, so each
    /// worker reads from its own inode set instead of contending on one.
    pub fn materialize_worker_copies(&self, suffix: u32) -> Result<(), SandboxError> {
        for dir in DISCRETE_DIRS {
            let src = self.root.join(dir);
            let dst = self.root.join(format!("{dir}.{suffix:03}"));
            if src.is_dir() {
                copy_dir_shallow(&src, &dst)
                    .map_err(|e| SandboxError::Template(format!("copy {dir}.{suffix:03}: {e}")))?;
            }
        }
        Ok(())
    }
}

fn copy_dir_shallow(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_shallow(&entry.path(), &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn needs_rebuild_when_sentinel_absent() {
        let dir = tempfile::tempdir().unwrap();
        let tpl = Template::new(dir.path());
        assert!(tpl.needs_rebuild(dir.path(), false));
    }

    #[test]
    fn rebuild_creates_sentinel() {
        let host = tempfile::tempdir().unwrap();
        fs::create_dir_all(host.path().join("bin")).unwrap();
        let build_base = tempfile::tempdir().unwrap();

        let tpl = Template::new(build_base.path());
        tpl.rebuild(host.path()).unwrap();

        assert!(tpl.is_good());
        assert!(!tpl.needs_rebuild(host.path(), false));
    }
}
