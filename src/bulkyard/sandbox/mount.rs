//! Per-worker sandbox mount assembly and teardown.
//!
//! Mirrors the original's `domount()`/`dounmount()` pair: a small
//! enumeration of mount kinds (tmpfs scratch, read-only system bind
//! mounts, read-write host passthroughs, `/dev`, `/proc`) applied in a
//! fixed order to build a worker's chroot, and torn down in reverse with
//! retries since a busy mount point is a recoverable, not fatal,
//! condition.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::error::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    /// Fresh, empty tmpfs, optionally size-capped.
    Tmpfs,
    /// Read-only bind mount of a host directory (`nullfs-ro` in the
    /// original's BSD terminology; a Linux bind mount remounted `MS_RDONLY`).
    BindRo,
    /// Read-write bind mount of a host directory.
    BindRw,
    /// `/dev`.
    Devfs,
    /// `/proc`.
    Procfs,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub kind: MountKind,
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    /// tmpfs size, e.g. `"64m"`; `None` means the kernel default.
    pub size: Option<String>,
}

impl MountSpec {
    pub fn tmpfs(target: impl Into<PathBuf>, size: Option<&str>) -> Self {
        Self {
            kind: MountKind::Tmpfs,
            source: None,
            target: target.into(),
            size: size.map(str::to_owned),
        }
    }

    pub fn bind_ro(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            kind: MountKind::BindRo,
            source: Some(source.into()),
            target: target.into(),
            size: None,
        }
    }

    pub fn bind_rw(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            kind: MountKind::BindRw,
            source: Some(source.into()),
            target: target.into(),
            size: None,
        }
    }
}

/// Build the ordered mount plan for one worker's sandbox at `basedir`,
/// given the host's system root, the per-worker discrete directory
/// suffix, and the four externally supplied real paths (xports,
/// distfiles, packages, options).
///
/// The order follows the original exactly: root tmpfs; `/boot` read-only;
/// `/boot/modules.local` tmpfs; `/dev`; `/proc`; the per-worker discrete
/// copies of the busiest system directories; the remaining read-only
/// system directories; `/usr/local` as a medium tmpfs; the four host
/// passthroughs; `/construction` as a large tmpfs for the actual build.
pub fn plan(
    basedir: &Path,
    host_root: &Path,
    worker_suffix: u32,
    xports: &Path,
    distfiles: &Path,
    packages: &Path,
    options: &Path,
) -> Vec<MountSpec> {
    let host = |rel: &str| host_root.join(rel);
    let target = |rel: &str| basedir.join(rel);
    let discrete = |rel: &str| host_root.join(format!("{rel}.{worker_suffix:03}"));

    vec![
        MountSpec::tmpfs(basedir, None),
        MountSpec::bind_ro(host("boot"), target("boot")),
        MountSpec::tmpfs(target("boot/modules.local"), None),
        MountSpec {
            kind: MountKind::Devfs,
            source: None,
            target: target("dev"),
            size: None,
        },
        MountSpec {
            kind: MountKind::Procfs,
            source: None,
            target: target("proc"),
            size: None,
        },
        MountSpec::bind_ro(discrete("bin"), target("bin")),
        MountSpec::bind_ro(discrete("lib"), target("lib")),
        MountSpec::bind_ro(discrete("libexec"), target("libexec")),
        MountSpec::bind_ro(discrete("usr/bin"), target("usr/bin")),
        MountSpec::bind_ro(host("usr/include"), target("usr/include")),
        MountSpec::bind_ro(host("usr/lib"), target("usr/lib")),
        MountSpec::bind_ro(host("usr/libdata"), target("usr/libdata")),
        MountSpec::bind_ro(host("usr/libexec"), target("usr/libexec")),
        MountSpec::bind_ro(host("usr/sbin"), target("usr/sbin")),
        MountSpec::bind_ro(host("usr/share"), target("usr/share")),
        MountSpec::tmpfs(target("usr/local"), Some("256m")),
        MountSpec::bind_rw(xports, target("xports")),
        MountSpec::bind_rw(options, target("options")),
        MountSpec::bind_rw(packages, target("packages")),
        MountSpec::bind_rw(distfiles, target("distfiles")),
        MountSpec::tmpfs(target("construction"), Some("4g")),
    ]
}

/// Apply one mount. `what` is a short label used only in error messages.
pub fn domount(spec: &MountSpec, what: &'static str) -> Result<(), SandboxError> {
    std::fs::create_dir_all(&spec.target).ok();

    let (fstype, flags, data): (&str, MsFlags, Option<String>) = match spec.kind {
        MountKind::Tmpfs => (
            "tmpfs",
            MsFlags::empty(),
            spec.size.as_ref().map(|s| format!("size={s}")),
        ),
        MountKind::BindRo => ("none", MsFlags::MS_BIND, None),
        MountKind::BindRw => ("none", MsFlags::MS_BIND, None),
        MountKind::Devfs => ("devtmpfs", MsFlags::empty(), None),
        MountKind::Procfs => ("proc", MsFlags::empty(), None),
    };

    mount(
        spec.source.as_deref(),
        &spec.target,
        Some(fstype),
        flags,
        data.as_deref(),
    )
    .map_err(|source| SandboxError::Mount {
        what,
        path: spec.target.clone(),
        source,
    })?;

    // A bind mount inherits the source's write permissions; remount
    // read-only as a second pass, matching nullfs-ro semantics.
    if spec.kind == MountKind::BindRo {
        mount(
            None::<&Path>,
            &spec.target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(|source| SandboxError::Mount {
            what,
            path: spec.target.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Unmount `target`, retrying up to 10 times with a 5 s backoff (matching
/// the original's teardown retry policy) since EBUSY on a just-finished
/// build is common and recoverable.
pub fn dounmount(target: &Path) -> Result<(), SandboxError> {
    const MAX_ATTEMPTS: u32 = 10;
    const BACKOFF: Duration = Duration::from_secs(5);

    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => return Ok(()),
            Err(nix::Error::EINVAL) => return Ok(()), // already unmounted
            Err(e) => {
                last_err = Some(e);
                if attempt < MAX_ATTEMPTS {
                    thread::sleep(BACKOFF);
                }
            }
        }
    }

    Err(SandboxError::Unmount {
        path: target.to_path_buf(),
        attempts: MAX_ATTEMPTS,
        source: last_err.unwrap(),
    })
}
