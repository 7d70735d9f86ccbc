//! Completion hooks: user-configured shell scripts invoked on each
//! terminal state transition plus run-start/run-end, run through the
//! bulk pool so a slow hook never stalls the scheduler.
//!
//! Mirrors the original's `doHook`/`childHookRun` split: the scheduler
//! (or the run driver, for run-start/run-end) only decides *that* a hook
//! fires and what its environment should contain; the actual fork/exec
//! happens on a bulk worker thread, off the graph and bulk-queue locks.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;

use crate::config::{Config, HookPaths};
use crate::core::bulk::{BulkFunc, BulkJob};

/// Which event fired, used only to pick the right `RESULT=` value and
/// extra environment variables; the script path itself travels in the
/// job's `s3` slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    RunStart,
    RunEnd,
    PkgSuccess,
    PkgFailure,
    PkgIgnored,
    PkgSkipped,
}

impl HookEvent {
    fn result_tag(self) -> Option<&'static str> {
        match self {
            HookEvent::RunStart | HookEvent::RunEnd => None,
            HookEvent::PkgSuccess => Some("success"),
            HookEvent::PkgFailure => Some("failure"),
            HookEvent::PkgIgnored => Some("ignored"),
            HookEvent::PkgSkipped => Some("skipped"),
        }
    }

    fn path(self, hooks: &HookPaths) -> Option<&Path> {
        match self {
            HookEvent::RunStart => hooks.run_start.as_deref(),
            HookEvent::RunEnd => hooks.run_end.as_deref(),
            HookEvent::PkgSuccess => hooks.pkg_success.as_deref(),
            HookEvent::PkgFailure => hooks.pkg_failure.as_deref(),
            HookEvent::PkgIgnored => hooks.pkg_ignored.as_deref(),
            HookEvent::PkgSkipped => hooks.pkg_skipped.as_deref(),
        }
    }
}

/// Per-package context for `pkg_*` hooks; `None` for the two run-level
/// events.
#[derive(Debug, Clone, Default)]
pub struct HookPkgContext {
    pub portdir: String,
    pub pkgfile: String,
}

/// Counts handed to the run-end hook, matching `PORTS_BUILT`/`_FAILED`/
/// `_IGNORED`/`_SKIPPED` in the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTotals {
    pub queued: u64,
    pub built: u64,
    pub failed: u64,
    pub ignored: u64,
    pub skipped: u64,
}

/// The fixed environment every hook receives, plus whatever event-
/// specific variables [`queue_hook`] layers on top.
fn base_env(cfg: &Config) -> HashMap<String, String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    HashMap::from([
        ("PROFILE".to_owned(), cfg.profile.clone()),
        ("DIR_PACKAGES".to_owned(), path(&cfg.packages_path)),
        ("DIR_PORTS".to_owned(), path(&cfg.ports_path)),
        ("DIR_DISTFILES".to_owned(), path(&cfg.distfiles_path)),
        ("DIR_LOGS".to_owned(), path(&cfg.logs_path)),
        ("DIR_BUILDBASE".to_owned(), path(&cfg.build_base)),
    ])
}

/// If `event` has a configured script, build the job that will run it
/// and submit it to `pool`. A no-op if the hook isn't configured,
/// matching `doHook`'s `if (path == NULL) return;` short circuit.
#[allow(clippy::too_many_arguments)]
pub fn queue_hook(
    pool: &crate::core::bulk::BulkPool,
    cfg: &Config,
    event: HookEvent,
    pkg: Option<&HookPkgContext>,
    totals: Option<RunTotals>,
) {
    let Some(path) = event.path(&cfg.hooks) else {
        return;
    };

    let mut env = base_env(cfg);
    if let Some(tag) = event.result_tag() {
        env.insert("RESULT".to_owned(), tag.to_owned());
    }
    if let Some(pkg) = pkg {
        // ORIGIN excludes any `@flavor` suffix, for compatibility with
        // the upstream `synth` tool's hook contract.
        let origin = pkg.portdir.split('@').next().unwrap_or(&pkg.portdir);
        env.insert("ORIGIN".to_owned(), origin.to_owned());
        env.insert("PKGFILE".to_owned(), pkg.pkgfile.clone());
    }
    if let Some(totals) = totals {
        match event {
            HookEvent::RunStart => {
                env.insert("PORTS_QUEUED".to_owned(), totals.queued.to_string());
            }
            HookEvent::RunEnd => {
                env.insert("PORTS_BUILT".to_owned(), totals.built.to_string());
                env.insert("PORTS_FAILED".to_owned(), totals.failed.to_string());
                env.insert("PORTS_IGNORED".to_owned(), totals.ignored.to_string());
                env.insert("PORTS_SKIPPED".to_owned(), totals.skipped.to_string());
            }
            _ => {}
        }
    }

    let job = BulkJob {
        s1: pkg.map(|p| p.portdir.clone()),
        s2: Some(hook_id(event).to_owned()),
        s3: Some(path.to_string_lossy().into_owned()),
        s4: pkg.map(|p| p.pkgfile.clone()),
        ..Default::default()
    };
    pool.submit(job_with_env(job, env));
}

fn hook_id(event: HookEvent) -> &'static str {
    match event {
        HookEvent::RunStart => "hook_run_start",
        HookEvent::RunEnd => "hook_run_end",
        HookEvent::PkgSuccess => "hook_pkg_success",
        HookEvent::PkgFailure => "hook_pkg_failure",
        HookEvent::PkgIgnored => "hook_pkg_ignored",
        HookEvent::PkgSkipped => "hook_pkg_skipped",
    }
}

/// The four string slots in [`BulkJob`] carry the invocation itself
/// (`s1` origin, `s2` id, `s3` script path, `s4` pkgfile); the
/// environment doesn't fit that shape, so it rides along as a thread-
/// local-free closure capture instead — see [`hook_runner`].
fn job_with_env(job: BulkJob, env: HashMap<String, String>) -> BulkJob {
    // Encode the environment into r1 as a recoverable string so the
    // generic `BulkJob` shape (four in, four out) stays unchanged; the
    // runner closure built by `hook_runner` decodes it back out.
    let encoded = env
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n");
    BulkJob {
        r1: Some(encoded),
        ..job
    }
}

/// The function a bulk pool running hooks should be constructed with;
/// runs the script named in `s3` with the environment stashed in `r1` by
/// [`job_with_env`], and records the exit status back into `r2`.
pub fn hook_runner() -> std::sync::Arc<BulkFunc> {
    std::sync::Arc::new(|job: &mut BulkJob| {
        let Some(script) = job.s3.clone() else { return };
        let mut cmd = Command::new(&script);
        if let Some(encoded) = &job.r1 {
            for line in encoded.lines() {
                if let Some((k, v)) = line.split_once('=') {
                    cmd.env(k, v);
                }
            }
        }
        match cmd.status() {
            Ok(status) => {
                job.r2 = Some(status.code().unwrap_or(-1).to_string());
            }
            Err(e) => {
                tracing::warn!(script = %script, error = %e, "hook script failed to start");
                job.r2 = Some("-1".to_owned());
            }
        }
    })
}

/// Spawn a dedicated bulk pool for hooks, sized the same as the main
/// bulk pool (`MaxBulk`), only if at least one hook is configured.
pub fn maybe_spawn_pool(cfg: &Config) -> Option<crate::core::bulk::BulkPool> {
    cfg.hooks
        .any_configured()
        .then(|| crate::core::bulk::BulkPool::new(cfg.max_bulk as usize, hook_runner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with_hook(dir: &Path, name: &str) -> Config {
        let script = dir.join(name);
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        Config {
            profile: "default".into(),
            ports_path: dir.to_path_buf(),
            distfiles_path: dir.to_path_buf(),
            packages_path: dir.to_path_buf(),
            logs_path: dir.to_path_buf(),
            build_base: dir.to_path_buf(),
            max_workers: 1,
            max_bulk: 1,
            pkg_dep_scale_target: 0,
            swap_cap_floor_pct: 25,
            load_cap_ncpu_multiplier: 1.5,
            override_pkg_delete: false,
            use_ccache: false,
            ccache_path: None,
            leverage_prebuilt: false,
            make_conf: HashMap::new(),
            hooks: HookPaths {
                pkg_success: Some(script),
                ..Default::default()
            },
        }
    }

    #[test]
    fn unconfigured_hook_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_with_hook(dir.path(), "hook_pkg_success");
        let pool = crate::core::bulk::BulkPool::new(1, hook_runner());

        queue_hook(&pool, &cfg, HookEvent::PkgFailure, None, None);
        assert!(pool.poll().is_none());
        pool.done();
    }

    #[test]
    fn configured_hook_runs_and_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = cfg_with_hook(dir.path(), "hook_pkg_success");
        let pool = crate::core::bulk::BulkPool::new(1, hook_runner());

        let pkg = HookPkgContext {
            portdir: "devel/foo@flavor".to_owned(),
            pkgfile: "foo-1.0.pkg".to_owned(),
        };
        queue_hook(&pool, &cfg, HookEvent::PkgSuccess, Some(&pkg), None);

        let job = pool.poll().expect("hook job should complete");
        assert_eq!(job.r2.as_deref(), Some("0"));
        pool.done();
    }
}
