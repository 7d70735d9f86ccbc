//! The WORKER mode driver: what runs inside the process the master
//! self-execs into a sandboxed child. Single-slot, single-threaded for
//! build work — it assembles the sandbox, runs the fixed phase pipeline
//! under a pty-attached watchdog, reports progress back to the master
//! over the IPC socket, lands the finished artifact, and tears its own
//! mounts down.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::pty::openpty;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, execvp, fork, ForkResult, Pid};

use bulkyard_util::copy_atomic;

use crate::core::flags::Phase;
use crate::core::ipc::{self, Cmd, WMsg};

pub struct WorkerContext {
    pub slot: u32,
    pub portdir: String,
    pub pkgfile: String,
    pub basedir: PathBuf,
    pub repo_dir: PathBuf,
    pub make_conf: HashMap<String, String>,
    pub flavor: Option<String>,
    pub make_jobs_number: Option<u32>,
    pub developer_mode: bool,
    pub debugstop: bool,
    pub install_deps_required: bool,
}

/// Build the environment the fixed pipeline's build tool invocations run
/// under: a minimal, explicit set rather than whatever leaked in from the
/// master's own environment.
pub fn build_environment(ctx: &WorkerContext) -> Vec<(String, String)> {
    let mut env = vec![
        ("DISTDIR".to_owned(), "/distfiles".to_owned()),
        ("WRKDIRPREFIX".to_owned(), "/construction".to_owned()),
        ("PACKAGES".to_owned(), "/packages".to_owned()),
        ("PKGDIR".to_owned(), "/packages".to_owned()),
        ("PATH".to_owned(), "/sbin:/bin:/usr/sbin:/usr/bin:/usr/local/sbin:/usr/local/bin".to_owned()),
    ];
    if let Some(n) = ctx.make_jobs_number {
        env.push(("MAKE_JOBS_NUMBER".to_owned(), n.to_string()));
    }
    if let Some(flavor) = &ctx.flavor {
        env.push(("FLAVOR".to_owned(), flavor.clone()));
    }
    for (k, v) in &ctx.make_conf {
        env.push((k.clone(), v.clone()));
    }
    env
}

/// Result of running one phase.
#[derive(Debug)]
enum PhaseOutcome {
    Completed { lines: u64 },
    TimedOut,
    ChildError(String),
}

/// `ipc_fd` is the fixed descriptor ([`crate::ops::worker_slot::CHILD_SOCKET_FD`])
/// the master dup'd its end of the `SOCK_STREAM` pair onto before exec.
pub fn run(ctx: WorkerContext, ipc_fd: RawFd) -> i32 {
    // SAFETY: `ipc_fd` was handed to us across exec specifically for this
    // purpose, and nothing else in this process touches it.
    let mut ipc = unsafe { UnixStream::from_raw_fd(ipc_fd) };

    become_subreaper();
    install_teardown_handlers();

    let env = build_environment(&ctx);

    // `ctx.basedir` arrives already mounted: the master's sandbox manager
    // (`crate::sandbox`) assembles and owns the mount plan before this
    // process is exec'd, and tears it down after this process reports a
    // terminal IPC message. This process only needs it to exist.
    if !ctx.basedir.is_dir() {
        tracing::error!(portdir = %ctx.portdir, "sandbox basedir missing at worker start");
        let _ = ipc::write_msg(&mut ipc, &WMsg::failure());
        return 1;
    }

    if ctx.install_deps_required {
        let ack = negotiate_install_pkgs(&mut ipc);
        if !ack {
            tracing::warn!(portdir = %ctx.portdir, "master declined install-pkgs step");
        }
    }

    let mut phases: Vec<Phase> = Vec::new();
    if ctx.developer_mode {
        phases.extend(Phase::DEVELOPER_DUMPS);
    }
    phases.extend(Phase::PIPELINE);
    phases.push(Phase::CheckPlist);
    phases.push(Phase::Package);

    let mut success = true;
    for phase in phases {
        match dophase(&ctx, phase, &env, &mut ipc) {
            Ok(PhaseOutcome::Completed { .. }) => {}
            Ok(PhaseOutcome::TimedOut) => {
                tracing::error!(portdir = %ctx.portdir, phase = phase.name(), "watchdog timeout");
                success = false;
                break;
            }
            Ok(PhaseOutcome::ChildError(msg)) => {
                tracing::error!(portdir = %ctx.portdir, phase = phase.name(), error = %msg, "phase failed");
                success = false;
                break;
            }
            Err(e) => {
                tracing::error!(portdir = %ctx.portdir, phase = phase.name(), error = %e, "phase setup failed");
                success = false;
                break;
            }
        }
    }

    if success {
        if let Err(e) = land_artifact(&ctx) {
            tracing::error!(portdir = %ctx.portdir, error = %e, "artifact placement failed");
            success = false;
        }
    }

    let outcome_msg = if success && ctx.debugstop {
        WMsg::freeze()
    } else if success {
        WMsg::success()
    } else {
        WMsg::failure()
    };
    let _ = ipc::write_msg(&mut ipc, &outcome_msg);

    // Mount teardown happens master-side once the slot thread observes
    // this terminal message, skipped entirely when DEBUGSTOP is set so an
    // operator can inspect the sandbox in place.

    if success {
        0
    } else {
        1
    }
}

fn become_subreaper() {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0);
    }
}

/// TERM/INT/HUP during a build mean "abandon this package": exit promptly
/// so the master sees an IPC close and counts it as FAILED rather than
/// hanging the slot. Mount teardown for the abandoned sandbox is the
/// master's responsibility, same as the success/failure path.
fn install_teardown_handlers() {
    for sig in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT, signal_hook::consts::SIGHUP] {
        let _ = unsafe { signal_hook::low_level::register(sig, || std::process::exit(130)) };
    }
}

fn negotiate_install_pkgs(ipc: &mut UnixStream) -> bool {
    match ipc::read_msg(ipc) {
        Ok(msg) if msg.cmd == Cmd::InstallPkgs => msg.status != 0,
        _ => false,
    }
}

/// Run one phase inside a forked pty-attached child that chroots into the
/// sandbox and execs the phase's build-tool invocation, polling its
/// output, reporting status upstream once a second, and enforcing a
/// load-scaled watchdog timeout.
fn dophase(
    ctx: &WorkerContext,
    phase: Phase,
    env: &[(String, String)],
    ipc: &mut UnixStream,
) -> Result<PhaseOutcome, String> {
    let pty = openpty(None, None).map_err(|e| format!("openpty: {e}"))?;

    match unsafe { fork() }.map_err(|e| format!("fork: {e}"))? {
        ForkResult::Parent { child } => {
            drop(pty.slave);
            let outcome = watch_phase(ctx, phase, child, pty.master.as_raw_fd(), ipc);
            let _ = waitpid(child, None);
            outcome
        }
        ForkResult::Child => {
            drop(pty.master);
            run_phase_child(ctx, phase, env, pty.slave.as_raw_fd());
            unsafe { libc::_exit(127) };
        }
    }
}

/// Runs only in the forked phase child, between fork and exec/chroot.
fn run_phase_child(ctx: &WorkerContext, phase: Phase, env: &[(String, String)], pty_slave: RawFd) {
    unsafe {
        libc::setsid();
        libc::dup2(pty_slave, libc::STDIN_FILENO);
        libc::dup2(pty_slave, libc::STDOUT_FILENO);
        libc::dup2(pty_slave, libc::STDERR_FILENO);
        if pty_slave > libc::STDERR_FILENO {
            libc::close(pty_slave);
        }
    }

    if chroot(&ctx.basedir).is_err() {
        unsafe { libc::_exit(126) };
    }
    let _ = chdir("/construction");

    for (k, v) in env {
        unsafe {
            let _ = std::env::set_var(k, v);
        }
    }

    let argv = phase_argv(phase);
    let c_argv: Vec<std::ffi::CString> =
        argv.iter().map(|a| std::ffi::CString::new(a.as_bytes()).unwrap()).collect();
    let _ = execvp(&c_argv[0], &c_argv);
    unsafe { libc::_exit(127) };
}

/// The fixed-pipeline phases invoke the external build tool with the
/// phase name as its target; the tool's own argument grammar is an
/// out-of-scope external collaborator's concern.
fn phase_argv(phase: Phase) -> Vec<String> {
    vec!["/usr/bin/make".to_owned(), phase.name().to_owned()]
}

fn watch_phase(
    ctx: &WorkerContext,
    phase: Phase,
    child: Pid,
    pty_master: RawFd,
    ipc: &mut UnixStream,
) -> Result<PhaseOutcome, String> {
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let nominal = Duration::from_secs(phase.nominal_minutes() as u64 * 60);
    let mut last_output = Instant::now();
    let mut last_status = Instant::now();
    let mut lines: u64 = 0;
    let mut buf = [0u8; 1024];

    // SAFETY: `pty_master` stays open for the duration of this call; we
    // never close it ourselves (the `Pty` guard in `dophase` owns it).
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(pty_master) };

    loop {
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let _ = poll(&mut fds, PollTimeout::from(1000u16));

        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            let n = unsafe {
                libc::read(pty_master, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                let got = &buf[..n as usize];
                lines += got.iter().filter(|&&b| b == b'\n').count() as u64;
                last_output = Instant::now();
            } else if n == 0 {
                break;
            }
        }

        match waitpid(child, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                if code == 0 {
                    return Ok(PhaseOutcome::Completed { lines });
                }
                return Ok(PhaseOutcome::ChildError(format!("exit code {code}")));
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(PhaseOutcome::ChildError(format!("killed by {sig}")));
            }
            _ => {}
        }

        if last_status.elapsed() >= Duration::from_secs(1) {
            last_status = Instant::now();
            let memuse = tmpfs_usage(&ctx.basedir.join("construction"));
            let msg = WMsg::status_update(phase.to_index(), lines as i64, memuse as i64);
            if ipc::write_msg(ipc, &msg).is_err() {
                return Err("master IPC socket closed".to_owned());
            }
        }

        let timeout = effective_timeout(nominal);
        if last_output.elapsed() >= timeout {
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Ok(PhaseOutcome::TimedOut);
        }
    }

    Ok(PhaseOutcome::Completed { lines })
}

/// Scale the nominal timeout by observed 2-minute load average relative to
/// cpu count, capped at 4x, per §4.8.
fn effective_timeout(nominal: Duration) -> Duration {
    let ncpus = num_cpus::get().max(1) as f64;
    let mut sys = sysinfo::System::new();
    sys.refresh_cpu_usage();
    let load = sysinfo::System::load_average().five / ncpus;
    let scale = load.max(1.0).min(4.0);
    Duration::from_secs_f64(nominal.as_secs_f64() * scale)
}

fn tmpfs_usage(path: &Path) -> u64 {
    use nix::sys::statvfs::statvfs;
    match statvfs(path) {
        Ok(stat) => (stat.blocks() - stat.blocks_available()) * stat.fragment_size(),
        Err(_) => 0,
    }
}

fn land_artifact(ctx: &WorkerContext) -> std::io::Result<()> {
    let src = ctx.basedir.join("packages").join(&ctx.pkgfile);
    let dst = ctx.repo_dir.join(&ctx.pkgfile);
    copy_atomic(&src, &dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_environment_carries_flavor_and_jobs() {
        let ctx = WorkerContext {
            slot: 0,
            portdir: "lang/foo@bar".to_owned(),
            pkgfile: "foo-1.0.pkg".to_owned(),
            basedir: PathBuf::from("/tmp/slot0"),
            repo_dir: PathBuf::from("/tmp/repo"),
            make_conf: HashMap::new(),
            flavor: Some("bar".to_owned()),
            make_jobs_number: Some(4),
            developer_mode: false,
            debugstop: false,
            install_deps_required: false,
        };
        let env = build_environment(&ctx);
        assert!(env.contains(&("FLAVOR".to_owned(), "bar".to_owned())));
        assert!(env.contains(&("MAKE_JOBS_NUMBER".to_owned(), "4".to_owned())));
    }

    #[test]
    fn effective_timeout_never_drops_below_nominal() {
        let nominal = Duration::from_secs(600);
        let scaled = effective_timeout(nominal);
        assert!(scaled >= nominal);
    }
}
