//! Master-side worker slot driver: forks the `worker` self-exec, wires the
//! `SOCK_STREAM` IPC socket pair, and loops in `ipcreadmsg` updating the
//! slot's visible state until a terminal message arrives or the socket
//! closes out from under it.

use std::os::fd::IntoRawFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use std::time::Instant;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::core::flags::{Phase, WorkerState};
use crate::core::ipc::{self, Cmd, WMsg};
use crate::core::worker::WorkerSlot;
use crate::error::{IpcError, SandboxError};
use crate::sandbox::{self, MountSpec};
use crate::stats::StatsSink;

/// Paths the master passes straight through into each worker's sandbox;
/// see `sandbox::mount::plan`.
pub struct SandboxPaths<'a> {
    pub host_root: &'a Path,
    pub xports: &'a Path,
    pub distfiles: &'a Path,
    pub packages: &'a Path,
    pub options: &'a Path,
}

/// Assemble a slot's sandbox mounts in order, per §4.7. Returns the
/// applied specs (for [`teardown_slot_sandbox`]) even on partial failure,
/// so the caller can unwind whatever did succeed.
pub fn prepare_slot_sandbox(
    basedir: &Path,
    worker_suffix: u32,
    paths: &SandboxPaths<'_>,
) -> (Vec<MountSpec>, Result<(), SandboxError>) {
    let specs = sandbox::plan(
        basedir,
        paths.host_root,
        worker_suffix,
        paths.xports,
        paths.distfiles,
        paths.packages,
        paths.options,
    );
    let mut applied = Vec::with_capacity(specs.len());
    for spec in specs {
        let what = mount_label(&spec);
        if let Err(e) = sandbox::domount(&spec, what) {
            return (applied, Err(e));
        }
        applied.push(spec);
    }
    (applied, Ok(()))
}

/// Unmount everything [`prepare_slot_sandbox`] mounted, in reverse order,
/// tolerating individual failures (logged, not fatal) since a partially
/// torn-down sandbox on an error path is still better than leaking all of
/// it; see §4.7 teardown and the `SandboxError::Unmount` retry policy.
pub fn teardown_slot_sandbox(applied: &[MountSpec]) -> u32 {
    let mut errors = 0;
    for spec in applied.iter().rev() {
        if let Err(e) = sandbox::dounmount(&spec.target) {
            tracing::error!(target = %spec.target.display(), error = %e, "sandbox unmount failed");
            errors += 1;
        }
    }
    errors
}

fn mount_label(spec: &MountSpec) -> &'static str {
    match spec.kind {
        sandbox::MountKind::Tmpfs => "tmpfs",
        sandbox::MountKind::BindRo => "bind-ro",
        sandbox::MountKind::BindRw => "bind-rw",
        sandbox::MountKind::Devfs => "devfs",
        sandbox::MountKind::Procfs => "procfs",
    }
}

/// Fixed descriptor the child's copy of the IPC socket is dup'd onto
/// before exec, so the hidden `worker` CLI argument is a stable constant
/// rather than whatever number the kernel happened to hand out.
pub const CHILD_SOCKET_FD: i32 = 3;

/// Spawn the sandboxed child: another invocation of this same binary in
/// `worker` mode, passed `slot#`, the IPC socket fd, `portdir`, `pkgfile`,
/// and a flags integer, per §4.5.
pub fn spawn_worker_child(
    exe: &Path,
    slot: u32,
    portdir: &str,
    pkgfile: &str,
    flags: u32,
    basedir: &Path,
) -> std::io::Result<(Child, UnixStream)> {
    let (master_end, child_end) = UnixStream::pair()?;
    let child_fd = child_end.into_raw_fd();

    let mut cmd = Command::new(exe);
    cmd.arg("worker")
        .arg(slot.to_string())
        .arg(CHILD_SOCKET_FD.to_string())
        .arg(portdir)
        .arg(pkgfile)
        .arg(flags.to_string())
        .current_dir(basedir);

    unsafe {
        cmd.pre_exec(move || {
            if child_fd != CHILD_SOCKET_FD {
                nix::unistd::dup2(child_fd, CHILD_SOCKET_FD)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            }
            let raw_flags = fcntl(CHILD_SOCKET_FD, FcntlArg::F_GETFD)
                .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            fcntl(
                CHILD_SOCKET_FD,
                FcntlArg::F_SETFD(FdFlag::from_bits_truncate(raw_flags) & !FdFlag::FD_CLOEXEC),
            )
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    if child_fd != CHILD_SOCKET_FD {
        // We leaked ownership via `into_raw_fd`; the parent's copy is no
        // longer needed once the child has its own dup.
        unsafe {
            libc::close(child_fd);
        }
    }

    Ok((child, master_end))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    Failure,
    Frozen,
    Failed,
}

/// Drive one slot from `Pending` through `Running` to a terminal state,
/// reading [`WMsg`]s off `master_end` and updating `slot` and `stats` as
/// they arrive. A clean socket close before a terminal message is a
/// [`WorkerOutcome::Failed`], matching the IPC-loss error kind.
pub fn drive_slot(
    slot: &mut WorkerSlot,
    portdir: &str,
    master_end: &mut UnixStream,
    stats: &mut dyn StatsSink,
    install_deps_required: bool,
) -> WorkerOutcome {
    slot.state = WorkerState::Running;
    slot.start_time = Some(Instant::now());
    stats.on_worker_state_change(slot.index, "running");

    loop {
        match ipc::read_msg(master_end) {
            Ok(msg) => match msg.cmd {
                Cmd::StatusUpdate => {
                    slot.lines = msg.lines.max(0) as u64;
                    slot.memuse = msg.memuse.max(0) as u64;
                    slot.phase = Phase::from_index(msg.phase);
                    let phase_name = slot.phase.map(Phase::name).unwrap_or("?");
                    stats.on_status_update(slot.index, portdir, phase_name, slot.lines);
                }
                Cmd::InstallPkgs => {
                    let ack = WMsg::install_pkgs_ack(install_deps_required);
                    if ipc::write_msg(master_end, &ack).is_err() {
                        slot.state = WorkerState::Failed;
                        return WorkerOutcome::Failed;
                    }
                }
                Cmd::Success => {
                    slot.state = WorkerState::Done;
                    return WorkerOutcome::Success;
                }
                Cmd::Failure => {
                    slot.state = WorkerState::Failed;
                    return WorkerOutcome::Failure;
                }
                Cmd::Freeze => {
                    slot.state = WorkerState::Frozen;
                    return WorkerOutcome::Frozen;
                }
            },
            Err(IpcError::UnexpectedEof) | Err(IpcError::ShortRead { .. }) | Err(IpcError::Io(_)) => {
                slot.state = WorkerState::Failed;
                return WorkerOutcome::Failed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn eof_without_terminal_message_counts_as_failed() {
        let (mut a, b) = UnixStream::pair().unwrap();
        drop(b); // simulate a worker dying before any message

        let mut slot = WorkerSlot::new(0, PathBuf::from("/tmp/slot0"));
        let mut stats = crate::stats::StatsChain::new();
        let outcome = drive_slot(&mut slot, "devel/x", &mut a, &mut stats, false);

        assert_eq!(outcome, WorkerOutcome::Failed);
        assert_eq!(slot.state, WorkerState::Failed);
    }

    #[test]
    fn success_message_transitions_to_done() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        ipc::write_msg(&mut b, &WMsg::success()).unwrap();

        let mut slot = WorkerSlot::new(1, PathBuf::from("/tmp/slot1"));
        let mut stats = crate::stats::StatsChain::new();
        let outcome = drive_slot(&mut slot, "devel/x", &mut a, &mut stats, false);

        assert_eq!(outcome, WorkerOutcome::Success);
        assert_eq!(slot.state, WorkerState::Done);
    }
}
