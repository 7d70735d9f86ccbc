//! Fork-and-exec process execution with a shared stderr "error log" socket.
//!
//! Every child spawned through a [`ProcessExecutor`] gets its own stdout
//! pipe (read by the caller directly, so output ordering per child is
//! trivially preserved) but shares one process-wide `SOCK_DGRAM` socket pair
//! for stderr. Datagram boundaries keep each write() from a child as one
//! message, and `SO_PASSCRED` lets the reader recover the sender's pid from
//! kernel-verified credentials rather than trusting a label the child could
//! forge. A background thread demultiplexes those datagrams by pid and logs
//! them through `tracing`, tagged with whatever `logid` the caller
//! registered for that pid.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use nix::sys::socket::{
    self, AddressFamily, MsgFlags, SockFlag, SockType, UnixCredentials,
};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execv, fork, pipe, ForkResult, Pid};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),
    #[error("exec of {path} failed: {source}")]
    Exec {
        path: String,
        #[source]
        source: nix::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("waitpid failed: {0}")]
    Wait(#[source] nix::Error),
}

/// A child process spawned by [`ProcessExecutor::open`].
pub struct SpawnedProcess {
    pub pid: Pid,
    pub stdout: File,
}

/// Outcome of [`ProcessExecutor::close`]: the raw wait status plus the
/// resource usage accumulated by the child and any of its own reaped
/// children, via `RUSAGE_CHILDREN`.
#[derive(Debug, Clone, Copy)]
pub struct Finished {
    pub status: WaitStatus,
    pub user_time_us: i64,
    pub sys_time_us: i64,
}

struct Inner {
    /// master side of the shared datagram pair; child is given the peer.
    errlog_rd: OwnedFd,
    errlog_peer: OwnedFd,
    /// pid -> caller-supplied label, consulted by the reader thread.
    registry: Mutex<HashMap<i32, String>>,
}

/// Spawns children and fans their stderr out to `tracing`, attributed by pid.
pub struct ProcessExecutor {
    inner: Arc<Inner>,
    _reader: JoinHandle<()>,
}

impl ProcessExecutor {
    pub fn new() -> Result<Self, ExecError> {
        let (rd, wr) = socket::socketpair(
            AddressFamily::Unix,
            SockType::Datagram,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(ExecError::Fork)?;
        socket::setsockopt(&rd, socket::sockopt::PassCred, &true)
            .map_err(ExecError::Fork)?;

        let inner = Arc::new(Inner {
            errlog_rd: rd,
            errlog_peer: wr,
            registry: Mutex::new(HashMap::new()),
        });

        let reader_inner = inner.clone();
        let reader = std::thread::Builder::new()
            .name("errlog-reader".into())
            .spawn(move || reader_loop(reader_inner))
            .map_err(ExecError::Io)?;

        Ok(Self {
            inner,
            _reader: reader,
        })
    }

    /// Register `logid` as the attribution label for a pid the caller is
    /// about to fork, so the reader thread can tag its stderr lines from
    /// the first datagram onward.
    pub fn register(&self, pid: Pid, logid: impl Into<String>) {
        self.inner
            .registry
            .lock()
            .unwrap()
            .insert(pid.as_raw(), logid.into());
    }

    pub fn unregister(&self, pid: Pid) {
        self.inner.registry.lock().unwrap().remove(&pid.as_raw());
    }

    /// Fork and exec `argv[0]` with `argv`/`envp`, wiring stdin to
    /// `/dev/null`, stdout to a fresh pipe returned to the caller, and
    /// stderr to the shared datagram socket.
    ///
    /// # Safety note
    /// This uses `fork()` directly rather than `posix_spawn`: between fork
    /// and exec the child only calls async-signal-safe functions (dup2,
    /// close, execv).
    pub fn open(&self, argv: &[String], cwd: Option<&Path>) -> Result<SpawnedProcess, ExecError> {
        let (stdout_rd, stdout_wr) = pipe().map_err(ExecError::Fork)?;

        let c_argv: Vec<CString> = argv
            .iter()
            .map(|a| CString::new(a.as_bytes()).expect("argv has no NUL bytes"))
            .collect();
        let path = c_argv[0].clone();

        let stderr_peer = self.inner.errlog_peer.as_raw_fd();
        let cwd_owned = cwd.map(|p| p.to_owned());

        match unsafe { fork() }.map_err(ExecError::Fork)? {
            ForkResult::Parent { child } => {
                drop(stdout_wr);
                let stdout = File::from(stdout_rd);
                Ok(SpawnedProcess { pid: child, stdout })
            }
            ForkResult::Child => {
                drop(stdout_rd);
                child_setup(stdout_wr.as_raw_fd(), stderr_peer, cwd_owned.as_deref());
                let _ = execv(&path, &c_argv);
                // execv only returns on failure; the parent cannot observe
                // this error, so surface it as loudly as async-signal-safe
                // code allows and die.
                unsafe { libc::_exit(127) };
            }
        }
    }

    /// Reap `pid` and fetch the resource usage of the reaped subtree.
    pub fn close(&self, proc: SpawnedProcess) -> Result<Finished, ExecError> {
        self.unregister(proc.pid);
        drop(proc.stdout);
        let status = waitpid(proc.pid, None).map_err(ExecError::Wait)?;

        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        unsafe { libc::getrusage(libc::RUSAGE_CHILDREN, &mut usage) };

        Ok(Finished {
            status,
            user_time_us: usage.ru_utime.tv_sec * 1_000_000 + usage.ru_utime.tv_usec as i64,
            sys_time_us: usage.ru_stime.tv_sec * 1_000_000 + usage.ru_stime.tv_usec as i64,
        })
    }
}

/// Runs in the child between `fork()` and `exec()`. Only touches
/// async-signal-safe primitives.
fn child_setup(stdout_wr: RawFd, stderr_peer: RawFd, cwd: Option<&Path>) {
    unsafe {
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if devnull >= 0 {
            libc::dup2(devnull, libc::STDIN_FILENO);
            if devnull > libc::STDERR_FILENO {
                libc::close(devnull);
            }
        }
    }
    let _ = dup2(stdout_wr, libc::STDOUT_FILENO);
    let _ = dup2(stderr_peer, libc::STDERR_FILENO);
    if stdout_wr > libc::STDERR_FILENO {
        let _ = close(stdout_wr);
    }

    if let Some(dir) = cwd {
        let c = CString::new(dir.as_os_str().as_bytes()).unwrap();
        unsafe {
            libc::chdir(c.as_ptr());
        }
    }
}

fn reader_loop(inner: Arc<Inner>) {
    let fd = inner.errlog_rd.as_raw_fd();
    let mut buf = [0u8; 4096];
    loop {
        let mut iov = [std::io::IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!(UnixCredentials);
        let msg = match socket::recvmsg::<()>(fd, &mut iov, Some(&mut cmsg_space), MsgFlags::empty())
        {
            Ok(msg) => msg,
            Err(nix::Error::EBADF) => return,
            Err(_) => continue,
        };

        if msg.bytes == 0 {
            continue;
        }

        let mut sender_pid = None;
        for cmsg in msg.cmsgs().into_iter().flatten() {
            if let socket::ControlMessageOwned::ScmCredentials(cred) = cmsg {
                sender_pid = Some(cred.pid());
            }
        }

        let line = String::from_utf8_lossy(&buf[..msg.bytes]);
        let line = line.trim_end_matches(['\n', '\r']);

        match sender_pid.and_then(|pid| inner.registry.lock().unwrap().get(&pid).cloned()) {
            Some(logid) => tracing::warn!(target: "errlog", pid = sender_pid, logid = %logid, "{line}"),
            None => tracing::warn!(target: "errlog", pid = sender_pid, "{line}"),
        }
    }
}

// `ProcessExecutor` is meant to be constructed once per master process and
// live for the program's duration, mirroring the original's process-wide
// error-log socket; the reader thread is intentionally never joined.
