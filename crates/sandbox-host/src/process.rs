use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;

/// Signal the whole process group led by `pid`.
///
/// The leader must have been spawned with `process_group(0)` so that its
/// PGID equals its PID. Returns `false` if the group no longer exists.
pub(crate) fn signal_group(pid: i32, signal: Signal) -> bool {
    !matches!(killpg(Pid::from_raw(pid), signal), Err(Errno::ESRCH))
}

/// Whether a process with `pid` exists and has not exited. Unreaped
/// zombies count as exited.
pub(crate) fn is_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Shell convention: the exit code, or 128 + signal number when killed.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// `uid:gid` of the current process, for running containers as the caller.
pub(crate) fn current_user() -> String {
    format!("{}:{}", nix::unistd::getuid(), nix::unistd::getgid())
}

/// SIGKILLs a process group when dropped, unless disarmed.
pub(crate) struct GroupGuard {
    pid: Option<i32>,
}

impl GroupGuard {
    pub(crate) fn new(child: &tokio::process::Child) -> Self {
        Self {
            pid: child.id().and_then(|pid| i32::try_from(pid).ok()),
        }
    }

    pub(crate) fn disarm(mut self) {
        self.pid = None;
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pid) = self.pid {
            signal_group(pid, Signal::SIGKILL);
        }
    }
}
