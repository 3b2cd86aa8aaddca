//! Process creation and teardown helpers shared by the orchestrator and the
//! wait stressor.

use std::ffi::CString;
use std::panic::{self, AssertUnwindSafe};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};

use crate::signals::StopFlag;

/// Prefix for worker process names; the kernel keeps 15 bytes.
pub const PROC_NAME_PREFIX: &str = "sfleet-";

/// Fork a child that runs `body` and exits with its return value.
///
/// The child never returns into the caller's stack: a panic becomes exit
/// status 1 and the exit skips destructors and atexit handlers that belong
/// to the parent.
pub fn fork_child<F>(body: F) -> nix::Result<Pid>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child only runs `body` and then `_exit`s.
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let code = panic::catch_unwind(AssertUnwindSafe(body)).unwrap_or(libc::EXIT_FAILURE);
            // SAFETY: terminating the forked child.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Like [`fork_child`], retrying while the kernel reports `EAGAIN` and the
/// stop flag is clear.
pub fn fork_child_retrying<F>(stop: StopFlag, body: F) -> nix::Result<Pid>
where
    F: FnOnce() -> i32 + Clone,
{
    loop {
        match fork_child(body.clone()) {
            Err(Errno::EAGAIN) if !stop.is_set() => continue,
            other => return other,
        }
    }
}

/// Send `signal` to every pid, ignoring processes that are already gone.
pub fn signal_all(pids: impl IntoIterator<Item = Pid>, signal: Signal) -> usize {
    pids.into_iter()
        .filter(|&pid| kill(pid, signal).is_ok())
        .count()
}

/// SIGKILL a direct child and reap it.
pub fn kill_and_reap(pid: Pid) {
    let _ = kill(pid, Signal::SIGKILL);
    while let Err(Errno::EINTR) = waitpid(pid, None) {}
}

/// Set the calling process's name as shown by `ps`.
pub fn set_name(suffix: &str) {
    if let Ok(name) = CString::new(format!("{PROC_NAME_PREFIX}{suffix}")) {
        let _ = nix::sys::prctl::set_name(&name);
    }
}

/// Ask the kernel to deliver SIGALRM when our parent exits, so orphans stop.
pub fn alarm_on_parent_death() {
    let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGALRM);
}
