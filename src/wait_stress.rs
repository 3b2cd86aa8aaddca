//! Wait-family stressor.
//!
//! Three processes cooperate:
//!
//! * the **parent** (this worker) blocks in `waitpid`/`waitid` on the runner
//!   and counts every continuation it observes;
//! * the **runner** does nothing but `pause`;
//! * the **killer** stops and continues the runner as fast as it can while
//!   watching the parent's counter.
//!
//! Continuation events can be coalesced or lost between the two wait calls,
//! which may leave the parent blocked on an event that never comes. The
//! killer's watchdog bounds that: once the counter has been frozen for the
//! stall window it kills the runner and wakes the parent.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgrp, getppid, setpgid, Pid};
use tracing::debug;

use crate::error::WorkerError;
use crate::process;
use crate::worker::RunContext;

/// Default watchdog window for the killer.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Waiting,
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillerState {
    Probing,
    StalledAbort,
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentState {
    Spawning,
    Monitoring,
    Draining,
    Done,
}

/// Tracks how long a counter has gone without advancing.
#[derive(Debug, Clone)]
pub struct Watchdog {
    window: Duration,
    last_count: u64,
    last_advance: Instant,
}

impl Watchdog {
    pub fn new(window: Duration, count: u64, now: Instant) -> Self {
        Self {
            window,
            last_count: count,
            last_advance: now,
        }
    }

    /// True once `count` has stayed the same for longer than the window.
    pub fn stalled(&mut self, count: u64, now: Instant) -> bool {
        if count != self.last_count {
            self.last_count = count;
            self.last_advance = now;
            return false;
        }
        now.saturating_duration_since(self.last_advance) > self.window
    }

    /// Killer state after one stop/continue probe.
    pub fn probe(&mut self, count: u64, now: Instant, keep_going: bool) -> KillerState {
        if self.stalled(count, now) {
            KillerState::StalledAbort
        } else if keep_going {
            KillerState::Probing
        } else {
            KillerState::Exiting
        }
    }
}

fn run_runner(ctx: &RunContext<'_>) -> i32 {
    process::set_name("runner");
    debug!(worker = %ctx.name(), pid = std::process::id(), "wait: runner started");

    let mut state = RunnerState::Waiting;
    while state == RunnerState::Waiting {
        nix::unistd::pause();
        if !ctx.keep_going() {
            state = RunnerState::Exiting;
        }
    }

    let _ = kill(getppid(), Signal::SIGALRM);
    libc::EXIT_SUCCESS
}

fn run_killer(ctx: &RunContext<'_>, runner: Pid) -> i32 {
    process::set_name("killer");
    debug!(worker = %ctx.name(), pid = std::process::id(), "wait: killer started");

    let window = ctx.config.wait.stall_timeout;
    let mut watchdog = Watchdog::new(window, ctx.counter.get(), Instant::now());
    let mut state = KillerState::Probing;
    while state == KillerState::Probing {
        let _ = kill(runner, Signal::SIGSTOP);
        let _ = kill(runner, Signal::SIGCONT);
        state = watchdog.probe(ctx.counter.get(), Instant::now(), ctx.keep_going());
    }
    if state == KillerState::StalledAbort {
        debug!(worker = %ctx.name(), "waits were blocked, aborting");
    }

    // the parent reaps the runner
    let _ = kill(runner, Signal::SIGKILL);
    let _ = kill(getppid(), Signal::SIGALRM);
    libc::EXIT_SUCCESS
}

/// Runner and killer pids still owned by the parent.
#[derive(Debug, Default)]
struct Triad {
    runner: Option<Pid>,
    killer: Option<Pid>,
}

impl Triad {
    /// Killer first, so it cannot keep signalling a runner that is being reaped.
    fn drain(&mut self) {
        if let Some(pid) = self.killer.take() {
            process::kill_and_reap(pid);
        }
        if let Some(pid) = self.runner.take() {
            process::kill_and_reap(pid);
        }
    }
}

impl Drop for Triad {
    fn drop(&mut self) {
        self.drain();
    }
}

fn spawn_member<F>(ctx: &RunContext<'_>, role: &'static str, body: F) -> Result<Pid, WorkerError>
where
    F: FnOnce() -> i32 + Clone,
{
    let pgrp = getpgrp();
    let pid = process::fork_child_retrying(ctx.stop, move || {
        let _ = setpgid(Pid::from_raw(0), pgrp);
        process::alarm_on_parent_death();
        body()
    })
    .map_err(|source| WorkerError::Spawn { role, source })?;
    let _ = setpgid(pid, pgrp);
    Ok(pid)
}

/// One round of the parent's monitoring loop.
fn monitor(ctx: &RunContext<'_>, triad: &mut Triad, runner: Pid) -> ParentState {
    match waitpid(runner, Some(WaitPidFlag::WCONTINUED)) {
        Ok(WaitStatus::Continued(_)) => {
            if ctx.stop.is_set() {
                return ParentState::Draining;
            }
            ctx.counter.inc();
        }
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
            triad.runner = None;
            return ParentState::Draining;
        }
        Ok(_) | Err(_) => {}
    }
    if !ctx.keep_going() {
        return ParentState::Draining;
    }

    // Second wait flavour; a continuation it reports is counted as well.
    match waitid(Id::Pid(runner), WaitPidFlag::WCONTINUED | WaitPidFlag::WEXITED) {
        Ok(WaitStatus::Continued(_)) => {
            if ctx.stop.is_set() {
                return ParentState::Draining;
            }
            ctx.counter.inc();
        }
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
            triad.runner = None;
            return ParentState::Draining;
        }
        Ok(_) | Err(_) => {}
    }

    if ctx.keep_going() {
        ParentState::Monitoring
    } else {
        ParentState::Draining
    }
}

/// Parent role: spawn the runner and killer, count continuations, tear
/// both down.
pub fn stress_wait(ctx: &RunContext<'_>) -> Result<(), WorkerError> {
    debug!(worker = %ctx.name(), state = ?ParentState::Spawning, "wait: waiter started");

    let mut triad = Triad::default();
    let runner = spawn_member(ctx, "runner", || run_runner(ctx))?;
    triad.runner = Some(runner);
    triad.killer = Some(spawn_member(ctx, "killer", move || run_killer(ctx, runner))?);

    let mut state = ParentState::Monitoring;
    while state == ParentState::Monitoring {
        state = monitor(ctx, &mut triad, runner);
    }

    debug!(worker = %ctx.name(), ?state, ops = ctx.counter.get(), "wait: tearing down");
    triad.drain();
    debug!(worker = %ctx.name(), state = ?ParentState::Done, "wait: waiter finished");
    Ok(())
}
