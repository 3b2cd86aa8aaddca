//! The generic worker loop and the worker process entry point.

use std::thread;
use std::time::Duration;

use nix::unistd::alarm;

use tracing::{debug, error};

use crate::config::RunConfig;
use crate::error::{StepError, WorkerError};
use crate::metrics::Counter;
use crate::process;
use crate::signals::{self, StopFlag};
use crate::stressor::Category;

/// Everything a stressor needs to know about its own run.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub category: Category,
    /// Index of this worker within its category.
    pub instance: usize,
    pub stop: StopFlag,
    pub counter: Counter<'a>,
    /// Bogo-ops this worker should complete, 0 = unbounded.
    pub budget: u64,
    pub config: &'a RunConfig,
}

impl RunContext<'_> {
    /// Loop condition shared by every stressor and every triad role.
    pub fn keep_going(&self) -> bool {
        !self.stop.is_set() && (self.budget == 0 || self.counter.get() < self.budget)
    }

    pub fn name(&self) -> String {
        format!("{}-{}", self.category.tag(), self.instance)
    }
}

/// One repeatable unit of stressor work.
///
/// Resources a workload owns are released by its `Drop`, which covers every
/// exit path out of [`run_budgeted`].
pub trait Workload {
    fn step(&mut self, ctx: &RunContext<'_>) -> Result<(), StepError>;
}

/// Drive `workload` until the stop flag or the budget ends it.
pub fn run_budgeted<W: Workload>(
    ctx: &RunContext<'_>,
    workload: &mut W,
) -> Result<(), WorkerError> {
    while ctx.keep_going() {
        match workload.step(ctx) {
            Ok(()) => ctx.counter.inc(),
            Err(StepError::Transient) => continue,
            Err(StepError::Fatal(err)) => return Err(err),
        }
    }
    Ok(())
}

/// Body of a freshly forked worker process. Returns the exit status.
pub fn worker_main(ctx: &RunContext<'_>, delay: Duration) -> i32 {
    let name = ctx.name();
    if let Err(err) = signals::install_stop_handlers() {
        error!(worker = %name, "cannot install signal handlers: {err}");
        return libc::EXIT_FAILURE;
    }
    arm_alarm(ctx.config.timeout);
    process::alarm_on_parent_death();
    process::set_name(ctx.category.tag());

    if !backoff(ctx.stop, delay) {
        debug!(worker = %name, "stopped during backoff");
        return libc::EXIT_SUCCESS;
    }
    if ctx.config.dry_run {
        return libc::EXIT_SUCCESS;
    }

    debug!(worker = %name, pid = std::process::id(), budget = ctx.budget, "started");
    match ctx.category.run(ctx) {
        Ok(()) => {
            debug!(worker = %name, ops = ctx.counter.get(), "finished");
            libc::EXIT_SUCCESS
        }
        Err(err) => {
            error!(worker = %name, "{err}");
            libc::EXIT_FAILURE
        }
    }
}

const BACKOFF_POLL: Duration = Duration::from_millis(10);

/// Sleep for `delay` in short slices. Returns false as soon as the stop flag
/// is raised instead of finishing the delay.
pub fn backoff(stop: StopFlag, delay: Duration) -> bool {
    let mut left = delay;
    while !left.is_zero() {
        if stop.is_set() {
            return false;
        }
        let slice = left.min(BACKOFF_POLL);
        thread::sleep(slice);
        left -= slice;
    }
    !stop.is_set()
}

/// Whole seconds for `alarm(2)`, at least one for any non-zero timeout.
/// A zero timeout arms nothing.
pub fn alarm_secs(timeout: Duration) -> Option<libc::c_uint> {
    if timeout.is_zero() {
        return None;
    }
    Some(timeout.as_secs().clamp(1, u64::from(libc::c_uint::MAX)) as libc::c_uint)
}

/// Schedule SIGALRM after `timeout`, unless it is zero.
pub fn arm_alarm(timeout: Duration) {
    if let Some(secs) = alarm_secs(timeout) {
        alarm::set(secs);
    }
}
