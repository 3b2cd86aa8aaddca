//! Launches, monitors, reaps and accounts for every worker of a run.
//!
//! Workers are forked round-robin across categories so a category with many
//! workers does not delay the start of the others. Each child gets a counter
//! slot in the shared metrics region, arms its own alarm and sleeps
//! `backoff × sequence` before it starts its stressor.
//!
//! Stopping is cooperative. The first time the orchestrator sees its stop
//! flag set it forwards SIGALRM to all live workers and gives them a grace
//! period; anything still alive after a further interruption is SIGKILLed.

use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{wait, WaitStatus};
use nix::unistd::{alarm, Pid};
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::memory_stress::check_memory_headroom;
use crate::metrics::{self, MetricsRegion, RunReport, WorkerSlot};
use crate::process;
use crate::signals::{self, StopFlag};
use crate::stressor::{Category, PerCategory};
use crate::worker::{self, RunContext};

/// Extra time past the run timeout, and after a stop request, before the
/// orchestrator escalates to SIGKILL.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Forks one worker running the given body.
pub type Spawner = Box<dyn Fn(&dyn Fn() -> i32) -> nix::Result<Pid>>;

pub struct Orchestrator {
    config: RunConfig,
    region_name: String,
    stop: StopFlag,
    spawn: Spawner,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            region_name: metrics::region_name(Pid::this()),
            stop: StopFlag::process(),
            spawn: Box::new(|body: &dyn Fn() -> i32| process::fork_child(body)),
        }
    }

    /// Override the shared memory object name.
    pub fn with_region_name(mut self, name: impl Into<String>) -> Self {
        self.region_name = name.into();
        self
    }

    /// Replace how workers are forked.
    pub fn with_spawner<F>(mut self, spawn: F) -> Self
    where
        F: Fn(&dyn Fn() -> i32) -> nix::Result<Pid> + 'static,
    {
        self.spawn = Box::new(spawn);
        self
    }

    pub fn launch(&self) -> Result<RunReport> {
        let config = &self.config;
        config.validate()?;
        let budgets = config.budgets();

        self.stop.clear();
        signals::install_stop_handlers().map_err(Error::Signal)?;

        let region = MetricsRegion::create(&self.region_name, config.max_workers() as usize)?;

        let w = &config.workers;
        info!(
            "dispatching hogs: {} io, {} cpu, {} vm, {} hdd, {} wait, {} null",
            w[Category::IoSync],
            w[Category::Cpu],
            w[Category::Vm],
            w[Category::Hdd],
            w[Category::Wait],
            w[Category::Null]
        );
        if w[Category::Vm] > 0 {
            check_memory_headroom(config.vm.bytes, w[Category::Vm]);
        }

        let started = Instant::now();
        let mut slots = self.spawn_all(&region, &budgets)?;
        debug!("{} processes running", slots.len());

        if !config.timeout.is_zero() {
            worker::arm_alarm(config.timeout.saturating_add(SHUTDOWN_GRACE));
        }
        let interrupted = self.reap_all(&mut slots);
        alarm::cancel();

        let report = RunReport {
            started,
            duration: started.elapsed(),
            metrics: metrics::collect(&region, &slots),
            workers: slots,
            interrupted,
        };
        report.log_summary(config.metrics);
        Ok(report)
    }

    fn spawn_all(
        &self,
        region: &MetricsRegion,
        budgets: &PerCategory<u64>,
    ) -> Result<Vec<WorkerSlot>> {
        let config = &self.config;
        let mut slots = Vec::with_capacity(config.total_workers() as usize);

        for index in 0..config.max_workers() as usize {
            for category in Category::ALL {
                if index >= config.workers[category] as usize {
                    continue;
                }
                if self.stop.is_set() {
                    info!("stop requested, {} workers launched", slots.len());
                    return Ok(slots);
                }

                let sequence = slots.len();
                let delay = config.backoff.saturating_mul(sequence as u32);
                let ctx = RunContext {
                    category,
                    instance: index,
                    stop: self.stop,
                    counter: region.counter(category, index),
                    budget: budgets[category],
                    config,
                };

                match (self.spawn)(&|| worker::worker_main(&ctx, delay)) {
                    Ok(pid) => slots.push(WorkerSlot {
                        category,
                        index,
                        sequence,
                        pid,
                        launched: Instant::now() + delay,
                        reaped: None,
                        exit_code: None,
                    }),
                    Err(source) => {
                        error!("cannot fork: {source}");
                        for slot in &slots {
                            process::kill_and_reap(slot.pid);
                        }
                        return Err(Error::Spawn {
                            category,
                            index,
                            source,
                        });
                    }
                }
            }
        }
        Ok(slots)
    }

    /// Reap until every worker is accounted for. Returns true if a wait
    /// failure ended the loop early.
    fn reap_all(&self, slots: &mut [WorkerSlot]) -> bool {
        let mut outstanding = slots.len();
        let mut notified = false;

        while outstanding > 0 {
            if self.stop.is_set() && !notified {
                notified = true;
                let n = process::signal_all(live_pids(slots), Signal::SIGALRM);
                info!("stop requested, signalled {n} workers");
                worker::arm_alarm(SHUTDOWN_GRACE);
            }

            match wait() {
                Ok(status) => {
                    let Some(slot) = status.pid().and_then(|pid| find_live(slots, pid)) else {
                        continue;
                    };
                    slot.reaped = Some(Instant::now());
                    slot.exit_code = match status {
                        WaitStatus::Exited(_, code) => Some(code),
                        _ => None,
                    };
                    outstanding -= 1;
                    debug!(
                        worker = %format!("{}-{}", slot.category.tag(), slot.index),
                        pid = %slot.pid,
                        ?status,
                        "process terminated"
                    );
                }
                Err(Errno::EINTR) => {
                    if notified {
                        let n = process::signal_all(live_pids(slots), Signal::SIGKILL);
                        warn!("workers did not stop in time, killed {n}");
                    }
                }
                Err(Errno::ECHILD) => {
                    warn!("{outstanding} workers unaccounted for");
                    break;
                }
                Err(err) => {
                    error!("wait failed: {err}");
                    process::signal_all(live_pids(slots), Signal::SIGKILL);
                    return true;
                }
            }
        }
        false
    }
}

fn live_pids(slots: &[WorkerSlot]) -> Vec<Pid> {
    slots.iter().filter(|s| s.is_live()).map(|s| s.pid).collect()
}

fn find_live(slots: &mut [WorkerSlot], pid: Pid) -> Option<&mut WorkerSlot> {
    slots.iter_mut().find(|s| s.pid == pid && s.is_live())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(pid: i32, reaped: bool) -> WorkerSlot {
        let now = Instant::now();
        WorkerSlot {
            category: Category::Cpu,
            index: 0,
            sequence: 0,
            pid: Pid::from_raw(pid),
            launched: now,
            reaped: reaped.then_some(now),
            exit_code: None,
        }
    }

    #[test]
    fn live_pids_skip_reaped_workers() {
        let slots = vec![slot(10, false), slot(11, true), slot(12, false)];
        assert_eq!(live_pids(&slots), vec![Pid::from_raw(10), Pid::from_raw(12)]);
    }

    #[test]
    fn find_live_ignores_reaped_pid() {
        let mut slots = vec![slot(10, true), slot(11, false)];
        assert!(find_live(&mut slots, Pid::from_raw(10)).is_none());
        assert!(find_live(&mut slots, Pid::from_raw(11)).is_some());
        assert!(find_live(&mut slots, Pid::from_raw(99)).is_none());
    }

    #[test]
    fn empty_run_fails_before_touching_anything() {
        let orchestrator = Orchestrator::new(RunConfig::default())
            .with_region_name("/stress_fleet_never_created");
        assert!(matches!(orchestrator.launch(), Err(Error::Config(_))));
    }

    #[test]
    fn unrepresentable_timeout_is_a_config_error() {
        let mut config = RunConfig::default();
        config.workers[Category::Null] = 1;
        config.timeout = Duration::from_secs(u64::MAX);

        let orchestrator =
            Orchestrator::new(config).with_region_name("/stress_fleet_never_created");
        let err = orchestrator.launch().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("timeout"));
    }
}
