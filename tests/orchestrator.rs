use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::pthread::{pthread_kill, pthread_self};
use nix::sys::signal::Signal;
use nix::sys::wait::wait;
use serial_test::serial;
use sysinfo::System;

use stress_fleet::config::{RunConfig, KB, MB};
use stress_fleet::orchestrator::SHUTDOWN_GRACE;
use stress_fleet::process::{self, PROC_NAME_PREFIX};
use stress_fleet::stressor::Category;
use stress_fleet::{Error, Orchestrator};

fn config_with(workers: &[(Category, u32, u64)]) -> RunConfig {
    let mut config = RunConfig::default();
    for &(category, count, ops) in workers {
        config.workers[category] = count;
        config.ops[category] = ops;
    }
    config
}

#[test]
#[serial]
fn cpu_budget_is_split_across_workers() {
    let config = config_with(&[(Category::Cpu, 4, 4000)]);
    let report = Orchestrator::new(config).launch().unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.reaped(), 4);
    assert_eq!(report.metrics[Category::Cpu].workers, 4);
    assert_eq!(report.metrics[Category::Cpu].ops, 4000);
    assert!(report.workers.iter().all(|w| w.exit_code == Some(0)));
}

#[test]
#[serial]
fn budget_remainder_is_dropped() {
    let config = config_with(&[(Category::Null, 3, 10)]);
    let report = Orchestrator::new(config).launch().unwrap();

    assert_eq!(report.reaped(), 3);
    assert_eq!(report.metrics[Category::Null].ops, 9);
}

#[test]
#[serial]
fn dry_run_spawns_but_does_no_work() {
    let mut config = config_with(&[(Category::Cpu, 2, 100), (Category::Null, 1, 0)]);
    config.dry_run = true;
    let report = Orchestrator::new(config).launch().unwrap();

    assert_eq!(report.reaped(), 3);
    assert!(report.workers.iter().all(|w| w.exit_code == Some(0)));
    for (_, m) in report.metrics.iter() {
        assert_eq!(m.ops, 0);
    }
}

#[test]
#[serial]
fn shared_memory_failure_aborts_before_spawning() {
    let config = config_with(&[(Category::Cpu, 2, 100)]);
    let result = Orchestrator::new(config)
        .with_region_name("/stress/fleet")
        .launch();

    assert!(matches!(result, Err(Error::SharedMemory { .. })));
    assert_eq!(wait(), Err(Errno::ECHILD));
}

#[test]
#[serial]
fn every_category_runs_and_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(&[
        (Category::IoSync, 1, 3),
        (Category::Cpu, 2, 200),
        (Category::Vm, 1, 20),
        (Category::Hdd, 1, 8),
        (Category::Wait, 1, 20),
        (Category::Null, 2, 100),
    ]);
    config.vm.bytes = 64 * KB;
    config.hdd.bytes = MB;
    config.hdd.dir = dir.path().to_path_buf();
    config.metrics = true;

    let report = Orchestrator::new(config).launch().unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.reaped(), 8);
    assert!(report.workers.iter().all(|w| w.exit_code == Some(0)));
    assert_eq!(report.metrics[Category::IoSync].ops, 3);
    assert_eq!(report.metrics[Category::Cpu].ops, 200);
    assert_eq!(report.metrics[Category::Vm].ops, 20);
    assert_eq!(report.metrics[Category::Hdd].ops, 8);
    assert_eq!(report.metrics[Category::Wait].ops, 20);
    assert_eq!(report.metrics[Category::Null].ops, 100);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
#[serial]
fn spawn_order_is_round_robin() {
    let config = config_with(&[(Category::Cpu, 2, 2), (Category::Null, 3, 3)]);
    let report = Orchestrator::new(config).launch().unwrap();

    let order: Vec<_> = report
        .workers
        .iter()
        .map(|w| (w.category, w.index, w.sequence))
        .collect();
    assert_eq!(
        order,
        vec![
            (Category::Cpu, 0, 0),
            (Category::Null, 0, 1),
            (Category::Cpu, 1, 2),
            (Category::Null, 1, 3),
            (Category::Null, 2, 4),
        ]
    );
}

#[test]
#[serial]
fn backoff_staggers_worker_starts() {
    let backoff = Duration::from_millis(100);
    let mut config = config_with(&[(Category::Null, 3, 3)]);
    config.backoff = backoff;
    let report = Orchestrator::new(config).launch().unwrap();

    for w in &report.workers {
        let reaped = w.reaped.unwrap();
        assert!(reaped >= report.started + backoff * w.sequence as u32);
    }
    assert!(report.duration >= backoff * 2);
}

#[test]
#[serial]
fn timeout_stops_unbounded_workers() {
    let mut config = config_with(&[(Category::Cpu, 2, 0), (Category::Null, 1, 0)]);
    config.timeout = Duration::from_secs(1);
    let report = Orchestrator::new(config).launch().unwrap();

    assert!(!report.interrupted);
    assert_eq!(report.reaped(), 3);
    assert!(report.workers.iter().all(|w| w.exit_code == Some(0)));
    assert!(report.duration >= Duration::from_secs(1));
    assert!(report.duration < Duration::from_secs(5));
    assert!(report.metrics[Category::Cpu].ops > 0);
}

#[test]
#[serial]
fn wait_workers_leave_no_helpers_behind() {
    let mut config = config_with(&[(Category::Wait, 2, 0)]);
    config.timeout = Duration::from_secs(1);
    let report = Orchestrator::new(config).launch().unwrap();

    assert_eq!(report.reaped(), 2);
    assert!(report.metrics[Category::Wait].ops > 0);

    let sys = System::new_all();
    let leftovers: Vec<_> = sys
        .processes()
        .values()
        .filter(|p| p.name().to_string_lossy().starts_with(PROC_NAME_PREFIX))
        .map(|p| p.pid())
        .collect();
    assert!(leftovers.is_empty(), "stray workers: {leftovers:?}");
}

#[test]
#[serial]
fn fork_failure_tears_down_started_workers() {
    // unbounded workers only stop when killed
    let config = config_with(&[(Category::Cpu, 2, 0), (Category::Null, 2, 0)]);
    let forks = AtomicUsize::new(0);
    let result = Orchestrator::new(config)
        .with_spawner(move |body| {
            if forks.fetch_add(1, Ordering::SeqCst) < 3 {
                process::fork_child(body)
            } else {
                Err(Errno::EAGAIN)
            }
        })
        .launch();

    assert!(matches!(
        result,
        Err(Error::Spawn {
            category: Category::Null,
            index: 1,
            source: Errno::EAGAIN,
        })
    ));
    assert_eq!(wait(), Err(Errno::ECHILD));
}

#[test]
#[serial]
fn interrupt_ends_backoff_without_escalation() {
    let mut config = config_with(&[(Category::Null, 2, 10)]);
    config.backoff = Duration::from_secs(20);

    let launcher = pthread_self();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        pthread_kill(launcher, Signal::SIGINT).unwrap();
    });
    let report = Orchestrator::new(config).launch().unwrap();
    interrupter.join().unwrap();

    assert_eq!(report.reaped(), 2);
    assert!(report.workers.iter().all(|w| w.exit_code == Some(0)));
    assert!(report.duration < SHUTDOWN_GRACE);
    assert_eq!(report.metrics[Category::Null].ops, 5);
}

#[test]
#[serial]
fn zero_timeout_means_no_timeout() {
    let mut config = config_with(&[(Category::Cpu, 1, 3000)]);
    config.timeout = Duration::ZERO;
    let report = Orchestrator::new(config).launch().unwrap();

    assert_eq!(report.reaped(), 1);
    assert_eq!(report.workers[0].exit_code, Some(0));
    assert_eq!(report.metrics[Category::Cpu].ops, 3000);
}
