//! Run configuration and validation.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::stressor::{Category, PerCategory};

pub const KB: u64 = 1024;
pub const MB: u64 = KB * KB;
pub const GB: u64 = KB * KB * KB;

/// Upper bound on workers per category.
pub const MAX_WORKERS: u32 = 1024;
/// Upper bound on any category's bogo-op budget.
pub const MAX_OPS: u64 = 100_000_000;

pub const MIN_VM_BYTES: u64 = 4 * KB;
pub const MAX_VM_BYTES: u64 = GB;
pub const DEFAULT_VM_BYTES: u64 = 256 * MB;

pub const MIN_VM_STRIDE: u64 = 1;
pub const MAX_VM_STRIDE: u64 = MB;
pub const DEFAULT_VM_STRIDE: u64 = 4 * KB;

pub const MAX_VM_HANG: u64 = 3600;

pub const MIN_HDD_BYTES: u64 = MB;
pub const MAX_HDD_BYTES: u64 = 256 * GB;
pub const DEFAULT_HDD_BYTES: u64 = GB;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24);
/// Longest timeout `alarm(2)` can express.
pub const MAX_TIMEOUT_SECS: u64 = libc::c_uint::MAX as u64;
/// Longest per-worker start stagger.
pub const MAX_BACKOFF_USECS: u64 = 3_600_000_000;

/// How long a VM worker holds its mapping between touching and verifying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmHang {
    #[default]
    None,
    Forever,
    For(Duration),
}

impl VmHang {
    /// `0` means forever, as on the command line.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            VmHang::Forever
        } else {
            VmHang::For(Duration::from_secs(secs))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmTuning {
    pub bytes: u64,
    pub stride: u64,
    pub hang: VmHang,
    /// Keep one mapping for the worker's life and re-dirty it.
    pub keep: bool,
}

impl Default for VmTuning {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_VM_BYTES,
            stride: DEFAULT_VM_STRIDE,
            hang: VmHang::None,
            keep: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HddTuning {
    /// Bytes written to each file before starting the next one.
    pub bytes: u64,
    pub dir: PathBuf,
    /// Leave written files behind.
    pub no_clean: bool,
}

impl Default for HddTuning {
    fn default() -> Self {
        Self {
            bytes: DEFAULT_HDD_BYTES,
            dir: PathBuf::from("."),
            no_clean: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitTuning {
    /// Killer gives up when the parent's counter is frozen this long.
    pub stall_timeout: Duration,
}

impl Default for WaitTuning {
    fn default() -> Self {
        Self {
            stall_timeout: crate::wait_stress::STALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub workers: PerCategory<u32>,
    /// Total bogo-ops per category, 0 = unbounded.
    pub ops: PerCategory<u64>,
    /// Zero means no timeout.
    pub timeout: Duration,
    /// Start delay added per spawn sequence number.
    pub backoff: Duration,
    pub metrics: bool,
    pub dry_run: bool,
    pub vm: VmTuning,
    pub hdd: HddTuning,
    pub wait: WaitTuning,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: PerCategory::splat(0),
            ops: PerCategory::splat(0),
            timeout: DEFAULT_TIMEOUT,
            backoff: Duration::ZERO,
            metrics: false,
            dry_run: false,
            vm: VmTuning::default(),
            hdd: HddTuning::default(),
            wait: WaitTuning::default(),
        }
    }
}

impl RunConfig {
    pub fn total_workers(&self) -> u32 {
        self.workers.iter().map(|(_, n)| n).sum()
    }

    pub fn max_workers(&self) -> u32 {
        self.workers.iter().map(|(_, n)| n).max().unwrap_or(0)
    }

    /// Per-worker share of each category's budget.
    pub fn budgets(&self) -> PerCategory<u64> {
        self.ops
            .map(|category, &total| per_worker_budget(total, self.workers[category]))
    }

    pub fn validate(&self) -> Result<()> {
        for (category, count) in self.workers.iter() {
            if count > MAX_WORKERS {
                return Err(Error::Config(format!(
                    "number of {} workers must be between 0 and {MAX_WORKERS}",
                    category.name()
                )));
            }
        }
        if self.total_workers() == 0 {
            return Err(Error::Config(
                "no stress workers specified, try --cpu N".to_string(),
            ));
        }
        check_range("timeout", self.timeout.as_secs(), 0, MAX_TIMEOUT_SECS)?;
        let backoff = u64::try_from(self.backoff.as_micros()).unwrap_or(u64::MAX);
        check_range("backoff", backoff, 0, MAX_BACKOFF_USECS)?;
        for (category, ops) in self.ops.iter() {
            check_range(&format!("{}-ops", category.tag()), ops, 0, MAX_OPS)?;
        }
        check_range("vm-bytes", self.vm.bytes, MIN_VM_BYTES, MAX_VM_BYTES)?;
        check_range("vm-stride", self.vm.stride, MIN_VM_STRIDE, MAX_VM_STRIDE)?;
        if let VmHang::For(hang) = self.vm.hang {
            check_range("vm-hang", hang.as_secs(), 0, MAX_VM_HANG)?;
        }
        check_range("hdd-bytes", self.hdd.bytes, MIN_HDD_BYTES, MAX_HDD_BYTES)?;
        if self.wait.stall_timeout.is_zero() {
            return Err(Error::Config("wait-stall must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Integer share of `total` for each of `workers`; the remainder is dropped.
pub fn per_worker_budget(total: u64, workers: u32) -> u64 {
    if workers == 0 {
        0
    } else {
        total / u64::from(workers)
    }
}

fn check_range(opt: &str, val: u64, lo: u64, hi: u64) -> Result<()> {
    if val < lo || val > hi {
        return Err(Error::Config(format!(
            "value {val} is out of range for {opt}, allowed: {lo} .. {hi}"
        )));
    }
    Ok(())
}
