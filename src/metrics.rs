//! Shared metrics region and the end-of-run report.
//!
//! Counters live in a POSIX shared memory object mapped before any worker is
//! forked, so every child inherits the same physical pages. The object's name
//! is unlinked as soon as the mapping exists; the mapping itself keeps the
//! pages alive until the orchestrator drops the region.
//!
//! Each slot has exactly one writer (its worker). The orchestrator reads a
//! slot only after reaping that worker, so process exit is the only
//! synchronization point.

use std::mem::size_of;
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{ftruncate, Pid};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::stressor::{Category, PerCategory};

/// Name of the shared memory object for an orchestrator with this pid.
pub fn region_name(pid: Pid) -> String {
    format!("/stress_fleet_{pid}")
}

/// Handle to one worker's counter.
#[derive(Debug, Clone, Copy)]
pub struct Counter<'a> {
    cell: &'a AtomicU64,
}

impl<'a> Counter<'a> {
    pub fn new(cell: &'a AtomicU64) -> Self {
        Self { cell }
    }

    pub fn get(&self) -> u64 {
        self.cell.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.cell.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct MetricsRegion {
    base: NonNull<AtomicU64>,
    len: NonZeroUsize,
    max_workers: usize,
    name: String,
}

impl MetricsRegion {
    /// Bytes needed for `categories` × `max_workers` counters.
    pub fn size_bytes(categories: usize, max_workers: usize) -> usize {
        categories * max_workers * size_of::<u64>()
    }

    pub fn create(name: &str, max_workers: usize) -> Result<Self> {
        let len = NonZeroUsize::new(Self::size_bytes(Category::COUNT, max_workers))
            .ok_or_else(|| Error::Config("metrics region needs at least one worker".into()))?;
        let fail = |op, source| Error::SharedMemory {
            op,
            name: name.to_string(),
            source,
        };

        // leftover from a crashed run with a recycled pid
        let _ = shm_unlink(name);

        let fd = shm_open(
            name,
            OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| fail("open", e))?;

        let mapped = ftruncate(&fd, len.get() as libc::off_t)
            .map_err(|e| fail("resize", e))
            .and_then(|()| {
                // SAFETY: fresh shared mapping of a descriptor we own.
                unsafe {
                    mmap(
                        None,
                        len,
                        ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                        MapFlags::MAP_SHARED,
                        &fd,
                        0,
                    )
                }
                .map_err(|e| fail("mmap", e))
            });
        let _ = shm_unlink(name);
        drop(fd);

        let region = Self {
            base: mapped?.cast(),
            len,
            max_workers,
            name: name.to_string(),
        };
        for cell in region.cells() {
            cell.store(0, Ordering::Relaxed);
        }
        debug!(region = name, bytes = len.get(), "metrics region mapped");
        Ok(region)
    }

    pub fn byte_len(&self) -> usize {
        self.len.get()
    }

    fn cells(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is len bytes long, page aligned and lives as
        // long as self.
        unsafe {
            std::slice::from_raw_parts(self.base.as_ptr(), self.len.get() / size_of::<u64>())
        }
    }

    /// Counter for worker `index` of `category`.
    ///
    /// Panics if `index` is not below the region's worker capacity.
    pub fn counter(&self, category: Category, index: usize) -> Counter<'_> {
        assert!(index < self.max_workers, "worker index {index} out of range");
        Counter::new(&self.cells()[index * Category::COUNT + category.index()])
    }
}

impl Drop for MetricsRegion {
    fn drop(&mut self) {
        // SAFETY: base/len came from a successful mmap and no Counter can
        // outlive the borrow of self.
        unsafe {
            let _ = munmap(self.base.cast(), self.len.get());
        }
        let _ = shm_unlink(self.name.as_str());
    }
}

/// Orchestrator's record of one spawned worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub category: Category,
    pub index: usize,
    /// Position in the overall spawn order.
    pub sequence: usize,
    pub pid: Pid,
    /// When the worker starts its stressor (spawn time plus its backoff).
    pub launched: Instant,
    pub reaped: Option<Instant>,
    /// Exit code, or `None` if killed by a signal or never reaped.
    pub exit_code: Option<i32>,
}

impl WorkerSlot {
    pub fn is_live(&self) -> bool {
        self.reaped.is_none()
    }

    pub fn elapsed(&self) -> Duration {
        self.reaped
            .map(|r| r.saturating_duration_since(self.launched))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CategoryMetrics {
    pub workers: usize,
    pub ops: u64,
    /// Summed reap-minus-launch time of all workers.
    pub elapsed: Duration,
}

impl CategoryMetrics {
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.ops as f64 / secs
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub started: Instant,
    pub duration: Duration,
    pub workers: Vec<WorkerSlot>,
    pub metrics: PerCategory<CategoryMetrics>,
    /// The reap loop ended on a wait failure rather than normally.
    pub interrupted: bool,
}

impl RunReport {
    pub fn reaped(&self) -> usize {
        self.workers.iter().filter(|w| !w.is_live()).count()
    }

    pub fn log_summary(&self, with_metrics: bool) {
        if self.interrupted {
            info!("run interrupted after {:.2}s", self.duration.as_secs_f64());
        } else {
            info!("successful run completed in {:.2}s", self.duration.as_secs_f64());
        }
        if !with_metrics {
            return;
        }
        for (category, m) in self.metrics.iter() {
            info!(
                "{}: {} in {:.2} secs, rate: {:.2}",
                category.name(),
                m.ops,
                m.elapsed.as_secs_f64(),
                m.rate()
            );
        }
    }
}

/// Aggregate counters and worker times per category.
pub fn collect(region: &MetricsRegion, workers: &[WorkerSlot]) -> PerCategory<CategoryMetrics> {
    let mut metrics = PerCategory::<CategoryMetrics>::default();
    for slot in workers {
        let m = &mut metrics[slot.category];
        m.workers += 1;
        m.ops += region.counter(slot.category, slot.index).get();
        m.elapsed += slot.elapsed();
    }
    metrics
}
