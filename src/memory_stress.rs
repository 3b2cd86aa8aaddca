use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use sysinfo::System;
use tracing::{debug, warn};

use crate::config::{VmHang, VmTuning};
use crate::error::{StepError, WorkerError};
use crate::worker::{RunContext, Workload};

/// Anonymous shared mapping, unmapped on drop.
struct Mapping {
    base: NonNull<u8>,
    len: NonZeroUsize,
}

impl Mapping {
    fn new(len: NonZeroUsize) -> nix::Result<Self> {
        // SAFETY: fresh anonymous mapping, not aliased by anything else.
        let base = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }?;
        Ok(Self {
            base: base.cast(),
            len,
        })
    }

    fn write(&mut self, offset: usize, val: u8) {
        debug_assert!(offset < self.len.get());
        // SAFETY: offset is inside the mapping.
        unsafe { self.base.as_ptr().add(offset).write_volatile(val) }
    }

    fn read(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.len.get());
        // SAFETY: offset is inside the mapping.
        unsafe { self.base.as_ptr().add(offset).read_volatile() }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/len came from mmap and nothing borrows the mapping.
        unsafe {
            let _ = munmap(self.base.cast(), self.len.get());
        }
    }
}

/// Map, touch every `stride` bytes with a gray code, optionally hang, then
/// verify the pattern and unmap.
pub struct MemoryStress {
    len: NonZeroUsize,
    stride: usize,
    hang: VmHang,
    keep: bool,
    mapping: Option<Mapping>,
    val: u8,
}

impl MemoryStress {
    pub fn new(tuning: &VmTuning) -> Self {
        Self {
            len: NonZeroUsize::new(tuning.bytes as usize).unwrap_or(NonZeroUsize::MIN),
            stride: (tuning.stride as usize).max(1),
            hang: tuning.hang,
            keep: tuning.keep,
            mapping: None,
            val: 0,
        }
    }

    fn hold(&self, ctx: &RunContext<'_>) {
        match self.hang {
            VmHang::None => {}
            VmHang::Forever => {
                while !ctx.stop.is_set() {
                    nix::unistd::sleep(3600);
                }
            }
            VmHang::For(hang) => {
                let mut left = hang.as_secs().min(u64::from(libc::c_uint::MAX)) as libc::c_uint;
                while left > 0 && !ctx.stop.is_set() {
                    left = nix::unistd::sleep(left);
                }
            }
        }
    }
}

impl Workload for MemoryStress {
    fn step(&mut self, ctx: &RunContext<'_>) -> Result<(), StepError> {
        let gray = (self.val >> 1) ^ self.val;
        self.val = self.val.wrapping_add(1);

        let mut mapping = match self.mapping.take() {
            Some(mapping) => mapping,
            // memory pressure is expected here, just try again
            None => Mapping::new(self.len).map_err(|e| match e {
                Errno::ENOMEM => StepError::Transient,
                e => StepError::sys("mmap", e),
            })?,
        };

        for offset in (0..self.len.get()).step_by(self.stride) {
            mapping.write(offset, gray);
        }

        self.hold(ctx);

        for offset in (0..self.len.get()).step_by(self.stride) {
            let got = mapping.read(offset);
            if got != gray {
                return Err(WorkerError::MemoryCorruption {
                    offset,
                    expected: gray,
                    got,
                }
                .into());
            }
        }

        if self.keep {
            self.mapping = Some(mapping);
        }
        Ok(())
    }
}

/// Warn when the VM workers together ask for more than the free memory.
pub fn check_memory_headroom(bytes_per_worker: u64, workers: u32) {
    let mut sys = System::new();
    sys.refresh_memory();

    let wanted = bytes_per_worker.saturating_mul(u64::from(workers));
    let available = sys.available_memory();
    if wanted > available {
        warn!(
            "vm workers want {} MB but only {} MB is available",
            wanted / crate::config::MB,
            available / crate::config::MB
        );
    } else {
        debug!(wanted, available, "vm memory headroom ok");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RunConfig, KB};
    use crate::metrics::Counter;
    use crate::signals::StopFlag;
    use crate::stressor::Category;
    use crate::worker::run_budgeted;
    use std::sync::atomic::AtomicU64;
    use std::time::{Duration, Instant};

    fn run(config: &RunConfig, budget: u64) -> (u64, Result<(), WorkerError>) {
        let cell = AtomicU64::new(0);
        let ctx = RunContext {
            category: Category::Vm,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget,
            config,
        };
        let result = run_budgeted(&ctx, &mut MemoryStress::new(&config.vm));
        (ctx.counter.get(), result)
    }

    #[test]
    fn maps_touches_and_verifies() {
        let mut config = RunConfig::default();
        config.vm.bytes = 64 * KB;
        config.vm.stride = 512;

        let (ops, result) = run(&config, 300);
        result.unwrap();
        assert_eq!(ops, 300);
    }

    #[test]
    fn keep_reuses_one_mapping() {
        let mut config = RunConfig::default();
        config.vm.bytes = 16 * KB;
        config.vm.keep = true;

        let mut stress = MemoryStress::new(&config.vm);
        let cell = AtomicU64::new(0);
        let ctx = RunContext {
            category: Category::Vm,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget: 0,
            config: &config,
        };

        stress.step(&ctx).unwrap();
        let first = stress.mapping.as_ref().map(|m| m.base);
        stress.step(&ctx).unwrap();
        assert!(first.is_some());
        assert_eq!(stress.mapping.as_ref().map(|m| m.base), first);
    }

    #[test]
    fn mapping_released_without_keep() {
        let mut config = RunConfig::default();
        config.vm.bytes = 16 * KB;

        let (_, result) = run(&config, 3);
        result.unwrap();

        let mut stress = MemoryStress::new(&config.vm);
        let cell = AtomicU64::new(0);
        let ctx = RunContext {
            category: Category::Vm,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget: 0,
            config: &config,
        };
        stress.step(&ctx).unwrap();
        assert!(stress.mapping.is_none());
    }

    #[test]
    fn hang_returns_early_when_stopped() {
        let mut config = RunConfig::default();
        config.vm.bytes = 4 * KB;
        config.vm.hang = VmHang::For(Duration::from_secs(30));

        let stress = MemoryStress::new(&config.vm);
        let cell = AtomicU64::new(0);
        let ctx = RunContext {
            category: Category::Vm,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget: 0,
            config: &config,
        };
        ctx.stop.set();

        let start = Instant::now();
        stress.hold(&ctx);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
