//! Stressor categories and dispatch.
//!
//! Every category exposes the same capability: run to completion given a
//! [`RunContext`]. Adding a category means adding a variant here and a
//! workload module; the orchestrator's launch and reap loops never change.

use std::fmt;
use std::ops::{Index, IndexMut};

use crate::cpu_stress::CpuStress;
use crate::disk_stress::DiskStress;
use crate::error::WorkerError;
use crate::iosync_stress::IoSyncStress;
use crate::memory_stress::MemoryStress;
use crate::null_stress::NullStress;
use crate::wait_stress;
use crate::worker::{run_budgeted, RunContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    IoSync,
    Cpu,
    Vm,
    Hdd,
    Wait,
    Null,
}

impl Category {
    pub const COUNT: usize = 6;

    /// Spawn and report order.
    pub const ALL: [Category; Category::COUNT] = [
        Category::IoSync,
        Category::Cpu,
        Category::Vm,
        Category::Hdd,
        Category::Wait,
        Category::Null,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            Category::IoSync => "I/O-Sync",
            Category::Cpu => "CPU-compute",
            Category::Vm => "VM-mmap",
            Category::Hdd => "HDD-Write",
            Category::Wait => "Wait",
            Category::Null => "Null",
        }
    }

    /// Short tag for process names and log lines.
    pub fn tag(self) -> &'static str {
        match self {
            Category::IoSync => "io",
            Category::Cpu => "cpu",
            Category::Vm => "vm",
            Category::Hdd => "hdd",
            Category::Wait => "wait",
            Category::Null => "null",
        }
    }

    /// Run this category's stressor until its budget or the stop flag ends it.
    pub fn run(self, ctx: &RunContext<'_>) -> Result<(), WorkerError> {
        match self {
            Category::IoSync => run_budgeted(ctx, &mut IoSyncStress),
            Category::Cpu => run_budgeted(ctx, &mut CpuStress::new()),
            Category::Vm => run_budgeted(ctx, &mut MemoryStress::new(&ctx.config.vm)),
            Category::Hdd => run_budgeted(ctx, &mut DiskStress::new(&ctx.config.hdd)),
            Category::Wait => wait_stress::stress_wait(ctx),
            Category::Null => run_budgeted(ctx, &mut NullStress::open()?),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One value per category, indexed by [`Category`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerCategory<T>([T; Category::COUNT]);

impl<T: Copy> PerCategory<T> {
    pub fn splat(value: T) -> Self {
        Self([value; Category::COUNT])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Category, T)> + '_ {
        Category::ALL.iter().map(move |&c| (c, self.0[c.index()]))
    }
}

impl<T> PerCategory<T> {
    pub fn map<U>(&self, f: impl Fn(Category, &T) -> U) -> PerCategory<U> {
        PerCategory(std::array::from_fn(|i| f(Category::ALL[i], &self.0[i])))
    }
}

impl<T> Index<Category> for PerCategory<T> {
    type Output = T;

    fn index(&self, category: Category) -> &T {
        &self.0[category.index()]
    }
}

impl<T> IndexMut<Category> for PerCategory<T> {
    fn index_mut(&mut self, category: Category) -> &mut T {
        &mut self.0[category.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_spawn_order() {
        for (i, category) in Category::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }

    #[test]
    fn per_category_indexing() {
        let mut counts = PerCategory::splat(0u32);
        counts[Category::Cpu] = 4;
        counts[Category::Wait] = 1;

        assert_eq!(counts[Category::Cpu], 4);
        assert_eq!(counts[Category::Hdd], 0);
        assert_eq!(counts.iter().map(|(_, n)| n).sum::<u32>(), 5);

        let doubled = counts.map(|_, n| n * 2);
        assert_eq!(doubled[Category::Cpu], 8);
    }

    #[test]
    fn tags_are_short_enough_for_process_names() {
        // "sfleet-" prefix plus tag must fit the 15 byte comm field
        for category in Category::ALL {
            assert!(7 + category.tag().len() <= 15);
        }
    }
}
