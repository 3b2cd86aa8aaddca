use std::hint::black_box;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::StepError;
use crate::worker::{RunContext, Workload};

const SQRTS_PER_OP: usize = 16384;
const SEED: u64 = 0x1234;

/// Spin on sqrt(rand()); one bogo-op is a batch of square roots.
pub struct CpuStress {
    rng: StdRng,
}

impl CpuStress {
    pub fn new() -> Self {
        Self {
            rng: StdRng::seed_from_u64(SEED),
        }
    }
}

impl Default for CpuStress {
    fn default() -> Self {
        Self::new()
    }
}

impl Workload for CpuStress {
    fn step(&mut self, _ctx: &RunContext<'_>) -> Result<(), StepError> {
        for _ in 0..SQRTS_PER_OP {
            black_box(f64::from(self.rng.random::<u32>()).sqrt());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::metrics::Counter;
    use crate::signals::StopFlag;
    use crate::stressor::Category;
    use crate::worker::run_budgeted;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn runs_to_budget() {
        let cell = AtomicU64::new(0);
        let config = RunConfig::default();
        let ctx = RunContext {
            category: Category::Cpu,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget: 5,
            config: &config,
        };

        run_budgeted(&ctx, &mut CpuStress::new()).unwrap();
        assert_eq!(ctx.counter.get(), 5);
    }
}
