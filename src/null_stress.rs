use std::fs::{File, OpenOptions};
use std::io::Write;

use crate::error::{StepError, WorkerError};
use crate::worker::{RunContext, Workload};

const BUF_SIZE: usize = 4096;

/// Write to /dev/null. Exercises the write path with no device behind it.
pub struct NullStress {
    dev: File,
    buf: [u8; BUF_SIZE],
}

impl NullStress {
    pub fn open() -> Result<Self, WorkerError> {
        let dev = OpenOptions::new().write(true).open("/dev/null")?;
        Ok(Self {
            dev,
            buf: [0xff; BUF_SIZE],
        })
    }
}

impl Workload for NullStress {
    fn step(&mut self, _ctx: &RunContext<'_>) -> Result<(), StepError> {
        match self.dev.write(&self.buf)? {
            0 => Err(StepError::Transient),
            _ => Ok(()),
        }
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
    fn writes_until_budget() {
        let cell = AtomicU64::new(0);
        let config = RunConfig::default();
        let ctx = RunContext {
            category: Category::Null,
            instance: 0,
            stop: StopFlag::detached(),
            counter: Counter::new(&cell),
            budget: 1000,
            config: &config,
        };

        run_budgeted(&ctx, &mut NullStress::open().unwrap()).unwrap();
        assert_eq!(ctx.counter.get(), 1000);
    }
}
