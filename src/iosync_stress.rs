use crate::error::StepError;
use crate::worker::{RunContext, Workload};

/// Spin on sync(2), flushing dirty pages system wide.
pub struct IoSyncStress;

impl Workload for IoSyncStress {
    fn step(&mut self, _ctx: &RunContext<'_>) -> Result<(), StepError> {
        nix::unistd::sync();
        Ok(())
    }
}
