use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use rand::RngCore;
use tracing::debug;

use crate::config::HddTuning;
use crate::error::{StepError, WorkerError};
use crate::worker::{RunContext, Workload};

pub const BUF_SIZE: usize = 64 * 1024;

/// Write files of `bytes` length in `BUF_SIZE` chunks; one chunk is one
/// bogo-op. Files are unlinked as soon as they are created unless
/// `no_clean` is set.
pub struct DiskStress {
    dir: PathBuf,
    bytes: u64,
    no_clean: bool,
    buf: Vec<u8>,
    file: Option<File>,
    written: u64,
}

impl DiskStress {
    pub fn new(tuning: &HddTuning) -> Self {
        let mut buf = vec![0u8; BUF_SIZE];
        rand::rng().fill_bytes(&mut buf);
        Self {
            dir: tuning.dir.clone(),
            bytes: tuning.bytes,
            no_clean: tuning.no_clean,
            buf,
            file: None,
            written: 0,
        }
    }

    fn create(&self) -> Result<File, WorkerError> {
        if self.no_clean {
            let prefix = format!("stress-fleet-{}.", std::process::id());
            let (file, path) = tempfile::Builder::new()
                .prefix(&prefix)
                .tempfile_in(&self.dir)?
                .keep()
                .map_err(|e| e.error)?;
            debug!(path = %path.display(), "keeping hdd file");
            Ok(file)
        } else {
            Ok(tempfile::tempfile_in(&self.dir)?)
        }
    }
}

impl Workload for DiskStress {
    fn step(&mut self, _ctx: &RunContext<'_>) -> Result<(), StepError> {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => {
                self.written = 0;
                self.create()?
            }
        };
        let n = match file.write(&self.buf) {
            Ok(n) => n,
            Err(err) => {
                self.file = Some(file);
                return Err(err.into());
            }
        };
        self.written += n as u64;
        if self.written < self.bytes {
            self.file = Some(file);
        }
        Ok(())
    }
}
