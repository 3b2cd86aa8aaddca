//! Command line surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::config::{self, HddTuning, RunConfig, VmHang, VmTuning, WaitTuning};
use crate::stressor::{Category, PerCategory};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "stress-fleet",
    version,
    about = "Load the system with a fleet of stressor processes",
    after_help = "Example: stress-fleet --cpu 8 --io 4 --vm 2 --vm-bytes 128M --timeout 10s\n\n\
                  Sizes can be suffixed with B,K,M,G and times with s,m,h,d,y"
)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only report errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Spawn the workers but do not run any stressor
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Stop after this long
    #[arg(short, long, value_parser = parse_time, default_value = "1d")]
    pub timeout: Duration,

    /// Microseconds to stagger each worker's start by
    #[arg(short, long, default_value_t = 0)]
    pub backoff: u64,

    /// Workers spinning on sync()
    #[arg(short = 'i', long = "io", default_value_t = 0)]
    pub io: u32,

    /// Workers spinning on sqrt(rand())
    #[arg(short, long, default_value_t = 0)]
    pub cpu: u32,

    /// Workers spinning on anonymous mmap
    #[arg(short = 'm', long, default_value_t = 0)]
    pub vm: u32,

    /// Workers spinning on write()/unlink()
    #[arg(short = 'd', long, default_value_t = 0)]
    pub hdd: u32,

    /// Workers stopping and continuing a child and waiting on it
    #[arg(short, long, default_value_t = 0)]
    pub wait: u32,

    /// Workers writing to /dev/null
    #[arg(long, default_value_t = 0)]
    pub null: u32,

    /// Stop when N io bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub io_ops: u64,

    /// Stop when N cpu bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub cpu_ops: u64,

    /// Stop when N vm bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub vm_ops: u64,

    /// Stop when N hdd bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub hdd_ops: u64,

    /// Stop when N wait bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub wait_ops: u64,

    /// Stop when N null bogo operations completed
    #[arg(long, default_value_t = 0)]
    pub null_ops: u64,

    /// Bytes per vm mapping
    #[arg(long, value_parser = parse_size, default_value = "256M")]
    pub vm_bytes: u64,

    /// Touch a byte every N bytes
    #[arg(long, value_parser = parse_size, default_value = "4K")]
    pub vm_stride: u64,

    /// Seconds to hold memory before verifying it, 0 = forever
    #[arg(long)]
    pub vm_hang: Option<u64>,

    /// Re-dirty one mapping instead of remapping
    #[arg(long, action = ArgAction::SetTrue)]
    pub vm_keep: bool,

    /// Bytes written per hdd file
    #[arg(long, value_parser = parse_size, default_value = "1G")]
    pub hdd_bytes: u64,

    /// Do not unlink files created by hdd workers
    #[arg(long)]
    pub hdd_noclean: bool,

    /// Directory hdd workers write into
    #[arg(long, default_value = ".")]
    pub hdd_dir: PathBuf,

    /// Give up on a wait triad whose counter is stuck this long
    #[arg(long, value_parser = parse_time, default_value = "8s")]
    pub wait_stall: Duration,

    /// Print pseudo metrics of activity
    #[arg(long)]
    pub metrics: bool,
}

impl Cli {
    /// Log filter for the chosen verbosity.
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }

    pub fn into_config(self) -> RunConfig {
        let mut workers = PerCategory::splat(0);
        workers[Category::IoSync] = self.io;
        workers[Category::Cpu] = self.cpu;
        workers[Category::Vm] = self.vm;
        workers[Category::Hdd] = self.hdd;
        workers[Category::Wait] = self.wait;
        workers[Category::Null] = self.null;

        let mut ops = PerCategory::splat(0);
        ops[Category::IoSync] = self.io_ops;
        ops[Category::Cpu] = self.cpu_ops;
        ops[Category::Vm] = self.vm_ops;
        ops[Category::Hdd] = self.hdd_ops;
        ops[Category::Wait] = self.wait_ops;
        ops[Category::Null] = self.null_ops;

        RunConfig {
            workers,
            ops,
            timeout: self.timeout,
            backoff: Duration::from_micros(self.backoff),
            metrics: self.metrics,
            dry_run: self.dry_run,
            vm: VmTuning {
                bytes: self.vm_bytes,
                stride: self.vm_stride,
                hang: self.vm_hang.map(VmHang::from_secs).unwrap_or_default(),
                keep: self.vm_keep,
            },
            hdd: HddTuning {
                bytes: self.hdd_bytes,
                dir: self.hdd_dir,
                no_clean: self.hdd_noclean,
            },
            wait: WaitTuning {
                stall_timeout: self.wait_stall,
            },
        }
    }
}

fn parse_scaled(s: &str, scales: &[(char, u64)], what: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, scale) = match s.chars().last() {
        Some(c) if c.is_ascii_digit() => (s, 1),
        Some(c) => {
            let lower = c.to_ascii_lowercase();
            let scale = scales
                .iter()
                .find(|(ch, _)| *ch == lower)
                .map(|&(_, scale)| scale)
                .ok_or_else(|| format!("illegal {what} specifier {c}"))?;
            (&s[..s.len() - c.len_utf8()], scale)
        }
        None => return Err(format!("value is an invalid {what}")),
    };
    let val: u64 = digits
        .parse()
        .map_err(|_| format!("invalid number {s}"))?;
    val.checked_mul(scale)
        .ok_or_else(|| format!("{s} is too large"))
}

/// Byte count with an optional B/K/M/G suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    parse_scaled(
        s,
        &[('b', 1), ('k', config::KB), ('m', config::MB), ('g', config::GB)],
        "length",
    )
}

/// Seconds with an optional s/m/h/d/y suffix.
pub fn parse_time(s: &str) -> Result<Duration, String> {
    parse_scaled(
        s,
        &[
            ('s', 1),
            ('m', 60),
            ('h', 3600),
            ('d', 24 * 3600),
            ('y', 365 * 24 * 3600),
        ],
        "time",
    )
    .map(Duration::from_secs)
}
