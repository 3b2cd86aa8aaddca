//! Multi-process system stress tool.
//!
//! An [`orchestrator::Orchestrator`] forks a fleet of worker processes, one
//! [`stressor::Category`] each, hands every worker a counter in a shared
//! memory region, then reaps them and reports bogo-op rates.

pub mod cli;
pub mod config;
pub mod cpu_stress;
pub mod disk_stress;
pub mod error;
pub mod iosync_stress;
pub mod memory_stress;
pub mod metrics;
pub mod null_stress;
pub mod orchestrator;
pub mod process;
pub mod signals;
pub mod stressor;
pub mod wait_stress;
pub mod worker;

pub use config::RunConfig;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
