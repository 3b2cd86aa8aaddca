//! Error types for stress-fleet

use std::io;

use thiserror::Error;

use crate::stressor::Category;

/// Orchestration-level errors. Any of these aborts the whole run.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or out-of-range configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Shared metrics region could not be set up
    #[error("cannot {op} shared memory region {name}: {source}")]
    SharedMemory {
        op: &'static str,
        name: String,
        #[source]
        source: nix::Error,
    },

    /// Process creation failed while launching workers
    #[error("cannot fork {category} worker #{index}: {source}")]
    Spawn {
        category: Category,
        index: usize,
        #[source]
        source: nix::Error,
    },

    /// Signal handlers could not be installed
    #[error("cannot install signal handlers: {0}")]
    Signal(#[source] nix::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Failures that end a single worker. Siblings and the run carry on.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{call} failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("detected memory error at offset {offset}, expected {expected:#04x}, got {got:#04x}")]
    MemoryCorruption { offset: usize, expected: u8, got: u8 },

    #[error("cannot fork {role}: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: nix::Error,
    },
}

/// Outcome of one failed unit of work.
#[derive(Error, Debug)]
pub enum StepError {
    /// Interrupted or would block; retry the same step without counting it.
    #[error("transient failure")]
    Transient,

    #[error(transparent)]
    Fatal(#[from] WorkerError),
}

impl StepError {
    pub fn sys(call: &'static str, source: nix::Error) -> Self {
        match source {
            nix::Error::EINTR | nix::Error::EAGAIN => StepError::Transient,
            source => StepError::Fatal(WorkerError::Sys { call, source }),
        }
    }
}

impl From<io::Error> for StepError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => StepError::Transient,
            _ => StepError::Fatal(WorkerError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_io_is_transient() {
        let err = io::Error::from(io::ErrorKind::Interrupted);
        assert!(matches!(StepError::from(err), StepError::Transient));

        let err = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(matches!(StepError::from(err), StepError::Transient));
    }

    #[test]
    fn other_io_is_fatal() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            StepError::from(err),
            StepError::Fatal(WorkerError::Io(_))
        ));
    }

    #[test]
    fn errno_classification() {
        assert!(matches!(
            StepError::sys("write", nix::Error::EINTR),
            StepError::Transient
        ));
        assert!(matches!(
            StepError::sys("mmap", nix::Error::EAGAIN),
            StepError::Transient
        ));
        match StepError::sys("mmap", nix::Error::ENOMEM) {
            StepError::Fatal(WorkerError::Sys { call, source }) => {
                assert_eq!(call, "mmap");
                assert_eq!(source, nix::Error::ENOMEM);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
