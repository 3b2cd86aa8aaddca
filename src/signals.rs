//! Per-process stop flag.
//!
//! Signal handlers can only reach statics, so every process owns exactly one
//! flag that the SIGINT/SIGALRM handler sets. The rest of the code never
//! touches the static directly: it is handed a [`StopFlag`] through the
//! run context and polls it at loop boundaries.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static PROCESS_STOP: AtomicBool = AtomicBool::new(false);

/// Signals that request a cooperative stop.
pub const STOP_SIGNALS: [Signal; 2] = [Signal::SIGINT, Signal::SIGALRM];

extern "C" fn request_stop(_signum: libc::c_int) {
    PROCESS_STOP.store(true, Ordering::SeqCst);
}

/// Cheap copyable handle to a stop indicator.
#[derive(Debug, Clone, Copy)]
pub struct StopFlag {
    flag: &'static AtomicBool,
}

impl StopFlag {
    /// The flag written by this process's signal handlers.
    pub fn process() -> Self {
        Self {
            flag: &PROCESS_STOP,
        }
    }

    /// A flag no signal handler writes to. Used where a loop has to be driven
    /// without touching process-wide state.
    pub fn detached() -> Self {
        Self {
            flag: Box::leak(Box::new(AtomicBool::new(false))),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Route SIGINT and SIGALRM to the process stop flag.
///
/// Installed without `SA_RESTART`: a process blocked in `wait`, `pause` or a
/// slow write gets `EINTR` back and re-checks the flag.
pub fn install_stop_handlers() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_stop),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in STOP_SIGNALS {
        // SAFETY: the handler only performs an atomic store.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_flags_are_independent() {
        let a = StopFlag::detached();
        let b = StopFlag::detached();
        assert!(!a.is_set());

        a.set();
        assert!(a.is_set());
        assert!(!b.is_set());

        a.clear();
        assert!(!a.is_set());
    }

    #[test]
    fn copies_share_state() {
        let a = StopFlag::detached();
        let b = a;
        b.set();
        assert!(a.is_set());
    }
}
