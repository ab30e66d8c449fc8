//! Start/shutdown gating.
//!
//! A one-way token: idle -> started -> stopped. Each transition succeeds for
//! exactly one caller, no matter how many race for it.

use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// Lifecycle token shared by the acceptor, the sweeper and operator calls.
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Transition idle -> started. Returns whether this call made the
    /// transition; repeated or concurrent calls after the first return false.
    pub fn start(&self) -> bool {
        self.state
            .compare_exchange(IDLE, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition started -> stopped. Returns whether this call made the
    /// transition. Shutting down a never-started token returns false.
    pub fn shutdown(&self) -> bool {
        self.state
            .compare_exchange(STARTED, STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True once `start` has succeeded (stays true after shutdown).
    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != IDLE
    }

    /// True once `shutdown` has succeeded.
    pub fn is_shutdown(&self) -> bool {
        self.state.load(Ordering::Acquire) == STOPPED
    }
}
