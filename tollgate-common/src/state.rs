//! Per-worker mutable server state: the pause gate and the counters the
//! control channel reports. One instance per worker process, shared between
//! the listener, the sessions, and (in single-process mode) the control
//! channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ServerState {
    paused: AtomicBool,
    accepted: AtomicU64,
    active: AtomicU64,
    rejected_black: AtomicU64,
    rejected_white: AtomicU64,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn connection_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A greylist DENYSOFT inside the black window.
    pub fn rejected_black(&self) {
        self.rejected_black.fetch_add(1, Ordering::Relaxed);
    }

    /// A greylist DENYSOFT for an overdue fingerprint.
    pub fn rejected_white(&self) {
        self.rejected_white.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            rejected_black: self.rejected_black.load(Ordering::Relaxed),
            rejected_white: self.rejected_white.load(Ordering::Relaxed),
            paused: self.is_paused(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub accepted: u64,
    pub active: u64,
    pub rejected_black: u64,
    pub rejected_white: u64,
    pub paused: bool,
}

#[cfg(test)]
mod test {
    use super::ServerState;

    #[test]
    fn counters_track_lifecycle() {
        let state = ServerState::new();
        state.connection_accepted();
        state.connection_accepted();
        state.connection_closed();
        state.rejected_black();

        let snap = state.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.rejected_black, 1);
        assert_eq!(snap.rejected_white, 0);
    }

    #[test]
    fn pause_gate_toggles() {
        let state = ServerState::new();
        assert!(!state.is_paused());
        state.pause();
        assert!(state.is_paused());
        state.resume();
        assert!(!state.is_paused());
    }
}
