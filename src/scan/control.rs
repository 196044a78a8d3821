//! Pause/resume/stop signaling between a controlling context and the scan
//! worker.
//!
//! The channel is the only state shared across the worker boundary. Requests
//! become visible to the worker at its next checkpoint, not sooner; sequential
//! consistency on the flags gives the checkpoint a happens-before edge on
//! every request made before it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle onto the shared pause and stop flags.
///
/// The controlling side writes, the scan worker reads. Stop is one-way: once
/// requested it cannot be cleared for the remainder of the run.
#[derive(Clone, Debug, Default)]
pub struct ControlChannel {
    inner: Arc<Flags>,
}

#[derive(Debug, Default)]
struct Flags {
    paused: AtomicBool,
    stop: AtomicBool,
}

impl ControlChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the worker to hold at its next checkpoint.
    pub fn request_pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Let a paused worker continue.
    pub fn request_resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Ask the worker to abort at its next checkpoint. Irrevocable.
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_toggles() {
        let control = ControlChannel::new();
        assert!(!control.is_paused());
        control.request_pause();
        assert!(control.is_paused());
        control.request_resume();
        assert!(!control.is_paused());
    }

    #[test]
    fn test_stop_is_one_way() {
        let control = ControlChannel::new();
        control.request_stop();
        control.request_resume();
        assert!(control.is_stop_requested());
    }

    #[test]
    fn test_clones_share_state() {
        let control = ControlChannel::new();
        let other = control.clone();
        other.request_stop();
        assert!(control.is_stop_requested());
    }
}
