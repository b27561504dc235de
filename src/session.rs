//! Explicit session context replacing the process-wide globals the reference
//! archiver keeps for cooperative cancellation and thread accounting (see
//! "Global state" in SPEC_FULL.md §9).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared cooperative-cancellation state and live-thread accounting for one
/// or more archive sessions.
///
/// Nothing in here is archive-specific, so a single `SessionContext` may be
/// reused across sessions in the same process if the embedder chooses to.
#[derive(Clone, Default)]
pub struct SessionContext {
    stop_feeding: Arc<AtomicBool>,
    active_threads: Arc<AtomicUsize>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals the producer side to stop feeding the input queue. Set by a
    /// pipeline's error path; observed cooperatively, never preemptively.
    pub fn request_stop_feeding(&self) {
        self.stop_feeding.store(true, Ordering::SeqCst);
    }

    pub fn should_stop_feeding(&self) -> bool {
        self.stop_feeding.load(Ordering::SeqCst)
    }

    /// Number of secondary (pipeline) threads currently live.
    pub fn active_thread_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Marks one secondary thread as entered; the returned guard decrements
    /// the counter on drop, including on panic unwind.
    pub(crate) fn thread_enter(&self) -> ThreadGuard {
        self.active_threads.fetch_add(1, Ordering::SeqCst);
        ThreadGuard { counter: self.active_threads.clone() }
    }
}

pub(crate) struct ThreadGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_feeding_flag_round_trips() {
        let ctx = SessionContext::new();
        assert!(!ctx.should_stop_feeding());
        ctx.request_stop_feeding();
        assert!(ctx.should_stop_feeding());
    }

    #[test]
    fn thread_guard_tracks_entry_and_exit() {
        let ctx = SessionContext::new();
        assert_eq!(ctx.active_thread_count(), 0);
        {
            let _guard = ctx.thread_enter();
            assert_eq!(ctx.active_thread_count(), 1);
        }
        assert_eq!(ctx.active_thread_count(), 0);
    }
}
