//! Drainer module — bounds in-flight background loads to the lifetime of the cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;

/// Tracks outstanding background work on behalf of a [`crate::cache::PageCache`].
///
/// Every load holds a [`DrainGuard`]; [`Drainer::drain`] flips the stop flag
/// and blocks until every guard has been dropped, so no load can touch cache
/// or page state once draining has returned.
pub(crate) struct Drainer {
    draining: Arc<AtomicBool>,
    guards: Mutex<Option<WaitGroup>>,
}

/// Held by a background load for as long as it runs.
pub(crate) struct DrainGuard {
    draining: Arc<AtomicBool>,
    _guard: WaitGroup,
}

impl Drainer {
    pub(crate) fn new() -> Drainer {
        Drainer {
            draining: Arc::new(AtomicBool::new(false)),
            guards: Mutex::new(Some(WaitGroup::new())),
        }
    }

    /// Hands out a guard that keeps [`Drainer::drain`] from returning.
    ///
    /// Must be taken before the background work is spawned, or a concurrent
    /// drain could complete while the work is still about to start.
    pub(crate) fn guard(&self) -> DrainGuard {
        let guards = self.guards.lock();
        let guard = guards
            .as_ref()
            .expect("background work started on an already drained cache")
            .clone();
        DrainGuard {
            draining: self.draining.clone(),
            _guard: guard,
        }
    }

    /// Signals outstanding work to stop and waits until all guards dropped.
    pub(crate) fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        let guards = self.guards.lock().take();
        if let Some(guards) = guards {
            guards.wait();
        }
    }
}

impl DrainGuard {
    /// True once draining has begun; the holder must stop touching shared
    /// state and bail out.
    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}
