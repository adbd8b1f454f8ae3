/*!
 * Single-flight run guard
 *
 * Capacity-1, non-blocking acquire. A trigger arriving while a run is in
 * flight gets `None` and is expected to drop the work, never queue it. The
 * permit releases on drop, so the guard is released on every exit path
 * including panics in the run worker.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone)]
pub struct SingleFlight {
    busy: Arc<AtomicBool>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Try to become the one live run. Returns `None` when a run is already
    /// in flight.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RunPermit {
                busy: Arc::clone(&self.busy),
            })
        } else {
            None
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}

/// Permission to run; released when dropped.
pub struct RunPermit {
    busy: Arc<AtomicBool>,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
