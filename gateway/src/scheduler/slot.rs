//! Release tracking for dispatched requests.

use std::fmt;
use std::sync::Arc;

use super::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Held,
    Released,
}

/// One unit of concurrency held by a dispatched request.
///
/// Created at dispatch time, after both the global and the upstream counter
/// were incremented. The first call to [`release`](Self::release), or the
/// drop, decrements both counters and drains the pending queue. Later calls
/// are no-ops, so every terminal path of a relay may release without
/// coordinating with the others.
pub struct Slot {
    scheduler: Arc<Scheduler>,
    upstream: usize,
    base: String,
    state: SlotState,
}

impl Slot {
    pub(super) fn new(scheduler: Arc<Scheduler>, upstream: usize, base: String) -> Self {
        Self {
            scheduler,
            upstream,
            base,
            state: SlotState::Held,
        }
    }

    /// Index of the upstream this slot belongs to.
    pub fn upstream_id(&self) -> usize {
        self.upstream
    }

    /// Base URL of the upstream this slot belongs to.
    pub fn upstream_base(&self) -> &str {
        &self.base
    }

    pub fn is_released(&self) -> bool {
        self.state == SlotState::Released
    }

    pub fn release(&mut self) {
        if self.state == SlotState::Released {
            return;
        }
        self.state = SlotState::Released;
        self.scheduler.release(self.upstream);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("upstream", &self.upstream)
            .field("base", &self.base)
            .field("state", &self.state)
            .finish()
    }
}
