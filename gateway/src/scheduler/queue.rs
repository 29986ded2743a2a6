//! FIFO queue of admitted requests waiting for a free upstream slot.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;

use super::slot::Slot;
use super::Scheduler;
use crate::error::GatewayError;

/// Sending half held by the queue; the slot is delivered through it on dispatch.
pub(super) type Waiter = oneshot::Sender<Slot>;

/// Pending requests in arrival order.
///
/// Entries are keyed by a ticket id so a disconnecting client can be removed
/// in O(1). Removed ids stay in `order` until they reach the head (or the
/// next compaction) and are skipped there.
#[derive(Debug, Default)]
pub struct PendingQueue {
    order: VecDeque<u64>,
    waiters: HashMap<u64, Waiter>,
    next_id: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Append to the tail, returning the entry's ticket id.
    pub(super) fn push(&mut self, waiter: Waiter) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.order.push_back(id);
        self.waiters.insert(id, waiter);
        id
    }

    /// Pop the oldest live entry.
    pub(super) fn pop_front(&mut self) -> Option<Waiter> {
        while let Some(id) = self.order.pop_front() {
            if let Some(waiter) = self.waiters.remove(&id) {
                return Some(waiter);
            }
        }
        None
    }

    /// Remove an entry that has not been dequeued yet.
    ///
    /// Returns `false` if the entry was already dequeued or removed.
    pub(super) fn remove(&mut self, id: u64) -> bool {
        let removed = self.waiters.remove(&id).is_some();
        if removed && self.order.len() > 2 * self.waiters.len() + 16 {
            let waiters = &self.waiters;
            self.order.retain(|id| waiters.contains_key(id));
        }
        removed
    }
}

/// A request's place in the pending queue.
///
/// Dropping the ticket before a slot arrives (the client went away while
/// waiting) takes the entry out of the queue, so no upstream is ever touched
/// on its behalf.
pub struct QueueTicket {
    scheduler: Arc<Scheduler>,
    id: u64,
    rx: oneshot::Receiver<Slot>,
    queued: bool,
}

impl QueueTicket {
    pub(super) fn new(scheduler: Arc<Scheduler>, id: u64, rx: oneshot::Receiver<Slot>) -> Self {
        Self {
            scheduler,
            id,
            rx,
            queued: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until a drain dispatches this request.
    pub async fn wait(mut self) -> Result<Slot, GatewayError> {
        let result = (&mut self.rx).await;
        self.queued = false;
        result.map_err(|_| GatewayError::Abandoned)
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        if self.queued && self.scheduler.withdraw(self.id) {
            tracing::info!(ticket = self.id, "Queued request abandoned by client");
        }
    }
}

impl fmt::Debug for QueueTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueTicket")
            .field("id", &self.id)
            .field("queued", &self.queued)
            .finish()
    }
}
