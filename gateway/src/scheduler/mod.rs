//! Admission, queueing and load balancing for chat completion requests.
//!
//! This module provides:
//! - Upstream pool with round-robin, skip-if-saturated selection
//! - Admission control against a global ceiling on active + queued requests
//! - A bounded FIFO of requests waiting for a free upstream
//! - Slots that release their counters exactly once and drain the queue
//!
//! All counters, the queue and the round-robin cursor live in one
//! [`GatewayState`] behind a single mutex. The lock is never held across an
//! `.await` and never held while a [`Slot`] is dropped.

mod pool;
mod queue;
mod slot;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use llm_gateway_common::UpstreamHealth;
use tokio::sync::oneshot;

use crate::config::Config;

pub use pool::{UpstreamPool, UpstreamTarget};
pub use queue::{PendingQueue, QueueTicket};
pub use slot::Slot;

/// Admission ceilings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionLimits {
    /// Ceiling on active + queued requests. `None` means unbounded.
    pub max_concurrent: Option<usize>,
    /// Queue capacity. `Some(0)` disables queueing, `None` is unbounded.
    pub max_queue: Option<usize>,
}

/// Outcome of admitting one request.
#[derive(Debug)]
pub enum Admission {
    /// A slot on an upstream was acquired; relay right away.
    Dispatch(Slot),
    /// No upstream is free; wait on the ticket.
    Queued(QueueTicket),
    /// Over capacity; answer with the busy response.
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Active + queued already reached the global ceiling.
    Overloaded {
        active: usize,
        queued: usize,
        limit: usize,
    },
    /// Every upstream is saturated and the queue is at capacity.
    QueueFull { queued: usize, limit: usize },
}

/// Point-in-time view of the scheduler's counters.
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    pub active: usize,
    pub queued: usize,
    pub upstreams: Vec<UpstreamHealth>,
}

#[derive(Debug)]
struct GatewayState {
    pool: UpstreamPool,
    queue: PendingQueue,
    global_active: usize,
}

impl GatewayState {
    /// Count a request against `upstream` and return the upstream's base URL.
    fn acquire(&mut self, upstream: usize) -> String {
        self.global_active += 1;
        self.pool.acquire(upstream);
        self.pool
            .get(upstream)
            .map(|target| target.base.clone())
            .unwrap_or_default()
    }
}

/// Process-wide request scheduler.
#[derive(Debug)]
pub struct Scheduler {
    state: Mutex<GatewayState>,
    limits: AdmissionLimits,
}

impl Scheduler {
    pub fn new(pool: UpstreamPool, limits: AdmissionLimits) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GatewayState {
                pool,
                queue: PendingQueue::new(),
                global_active: 0,
            }),
            limits,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        let pool = UpstreamPool::new(config.upstreams.clone(), config.upstream_max_concurrent);
        Self::new(
            pool,
            AdmissionLimits {
                max_concurrent: config.max_concurrent,
                max_queue: config.max_queue,
            },
        )
    }

    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        // The state is plain counters; a panic elsewhere cannot leave it torn.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a request dispatches now, waits in the queue, or is rejected.
    ///
    /// The global ceiling is checked before any upstream is consulted.
    pub fn admit(self: &Arc<Self>) -> Admission {
        let mut state = self.lock();

        if let Some(limit) = self.limits.max_concurrent {
            let active = state.global_active;
            let queued = state.queue.len();
            if active + queued >= limit {
                tracing::warn!(active, queued, limit, "Gateway overloaded");
                return Admission::Rejected(Rejection::Overloaded {
                    active,
                    queued,
                    limit,
                });
            }
        }

        if let Some(upstream) = state.pool.select() {
            let base = state.acquire(upstream);
            return Admission::Dispatch(Slot::new(self.clone(), upstream, base));
        }

        let queued = state.queue.len();
        if let Some(limit) = self.limits.max_queue {
            if queued >= limit {
                tracing::warn!(queued, limit, "Queue full");
                return Admission::Rejected(Rejection::QueueFull { queued, limit });
            }
        }

        let (tx, rx) = oneshot::channel();
        let id = state.queue.push(tx);
        tracing::info!(
            queue_len = state.queue.len(),
            active = state.global_active,
            "Request queued"
        );
        Admission::Queued(QueueTicket::new(self.clone(), id, rx))
    }

    /// Dispatch queued requests for as long as an upstream has a free slot.
    ///
    /// Requests whose client already went away are discarded without
    /// acquiring anything.
    pub fn drain(self: &Arc<Self>) {
        let mut grants = Vec::new();
        {
            let mut state = self.lock();
            while !state.queue.is_empty() {
                let Some(upstream) = state.pool.select() else {
                    break;
                };
                let Some(waiter) = state.queue.pop_front() else {
                    break;
                };
                if waiter.is_closed() {
                    tracing::debug!("Discarding queued request whose client disconnected");
                    continue;
                }
                let base = state.acquire(upstream);
                grants.push((waiter, Slot::new(self.clone(), upstream, base)));
            }
        }

        // Delivered outside the lock: a refused grant drops its slot, which
        // releases and drains again.
        for (waiter, slot) in grants {
            tracing::debug!(upstream = %slot.upstream_base(), "Dispatching queued request");
            if let Err(slot) = waiter.send(slot) {
                tracing::debug!("Queued client left before dispatch");
                drop(slot);
            }
        }
    }

    /// Decrement the counters for one finished request and drain the queue.
    fn release(self: &Arc<Self>, upstream: usize) {
        {
            let mut state = self.lock();
            state.global_active = state.global_active.saturating_sub(1);
            state.pool.release(upstream);
            tracing::debug!(
                upstream,
                active = state.global_active,
                queued = state.queue.len(),
                "Slot released"
            );
        }
        self.drain();
    }

    /// Take a queued entry out before it is dispatched.
    fn withdraw(&self, ticket: u64) -> bool {
        self.lock().queue.remove(ticket)
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.lock();
        SchedulerSnapshot {
            active: state.global_active,
            queued: state.queue.len(),
            upstreams: state.pool.health(),
        }
    }
}
