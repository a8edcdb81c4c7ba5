//! Per-queue leader lease.
//!
//! Exactly one replica evaluates a queue at a time: whoever holds the
//! queue's lease in the shared state store. The holder renews it every
//! cycle; a replica that stops renewing loses it after the TTL.

use tracing::{info, warn};

use gangway_state::StateStore;

use crate::error::SchedulerResult;

pub struct QueueLease {
    store: StateStore,
    queue: String,
    holder: String,
    ttl_ms: u64,
    held: bool,
}

impl QueueLease {
    pub fn new(store: StateStore, queue: &str, holder: &str, ttl_ms: u64) -> Self {
        Self {
            store,
            queue: queue.to_string(),
            holder: holder.to_string(),
            ttl_ms,
            held: false,
        }
    }

    /// Acquire or renew. Returns whether this replica leads the queue.
    pub fn acquire(&mut self, now_ms: u64) -> SchedulerResult<bool> {
        let granted = self
            .store
            .try_acquire_lease(&self.queue, &self.holder, now_ms, self.ttl_ms)?
            .is_some();
        if granted && !self.held {
            info!(queue = %self.queue, holder = %self.holder, "queue lease acquired");
        } else if !granted && self.held {
            warn!(queue = %self.queue, holder = %self.holder, "queue lease lost");
        }
        self.held = granted;
        Ok(granted)
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn release(&mut self) -> SchedulerResult<()> {
        if self.held {
            self.store.release_lease(&self.queue, &self.holder)?;
            self.held = false;
            info!(queue = %self.queue, holder = %self.holder, "queue lease released");
        }
        Ok(())
    }
}
