//! Per-queue circuit breaker for capacity oracle outages.
//!
//! Tracks consecutive oracle failures. Past the threshold the queue's
//! loop stops evaluating for a cooldown, then lets one probe cycle
//! through; a success closes the breaker again.

use std::time::Duration;

use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    /// Evaluation paused.
    Open,
    /// Cooldown elapsed; the next cycle is a probe.
    HalfOpen,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at_ms: Option<u64>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            opened_at_ms: None,
        }
    }

    pub fn state(&self, now_ms: u64) -> BreakerState {
        match self.opened_at_ms {
            None => BreakerState::Closed,
            Some(at) if now_ms >= at.saturating_add(self.cooldown.as_millis() as u64) => {
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
        }
    }

    /// Record a successful oracle round-trip. Returns true if this closed
    /// an open breaker.
    pub fn record_success(&mut self) -> bool {
        self.consecutive_failures = 0;
        let recovered = self.opened_at_ms.take().is_some();
        if recovered {
            debug!("circuit breaker closed");
        }
        recovered
    }

    /// Record a failed round-trip. Returns true if this opened the breaker.
    pub fn record_failure(&mut self, now_ms: u64) -> bool {
        self.consecutive_failures += 1;
        match self.opened_at_ms {
            // A failed probe restarts the cooldown.
            Some(_) => {
                self.opened_at_ms = Some(now_ms);
                false
            }
            None if self.consecutive_failures >= self.threshold => {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.threshold,
                    "circuit breaker opened"
                );
                self.opened_at_ms = Some(now_ms);
                true
            }
            None => false,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
