//! Timeout/Retry Supervisor.
//!
//! A periodic sweep, independent of the evaluation loops. It only moves
//! phases and timestamps; bindings are released through the
//! [`ReservationManager`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gangway_core::{RetryConfig, TimeoutAction};
use gangway_state::{Group, GroupPhase};

use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::{GroupFilter, GroupRegistry};
use crate::reservation::ReservationManager;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: u32,
    pub failed: u32,
    pub requeued: u32,
    pub readmitted: u32,
    /// Bindings found on expired groups. Always zero unless a commit
    /// broke atomicity.
    pub released: u32,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct TimeoutSupervisor {
    registry: Arc<GroupRegistry>,
    reservations: Arc<ReservationManager>,
    retry: RetryConfig,
}

impl TimeoutSupervisor {
    pub fn new(
        registry: Arc<GroupRegistry>,
        reservations: Arc<ReservationManager>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            reservations,
            retry,
        }
    }

    /// Expire overdue groups, apply the retry policy, and re-admit groups
    /// whose backoff has elapsed.
    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let mut report = SweepReport::default();
        let now = self.registry.now_ms();

        for group in self.registry.list_groups(&GroupFilter::default())? {
            if group.phase.is_awaiting_capacity() && now >= group.deadline_at_ms {
                self.expire(group, now, &mut report).await?;
            }
        }

        for group in self.registry.list_groups(&GroupFilter::phase(GroupPhase::Pending))? {
            let backoff_elapsed = group.not_before_ms.is_none_or(|t| now >= t);
            if !backoff_elapsed || !group.has_quorum() {
                continue;
            }
            match self
                .registry
                .transition_with(group.id(), GroupPhase::Pending, GroupPhase::Queued, None, |g| {
                    g.not_before_ms = None;
                })
                .await
            {
                Ok(_) => report.readmitted += 1,
                // Membership changed under us; the next sweep sees it.
                Err(SchedulerError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        if !report.is_empty() {
            info!(
                timed_out = report.timed_out,
                failed = report.failed,
                requeued = report.requeued,
                readmitted = report.readmitted,
                "supervisor sweep"
            );
        }
        Ok(report)
    }

    async fn expire(&self, group: Group, now: u64, report: &mut SweepReport) -> SchedulerResult<()> {
        let group_id = group.id().to_string();

        let last = group
            .reason
            .clone()
            .unwrap_or_else(|| "no feasible placement found".to_string());
        let reason = format!(
            "schedule timeout of {}s exceeded: {last}",
            group.schedule_timeout_secs
        );

        // The queue's loop may move the group between Queued and
        // Evaluating while we look; re-read once.
        let mut from = group.phase;
        let mut attempt = 0;
        let timed_out = loop {
            match self
                .registry
                .transition(&group_id, from, GroupPhase::TimedOut, Some(reason.clone()))
                .await
            {
                Ok(g) => break Some(g),
                Err(SchedulerError::InvalidTransition { from: actual, .. })
                    if attempt == 0 && actual.is_awaiting_capacity() =>
                {
                    from = actual;
                    attempt += 1;
                }
                Err(SchedulerError::InvalidTransition { from: actual, .. }) => {
                    debug!(group = %group_id, phase = %actual, "group left the queue before expiry");
                    break None;
                }
                Err(e) => return Err(e),
            }
        };
        let Some(timed_out) = timed_out else {
            return Ok(());
        };
        warn!(group = %group_id, queue = %timed_out.queue(), reason = %reason, "group timed out");
        report.timed_out += 1;

        // Only after the group left Queued/Evaluating: a commit that won
        // the race owns its bindings and must keep them.
        let released = self.reservations.release_group(&group_id).await?;
        if released > 0 {
            error!(group = %group_id, released, "expired group held bindings");
            report.released += released as u32;
        }

        match self.retry.on_timeout {
            TimeoutAction::Expire => {}
            TimeoutAction::Fail => {
                self.registry
                    .transition(&group_id, GroupPhase::TimedOut, GroupPhase::Failed, None)
                    .await?;
                report.failed += 1;
            }
            TimeoutAction::Requeue if timed_out.retry_count < self.retry.max_retries => {
                let retry = timed_out.retry_count + 1;
                let not_before = now.saturating_add(self.retry.backoff_for(retry).as_millis() as u64);
                let deadline =
                    not_before.saturating_add(timed_out.schedule_timeout_secs.saturating_mul(1000));
                self.registry
                    .transition_with(
                        &group_id,
                        GroupPhase::TimedOut,
                        GroupPhase::Pending,
                        Some(format!("retry {retry} of {}: {reason}", self.retry.max_retries)),
                        |g| {
                            g.retry_count = retry;
                            g.not_before_ms = Some(not_before);
                            g.deadline_at_ms = deadline;
                        },
                    )
                    .await?;
                info!(group = %group_id, retry, not_before_ms = not_before, "group requeued after timeout");
                report.requeued += 1;
            }
            TimeoutAction::Requeue => {
                info!(group = %group_id, retries = timed_out.retry_count, "retries exhausted");
            }
        }
        Ok(())
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(&self, interval: Duration, shutdown: watch::Receiver<bool>) {
        self.run_with(interval, shutdown, |_| {}).await
    }

    /// Like [`run`](Self::run), calling `after_sweep` after each
    /// successful sweep.
    pub async fn run_with<F>(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut after_sweep: F,
    ) where
        F: FnMut(&SweepReport),
    {
        info!(interval_ms = interval.as_millis() as u64, "timeout supervisor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep().await {
                        Ok(report) => after_sweep(&report),
                        Err(e) => error!(error = %e, "supervisor sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("timeout supervisor shutting down");
                    break;
                }
            }
        }
    }
}
