//! Per-queue evaluation loop.
//!
//! One [`QueueController`] per queue, each on its own task. A cycle:
//!
//! 1. renew the queue lease; a replica that doesn't hold it does nothing
//! 2. consult the circuit breaker; an open breaker pauses the queue
//! 3. repeatedly take the queue head (re-sorted every time), evaluate it,
//!    and either commit the plan or put the group back with a reason
//!
//! Evaluation is sequential within a queue. A slow oracle stalls only
//! the queue that is waiting on it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use gangway_core::GangwayConfig;
use gangway_placement::{Evaluation, GangEvaluator, OracleError, Plan};
use gangway_state::{EventKind, Group, GroupPhase, QueueSpec, StateStore};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::{SchedulerError, SchedulerResult};
use crate::lease::QueueLease;
use crate::queue::AdmissionQueue;
use crate::registry::GroupRegistry;
use crate::reservation::ReservationManager;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    #[default]
    Ran,
    /// Another replica holds the queue lease.
    NotLeader,
    /// The circuit breaker is open.
    Degraded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub evaluated: u32,
    pub scheduled: u32,
    pub insufficient: u32,
    /// Held back by the queue's capacity share.
    pub deferred: u32,
    pub conflicts: u32,
    pub oracle_errors: u32,
}

impl CycleReport {
    fn skipped(outcome: CycleOutcome) -> Self {
        Self {
            outcome,
            ..Default::default()
        }
    }
}

/// How one evaluation attempt ended, short of an error.
enum Attempt {
    Scheduled(Plan),
    Insufficient(String),
    Deferred(String),
    Conflict(String),
    /// A planned member left before the commit.
    MembershipChanged(String),
    /// Cancelled or expired while we were working on it.
    Gone,
}

struct LoopState {
    lease: QueueLease,
    breaker: CircuitBreaker,
}

pub struct QueueController {
    queue: AdmissionQueue,
    registry: Arc<GroupRegistry>,
    evaluator: Arc<GangEvaluator>,
    reservations: Arc<ReservationManager>,
    state: Mutex<LoopState>,
    interval: Duration,
    max_evaluations: u32,
    conflict_budget: u32,
}

impl QueueController {
    pub fn new(
        spec: QueueSpec,
        store: StateStore,
        registry: Arc<GroupRegistry>,
        evaluator: Arc<GangEvaluator>,
        reservations: Arc<ReservationManager>,
        config: &GangwayConfig,
    ) -> Self {
        let lease = QueueLease::new(
            store,
            &spec.name,
            &config.controller.replica_id,
            config.controller.lease_ttl_ms,
        );
        let breaker = CircuitBreaker::new(
            config.oracle.circuit_breaker_threshold,
            Duration::from_millis(config.oracle.circuit_breaker_cooldown_ms),
        );
        Self {
            queue: AdmissionQueue::new(spec, registry.clone()),
            registry,
            evaluator,
            reservations,
            state: Mutex::new(LoopState { lease, breaker }),
            interval: config.controller.evaluation_interval(),
            max_evaluations: config.controller.max_evaluations_per_cycle.max(1),
            conflict_budget: config.retry.conflict_budget,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub async fn breaker_state(&self) -> BreakerState {
        self.state.lock().await.breaker.state(self.registry.now_ms())
    }

    /// Run one evaluation cycle.
    pub async fn run_cycle(&self) -> SchedulerResult<CycleReport> {
        let mut state = self.state.lock().await;
        let now = self.registry.now_ms();

        if !state.lease.acquire(now)? {
            return Ok(CycleReport::skipped(CycleOutcome::NotLeader));
        }

        match state.breaker.state(now) {
            BreakerState::Closed => {}
            BreakerState::Open => return Ok(CycleReport::skipped(CycleOutcome::Degraded)),
            BreakerState::HalfOpen => {
                let probe = self.evaluator.oracle().cluster_capacity().await;
                match probe {
                    Ok(_) => self.oracle_succeeded(&mut state),
                    Err(e) => {
                        debug!(queue = %self.queue.name(), error = %e, "oracle probe failed");
                        state.breaker.record_failure(now);
                        return Ok(CycleReport::skipped(CycleOutcome::Degraded));
                    }
                }
            }
        }

        let mut report = CycleReport::default();
        let mut attempted: HashSet<String> = HashSet::new();
        for _ in 0..self.max_evaluations {
            // Re-read every iteration: a newly queued higher-priority group
            // goes next.
            let Some(head) = self.queue.head_excluding(&attempted)? else {
                break;
            };
            attempted.insert(head.id().to_string());

            let group = match self
                .registry
                .transition(head.id(), GroupPhase::Queued, GroupPhase::Evaluating, None)
                .await
            {
                Ok(group) => group,
                Err(SchedulerError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            };
            report.evaluated += 1;

            match self.attempt(&group).await {
                Ok(attempt) => {
                    self.oracle_succeeded(&mut state);
                    self.settle(&group, attempt, &mut report).await?;
                }
                Err(SchedulerError::OracleUnavailable(msg)) => {
                    report.oracle_errors += 1;
                    warn!(queue = %self.queue.name(), group = %group.id(), error = %msg, "capacity oracle unavailable");
                    self.requeue(group.id(), format!("capacity oracle unavailable: {msg}"), false)
                        .await?;
                    if state.breaker.record_failure(self.registry.now_ms()) {
                        self.registry.events().record(
                            EventKind::QueueDegraded,
                            self.queue.name(),
                            None,
                            format!("evaluation paused after repeated oracle failures: {msg}"),
                        );
                    }
                    break;
                }
                Err(e) => {
                    error!(queue = %self.queue.name(), group = %group.id(), error = %e, "evaluation failed");
                    if let Err(requeue_err) = self.requeue(group.id(), e.to_string(), false).await {
                        error!(group = %group.id(), error = %requeue_err, "could not return group to queue");
                    }
                    return Err(e);
                }
            }
        }

        if report.evaluated > 0 {
            debug!(
                queue = %self.queue.name(),
                evaluated = report.evaluated,
                scheduled = report.scheduled,
                insufficient = report.insufficient,
                conflicts = report.conflicts,
                "evaluation cycle"
            );
        }
        Ok(report)
    }

    async fn attempt(&self, group: &Group) -> SchedulerResult<Attempt> {
        let members = match self.registry.members(group.id()) {
            Ok(members) => members,
            Err(SchedulerError::GroupNotFound(_)) => return Ok(Attempt::Gone),
            Err(e) => return Err(e),
        };
        let plan = match self.evaluator.evaluate(group, &members).await? {
            Evaluation::Feasible(plan) => plan,
            Evaluation::InsufficientCapacity { reason } => return Ok(Attempt::Insufficient(reason)),
        };

        if let Some(reason) = self.over_share(&plan).await? {
            return Ok(Attempt::Deferred(reason));
        }

        match self.reservations.commit(&plan).await {
            Ok(_) => Ok(Attempt::Scheduled(plan)),
            Err(e) if e.is_commit_conflict() => Ok(Attempt::Conflict(e.to_string())),
            Err(SchedulerError::Cancelled(_) | SchedulerError::InvalidTransition { .. }) => {
                Ok(Attempt::Gone)
            }
            Err(SchedulerError::GroupNotFound(_)) => Ok(Attempt::Gone),
            Err(e @ SchedulerError::RequestNotFound { .. }) => Ok(Attempt::MembershipChanged(format!(
                "membership changed during evaluation: {e}"
            ))),
            Err(e) => Err(e),
        }
    }

    async fn settle(&self, group: &Group, attempt: Attempt, report: &mut CycleReport) -> SchedulerResult<()> {
        let group_id = group.id();
        match attempt {
            Attempt::Scheduled(plan) => {
                report.scheduled += 1;
                info!(
                    queue = %self.queue.name(),
                    group = %group_id,
                    members = plan.len(),
                    heuristic = ?plan.heuristic,
                    domain = plan.domain.as_deref().unwrap_or("-"),
                    "plan committed"
                );
            }
            Attempt::Insufficient(reason) => {
                report.insufficient += 1;
                debug!(group = %group_id, reason = %reason, "insufficient capacity");
                self.requeue(group_id, reason, false).await?;
            }
            Attempt::Deferred(reason) => {
                report.deferred += 1;
                debug!(group = %group_id, reason = %reason, "deferred by capacity share");
                self.requeue(group_id, reason, false).await?;
            }
            Attempt::Conflict(reason) => {
                report.conflicts += 1;
                warn!(group = %group_id, reason = %reason, "commit conflict, group requeued");
                if let Some(group) = self.requeue(group_id, reason.clone(), true).await?
                    && group.conflict_count == self.conflict_budget + 1
                {
                    self.registry.events().record(
                        EventKind::ConflictBudgetExceeded,
                        group.queue(),
                        Some(group_id),
                        format!(
                            "{} commit conflicts exceed the budget of {}: {reason}",
                            group.conflict_count, self.conflict_budget
                        ),
                    );
                }
            }
            Attempt::MembershipChanged(reason) => {
                debug!(group = %group_id, reason = %reason, "plan is stale, group requeued");
                self.requeue(group_id, reason, false).await?;
            }
            Attempt::Gone => {
                debug!(group = %group_id, "group left evaluation before commit");
            }
        }
        Ok(())
    }

    /// Put a group back after an attempt. `None` if it already moved on.
    async fn requeue(&self, group_id: &str, reason: String, conflict: bool) -> SchedulerResult<Option<Group>> {
        match self.registry.return_to_queue(group_id, reason, conflict).await {
            Ok(group) => Ok(Some(group)),
            Err(SchedulerError::InvalidTransition { .. } | SchedulerError::GroupNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Reason to hold `plan` back if committing it would push this queue
    /// past its capacity share while other queues wait.
    async fn over_share(&self, plan: &Plan) -> SchedulerResult<Option<String>> {
        let share = self.queue.spec().capacity_share;
        if share >= 1.0 || !self.registry.has_waiting_outside(self.queue.name())? {
            return Ok(None);
        }
        let capacity = self
            .evaluator
            .oracle()
            .cluster_capacity()
            .await
            .map_err(|e| match e {
                OracleError::Unavailable(msg) => SchedulerError::OracleUnavailable(msg),
                other => SchedulerError::OracleUnavailable(other.to_string()),
            })?;
        let usage = self.registry.queue_usage(self.queue.name())? + plan.total_demand();
        let projected = usage.dominant_share(&capacity);
        if projected > share {
            return Ok(Some(format!(
                "over capacity share: would hold {:.0}% of the cluster, share is {:.0}%",
                projected * 100.0,
                share * 100.0
            )));
        }
        Ok(None)
    }

    fn oracle_succeeded(&self, state: &mut LoopState) {
        if state.breaker.record_success() {
            info!(queue = %self.queue.name(), "capacity oracle recovered");
            self.registry.events().record(
                EventKind::QueueRecovered,
                self.queue.name(),
                None,
                "evaluation resumed",
            );
        }
    }

    /// Evaluate every `evaluation_interval` until shutdown, then give up
    /// the lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.queue.name(),
            interval_ms = self.interval.as_millis() as u64,
            "queue controller started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(queue = %self.queue.name(), error = %e, "evaluation cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(queue = %self.queue.name(), "queue controller shutting down");
                    break;
                }
            }
        }
        if let Err(e) = self.state.lock().await.lease.release() {
            warn!(queue = %self.queue.name(), error = %e, "lease release failed");
        }
    }
}
