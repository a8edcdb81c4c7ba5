//! Reservation Manager: atomic two-phase commit of a gang plan.
//!
//! # Architecture
//!
//! ```text
//!   Plan ──► lock plan's nodes (sorted) ──► cancellation gate
//!                                                │
//!                        ┌───────────────────────┘
//!                        ▼
//!     reserve  ── oracle.reserve per placement, under commit_timeout
//!          │           any rejection / timeout / outage ──► release all, Err
//!          ▼
//!     confirm  ── registry.record_bindings (one store write, re-gated)
//!          │           failure ──► release all, Err
//!          ▼
//!     Scheduled
//! ```
//!
//! Node locks are the only cross-queue mutual exclusion in the system.
//! They cover exactly the plan's node set and are held only for the
//! commit, so two queues touching disjoint nodes commit in parallel.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use gangway_placement::{CapacityOracle, OracleError, Plan, ReservationToken};
use gangway_state::{Binding, Group, GroupPhase, NodeId, RequestId};

use crate::error::{SchedulerError, SchedulerResult};
use crate::registry::{GroupFilter, GroupRegistry};

/// What [`ReservationManager::restore`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Bindings reserved again on their node.
    pub rebound: u32,
    /// Bindings whose node refused them.
    pub lost: u32,
    /// Groups found `Evaluating` and put back in their queue.
    pub requeued: u32,
}

pub struct ReservationManager {
    registry: Arc<GroupRegistry>,
    oracle: Arc<dyn CapacityOracle>,
    node_locks: Mutex<HashMap<NodeId, Arc<Mutex<()>>>>,
    commit_timeout: Duration,
}

impl ReservationManager {
    pub fn new(
        registry: Arc<GroupRegistry>,
        oracle: Arc<dyn CapacityOracle>,
        commit_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            oracle,
            node_locks: Mutex::new(HashMap::new()),
            commit_timeout,
        }
    }

    /// Lock every node in `nodes`, in sorted order.
    async fn lock_nodes(&self, nodes: &BTreeSet<NodeId>) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<Arc<Mutex<()>>> = {
            let mut table = self.node_locks.lock().await;
            nodes
                .iter()
                .map(|n| table.entry(n.clone()).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Bind every placement in `plan`, or none of them.
    pub async fn commit(&self, plan: &Plan) -> SchedulerResult<Group> {
        let group_id = plan.group_id.as_str();
        let nodes = plan.node_set();
        let _guards = self.lock_nodes(&nodes).await;

        self.check_gate(group_id)?;

        // ── Phase 1: reserve ──────────────────────────────────────
        let deadline = Instant::now() + self.commit_timeout;
        let mut tokens: Vec<(RequestId, ReservationToken)> = Vec::with_capacity(plan.len());
        for placement in &plan.placements {
            let reserved = tokio::time::timeout_at(
                deadline,
                self.oracle.reserve(&placement.node_id, &placement.demand),
            )
            .await;
            let err = match reserved {
                Ok(Ok(token)) => {
                    tokens.push((placement.request_id.clone(), token));
                    continue;
                }
                Ok(Err(OracleError::Unavailable(msg))) => SchedulerError::OracleUnavailable(msg),
                Ok(Err(e)) => SchedulerError::PartialReservationConflict {
                    group: group_id.to_string(),
                    node: placement.node_id.clone(),
                    reason: e.to_string(),
                },
                Err(_) => SchedulerError::CommitTimedOut {
                    group: group_id.to_string(),
                    timeout_ms: self.commit_timeout.as_millis() as u64,
                },
            };
            warn!(
                group = %group_id,
                node = %placement.node_id,
                reserved = tokens.len(),
                error = %err,
                "reservation failed, rolling back"
            );
            self.rollback(&tokens).await;
            return Err(err);
        }

        // ── Phase 2: confirm ──────────────────────────────────────
        let now = self.registry.now_ms();
        let bindings: Vec<(RequestId, Binding)> = tokens
            .iter()
            .map(|(request_id, token)| {
                (
                    request_id.clone(),
                    Binding {
                        node_id: token.node_id.clone(),
                        token_id: token.id,
                        bound_at_ms: now,
                    },
                )
            })
            .collect();

        match self.registry.record_bindings(group_id, &bindings).await {
            Ok(group) => {
                debug!(group = %group_id, nodes = nodes.len(), "commit confirmed");
                Ok(group)
            }
            Err(e) => {
                warn!(group = %group_id, error = %e, "confirm failed, rolling back");
                self.rollback(&tokens).await;
                Err(e)
            }
        }
    }

    fn check_gate(&self, group_id: &str) -> SchedulerResult<()> {
        let group = self.registry.get_group(group_id)?;
        match group.phase {
            GroupPhase::Evaluating => Ok(()),
            GroupPhase::Failed => Err(SchedulerError::Cancelled(group_id.to_string())),
            phase => Err(SchedulerError::InvalidTransition {
                group: group_id.to_string(),
                from: phase,
                to: GroupPhase::Scheduled,
            }),
        }
    }

    async fn rollback(&self, tokens: &[(RequestId, ReservationToken)]) {
        for (request_id, token) in tokens.iter().rev() {
            if let Err(e) = self.oracle.release(token).await {
                warn!(
                    request = %request_id,
                    node = %token.node_id,
                    token = token.id,
                    error = %e,
                    "rollback release failed"
                );
            }
        }
    }

    /// Release every binding of a group. Returns how many were released.
    pub async fn release_group(&self, group_id: &str) -> SchedulerResult<usize> {
        let bindings = self.registry.clear_bindings(group_id).await?;
        for binding in &bindings {
            self.release_binding(binding).await;
        }
        if !bindings.is_empty() {
            info!(group = %group_id, released = bindings.len(), "group bindings released");
        }
        Ok(bindings.len())
    }

    /// Bring a freshly built oracle in line with the store after a restart.
    ///
    /// Every binding of a `Scheduled` group is reserved again on its node
    /// and its token rewritten. Groups caught `Evaluating` go back to their
    /// queue; bindings on any other phase are dropped.
    pub async fn restore(&self) -> SchedulerResult<RestoreReport> {
        let mut report = RestoreReport::default();
        for group in self.registry.list_groups(&GroupFilter::default())? {
            let group_id = group.id();
            match group.phase {
                GroupPhase::Scheduled => {
                    let mut rebound = Vec::new();
                    for request in self.registry.members(group_id)? {
                        let Some(binding) = request.binding else {
                            continue;
                        };
                        let reserved = self.oracle.reserve(&binding.node_id, &request.demand).await;
                        match reserved {
                            Ok(token) => rebound.push((
                                request.id,
                                Binding {
                                    token_id: token.id,
                                    ..binding
                                },
                            )),
                            Err(e) => {
                                error!(
                                    group = %group_id,
                                    request = %request.id,
                                    node = %binding.node_id,
                                    error = %e,
                                    "binding could not be restored"
                                );
                                report.lost += 1;
                            }
                        }
                    }
                    report.rebound += rebound.len() as u32;
                    self.registry.rebind(group_id, &rebound).await?;
                }
                GroupPhase::Evaluating => {
                    self.registry.clear_bindings(group_id).await?;
                    self.registry
                        .return_to_queue(group_id, "controller restarted during evaluation".to_string(), false)
                        .await?;
                    report.requeued += 1;
                }
                _ => {
                    let dropped = self.registry.clear_bindings(group_id).await?;
                    if !dropped.is_empty() {
                        warn!(group = %group_id, phase = %group.phase, dropped = dropped.len(), "stale bindings dropped");
                    }
                }
            }
        }
        info!(
            rebound = report.rebound,
            lost = report.lost,
            requeued = report.requeued,
            "reservations restored"
        );
        Ok(report)
    }

    /// Return one member's capacity to the oracle.
    pub async fn release_binding(&self, binding: &Binding) {
        let token = ReservationToken {
            id: binding.token_id,
            node_id: binding.node_id.clone(),
        };
        if let Err(e) = self.oracle.release(&token).await {
            warn!(node = %binding.node_id, token = binding.token_id, error = %e, "release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gangway_core::{ControllerConfig, ManualClock};
    use gangway_placement::{
        CandidateNode, Heuristic, InMemoryOracle, InventoryNode, Placement, PlanScore,
    };
    use gangway_state::{GroupSpec, PlacementConstraints, Request, ResourceVector, StateStore};

    use crate::events::EventRecorder;

    fn unit() -> ResourceVector {
        ResourceVector::new(1000, 1 << 30, 1)
    }

    fn test_registry() -> Arc<GroupRegistry> {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let events = EventRecorder::new(store.clone(), clock.clone());
        Arc::new(
            GroupRegistry::new(store, clock, events, &ControllerConfig::default(), Vec::new())
                .unwrap(),
        )
    }

    /// Register `members` members and move the group to Evaluating.
    async fn evaluating_group(registry: &GroupRegistry, id: &str, members: usize) {
        let spec = GroupSpec::new(id, "default", members as u32);
        for i in 1..=members {
            registry
                .register_member(&spec, Request::new(&format!("r{i}"), id, unit()))
                .await
                .unwrap();
        }
        registry
            .transition(id, GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap();
    }

    fn plan(group: &str, nodes: &[&str]) -> Plan {
        let placements: Vec<Placement> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| Placement {
                request_id: format!("r{}", i + 1),
                node_id: n.to_string(),
                demand: unit(),
            })
            .collect();
        let distinct: BTreeSet<String> = nodes.iter().map(|n| n.to_string()).collect();
        Plan {
            group_id: group.to_string(),
            placements,
            heuristic: Heuristic::Consolidate,
            domain: None,
            score: PlanScore {
                placed: nodes.len(),
                nodes_touched: distinct.len(),
                imbalance: 0.0,
                nodes: distinct.into_iter().collect(),
            },
        }
    }

    fn two_by_two() -> Arc<InMemoryOracle> {
        Arc::new(InMemoryOracle::new([
            InventoryNode::new("n1", ResourceVector::new(2000, 2 << 30, 2)),
            InventoryNode::new("n2", ResourceVector::new(2000, 2 << 30, 2)),
        ]))
    }

    #[tokio::test]
    async fn commit_binds_every_member() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_secs(1));
        evaluating_group(&registry, "g1", 4).await;

        let group = manager.commit(&plan("g1", &["n1", "n1", "n2", "n2"])).await.unwrap();
        assert_eq!(group.phase, GroupPhase::Scheduled);
        assert_eq!(registry.bound_count("g1").unwrap(), 4);
        assert_eq!(oracle.outstanding_reservations().await, 4);
    }

    #[tokio::test]
    async fn late_rejection_rolls_back_everything() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_secs(1));
        evaluating_group(&registry, "g1", 4).await;

        // n2 fails after the plan was made.
        oracle.set_schedulable("n2", false).await;
        let err = manager.commit(&plan("g1", &["n1", "n1", "n2", "n2"])).await.unwrap_err();
        assert!(matches!(err, SchedulerError::PartialReservationConflict { ref node, .. } if node == "n2"));

        assert_eq!(registry.bound_count("g1").unwrap(), 0);
        assert_eq!(oracle.outstanding_reservations().await, 0);
        assert_eq!(oracle.total_allocated().await, ResourceVector::ZERO);
        // The group is untouched; the caller decides where it goes next.
        assert_eq!(registry.get_group("g1").unwrap().phase, GroupPhase::Evaluating);
    }

    #[tokio::test]
    async fn cancelled_group_is_not_committed() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_secs(1));
        evaluating_group(&registry, "g1", 2).await;
        registry.cancel("g1", "owner").await.unwrap();

        let err = manager.commit(&plan("g1", &["n1", "n1"])).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled(_)));
        assert_eq!(oracle.outstanding_reservations().await, 0);
    }

    #[tokio::test]
    async fn oracle_outage_during_commit() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_secs(1));
        evaluating_group(&registry, "g1", 2).await;
        oracle.set_available(false).await;

        let err = manager.commit(&plan("g1", &["n1", "n2"])).await.unwrap_err();
        assert!(matches!(err, SchedulerError::OracleUnavailable(_)));
        assert_eq!(registry.bound_count("g1").unwrap(), 0);
    }

    /// Reserves succeed but the second one takes far too long.
    struct SlowOracle {
        inner: InMemoryOracle,
    }

    #[async_trait]
    impl CapacityOracle for SlowOracle {
        async fn query(
            &self,
            demand: &ResourceVector,
            constraints: &PlacementConstraints,
        ) -> Result<Vec<CandidateNode>, OracleError> {
            self.inner.query(demand, constraints).await
        }

        async fn reserve(
            &self,
            node_id: &str,
            demand: &ResourceVector,
        ) -> Result<ReservationToken, OracleError> {
            if node_id == "n2" {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            self.inner.reserve(node_id, demand).await
        }

        async fn release(&self, token: &ReservationToken) -> Result<(), OracleError> {
            self.inner.release(token).await
        }

        async fn cluster_capacity(&self) -> Result<ResourceVector, OracleError> {
            self.inner.cluster_capacity().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn commit_timeout_rolls_back() {
        let registry = test_registry();
        let oracle = Arc::new(SlowOracle {
            inner: InMemoryOracle::new([
                InventoryNode::new("n1", ResourceVector::new(2000, 2 << 30, 2)),
                InventoryNode::new("n2", ResourceVector::new(2000, 2 << 30, 2)),
            ]),
        });
        let manager =
            ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_millis(200));
        evaluating_group(&registry, "g1", 2).await;

        let err = manager.commit(&plan("g1", &["n1", "n2"])).await.unwrap_err();
        assert!(matches!(err, SchedulerError::CommitTimedOut { timeout_ms: 200, .. }));
        assert_eq!(oracle.inner.outstanding_reservations().await, 0);
    }

    #[tokio::test]
    async fn release_group_returns_capacity() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = ReservationManager::new(registry.clone(), oracle.clone(), Duration::from_secs(1));
        evaluating_group(&registry, "g1", 2).await;
        manager.commit(&plan("g1", &["n1", "n2"])).await.unwrap();

        assert_eq!(manager.release_group("g1").await.unwrap(), 2);
        assert_eq!(oracle.total_allocated().await, ResourceVector::ZERO);
        assert_eq!(registry.bound_count("g1").unwrap(), 0);
        // Nothing left to release the second time.
        assert_eq!(manager.release_group("g1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn racing_commits_on_shared_nodes() {
        let registry = test_registry();
        let oracle = two_by_two();
        let manager = Arc::new(ReservationManager::new(
            registry.clone(),
            oracle.clone(),
            Duration::from_secs(1),
        ));
        evaluating_group(&registry, "a", 3).await;
        evaluating_group(&registry, "b", 3).await;

        // Both planned against the same free capacity; only one fits.
        let plan_a = plan("a", &["n1", "n1", "n2"]);
        let plan_b = plan("b", &["n2", "n1", "n1"]);
        let (ra, rb) = tokio::join!(
            {
                let m = manager.clone();
                async move { m.commit(&plan_a).await }
            },
            {
                let m = manager.clone();
                async move { m.commit(&plan_b).await }
            }
        );

        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(winners, 1);
        let loser = if ra.is_ok() { rb } else { ra };
        assert!(loser.unwrap_err().is_commit_conflict());

        // Exactly the winner's three units are held; the loser leaked nothing.
        assert_eq!(oracle.outstanding_reservations().await, 3);
        let bound = registry.bound_count("a").unwrap() + registry.bound_count("b").unwrap();
        assert_eq!(bound, 3);
    }
}
