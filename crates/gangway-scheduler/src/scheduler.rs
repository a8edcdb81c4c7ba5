//! The assembled gang scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use gangway_core::{Clock, GangwayConfig};
use gangway_placement::{CapacityOracle, GangEvaluator};
use gangway_state::{
    GangEvent, Group, GroupSpec, GroupStatus, QueueSpec, Request, StateStore, StatusSnapshot,
};

use crate::controller::{CycleReport, QueueController};
use crate::error::SchedulerResult;
use crate::events::EventRecorder;
use crate::hierarchy::HierarchyResolver;
use crate::registry::{GroupFilter, GroupRegistry};
use crate::reservation::{ReservationManager, RestoreReport};
use crate::status::publish;
use crate::supervisor::{SweepReport, TimeoutSupervisor};

/// Queue used when the configuration declares none.
pub const DEFAULT_QUEUE: &str = "default";

/// Registry, evaluator, reservation manager, supervisor, hierarchy
/// resolver and one controller per queue, over one state store.
pub struct GangScheduler {
    config: GangwayConfig,
    store: StateStore,
    registry: Arc<GroupRegistry>,
    reservations: Arc<ReservationManager>,
    supervisor: Arc<TimeoutSupervisor>,
    hierarchy: HierarchyResolver,
    controllers: Vec<Arc<QueueController>>,
    status_file: Option<PathBuf>,
}

impl GangScheduler {
    pub fn new(
        config: GangwayConfig,
        store: StateStore,
        oracle: Arc<dyn CapacityOracle>,
        clock: Arc<dyn Clock>,
    ) -> SchedulerResult<Self> {
        let queues: Vec<QueueSpec> = if config.queues.is_empty() {
            vec![QueueSpec::new(DEFAULT_QUEUE)]
        } else {
            config
                .queues
                .iter()
                .map(|q| QueueSpec {
                    name: q.name.clone(),
                    weight: q.weight,
                    capacity_share: q.capacity_share,
                })
                .collect()
        };
        for queue in &queues {
            store.put_queue(queue)?;
        }

        let events = EventRecorder::new(store.clone(), clock.clone());
        let registry = Arc::new(GroupRegistry::new(
            store.clone(),
            clock,
            events,
            &config.controller,
            queues.iter().map(|q| q.name.clone()),
        )?);
        let evaluator = Arc::new(GangEvaluator::new(oracle.clone(), &config.oracle));
        let reservations = Arc::new(ReservationManager::new(
            registry.clone(),
            oracle,
            config.controller.commit_timeout(),
        ));
        let supervisor = Arc::new(TimeoutSupervisor::new(
            registry.clone(),
            reservations.clone(),
            config.retry.clone(),
        ));
        let controllers = queues
            .into_iter()
            .map(|spec| {
                Arc::new(QueueController::new(
                    spec,
                    store.clone(),
                    registry.clone(),
                    evaluator.clone(),
                    reservations.clone(),
                    &config,
                ))
            })
            .collect();

        Ok(Self {
            hierarchy: HierarchyResolver::new(registry.clone()),
            config,
            store,
            registry,
            reservations,
            supervisor,
            controllers,
            status_file: None,
        })
    }

    /// Write a status snapshot to `path` after every sweep.
    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }

    pub fn status_file(&self) -> Option<&Path> {
        self.status_file.as_deref()
    }

    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    pub fn reservations(&self) -> &Arc<ReservationManager> {
        &self.reservations
    }

    pub fn controllers(&self) -> &[Arc<QueueController>] {
        &self.controllers
    }

    pub fn controller(&self, queue: &str) -> Option<&Arc<QueueController>> {
        self.controllers.iter().find(|c| c.queue_name() == queue)
    }

    // ── Membership ────────────────────────────────────────────────

    pub async fn register_member(&self, spec: &GroupSpec, request: Request) -> SchedulerResult<Group> {
        self.registry.register_member(spec, request).await
    }

    /// Remove one member, returning any capacity it held.
    pub async fn remove_member(&self, group_id: &str, request_id: &str) -> SchedulerResult<Request> {
        let request = self.registry.remove_member(group_id, request_id).await?;
        if let Some(binding) = &request.binding {
            self.reservations.release_binding(binding).await;
        }
        Ok(request)
    }

    pub async fn cancel(&self, group_id: &str, reason: &str) -> SchedulerResult<Group> {
        self.registry.cancel(group_id, reason).await
    }

    /// The group's workload finished: release its capacity and delete it
    /// with its members.
    pub async fn complete_group(&self, group_id: &str) -> SchedulerResult<Vec<Request>> {
        let released = self.reservations.release_group(group_id).await?;
        let requests = self.registry.delete_group(group_id).await?;
        info!(group = %group_id, released, "group completed");
        Ok(requests)
    }

    // ── Queries ───────────────────────────────────────────────────

    pub fn get_group(&self, group_id: &str) -> SchedulerResult<Group> {
        self.registry.get_group(group_id)
    }

    pub fn list_groups(&self, filter: &GroupFilter) -> SchedulerResult<Vec<Group>> {
        self.registry.list_groups(filter)
    }

    pub fn list_pending_groups(&self, queue: &str) -> SchedulerResult<Vec<Group>> {
        self.registry.list_pending_groups(queue)
    }

    pub fn members(&self, group_id: &str) -> SchedulerResult<Vec<Request>> {
        self.registry.members(group_id)
    }

    pub fn is_parent_satisfied(&self, parent_id: &str) -> SchedulerResult<bool> {
        self.hierarchy.is_parent_satisfied(parent_id)
    }

    pub fn visible_status(&self, group_id: &str) -> SchedulerResult<GroupStatus> {
        self.hierarchy.visible_status(group_id)
    }

    pub fn status_snapshot(&self) -> SchedulerResult<StatusSnapshot> {
        self.hierarchy.snapshot()
    }

    // ── Events ────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<GangEvent> {
        self.registry.events().subscribe()
    }

    /// Persisted events with sequence numbers above `after`.
    pub fn events_since(&self, after: u64, limit: usize) -> SchedulerResult<Vec<GangEvent>> {
        Ok(self.store.list_events(after, limit)?)
    }

    // ── Loops ─────────────────────────────────────────────────────

    /// Replay persisted bindings into the oracle. Call once at startup,
    /// before [`spawn`](Self::spawn).
    pub async fn restore(&self) -> SchedulerResult<RestoreReport> {
        self.reservations.restore().await
    }

    /// One evaluation cycle on every queue, in configuration order.
    pub async fn evaluate_all(&self) -> SchedulerResult<Vec<(String, CycleReport)>> {
        let mut reports = Vec::with_capacity(self.controllers.len());
        for controller in &self.controllers {
            let report = controller.run_cycle().await?;
            reports.push((controller.queue_name().to_string(), report));
        }
        Ok(reports)
    }

    /// One supervisor sweep, then a status snapshot if configured.
    pub async fn sweep(&self) -> SchedulerResult<SweepReport> {
        let report = self.supervisor.sweep().await?;
        self.publish_status()?;
        Ok(report)
    }

    pub fn publish_status(&self) -> SchedulerResult<()> {
        if let Some(path) = &self.status_file {
            publish(path, &self.status_snapshot()?)?;
        }
        Ok(())
    }

    /// Start one task per queue controller plus the supervisor.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.controllers.len() + 1);
        for controller in &self.controllers {
            let controller = controller.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { controller.run(shutdown).await }));
        }

        let scheduler = self.clone();
        let interval = self.config.controller.sweep_interval();
        handles.push(tokio::spawn(async move {
            let publisher = scheduler.clone();
            scheduler
                .supervisor
                .run_with(interval, shutdown, move |_| {
                    if let Err(e) = publisher.publish_status() {
                        error!(error = %e, "status snapshot failed");
                    }
                })
                .await;
        }));

        info!(queues = self.controllers.len(), "gang scheduler started");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_core::{ManualClock, QueueConfig};
    use gangway_placement::{InMemoryOracle, InventoryNode};
    use gangway_state::ResourceVector;

    fn scheduler(config: GangwayConfig) -> GangScheduler {
        let oracle = Arc::new(InMemoryOracle::new([InventoryNode::new(
            "n1",
            ResourceVector::new(4000, 4 << 30, 4),
        )]));
        GangScheduler::new(
            config,
            StateStore::open_in_memory().unwrap(),
            oracle,
            Arc::new(ManualClock::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn default_queue_when_none_configured() {
        let s = scheduler(GangwayConfig::default());
        assert_eq!(s.controllers().len(), 1);
        assert!(s.controller(DEFAULT_QUEUE).is_some());
        assert!(s.store.get_queue(DEFAULT_QUEUE).unwrap().is_some());
    }

    #[tokio::test]
    async fn configured_queues_are_enforced() {
        let mut config = GangwayConfig::default();
        config.queues = vec![
            QueueConfig {
                name: "training".into(),
                weight: 2,
                capacity_share: 0.75,
            },
            QueueConfig {
                name: "batch".into(),
                weight: 1,
                capacity_share: 0.25,
            },
        ];
        let s = scheduler(config);
        assert_eq!(s.controllers().len(), 2);
        assert_eq!(s.store.get_queue("training").unwrap().unwrap().capacity_share, 0.75);

        let spec = GroupSpec::new("g1", "nope", 1);
        let err = s
            .register_member(&spec, Request::new("r1", "g1", ResourceVector::new(1, 1, 0)))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::SchedulerError::InvalidGroupSpec(_)));
    }

    #[tokio::test]
    async fn complete_group_returns_capacity() {
        let s = scheduler(GangwayConfig::default());
        let spec = GroupSpec::new("g1", DEFAULT_QUEUE, 2);
        for r in ["r1", "r2"] {
            s.register_member(&spec, Request::new(r, "g1", ResourceVector::new(1000, 1 << 30, 1)))
                .await
                .unwrap();
        }
        s.evaluate_all().await.unwrap();
        assert_eq!(s.get_group("g1").unwrap().phase, gangway_state::GroupPhase::Scheduled);

        let requests = s.complete_group("g1").await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(s.registry().find_group("g1").unwrap().is_none());

        // The freed node takes a new four-wide group.
        let spec = GroupSpec::new("g2", DEFAULT_QUEUE, 4);
        for r in ["a", "b", "c", "d"] {
            s.register_member(&spec, Request::new(r, "g2", ResourceVector::new(1000, 1 << 30, 1)))
                .await
                .unwrap();
        }
        s.evaluate_all().await.unwrap();
        assert_eq!(s.get_group("g2").unwrap().phase, gangway_state::GroupPhase::Scheduled);
    }

    #[tokio::test]
    async fn restart_restores_bindings_into_a_fresh_oracle() {
        use gangway_state::GroupPhase;

        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("gangway.redb");
        let unit = ResourceVector::new(1000, 1 << 30, 1);
        let inventory = || {
            Arc::new(InMemoryOracle::new([InventoryNode::new(
                "n1",
                ResourceVector::new(4000, 4 << 30, 4),
            )]))
        };

        {
            let s = GangScheduler::new(
                GangwayConfig::default(),
                StateStore::open(&db).unwrap(),
                inventory(),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap();
            let spec = GroupSpec::new("held", DEFAULT_QUEUE, 3);
            for r in ["r1", "r2", "r3"] {
                s.register_member(&spec, Request::new(r, "held", unit)).await.unwrap();
            }
            s.evaluate_all().await.unwrap();
            assert_eq!(s.get_group("held").unwrap().phase, GroupPhase::Scheduled);

            // Stopped while a second group was being evaluated.
            let spec = GroupSpec::new("mid", DEFAULT_QUEUE, 1);
            s.register_member(&spec, Request::new("m1", "mid", unit)).await.unwrap();
            s.registry()
                .transition("mid", GroupPhase::Queued, GroupPhase::Evaluating, None)
                .await
                .unwrap();
        }

        let oracle = inventory();
        let s = GangScheduler::new(
            GangwayConfig::default(),
            StateStore::open(&db).unwrap(),
            oracle.clone(),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let report = s.restore().await.unwrap();
        assert_eq!(
            report,
            RestoreReport {
                rebound: 3,
                lost: 0,
                requeued: 1
            }
        );
        assert_eq!(oracle.outstanding_reservations().await, 3);
        assert_eq!(s.get_group("mid").unwrap().phase, GroupPhase::Queued);

        // One unit left: the two-wide group waits, the one-wide group fits.
        let spec = GroupSpec::new("late", DEFAULT_QUEUE, 2);
        for r in ["a", "b"] {
            s.register_member(&spec, Request::new(r, "late", unit)).await.unwrap();
        }
        s.evaluate_all().await.unwrap();
        assert_eq!(s.get_group("late").unwrap().phase, GroupPhase::Queued);
        assert_eq!(s.get_group("mid").unwrap().phase, GroupPhase::Scheduled);

        // Restored tokens release cleanly.
        s.complete_group("held").await.unwrap();
        assert_eq!(oracle.outstanding_reservations().await, 1);
    }

    #[tokio::test]
    async fn sweep_writes_status_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let s = scheduler(GangwayConfig::default()).with_status_file(&path);
        let spec = GroupSpec::new("g1", DEFAULT_QUEUE, 2);
        s.register_member(&spec, Request::new("r1", "g1", ResourceVector::new(1, 1, 0)))
            .await
            .unwrap();

        s.sweep().await.unwrap();
        let snapshot = gangway_state::snapshot::read_snapshot(&path).unwrap();
        assert_eq!(snapshot.find("g1").unwrap().members, 1);
    }
}
