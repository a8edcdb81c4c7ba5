//! Group Registry: single source of truth for group membership and phase.
//!
//! Every mutation takes the registry's write lock and is committed to the
//! state store before it returns, so the next evaluation cycle always
//! observes it. Reads go straight to the store and never block on the lock.
//!
//! Phase changes are compare-and-set on the caller's expected phase: a
//! stale caller gets [`SchedulerError::InvalidTransition`] and re-reads.
//!
//! Membership may change while a group is `Evaluating`. Members that join
//! after the plan was made wait for the next cycle; a planned member that
//! leaves fails the confirm with [`SchedulerError::RequestNotFound`] and the
//! group goes back to the queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info};

use gangway_core::{Clock, ControllerConfig};
use gangway_state::*;

use crate::error::{SchedulerError, SchedulerResult};
use crate::events::EventRecorder;
use crate::hierarchy::check_acyclic;
use crate::queue::admission_order;

/// Selects groups by phase and/or queue.
#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub phase: Option<GroupPhase>,
    pub queue: Option<String>,
}

impl GroupFilter {
    pub fn phase(phase: GroupPhase) -> Self {
        Self {
            phase: Some(phase),
            queue: None,
        }
    }

    pub fn queue(queue: &str) -> Self {
        Self {
            phase: None,
            queue: Some(queue.to_string()),
        }
    }

    pub fn matches(&self, group: &Group) -> bool {
        self.phase.is_none_or(|p| group.phase == p)
            && self.queue.as_deref().is_none_or(|q| group.queue() == q)
    }
}

/// Event emitted for a phase change, if any.
fn event_for(from: GroupPhase, to: GroupPhase) -> Option<EventKind> {
    use GroupPhase::*;
    match (from, to) {
        (Pending, Queued) => Some(EventKind::GroupQueued),
        (_, Scheduled) => Some(EventKind::GroupScheduled),
        (_, TimedOut) => Some(EventKind::GroupTimedOut),
        (_, Failed) => Some(EventKind::GroupFailed),
        (TimedOut, Pending) => Some(EventKind::GroupRequeued),
        _ => None,
    }
}

pub struct GroupRegistry {
    store: StateStore,
    clock: Arc<dyn Clock>,
    events: EventRecorder,
    write_lock: Mutex<()>,
    next_arrival: AtomicU64,
    default_timeout_secs: u64,
    max_hierarchy_depth: u32,
    /// Accepted queue names. Empty accepts any queue.
    queues: HashSet<QueueName>,
}

impl GroupRegistry {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        events: EventRecorder,
        config: &ControllerConfig,
        queues: impl IntoIterator<Item = QueueName>,
    ) -> SchedulerResult<Self> {
        let last_arrival = store
            .list_groups()?
            .iter()
            .map(|g| g.arrival_seq)
            .max()
            .unwrap_or(0);
        Ok(Self {
            store,
            clock,
            events,
            write_lock: Mutex::new(()),
            next_arrival: AtomicU64::new(last_arrival + 1),
            default_timeout_secs: config.default_schedule_timeout_secs,
            max_hierarchy_depth: config.max_hierarchy_depth,
            queues: queues.into_iter().collect(),
        })
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn events(&self) -> &EventRecorder {
        &self.events
    }

    // ── Membership ────────────────────────────────────────────────

    /// Add `request` to the group declared by `spec`, creating the group
    /// on first sight of its id.
    ///
    /// Registering a request id that is already a member returns the
    /// group unchanged. The `minMember`-th member admits the group to its
    /// queue unless a retry backoff is still running.
    pub async fn register_member(&self, spec: &GroupSpec, mut request: Request) -> SchedulerResult<Group> {
        spec.validate().map_err(SchedulerError::InvalidGroupSpec)?;
        if request.id.is_empty() {
            return Err(SchedulerError::InvalidGroupSpec(format!(
                "group {}: request id must not be empty",
                spec.id
            )));
        }
        if request.group_id != spec.id {
            return Err(SchedulerError::InvalidGroupSpec(format!(
                "request {} declares group {}, not {}",
                request.id, request.group_id, spec.id
            )));
        }
        if !self.queues.is_empty() && !self.queues.contains(&spec.queue) {
            return Err(SchedulerError::InvalidGroupSpec(format!(
                "group {}: unknown queue {}",
                spec.id, spec.queue
            )));
        }

        let _guard = self.write_lock.lock().await;
        let now = self.now_ms();

        let mut group = match self.store.get_group(&spec.id)? {
            Some(existing) => {
                if existing.has_member(&request.id) {
                    debug!(group = %spec.id, request = %request.id, "member already registered");
                    return Ok(existing);
                }
                if matches!(
                    existing.phase,
                    GroupPhase::Scheduled | GroupPhase::Failed | GroupPhase::TimedOut
                ) {
                    return Err(SchedulerError::GroupClosed {
                        group: spec.id.clone(),
                        phase: existing.phase,
                    });
                }
                existing
            }
            None => {
                let parents: HashMap<GroupId, GroupId> = self
                    .store
                    .list_groups()?
                    .into_iter()
                    .filter_map(|g| g.spec.parent_group_id.clone().map(|p| (g.spec.id, p)))
                    .collect();
                check_acyclic(
                    &spec.id,
                    spec.parent_group_id.as_deref(),
                    |id| parents.get(id).cloned(),
                    self.max_hierarchy_depth,
                )
                .map_err(SchedulerError::InvalidGroupSpec)?;
                self.new_group(spec, now)
            }
        };

        if request.created_at_ms == 0 {
            request.created_at_ms = now;
        }
        request.binding = None;
        group.members.push(request.id.clone());

        let admitted = group.phase == GroupPhase::Pending
            && group.has_quorum()
            && group.not_before_ms.is_none_or(|t| now >= t);
        if admitted {
            group.phase = GroupPhase::Queued;
            group.last_transition_at_ms = now;
            group.not_before_ms = None;
        }

        self.store
            .put_group_with_requests(&group, std::slice::from_ref(&request))?;
        debug!(
            group = %group.id(),
            request = %request.id,
            members = group.members.len(),
            min_member = group.min_member(),
            "member registered"
        );

        if admitted {
            info!(group = %group.id(), queue = %group.queue(), "group admitted to queue");
            self.events.record(
                EventKind::GroupQueued,
                group.queue(),
                Some(group.id()),
                format!("{} of {} members registered", group.members.len(), group.min_member()),
            );
        }
        Ok(group)
    }

    fn new_group(&self, spec: &GroupSpec, now: u64) -> Group {
        let timeout_secs = spec.schedule_timeout_secs.unwrap_or(self.default_timeout_secs);
        info!(group = %spec.id, queue = %spec.queue, min_member = spec.min_member, "group created");
        Group {
            spec: spec.clone(),
            members: Vec::new(),
            phase: GroupPhase::Pending,
            reason: None,
            schedule_timeout_secs: timeout_secs,
            retry_count: 0,
            conflict_count: 0,
            arrival_seq: self.next_arrival.fetch_add(1, Ordering::SeqCst),
            created_at_ms: now,
            last_transition_at_ms: now,
            deadline_at_ms: now.saturating_add(timeout_secs.saturating_mul(1000)),
            not_before_ms: None,
        }
    }

    /// Remove one member and return its request.
    ///
    /// A queued group that drops below `minMember` goes back to `Pending`;
    /// a group whose last member leaves is deleted.
    pub async fn remove_member(&self, group_id: &str, request_id: &str) -> SchedulerResult<Request> {
        let _guard = self.write_lock.lock().await;
        let mut group = self.load(group_id)?;
        if group.phase == GroupPhase::Scheduled {
            return Err(SchedulerError::GroupClosed {
                group: group_id.to_string(),
                phase: group.phase,
            });
        }
        let not_found = || SchedulerError::RequestNotFound {
            group: group_id.to_string(),
            request: request_id.to_string(),
        };
        if !group.has_member(request_id) {
            return Err(not_found());
        }
        let request = self.store.get_request(group_id, request_id)?.ok_or_else(not_found)?;

        group.members.retain(|m| m != request_id);
        if group.members.is_empty() {
            self.store.delete_group(group_id)?;
            info!(group = %group_id, "last member left, group deleted");
            return Ok(request);
        }

        self.store.delete_request(group_id, request_id)?;
        if group.phase == GroupPhase::Queued && !group.has_quorum() {
            group.phase = GroupPhase::Pending;
            group.last_transition_at_ms = self.now_ms();
            info!(group = %group_id, members = group.members.len(), "group fell below min_member");
        }
        self.store.put_group(&group)?;
        debug!(group = %group_id, request = %request_id, "member removed");
        Ok(request)
    }

    /// Cancel a group that has not been scheduled yet.
    pub async fn cancel(&self, group_id: &str, reason: &str) -> SchedulerResult<Group> {
        let _guard = self.write_lock.lock().await;
        let mut group = self.load(group_id)?;
        if !group.phase.is_cancellable() {
            return Err(SchedulerError::GroupClosed {
                group: group_id.to_string(),
                phase: group.phase,
            });
        }
        let from = group.phase;
        group.phase = GroupPhase::Failed;
        group.reason = Some(format!("cancelled: {reason}"));
        group.last_transition_at_ms = self.now_ms();
        self.store.put_group(&group)?;
        self.emit_transition(&group, from);
        Ok(group)
    }

    /// Delete a group and its requests, returning the requests so their
    /// bindings can be released.
    pub async fn delete_group(&self, group_id: &str) -> SchedulerResult<Vec<Request>> {
        let _guard = self.write_lock.lock().await;
        let requests = self.store.list_requests_for_group(group_id)?;
        if !self.store.delete_group(group_id)? {
            return Err(SchedulerError::GroupNotFound(group_id.to_string()));
        }
        info!(group = %group_id, requests = requests.len(), "group deleted");
        Ok(requests)
    }

    // ── Phase changes ─────────────────────────────────────────────

    /// Move a group from `from` to `to`.
    pub async fn transition(
        &self,
        group_id: &str,
        from: GroupPhase,
        to: GroupPhase,
        reason: Option<String>,
    ) -> SchedulerResult<Group> {
        self.transition_with(group_id, from, to, reason, |_| {}).await
    }

    /// Like [`transition`](Self::transition), applying `update` to the
    /// group in the same write.
    pub async fn transition_with<F>(
        &self,
        group_id: &str,
        from: GroupPhase,
        to: GroupPhase,
        reason: Option<String>,
        update: F,
    ) -> SchedulerResult<Group>
    where
        F: FnOnce(&mut Group),
    {
        let _guard = self.write_lock.lock().await;
        let mut group = self.load(group_id)?;
        if group.phase != from || !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                group: group_id.to_string(),
                from: group.phase,
                to,
            });
        }
        group.phase = to;
        group.last_transition_at_ms = self.now_ms();
        if reason.is_some() {
            group.reason = reason;
        }
        update(&mut group);
        self.store.put_group(&group)?;
        self.emit_transition(&group, from);
        Ok(group)
    }

    /// End an evaluation attempt without scheduling.
    ///
    /// The group goes back to `Queued`, or on to `Pending` if members left
    /// while it was being evaluated.
    pub async fn return_to_queue(
        &self,
        group_id: &str,
        reason: String,
        conflict: bool,
    ) -> SchedulerResult<Group> {
        let _guard = self.write_lock.lock().await;
        let mut group = self.load(group_id)?;
        if group.phase != GroupPhase::Evaluating {
            return Err(SchedulerError::InvalidTransition {
                group: group_id.to_string(),
                from: group.phase,
                to: GroupPhase::Queued,
            });
        }
        group.phase = GroupPhase::Queued;
        if !group.has_quorum() {
            group.phase = GroupPhase::Pending;
        }
        group.reason = Some(reason);
        group.last_transition_at_ms = self.now_ms();
        if conflict {
            group.conflict_count += 1;
        }
        self.store.put_group(&group)?;
        debug!(
            group = %group_id,
            phase = %group.phase,
            reason = group.reason.as_deref().unwrap_or(""),
            "evaluation ended without scheduling"
        );
        Ok(group)
    }

    /// Persist every binding and the `Scheduled` phase in one write.
    ///
    /// This is the cancellation gate: the group must still be
    /// `Evaluating`, otherwise nothing is written.
    pub async fn record_bindings(
        &self,
        group_id: &str,
        bindings: &[(RequestId, Binding)],
    ) -> SchedulerResult<Group> {
        let _guard = self.write_lock.lock().await;
        let mut group = self.load(group_id)?;
        match group.phase {
            GroupPhase::Evaluating => {}
            GroupPhase::Failed => return Err(SchedulerError::Cancelled(group_id.to_string())),
            phase => {
                return Err(SchedulerError::InvalidTransition {
                    group: group_id.to_string(),
                    from: phase,
                    to: GroupPhase::Scheduled,
                });
            }
        }

        let mut requests = Vec::with_capacity(bindings.len());
        for (request_id, binding) in bindings {
            let not_found = || SchedulerError::RequestNotFound {
                group: group_id.to_string(),
                request: request_id.clone(),
            };
            if !group.has_member(request_id) {
                return Err(not_found());
            }
            let mut request = self
                .store
                .get_request(group_id, request_id)?
                .ok_or_else(not_found)?;
            request.binding = Some(binding.clone());
            requests.push(request);
        }

        group.phase = GroupPhase::Scheduled;
        group.reason = None;
        group.last_transition_at_ms = self.now_ms();
        self.store.put_group_with_requests(&group, &requests)?;

        let nodes: HashSet<&str> = bindings.iter().map(|(_, b)| b.node_id.as_str()).collect();
        info!(
            group = %group_id,
            bound = requests.len(),
            nodes = nodes.len(),
            "group scheduled"
        );
        self.events.record(
            EventKind::GroupScheduled,
            group.queue(),
            Some(group_id),
            format!("{} members bound across {} nodes", requests.len(), nodes.len()),
        );
        Ok(group)
    }

    /// Unbind every member in one write and return the old bindings.
    pub async fn clear_bindings(&self, group_id: &str) -> SchedulerResult<Vec<Binding>> {
        let _guard = self.write_lock.lock().await;
        let group = self.load(group_id)?;
        let mut changed = Vec::new();
        let mut cleared = Vec::new();
        for mut request in self.store.list_requests_for_group(group_id)? {
            if let Some(binding) = request.binding.take() {
                cleared.push(binding);
                changed.push(request);
            }
        }
        if !changed.is_empty() {
            self.store.put_group_with_requests(&group, &changed)?;
            info!(group = %group_id, released = cleared.len(), "bindings cleared");
        }
        Ok(cleared)
    }

    /// Rewrite bindings a scheduled group already holds, e.g. with the
    /// tokens of a restarted oracle. The phase is untouched.
    pub async fn rebind(&self, group_id: &str, bindings: &[(RequestId, Binding)]) -> SchedulerResult<()> {
        let _guard = self.write_lock.lock().await;
        let group = self.load(group_id)?;
        let mut requests = Vec::with_capacity(bindings.len());
        for (request_id, binding) in bindings {
            let mut request = self.store.get_request(group_id, request_id)?.ok_or_else(|| {
                SchedulerError::RequestNotFound {
                    group: group_id.to_string(),
                    request: request_id.clone(),
                }
            })?;
            request.binding = Some(binding.clone());
            requests.push(request);
        }
        if !requests.is_empty() {
            self.store.put_group_with_requests(&group, &requests)?;
        }
        Ok(())
    }

    fn emit_transition(&self, group: &Group, from: GroupPhase) {
        info!(
            group = %group.id(),
            queue = %group.queue(),
            from = %from,
            to = %group.phase,
            "group phase changed"
        );
        if let Some(kind) = event_for(from, group.phase) {
            let message = group
                .reason
                .clone()
                .unwrap_or_else(|| format!("{from} -> {}", group.phase));
            self.events.record(kind, group.queue(), Some(group.id()), message);
        }
    }

    // ── Queries ───────────────────────────────────────────────────

    fn load(&self, group_id: &str) -> SchedulerResult<Group> {
        self.store
            .get_group(group_id)?
            .ok_or_else(|| SchedulerError::GroupNotFound(group_id.to_string()))
    }

    pub fn get_group(&self, group_id: &str) -> SchedulerResult<Group> {
        self.load(group_id)
    }

    pub fn find_group(&self, group_id: &str) -> SchedulerResult<Option<Group>> {
        Ok(self.store.get_group(group_id)?)
    }

    /// A group's member requests.
    pub fn members(&self, group_id: &str) -> SchedulerResult<Vec<Request>> {
        Ok(self.store.list_requests_for_group(group_id)?)
    }

    pub fn bound_count(&self, group_id: &str) -> SchedulerResult<u32> {
        Ok(self
            .members(group_id)?
            .iter()
            .filter(|r| r.is_bound())
            .count() as u32)
    }

    /// Matching groups in arrival order.
    pub fn list_groups(&self, filter: &GroupFilter) -> SchedulerResult<Vec<Group>> {
        let mut groups: Vec<Group> = self
            .store
            .list_groups()?
            .into_iter()
            .filter(|g| filter.matches(g))
            .collect();
        groups.sort_by_key(|g| g.arrival_seq);
        Ok(groups)
    }

    /// `Queued` groups of `queue` in admission order.
    pub fn list_pending_groups(&self, queue: &str) -> SchedulerResult<Vec<Group>> {
        let mut groups = self.list_groups(&GroupFilter {
            phase: Some(GroupPhase::Queued),
            queue: Some(queue.to_string()),
        })?;
        groups.sort_by(admission_order);
        Ok(groups)
    }

    pub fn children_of(&self, parent_id: &str) -> SchedulerResult<Vec<Group>> {
        Ok(self
            .list_groups(&GroupFilter::default())?
            .into_iter()
            .filter(|g| g.spec.parent_group_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Capacity currently bound to scheduled groups of `queue`.
    pub fn queue_usage(&self, queue: &str) -> SchedulerResult<ResourceVector> {
        let mut total = ResourceVector::ZERO;
        for group in self.list_groups(&GroupFilter {
            phase: Some(GroupPhase::Scheduled),
            queue: Some(queue.to_string()),
        })? {
            total += self
                .members(group.id())?
                .iter()
                .filter(|r| r.is_bound())
                .map(|r| r.demand)
                .sum::<ResourceVector>();
        }
        Ok(total)
    }

    /// Whether any queue other than `queue` has groups waiting.
    pub fn has_waiting_outside(&self, queue: &str) -> SchedulerResult<bool> {
        Ok(self
            .list_groups(&GroupFilter::phase(GroupPhase::Queued))?
            .iter()
            .any(|g| g.queue() != queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_core::ManualClock;

    fn test_registry_with_queues(queues: &[&str]) -> (GroupRegistry, StateStore, ManualClock) {
        let store = StateStore::open_in_memory().unwrap();
        let clock = ManualClock::new(1_000);
        let events = EventRecorder::new(store.clone(), Arc::new(clock.clone()));
        let registry = GroupRegistry::new(
            store.clone(),
            Arc::new(clock.clone()),
            events,
            &ControllerConfig::default(),
            queues.iter().map(|q| q.to_string()),
        )
        .unwrap();
        (registry, store, clock)
    }

    fn test_registry() -> (GroupRegistry, StateStore, ManualClock) {
        test_registry_with_queues(&[])
    }

    fn req(group: &str, id: &str) -> Request {
        Request::new(id, group, ResourceVector::new(1000, 1 << 30, 1))
    }

    async fn register_n(registry: &GroupRegistry, spec: &GroupSpec, n: usize) -> Group {
        let mut last = None;
        for i in 1..=n {
            last = Some(registry.register_member(spec, req(&spec.id, &format!("r{i}"))).await.unwrap());
        }
        last.unwrap()
    }

    #[tokio::test]
    async fn group_waits_in_pending_until_min_member() {
        let (registry, store, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 3);

        let group = register_n(&registry, &spec, 2).await;
        assert_eq!(group.phase, GroupPhase::Pending);
        assert_eq!(group.deadline_at_ms, 1_000 + 300_000);

        let group = registry.register_member(&spec, req("g1", "r3")).await.unwrap();
        assert_eq!(group.phase, GroupPhase::Queued);

        let events = store.list_events(0, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::GroupQueued);
    }

    #[tokio::test]
    async fn registering_twice_is_a_no_op() {
        let (registry, _, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 2);

        let first = registry.register_member(&spec, req("g1", "r1")).await.unwrap();
        let again = registry.register_member(&spec, req("g1", "r1")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(again.members.len(), 1);
        assert_eq!(registry.members("g1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_spec_never_enters_the_registry() {
        let (registry, _, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 4).with_max_member(2);

        let err = registry.register_member(&spec, req("g1", "r1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidGroupSpec(_)));
        assert!(registry.find_group("g1").unwrap().is_none());
    }

    #[tokio::test]
    async fn request_must_name_its_group() {
        let (registry, _, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 1);
        let err = registry.register_member(&spec, req("other", "r1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidGroupSpec(_)));
    }

    #[tokio::test]
    async fn unknown_queue_is_rejected() {
        let (registry, _, _) = test_registry_with_queues(&["training"]);
        let spec = GroupSpec::new("g1", "batch", 1);
        let err = registry.register_member(&spec, req("g1", "r1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidGroupSpec(_)));
    }

    #[tokio::test]
    async fn cyclic_parent_is_rejected() {
        let (registry, _, _) = test_registry();
        // a declares b as its parent before b exists.
        let a = GroupSpec::new("a", "default", 1).with_parent("b");
        registry.register_member(&a, req("a", "r1")).await.unwrap();

        let b = GroupSpec::new("b", "default", 1).with_parent("a");
        let err = registry.register_member(&b, req("b", "r1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidGroupSpec(msg) if msg.contains("cycle")));
    }

    #[tokio::test]
    async fn closed_groups_reject_new_members() {
        let (registry, _, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 1);
        registry.register_member(&spec, req("g1", "r1")).await.unwrap();
        registry.cancel("g1", "owner gave up").await.unwrap();

        let err = registry.register_member(&spec, req("g1", "r2")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupClosed { phase: GroupPhase::Failed, .. }));
    }

    #[tokio::test]
    async fn removing_below_min_returns_to_pending() {
        let (registry, _, _) = test_registry();
        let spec = GroupSpec::new("g1", "default", 2);
        register_n(&registry, &spec, 2).await;

        let removed = registry.remove_member("g1", "r2").await.unwrap();
        assert_eq!(removed.id, "r2");
        let group = registry.get_group("g1").unwrap();
        assert_eq!(group.phase, GroupPhase::Pending);
        assert_eq!(group.members, vec!["r1".to_string()]);

        registry.remove_member("g1", "r1").await.unwrap();
        assert!(registry.find_group("g1").unwrap().is_none());
        assert!(registry.members("g1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_unknown_member() {
        let (registry, _, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 2), 1).await;
        let err = registry.remove_member("g1", "nope").await.unwrap_err();
        assert!(matches!(err, SchedulerError::RequestNotFound { .. }));
        let err = registry.remove_member("nope", "r1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::GroupNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_sets_reason_and_emits_failed() {
        let (registry, store, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 2), 2).await;

        let group = registry.cancel("g1", "job deleted").await.unwrap();
        assert_eq!(group.phase, GroupPhase::Failed);
        assert_eq!(group.reason.as_deref(), Some("cancelled: job deleted"));

        let kinds: Vec<_> = store.list_events(0, 10).unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::GroupQueued, EventKind::GroupFailed]);
    }

    #[tokio::test]
    async fn stale_transition_is_refused() {
        let (registry, _, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 1), 1).await;

        registry
            .transition("g1", GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap();
        let err = registry
            .transition("g1", GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidTransition { from: GroupPhase::Evaluating, .. }
        ));

        // Evaluating never drops straight back to Pending.
        let err = registry
            .transition("g1", GroupPhase::Evaluating, GroupPhase::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_groups_sorted_by_priority_then_age() {
        let (registry, _, clock) = test_registry();
        let low = GroupSpec::new("low", "default", 1).with_priority(1);
        let high = GroupSpec::new("high", "default", 1).with_priority(10);
        let old = GroupSpec::new("old", "default", 1).with_priority(1);

        registry.register_member(&old, req("old", "r1")).await.unwrap();
        clock.advance(std::time::Duration::from_millis(10));
        registry.register_member(&low, req("low", "r1")).await.unwrap();
        registry.register_member(&high, req("high", "r1")).await.unwrap();
        registry
            .register_member(&GroupSpec::new("elsewhere", "other", 1), req("elsewhere", "r1"))
            .await
            .unwrap();

        let ids: Vec<String> = registry
            .list_pending_groups("default")
            .unwrap()
            .into_iter()
            .map(|g| g.spec.id)
            .collect();
        assert_eq!(ids, vec!["high", "old", "low"]);
        assert!(registry.has_waiting_outside("default").unwrap());
    }

    #[tokio::test]
    async fn bindings_are_gated_on_evaluating() {
        let (registry, _, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 2), 2).await;
        let binding = |token| Binding {
            node_id: "n1".to_string(),
            token_id: token,
            bound_at_ms: 1_000,
        };
        let bindings = vec![("r1".to_string(), binding(1)), ("r2".to_string(), binding(2))];

        // Still Queued: refused.
        let err = registry.record_bindings("g1", &bindings).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { .. }));

        registry
            .transition("g1", GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap();
        let group = registry.record_bindings("g1", &bindings).await.unwrap();
        assert_eq!(group.phase, GroupPhase::Scheduled);
        assert_eq!(registry.bound_count("g1").unwrap(), 2);
        assert_eq!(registry.queue_usage("default").unwrap().accelerators, 2);

        let cleared = registry.clear_bindings("g1").await.unwrap();
        assert_eq!(cleared.len(), 2);
        assert_eq!(registry.bound_count("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_group_fails_the_gate() {
        let (registry, _, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 1), 1).await;
        registry
            .transition("g1", GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap();
        registry.cancel("g1", "owner").await.unwrap();

        let bindings = vec![(
            "r1".to_string(),
            Binding {
                node_id: "n1".to_string(),
                token_id: 1,
                bound_at_ms: 0,
            },
        )];
        let err = registry.record_bindings("g1", &bindings).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Cancelled(_)));
        assert_eq!(registry.bound_count("g1").unwrap(), 0);
    }

    #[tokio::test]
    async fn return_to_queue_counts_conflicts() {
        let (registry, _, _) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 2), 2).await;
        registry
            .transition("g1", GroupPhase::Queued, GroupPhase::Evaluating, None)
            .await
            .unwrap();

        let group = registry
            .return_to_queue("g1", "lost race on n1".to_string(), true)
            .await
            .unwrap();
        assert_eq!(group.phase, GroupPhase::Queued);
        assert_eq!(group.conflict_count, 1);
        assert_eq!(group.reason.as_deref(), Some("lost race on n1"));
    }

    #[tokio::test]
    async fn arrival_sequence_survives_restart() {
        let (registry, store, clock) = test_registry();
        register_n(&registry, &GroupSpec::new("g1", "default", 1), 1).await;
        drop(registry);

        let events = EventRecorder::new(store.clone(), Arc::new(clock.clone()));
        let reopened = GroupRegistry::new(
            store,
            Arc::new(clock),
            events,
            &ControllerConfig::default(),
            Vec::new(),
        )
        .unwrap();
        let g2 = reopened
            .register_member(&GroupSpec::new("g2", "default", 1), req("g2", "r1"))
            .await
            .unwrap();
        assert!(g2.arrival_seq > reopened.get_group("g1").unwrap().arrival_seq);
    }
}
