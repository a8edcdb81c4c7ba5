//! Admission Queue: per-queue ordering of groups awaiting evaluation.
//!
//! The queue holds no copy of its groups; it is an ordered view over the
//! registry, re-read on every pick so a newly arrived higher-priority
//! group is seen by the very next iteration.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use gangway_state::{Group, GroupId, QueueSpec};

use crate::error::SchedulerResult;
use crate::registry::GroupRegistry;

/// Priority descending, then creation time, then registry arrival order.
pub fn admission_order(a: &Group, b: &Group) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then(a.created_at_ms.cmp(&b.created_at_ms))
        .then(a.arrival_seq.cmp(&b.arrival_seq))
}

pub struct AdmissionQueue {
    spec: QueueSpec,
    registry: Arc<GroupRegistry>,
}

impl AdmissionQueue {
    pub fn new(spec: QueueSpec, registry: Arc<GroupRegistry>) -> Self {
        Self { spec, registry }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &QueueSpec {
        &self.spec
    }

    /// Every `Queued` group, head first.
    pub fn pending(&self) -> SchedulerResult<Vec<Group>> {
        self.registry.list_pending_groups(&self.spec.name)
    }

    pub fn depth(&self) -> SchedulerResult<usize> {
        Ok(self.pending()?.len())
    }

    /// The highest-ranked group not in `skip`.
    pub fn head_excluding(&self, skip: &HashSet<GroupId>) -> SchedulerResult<Option<Group>> {
        Ok(self
            .pending()?
            .into_iter()
            .find(|g| !skip.contains(g.id())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gangway_core::{ControllerConfig, ManualClock};
    use gangway_state::{GroupPhase, GroupSpec, Request, ResourceVector, StateStore};

    use crate::events::EventRecorder;

    fn group(id: &str, priority: i32, created_at_ms: u64, arrival_seq: u64) -> Group {
        Group {
            spec: GroupSpec::new(id, "q", 1).with_priority(priority),
            members: vec!["r1".into()],
            phase: GroupPhase::Queued,
            reason: None,
            schedule_timeout_secs: 300,
            retry_count: 0,
            conflict_count: 0,
            arrival_seq,
            created_at_ms,
            last_transition_at_ms: created_at_ms,
            deadline_at_ms: created_at_ms + 300_000,
            not_before_ms: None,
        }
    }

    #[test]
    fn priority_then_age_then_arrival() {
        let mut groups = vec![
            group("late-low", 1, 200, 4),
            group("early-low", 1, 100, 3),
            group("high", 9, 300, 5),
            group("same-time-second", 1, 100, 7),
        ];
        groups.sort_by(admission_order);
        let ids: Vec<&str> = groups.iter().map(|g| g.id()).collect();
        assert_eq!(ids, vec!["high", "early-low", "same-time-second", "late-low"]);
    }

    #[tokio::test]
    async fn head_skips_already_attempted() {
        let store = StateStore::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let events = EventRecorder::new(store.clone(), clock.clone());
        let registry = Arc::new(
            GroupRegistry::new(store, clock, events, &ControllerConfig::default(), Vec::new()).unwrap(),
        );
        for (id, prio) in [("a", 5), ("b", 3)] {
            let spec = GroupSpec::new(id, "training", 1).with_priority(prio);
            registry
                .register_member(&spec, Request::new("r1", id, ResourceVector::new(1, 1, 0)))
                .await
                .unwrap();
        }

        let queue = AdmissionQueue::new(QueueSpec::new("training"), registry);
        assert_eq!(queue.depth().unwrap(), 2);

        let mut skip = HashSet::new();
        let head = queue.head_excluding(&skip).unwrap().unwrap();
        assert_eq!(head.id(), "a");

        skip.insert("a".to_string());
        assert_eq!(queue.head_excluding(&skip).unwrap().unwrap().id(), "b");

        skip.insert("b".to_string());
        assert!(queue.head_excluding(&skip).unwrap().is_none());
    }
}
