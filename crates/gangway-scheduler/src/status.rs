//! Read-only status views.

use std::path::Path;

use gangway_state::snapshot::write_snapshot;
use gangway_state::{Group, GroupStatus, StatusSnapshot};

use crate::error::SchedulerResult;

pub fn group_status(group: &Group, bound: u32, now_ms: u64, gated_by_hierarchy: bool) -> GroupStatus {
    GroupStatus {
        id: group.id().to_string(),
        queue: group.queue().to_string(),
        phase: group.phase,
        priority: group.priority(),
        min_member: group.min_member(),
        max_member: group.spec.max_member,
        members: group.members.len() as u32,
        bound,
        time_in_phase_ms: now_ms.saturating_sub(group.last_transition_at_ms),
        retry_count: group.retry_count,
        reason: group.reason.clone(),
        parent: group.spec.parent_group_id.clone(),
        gated_by_hierarchy,
    }
}

/// Persist `snapshot` for `gangctl`.
pub fn publish(path: &Path, snapshot: &StatusSnapshot) -> SchedulerResult<()> {
    write_snapshot(path, snapshot)?;
    Ok(())
}
