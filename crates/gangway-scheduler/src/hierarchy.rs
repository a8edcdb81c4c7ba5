//! Hierarchy Resolver: parent/child group composition.
//!
//! A parent is satisfied only when every declared child is `Scheduled`.
//! The resolver is read-only: children are scheduled independently and
//! never wait on their siblings.

use std::collections::HashMap;
use std::sync::Arc;

use gangway_state::{Group, GroupId, GroupPhase, GroupStatus, StatusSnapshot};

use crate::error::SchedulerResult;
use crate::registry::GroupRegistry;
use crate::status::group_status;

/// Reject a new group whose parent chain would loop back to it.
///
/// `parent_of` looks up the declared parent of an existing group. The
/// walk stops at a missing group or after `max_depth` hops.
pub fn check_acyclic<F>(group_id: &str, parent: Option<&str>, parent_of: F, max_depth: u32) -> Result<(), String>
where
    F: Fn(&str) -> Option<GroupId>,
{
    let mut current = parent.map(str::to_string);
    let mut depth = 0;
    while let Some(ancestor) = current {
        if ancestor == group_id {
            return Err(format!("group {group_id}: parent chain forms a cycle"));
        }
        depth += 1;
        if depth > max_depth {
            return Err(format!(
                "group {group_id}: hierarchy deeper than {max_depth} levels"
            ));
        }
        current = parent_of(&ancestor);
    }
    Ok(())
}

/// True iff `children` is non-empty and all of them are `Scheduled`.
pub fn all_scheduled<'a>(children: impl IntoIterator<Item = &'a Group>) -> bool {
    let mut any = false;
    for child in children {
        if child.phase != GroupPhase::Scheduled {
            return false;
        }
        any = true;
    }
    any
}

pub struct HierarchyResolver {
    registry: Arc<GroupRegistry>,
}

impl HierarchyResolver {
    pub fn new(registry: Arc<GroupRegistry>) -> Self {
        Self { registry }
    }

    pub fn is_parent_satisfied(&self, parent_id: &str) -> SchedulerResult<bool> {
        let children = self.registry.children_of(parent_id)?;
        Ok(all_scheduled(&children))
    }

    /// Application-visible status of one group.
    pub fn visible_status(&self, group_id: &str) -> SchedulerResult<GroupStatus> {
        let group = self.registry.get_group(group_id)?;
        let bound = self.registry.bound_count(group_id)?;
        let gated = match &group.spec.parent_group_id {
            Some(parent) if group.phase == GroupPhase::Scheduled => !self.is_parent_satisfied(parent)?,
            _ => false,
        };
        Ok(group_status(&group, bound, self.registry.now_ms(), gated))
    }

    /// Status of every group, reading the registry once.
    pub fn snapshot(&self) -> SchedulerResult<StatusSnapshot> {
        let now = self.registry.now_ms();
        let groups = self.registry.list_groups(&Default::default())?;

        let mut children: HashMap<&str, Vec<&Group>> = HashMap::new();
        for group in &groups {
            if let Some(parent) = &group.spec.parent_group_id {
                children.entry(parent.as_str()).or_default().push(group);
            }
        }

        let mut statuses = Vec::with_capacity(groups.len());
        for group in &groups {
            let gated = match &group.spec.parent_group_id {
                Some(parent) if group.phase == GroupPhase::Scheduled => children
                    .get(parent.as_str())
                    .is_none_or(|siblings| !all_scheduled(siblings.iter().copied())),
                _ => false,
            };
            let bound = self.registry.bound_count(group.id())?;
            statuses.push(group_status(group, bound, now, gated));
        }

        Ok(StatusSnapshot {
            generated_at_ms: now,
            groups: statuses,
        })
    }
}
