//! Domain types for the gangway state store.
//!
//! These types represent the persisted state of gang groups, their member
//! requests, queues, events, and per-queue leases. All types are
//! serializable to/from JSON for storage in redb tables.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unique identifier for a gang group.
pub type GroupId = String;

/// Unique identifier for a member request (one pod/task).
pub type RequestId = String;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Name of a capacity-sharing queue.
pub type QueueName = String;

// ── Resources ─────────────────────────────────────────────────────

/// A multi-dimensional resource amount.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct ResourceVector {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_bytes: u64,
    #[serde(default)]
    pub accelerators: u32,
}

impl ResourceVector {
    pub const ZERO: ResourceVector = ResourceVector {
        cpu_millis: 0,
        memory_bytes: 0,
        accelerators: 0,
    };

    pub fn new(cpu_millis: u64, memory_bytes: u64, accelerators: u32) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            accelerators,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// True if every dimension of `self` is within `available`.
    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.cpu_millis <= available.cpu_millis
            && self.memory_bytes <= available.memory_bytes
            && self.accelerators <= available.accelerators
    }

    pub fn saturating_add(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            accelerators: self.accelerators.saturating_add(other.accelerators),
        }
    }

    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        ResourceVector {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            accelerators: self.accelerators.saturating_sub(other.accelerators),
        }
    }

    /// Largest fraction of `capacity` consumed by `self` across dimensions.
    ///
    /// A dimension with zero capacity counts as fully consumed when
    /// `self` asks for any of it, and is ignored otherwise.
    pub fn dominant_share(&self, capacity: &ResourceVector) -> f64 {
        let dims = [
            (self.cpu_millis as f64, capacity.cpu_millis as f64),
            (self.memory_bytes as f64, capacity.memory_bytes as f64),
            (self.accelerators as f64, capacity.accelerators as f64),
        ];
        dims.iter()
            .map(|&(used, cap)| {
                if cap > 0.0 {
                    used / cap
                } else if used > 0.0 {
                    1.0
                } else {
                    0.0
                }
            })
            .fold(0.0, f64::max)
    }
}

impl Add for ResourceVector {
    type Output = ResourceVector;

    fn add(self, rhs: ResourceVector) -> ResourceVector {
        self.saturating_add(&rhs)
    }
}

impl AddAssign for ResourceVector {
    fn add_assign(&mut self, rhs: ResourceVector) {
        *self = self.saturating_add(&rhs);
    }
}

impl Sum for ResourceVector {
    fn sum<I: Iterator<Item = ResourceVector>>(iter: I) -> Self {
        iter.fold(ResourceVector::ZERO, Add::add)
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={}m mem={}B acc={}",
            self.cpu_millis, self.memory_bytes, self.accelerators
        )
    }
}

/// Per-member placement constraints.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlacementConstraints {
    /// Accelerator model the member must run on (e.g. "a100").
    #[serde(default)]
    pub accelerator_type: Option<String>,
    /// Node labels that must all match.
    #[serde(default)]
    pub required_labels: BTreeMap<String, String>,
}

// ── Group ─────────────────────────────────────────────────────────

/// Declarative description of a gang group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupSpec {
    pub id: GroupId,
    /// Minimum members that must be placed together.
    pub min_member: u32,
    /// Elastic upper bound.
    #[serde(default)]
    pub max_member: Option<u32>,
    pub queue: QueueName,
    /// Higher is more important.
    #[serde(default)]
    pub priority: i32,
    /// `None` uses the controller default.
    #[serde(default)]
    pub schedule_timeout_secs: Option<u64>,
    #[serde(default)]
    pub parent_group_id: Option<GroupId>,
    /// Node label whose value every placed member must share.
    #[serde(default)]
    pub topology_key: Option<String>,
}

impl GroupSpec {
    pub fn new(id: &str, queue: &str, min_member: u32) -> Self {
        Self {
            id: id.to_string(),
            min_member,
            max_member: None,
            queue: queue.to_string(),
            priority: 0,
            schedule_timeout_secs: None,
            parent_group_id: None,
            topology_key: None,
        }
    }

    pub fn with_max_member(mut self, max: u32) -> Self {
        self.max_member = Some(max);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.schedule_timeout_secs = Some(secs);
        self
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent_group_id = Some(parent.to_string());
        self
    }

    pub fn with_topology_key(mut self, key: &str) -> Self {
        self.topology_key = Some(key.to_string());
        self
    }

    pub fn is_elastic(&self) -> bool {
        self.max_member.is_some_and(|max| max > self.min_member)
    }

    /// Check the declaration on its own (hierarchy is checked by the registry).
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("group id must not be empty".to_string());
        }
        if self.queue.is_empty() {
            return Err(format!("group {}: queue must not be empty", self.id));
        }
        if self.min_member == 0 {
            return Err(format!("group {}: min_member must be positive", self.id));
        }
        if let Some(max) = self.max_member
            && max < self.min_member
        {
            return Err(format!(
                "group {}: max_member ({max}) is below min_member ({})",
                self.id, self.min_member
            ));
        }
        if self.schedule_timeout_secs == Some(0) {
            return Err(format!(
                "group {}: schedule_timeout_secs must be positive",
                self.id
            ));
        }
        if self.parent_group_id.as_deref() == Some(self.id.as_str()) {
            return Err(format!("group {} cannot be its own parent", self.id));
        }
        Ok(())
    }
}

/// Lifecycle phase of a gang group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPhase {
    /// Waiting for members, or for a retry backoff to elapse.
    Pending,
    /// Waiting in its queue for evaluation.
    Queued,
    /// The evaluator is working on it.
    Evaluating,
    /// Every required member is bound.
    Scheduled,
    /// The schedule timeout expired.
    TimedOut,
    /// Cancelled or unrecoverable.
    Failed,
}

impl GroupPhase {
    pub const ALL: [GroupPhase; 6] = [
        GroupPhase::Pending,
        GroupPhase::Queued,
        GroupPhase::Evaluating,
        GroupPhase::Scheduled,
        GroupPhase::TimedOut,
        GroupPhase::Failed,
    ];

    /// The phase state machine.
    pub fn can_transition_to(self, next: GroupPhase) -> bool {
        use GroupPhase::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Failed)
                | (Queued, Evaluating)
                | (Queued, Pending)
                | (Queued, TimedOut)
                | (Queued, Failed)
                | (Evaluating, Queued)
                | (Evaluating, Scheduled)
                | (Evaluating, TimedOut)
                | (Evaluating, Failed)
                | (TimedOut, Pending)
                | (TimedOut, Failed)
        )
    }

    /// Phases the timeout supervisor watches.
    pub fn is_awaiting_capacity(self) -> bool {
        matches!(self, GroupPhase::Queued | GroupPhase::Evaluating)
    }

    /// Phases in which a group can still be cancelled.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            GroupPhase::Pending | GroupPhase::Queued | GroupPhase::Evaluating | GroupPhase::TimedOut
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GroupPhase::Pending => "Pending",
            GroupPhase::Queued => "Queued",
            GroupPhase::Evaluating => "Evaluating",
            GroupPhase::Scheduled => "Scheduled",
            GroupPhase::TimedOut => "TimedOut",
            GroupPhase::Failed => "Failed",
        }
    }
}

impl fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupPhase::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown phase: {s}"))
    }
}

/// Runtime state of a gang group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub spec: GroupSpec,
    /// Member request ids in registration order.
    pub members: Vec<RequestId>,
    pub phase: GroupPhase,
    /// Human-readable reason for the current phase or last capacity miss.
    pub reason: Option<String>,
    /// Resolved from the spec or the controller default.
    pub schedule_timeout_secs: u64,
    pub retry_count: u32,
    pub conflict_count: u32,
    /// Registry-wide arrival order, used to break priority ties.
    pub arrival_seq: u64,
    pub created_at_ms: u64,
    pub last_transition_at_ms: u64,
    /// Time after which a queued group times out.
    pub deadline_at_ms: u64,
    /// Retry backoff gate: not re-queued before this instant.
    pub not_before_ms: Option<u64>,
}

impl Group {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn queue(&self) -> &str {
        &self.spec.queue
    }

    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    pub fn min_member(&self) -> u32 {
        self.spec.min_member
    }

    pub fn has_member(&self, request_id: &str) -> bool {
        self.members.iter().any(|m| m == request_id)
    }

    /// Enough members registered to be worth evaluating.
    pub fn has_quorum(&self) -> bool {
        self.members.len() as u64 >= u64::from(self.spec.min_member)
    }

    /// How many members a plan should try to place.
    pub fn desired_members(&self) -> usize {
        match self.spec.max_member {
            Some(max) => self.members.len().min(max as usize),
            None => self.members.len(),
        }
    }

    pub fn table_key(&self) -> String {
        self.spec.id.clone()
    }
}

// ── Request ───────────────────────────────────────────────────────

/// Where a member landed and the oracle token backing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Binding {
    pub node_id: NodeId,
    pub token_id: u64,
    pub bound_at_ms: u64,
}

/// A single schedulable member of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub group_id: GroupId,
    pub demand: ResourceVector,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    #[serde(default)]
    pub binding: Option<Binding>,
    #[serde(default)]
    pub created_at_ms: u64,
}

impl Request {
    pub fn new(id: &str, group_id: &str, demand: ResourceVector) -> Self {
        Self {
            id: id.to_string(),
            group_id: group_id.to_string(),
            demand,
            constraints: PlacementConstraints::default(),
            binding: None,
            created_at_ms: 0,
        }
    }

    pub fn with_constraints(mut self, constraints: PlacementConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Build the composite key for the requests table.
    pub fn table_key(&self) -> String {
        request_key(&self.group_id, &self.id)
    }
}

/// `{len(group_id)}:{group_id}:{request_id}`. The length prefix keeps
/// keys unambiguous when ids themselves contain `:`.
pub fn request_key(group_id: &str, request_id: &str) -> String {
    format!("{}{request_id}", request_prefix(group_id))
}

/// Key prefix shared by every request of `group_id`, and by no other group.
pub fn request_prefix(group_id: &str) -> String {
    format!("{}:{group_id}:", group_id.len())
}

// ── Queue ─────────────────────────────────────────────────────────

/// A named capacity-sharing domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSpec {
    pub name: QueueName,
    pub weight: u32,
    /// Soft quota as a fraction of cluster capacity.
    pub capacity_share: f64,
}

impl QueueSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            weight: 1,
            capacity_share: 1.0,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    GroupQueued,
    GroupScheduled,
    GroupTimedOut,
    GroupFailed,
    GroupRequeued,
    ConflictBudgetExceeded,
    QueueDegraded,
    QueueRecovered,
}

/// A user-visible event, persisted for the telemetry pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GangEvent {
    /// Assigned by the store on append.
    pub seq: u64,
    pub at_ms: u64,
    pub kind: EventKind,
    pub queue: QueueName,
    pub group_id: Option<GroupId>,
    pub message: String,
}

// ── Leases ────────────────────────────────────────────────────────

/// Which replica currently drives a queue's evaluation loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseRecord {
    pub queue: QueueName,
    pub holder: String,
    pub expires_at_ms: u64,
}

// ── Status ────────────────────────────────────────────────────────

/// Read-only view of one group for the status surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupStatus {
    pub id: GroupId,
    pub queue: QueueName,
    pub phase: GroupPhase,
    pub priority: i32,
    pub min_member: u32,
    pub max_member: Option<u32>,
    pub members: u32,
    pub bound: u32,
    pub time_in_phase_ms: u64,
    pub retry_count: u32,
    pub reason: Option<String>,
    pub parent: Option<GroupId>,
    /// Scheduled, but siblings under the same parent are not yet.
    pub gated_by_hierarchy: bool,
}

/// Point-in-time status of every group, written by the daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub generated_at_ms: u64,
    pub groups: Vec<GroupStatus>,
}

impl StatusSnapshot {
    pub fn find(&self, group_id: &str) -> Option<&GroupStatus> {
        self.groups.iter().find(|g| g.id == group_id)
    }
}
