//! Gang Evaluator: decides whether a whole group fits right now.
//!
//! # Algorithm
//!
//! ```text
//!   unbound members ──► one oracle query per (demand, constraints) class
//!                              │
//!                              ▼
//!            per-member candidate sets + node free capacity
//!                              │
//!        ┌─────────────────────┼──────────────────────┐
//!        ▼                     ▼                      ▼
//!   consolidate       first-fit decreasing    best-fit decreasing
//!        └──────── simulated per topology domain ─────┘
//!                              │
//!                              ▼
//!        best plan by (placed ↓, nodes ↑, imbalance ↑, node ids)
//! ```
//!
//! The evaluator never reserves anything; it only proposes a [`Plan`]
//! that the reservation manager commits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use gangway_core::OracleConfig;
use gangway_state::{
    Group, GroupId, NodeId, PlacementConstraints, Request, RequestId, ResourceVector,
};

use crate::oracle::{CandidateNode, CapacityOracle, OracleError};
use crate::scorer::{PlanScore, residual_imbalance, utilization};

/// Packing strategy used to build a candidate plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Heuristic {
    /// Fill the node already hosting the most members, then the roomiest.
    Consolidate,
    FirstFitDecreasing,
    BestFitDecreasing,
}

impl Heuristic {
    pub const ALL: [Heuristic; 3] = [
        Heuristic::Consolidate,
        Heuristic::FirstFitDecreasing,
        Heuristic::BestFitDecreasing,
    ];
}

/// One member assigned to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub demand: ResourceVector,
}

/// A feasible all-members assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub group_id: GroupId,
    /// In member registration order.
    pub placements: Vec<Placement>,
    pub heuristic: Heuristic,
    /// Shared topology label value, when the group declares a topology key.
    pub domain: Option<String>,
    pub score: PlanScore,
}

impl Plan {
    pub fn node_set(&self) -> BTreeSet<NodeId> {
        self.placements.iter().map(|p| p.node_id.clone()).collect()
    }

    pub fn total_demand(&self) -> ResourceVector {
        self.placements.iter().map(|p| p.demand).sum()
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }
}

/// Outcome of one evaluation. Running out of capacity is a normal result.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Feasible(Plan),
    InsufficientCapacity { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluateError {
    #[error("capacity oracle unavailable after {attempts} attempts: {last}")]
    OracleUnavailable { attempts: u32, last: String },
}

pub struct GangEvaluator {
    oracle: Arc<dyn CapacityOracle>,
    query_attempts: u32,
    query_backoff: Duration,
}

impl GangEvaluator {
    pub fn new(oracle: Arc<dyn CapacityOracle>, config: &OracleConfig) -> Self {
        Self {
            oracle,
            query_attempts: config.query_attempts.max(1),
            query_backoff: Duration::from_millis(config.query_backoff_ms),
        }
    }

    pub fn oracle(&self) -> &Arc<dyn CapacityOracle> {
        &self.oracle
    }

    /// Evaluate `group` against current capacity.
    ///
    /// `requests` are the group's stored member requests in any order;
    /// members are considered in the group's registration order.
    pub async fn evaluate(
        &self,
        group: &Group,
        requests: &[Request],
    ) -> Result<Evaluation, EvaluateError> {
        let by_id: HashMap<&str, &Request> =
            requests.iter().map(|r| (r.id.as_str(), r)).collect();
        let members: Vec<&Request> = group
            .members
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).copied())
            .collect();

        let bound = members.iter().filter(|r| r.is_bound()).count();
        let required = (group.min_member() as usize).saturating_sub(bound);
        let wanted = group.desired_members().saturating_sub(bound);
        let unbound: Vec<&Request> = members
            .iter()
            .filter(|r| !r.is_bound())
            .take(wanted)
            .copied()
            .collect();

        if unbound.len() < required {
            return Ok(Evaluation::InsufficientCapacity {
                reason: format!(
                    "only {} of {} required members registered",
                    unbound.len() + bound,
                    group.min_member()
                ),
            });
        }

        // ── Candidate discovery ───────────────────────────────────
        let mut classes: BTreeMap<(ResourceVector, PlacementConstraints), Vec<CandidateNode>> =
            BTreeMap::new();
        for req in &unbound {
            let key = (req.demand, req.constraints.clone());
            if !classes.contains_key(&key) {
                let nodes = self.query_with_retry(&req.demand, &req.constraints).await?;
                classes.insert(key, nodes);
            }
        }

        let mut universe: BTreeMap<NodeId, CandidateNode> = BTreeMap::new();
        for nodes in classes.values() {
            for node in nodes {
                universe
                    .entry(node.node_id.clone())
                    .or_insert_with(|| node.clone());
            }
        }

        let candidates: Vec<BTreeSet<NodeId>> = unbound
            .iter()
            .map(|req| {
                classes
                    .get(&(req.demand, req.constraints.clone()))
                    .map(|nodes| nodes.iter().map(|n| n.node_id.clone()).collect())
                    .unwrap_or_default()
            })
            .collect();

        let unplaceable: Vec<&str> = unbound
            .iter()
            .zip(&candidates)
            .filter(|(_, c)| c.is_empty())
            .map(|(r, _)| r.id.as_str())
            .collect();
        if unbound.len() - unplaceable.len() < required {
            let reason = format!(
                "no candidate node for members {} ({} of {} required members placeable)",
                unplaceable.join(", "),
                unbound.len() - unplaceable.len() + bound,
                group.min_member()
            );
            debug!(group = %group.id(), %reason, "group infeasible");
            return Ok(Evaluation::InsufficientCapacity { reason });
        }

        // ── Topology domains ──────────────────────────────────────
        let domains: Vec<(Option<String>, Vec<&CandidateNode>)> = match &group.spec.topology_key {
            None => vec![(None, universe.values().collect())],
            Some(key) => {
                let mut by_value: BTreeMap<String, Vec<&CandidateNode>> = BTreeMap::new();
                for node in universe.values() {
                    if let Some(value) = node.label(key) {
                        by_value.entry(value.to_string()).or_default().push(node);
                    }
                }
                by_value.into_iter().map(|(v, nodes)| (Some(v), nodes)).collect()
            }
        };

        // ── Plan search ───────────────────────────────────────────
        let mut best: Option<Plan> = None;
        let mut most_placed = 0;
        for (domain, nodes) in &domains {
            for heuristic in Heuristic::ALL {
                let sim = simulate(heuristic, &unbound, &candidates, nodes);
                most_placed = most_placed.max(sim.assigned.len());
                if sim.assigned.len() < required || sim.assigned.is_empty() {
                    continue;
                }

                let residual: Vec<(ResourceVector, ResourceVector)> = nodes
                    .iter()
                    .map(|n| (sim.free[&n.node_id], n.capacity))
                    .collect();
                let touched: BTreeSet<NodeId> =
                    sim.assigned.iter().map(|(_, node)| node.clone()).collect();
                let score = PlanScore {
                    placed: sim.assigned.len(),
                    nodes_touched: touched.len(),
                    imbalance: residual_imbalance(&residual),
                    nodes: touched.into_iter().collect(),
                };

                if best.as_ref().is_some_and(|b| !score.rank(&b.score).is_lt()) {
                    continue;
                }
                let placements = sim
                    .assigned
                    .iter()
                    .map(|(idx, node)| Placement {
                        request_id: unbound[*idx].id.clone(),
                        node_id: node.clone(),
                        demand: unbound[*idx].demand,
                    })
                    .collect();
                best = Some(Plan {
                    group_id: group.id().to_string(),
                    placements,
                    heuristic,
                    domain: domain.clone(),
                    score,
                });
            }
        }

        match best {
            Some(plan) => {
                debug!(
                    group = %group.id(),
                    placed = plan.len(),
                    nodes = plan.score.nodes_touched,
                    heuristic = ?plan.heuristic,
                    domain = ?plan.domain,
                    "feasible plan found"
                );
                Ok(Evaluation::Feasible(plan))
            }
            None if required == 0 && unbound.is_empty() => Ok(Evaluation::Feasible(Plan {
                group_id: group.id().to_string(),
                placements: Vec::new(),
                heuristic: Heuristic::Consolidate,
                domain: None,
                score: PlanScore {
                    placed: 0,
                    nodes_touched: 0,
                    imbalance: 0.0,
                    nodes: Vec::new(),
                },
            })),
            None => {
                let mut reason = format!(
                    "insufficient capacity: {} of {} required members placeable",
                    most_placed + bound,
                    group.min_member()
                );
                if let Some(key) = &group.spec.topology_key {
                    if domains.is_empty() {
                        reason = format!("no candidate node carries topology label {key}");
                    } else {
                        reason.push_str(&format!(" within a single {key} domain"));
                    }
                }
                debug!(group = %group.id(), %reason, "group infeasible");
                Ok(Evaluation::InsufficientCapacity { reason })
            }
        }
    }

    async fn query_with_retry(
        &self,
        demand: &ResourceVector,
        constraints: &PlacementConstraints,
    ) -> Result<Vec<CandidateNode>, EvaluateError> {
        let mut last = String::new();
        for attempt in 1..=self.query_attempts {
            match self.oracle.query(demand, constraints).await {
                Ok(nodes) => return Ok(nodes),
                Err(e) => {
                    warn!(attempt, max = self.query_attempts, error = %e, "capacity query failed");
                    last = match e {
                        OracleError::Unavailable(msg) => msg,
                        other => other.to_string(),
                    };
                    if attempt < self.query_attempts {
                        let factor = 1u32 << (attempt - 1).min(16);
                        tokio::time::sleep(self.query_backoff * factor).await;
                    }
                }
            }
        }
        Err(EvaluateError::OracleUnavailable {
            attempts: self.query_attempts,
            last,
        })
    }
}

// ── Simulation ────────────────────────────────────────────────────

struct Simulation {
    /// (member index, node), sorted by member index.
    assigned: Vec<(usize, NodeId)>,
    free: BTreeMap<NodeId, ResourceVector>,
}

/// Largest-first ordering key.
fn size_key(v: &ResourceVector) -> (u32, u64, u64) {
    (v.accelerators, v.cpu_millis, v.memory_bytes)
}

/// How many copies of `demand` fit into `free`.
fn fit_count(free: &ResourceVector, demand: &ResourceVector) -> u64 {
    let dims = [
        (free.cpu_millis, demand.cpu_millis),
        (free.memory_bytes, demand.memory_bytes),
        (u64::from(free.accelerators), u64::from(demand.accelerators)),
    ];
    dims.iter()
        .filter(|(_, d)| *d > 0)
        .map(|(f, d)| f / d)
        .min()
        .unwrap_or(u64::MAX)
}

fn simulate(
    heuristic: Heuristic,
    members: &[&Request],
    candidates: &[BTreeSet<NodeId>],
    nodes: &[&CandidateNode],
) -> Simulation {
    let capacity: BTreeMap<&str, ResourceVector> =
        nodes.iter().map(|n| (n.node_id.as_str(), n.capacity)).collect();
    let mut free: BTreeMap<NodeId, ResourceVector> =
        nodes.iter().map(|n| (n.node_id.clone(), n.free)).collect();
    let mut hosted: BTreeMap<NodeId, usize> = BTreeMap::new();

    let mut ffd_nodes: Vec<&CandidateNode> = nodes.to_vec();
    ffd_nodes.sort_by(|a, b| {
        size_key(&b.free)
            .cmp(&size_key(&a.free))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let mut order: Vec<usize> = (0..members.len()).collect();
    order.sort_by(|&a, &b| size_key(&members[b].demand).cmp(&size_key(&members[a].demand)));

    let mut assigned = Vec::new();
    for idx in order {
        let demand = members[idx].demand;
        let choice = {
            let fits = |id: &NodeId| {
                candidates[idx].contains(id) && free.get(id).is_some_and(|f| demand.fits_within(f))
            };
            match heuristic {
                Heuristic::FirstFitDecreasing => ffd_nodes
                    .iter()
                    .map(|n| &n.node_id)
                    .find(|id| fits(*id))
                    .cloned(),
                Heuristic::BestFitDecreasing => {
                    let mut best: Option<(&NodeId, f64)> = None;
                    for (id, f) in free.iter().filter(|(id, _)| fits(*id)) {
                        let cap = capacity.get(id.as_str()).copied().unwrap_or_default();
                        let after = utilization(&f.saturating_sub(&demand), &cap);
                        if best.is_none_or(|(_, u)| after > u) {
                            best = Some((id, after));
                        }
                    }
                    best.map(|(id, _)| id.clone())
                }
                Heuristic::Consolidate => {
                    let mut best: Option<(&NodeId, (usize, u64))> = None;
                    for (id, f) in free.iter().filter(|(id, _)| fits(*id)) {
                        let key = (hosted.get(id).copied().unwrap_or(0), fit_count(f, &demand));
                        if best.is_none_or(|(_, k)| key > k) {
                            best = Some((id, key));
                        }
                    }
                    best.map(|(id, _)| id.clone())
                }
            }
        };

        if let Some(node) = choice {
            if let Some(f) = free.get_mut(&node) {
                *f = f.saturating_sub(&demand);
            }
            *hosted.entry(node.clone()).or_default() += 1;
            assigned.push((idx, node));
        }
    }

    assigned.sort_by_key(|(idx, _)| *idx);
    Simulation { assigned, free }
}
