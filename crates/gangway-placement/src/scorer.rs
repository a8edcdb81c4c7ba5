//! Plan scoring.
//!
//! Feasible plans are ranked by:
//! - **Placed members** (more is better, so elastic groups grow eagerly)
//! - **Locality**: fewer distinct nodes touched
//! - **Balance**: lower spread of per-node utilization after the plan
//! - **Node list**: lexicographic, so equal plans rank deterministically

use std::cmp::Ordering;

use gangway_state::{NodeId, ResourceVector};

/// Fraction of a node in use, measured on its tightest dimension.
pub fn utilization(free: &ResourceVector, capacity: &ResourceVector) -> f64 {
    capacity.saturating_sub(free).dominant_share(capacity)
}

/// Population standard deviation of node utilizations.
///
/// `nodes` holds `(free, capacity)` per node after the plan is applied.
pub fn residual_imbalance(nodes: &[(ResourceVector, ResourceVector)]) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    let utils: Vec<f64> = nodes.iter().map(|(free, cap)| utilization(free, cap)).collect();
    let n = utils.len() as f64;
    let mean = utils.iter().sum::<f64>() / n;
    let variance = utils.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Ranking key for one candidate plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanScore {
    pub placed: usize,
    pub nodes_touched: usize,
    pub imbalance: f64,
    /// Sorted distinct node ids.
    pub nodes: Vec<NodeId>,
}

impl PlanScore {
    /// `Less` means `self` is the better plan.
    pub fn rank(&self, other: &PlanScore) -> Ordering {
        other
            .placed
            .cmp(&self.placed)
            .then(self.nodes_touched.cmp(&other.nodes_touched))
            .then(self.imbalance.total_cmp(&other.imbalance))
            .then_with(|| self.nodes.cmp(&other.nodes))
    }
}
