//! In-memory Capacity Oracle over a static node inventory.
//!
//! Backs the daemon when no external oracle is configured, and every
//! test. Reservations are tracked per token so releases are exact.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use gangway_state::{NodeId, PlacementConstraints, ResourceVector};

use crate::oracle::{CandidateNode, CapacityOracle, OracleError, ReservationToken};

/// One node's static description.
#[derive(Debug, Clone, PartialEq)]
pub struct InventoryNode {
    pub id: NodeId,
    pub capacity: ResourceVector,
    pub labels: BTreeMap<String, String>,
    pub accelerator_type: Option<String>,
}

impl InventoryNode {
    pub fn new(id: &str, capacity: ResourceVector) -> Self {
        Self {
            id: id.to_string(),
            capacity,
            labels: BTreeMap::new(),
            accelerator_type: None,
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_accelerator_type(mut self, accelerator_type: &str) -> Self {
        self.accelerator_type = Some(accelerator_type.to_string());
        self
    }

    /// Whether this node satisfies the member's hard constraints.
    pub fn matches(&self, constraints: &PlacementConstraints) -> bool {
        if let Some(wanted) = &constraints.accelerator_type
            && self.accelerator_type.as_ref() != Some(wanted)
        {
            return false;
        }
        constraints
            .required_labels
            .iter()
            .all(|(k, v)| self.labels.get(k) == Some(v))
    }
}

#[derive(Debug)]
struct NodeState {
    node: InventoryNode,
    allocated: ResourceVector,
    schedulable: bool,
}

impl NodeState {
    fn free(&self) -> ResourceVector {
        self.node.capacity.saturating_sub(&self.allocated)
    }
}

#[derive(Debug, Default)]
struct Inner {
    nodes: BTreeMap<NodeId, NodeState>,
    tokens: HashMap<u64, (NodeId, ResourceVector)>,
    next_token: u64,
    unavailable: bool,
}

/// Capacity oracle answering from an in-process node table.
#[derive(Debug, Default)]
pub struct InMemoryOracle {
    inner: RwLock<Inner>,
}

impl InMemoryOracle {
    pub fn new(nodes: impl IntoIterator<Item = InventoryNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .map(|node| {
                (
                    node.id.clone(),
                    NodeState {
                        node,
                        allocated: ResourceVector::ZERO,
                        schedulable: true,
                    },
                )
            })
            .collect();
        Self {
            inner: RwLock::new(Inner {
                nodes,
                next_token: 1,
                ..Inner::default()
            }),
        }
    }

    pub async fn add_node(&self, node: InventoryNode) {
        let mut inner = self.inner.write().await;
        debug!(node = %node.id, capacity = %node.capacity, "node added to inventory");
        inner.nodes.insert(
            node.id.clone(),
            NodeState {
                node,
                allocated: ResourceVector::ZERO,
                schedulable: true,
            },
        );
    }

    /// Simulate losing (or regaining) the oracle backend.
    ///
    /// While unavailable, queries and reservations fail; releases still
    /// succeed so rollbacks never leak.
    pub async fn set_available(&self, available: bool) {
        self.inner.write().await.unavailable = !available;
    }

    /// Cordon or uncordon a node. Cordoned nodes are never returned by
    /// `query` and reject reservations.
    pub async fn set_schedulable(&self, node_id: &str, schedulable: bool) {
        if let Some(state) = self.inner.write().await.nodes.get_mut(node_id) {
            state.schedulable = schedulable;
        }
    }

    pub async fn free(&self, node_id: &str) -> Option<ResourceVector> {
        self.inner.read().await.nodes.get(node_id).map(NodeState::free)
    }

    pub async fn total_allocated(&self) -> ResourceVector {
        self.inner.read().await.nodes.values().map(|s| s.allocated).sum()
    }

    pub async fn outstanding_reservations(&self) -> usize {
        self.inner.read().await.tokens.len()
    }
}

#[async_trait]
impl CapacityOracle for InMemoryOracle {
    async fn query(
        &self,
        demand: &ResourceVector,
        constraints: &PlacementConstraints,
    ) -> Result<Vec<CandidateNode>, OracleError> {
        let inner = self.inner.read().await;
        if inner.unavailable {
            return Err(OracleError::Unavailable("inventory offline".to_string()));
        }
        Ok(inner
            .nodes
            .values()
            .filter(|s| s.schedulable && s.node.matches(constraints))
            .filter(|s| demand.fits_within(&s.free()))
            .map(|s| CandidateNode {
                node_id: s.node.id.clone(),
                free: s.free(),
                capacity: s.node.capacity,
                labels: s.node.labels.clone(),
                accelerator_type: s.node.accelerator_type.clone(),
            })
            .collect())
    }

    async fn reserve(
        &self,
        node_id: &str,
        demand: &ResourceVector,
    ) -> Result<ReservationToken, OracleError> {
        let mut inner = self.inner.write().await;
        if inner.unavailable {
            return Err(OracleError::Unavailable("inventory offline".to_string()));
        }
        let rejected = |reason: &str| OracleError::Rejected {
            node: node_id.to_string(),
            reason: reason.to_string(),
        };
        let state = inner
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| rejected("unknown node"))?;
        if !state.schedulable {
            return Err(rejected("node is not schedulable"));
        }
        if !demand.fits_within(&state.free()) {
            return Err(rejected(&format!(
                "requested {demand}, free {}",
                state.free()
            )));
        }
        state.allocated += *demand;

        let id = inner.next_token;
        inner.next_token += 1;
        inner.tokens.insert(id, (node_id.to_string(), *demand));
        debug!(node = node_id, token = id, demand = %demand, "capacity reserved");
        Ok(ReservationToken {
            id,
            node_id: node_id.to_string(),
        })
    }

    async fn release(&self, token: &ReservationToken) -> Result<(), OracleError> {
        let mut inner = self.inner.write().await;
        let (node_id, demand) = inner
            .tokens
            .remove(&token.id)
            .ok_or(OracleError::UnknownToken(token.id))?;
        match inner.nodes.get_mut(&node_id) {
            Some(state) => state.allocated = state.allocated.saturating_sub(&demand),
            None => warn!(node = %node_id, token = token.id, "released token for a removed node"),
        }
        debug!(node = %node_id, token = token.id, "capacity released");
        Ok(())
    }

    async fn cluster_capacity(&self) -> Result<ResourceVector, OracleError> {
        let inner = self.inner.read().await;
        if inner.unavailable {
            return Err(OracleError::Unavailable("inventory offline".to_string()));
        }
        Ok(inner
            .nodes
            .values()
            .filter(|s| s.schedulable)
            .map(|s| s.node.capacity)
            .sum())
    }
}
