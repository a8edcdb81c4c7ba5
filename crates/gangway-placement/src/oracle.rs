//! Capacity Oracle interface.
//!
//! The oracle is the external authority on node capacity. Gangway only
//! talks to it through [`CapacityOracle`]: candidate discovery for one
//! member shape, and per-node reserve/release used by the two-phase
//! commit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use gangway_state::{NodeId, PlacementConstraints, ResourceVector};

/// A node able to host one member of the queried shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateNode {
    pub node_id: NodeId,
    /// Unreserved capacity at query time.
    pub free: ResourceVector,
    pub capacity: ResourceVector,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub accelerator_type: Option<String>,
}

impl CandidateNode {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Handle for a single per-node reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: u64,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OracleError {
    #[error("capacity oracle unavailable: {0}")]
    Unavailable(String),

    #[error("node {node} rejected reservation: {reason}")]
    Rejected { node: NodeId, reason: String },

    #[error("unknown reservation token: {0}")]
    UnknownToken(u64),
}

#[async_trait]
pub trait CapacityOracle: Send + Sync {
    /// Nodes that satisfy `constraints` and currently have room for `demand`.
    async fn query(
        &self,
        demand: &ResourceVector,
        constraints: &PlacementConstraints,
    ) -> Result<Vec<CandidateNode>, OracleError>;

    /// Hold `demand` on `node_id` until released.
    async fn reserve(
        &self,
        node_id: &str,
        demand: &ResourceVector,
    ) -> Result<ReservationToken, OracleError>;

    async fn release(&self, token: &ReservationToken) -> Result<(), OracleError>;

    /// Total capacity of every schedulable node.
    async fn cluster_capacity(&self) -> Result<ResourceVector, OracleError>;
}
