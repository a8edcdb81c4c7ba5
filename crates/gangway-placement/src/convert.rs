//! Type conversions between configuration types and placement types.
//!
//! Bridges `gangway_core::NodeConfig` (the `[[nodes]]` inventory in
//! gangway.toml) to the in-memory oracle's [`InventoryNode`].

use gangway_core::NodeConfig;
use gangway_state::ResourceVector;

use crate::inventory::{InMemoryOracle, InventoryNode};

/// Convert a [`NodeConfig`] to an [`InventoryNode`].
pub fn node_config_to_inventory(node: &NodeConfig) -> InventoryNode {
    InventoryNode {
        id: node.id.clone(),
        capacity: ResourceVector::new(node.cpu_millis, node.memory_bytes, node.accelerators),
        labels: node.labels.clone(),
        accelerator_type: node.accelerator_type.clone(),
    }
}

/// Build an oracle holding every configured node.
pub fn oracle_from_config(nodes: &[NodeConfig]) -> InMemoryOracle {
    InMemoryOracle::new(nodes.iter().map(node_config_to_inventory))
}
