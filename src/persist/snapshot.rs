//! Conversions between a live `GraphHost` and its serializable topology.
//!
//! No I/O here; stores live in the parent module.

use tracing::debug;

use crate::graph::GraphHost;
use crate::persist::types::{LinkRecord, NodeRecord, PersistError, PersistResult, TopologySnapshot, TOPOLOGY_SCHEMA_VERSION};

/// Captures node specs, pin ids and links in id order.
pub fn capture(host: &GraphHost) -> TopologySnapshot {
    let nodes = host
        .nodes()
        .map(|n| NodeRecord {
            id: n.id(),
            name: n.name().to_string(),
            spec: n.spec().clone(),
            inputs: n.inputs().iter().map(|p| p.id).collect(),
            outputs: n.outputs().iter().map(|p| p.id).collect(),
        })
        .collect();
    let links = host.links().map(|l| LinkRecord { id: l.id, from: l.from, to: l.to }).collect();
    TopologySnapshot { version: TOPOLOGY_SCHEMA_VERSION, nodes, links }
}

/// Builds a fresh host with the stored ids. Links are re-checked, so a stored
/// topology that no longer type-checks fails here.
pub fn restore(snap: &TopologySnapshot) -> PersistResult<GraphHost> {
    if snap.version != TOPOLOGY_SCHEMA_VERSION {
        return Err(PersistError::FormatMismatch { expected: TOPOLOGY_SCHEMA_VERSION, found: snap.version });
    }
    let mut host = GraphHost::new();
    for node in &snap.nodes {
        host.add_node_with_ids(node.id, &node.name, node.spec.clone(), &node.inputs, &node.outputs)?;
    }
    for link in &snap.links {
        host.add_link_with_id(link.id, link.from, link.to)?;
    }
    debug!(nodes = snap.nodes.len(), links = snap.links.len(), "Topology restored");
    Ok(host)
}
