use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{GraphError, LinkId, NodeId, NodeSpec, PinId};

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("schema version {found} does not match {expected}")]
    FormatMismatch { expected: u32, found: u32 },

    #[error("topology {0} not found")]
    NotFound(String),

    #[error("stored topology does not fit the graph: {0}")]
    Graph(#[from] GraphError),
}

pub type PersistResult<T> = Result<T, PersistError>;

pub const TOPOLOGY_SCHEMA_VERSION: u32 = 1;

/// Serializable view of a graph: node specs with their pin ids, and links.
/// Runtime state (books, caches, queues) is not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    pub version: u32,
    pub nodes: Vec<NodeRecord>,
    pub links: Vec<LinkRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub name: String,
    pub spec: NodeSpec,
    pub inputs: Vec<PinId>,
    pub outputs: Vec<PinId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: LinkId,
    pub from: PinId,
    pub to: PinId,
}
