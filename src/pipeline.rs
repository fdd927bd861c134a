//! Standard five-node chain: connection, extractor, filter, processor, updater.

use crate::config::PipelineConfig;
use crate::engine::types::MessageCategory;
use crate::graph::{GraphError, GraphHost, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainNodes {
    pub connection: NodeId,
    pub extractor: NodeId,
    pub filter: NodeId,
    pub processor: NodeId,
    pub updater: NodeId,
}

impl ChainNodes {
    pub fn in_order(&self) -> [NodeId; 5] {
        [self.connection, self.extractor, self.filter, self.processor, self.updater]
    }
}

/// JSON chain for one source and category with default stage settings.
pub fn build_standard_graph(
    host: &mut GraphHost,
    source_id: &str,
    category: MessageCategory,
) -> Result<ChainNodes, GraphError> {
    let cfg = PipelineConfig { source_id: source_id.to_string(), category, ..PipelineConfig::default() };
    build_from_config(host, &cfg)
}

/// Name of the updater every chain of `category` merges into.
pub fn shared_updater_name(category: MessageCategory) -> &'static str {
    match category {
        MessageCategory::Trade => "trades.updater",
        MessageCategory::Orderbook => "orderbooks.updater",
    }
}

/// Adds and wires the chain described by `cfg`. Per-source nodes are prefixed
/// with the source id; the updater is shared per category, so the first chain
/// of a category creates it with its settings and later chains feed into it.
pub fn build_from_config(host: &mut GraphHost, cfg: &PipelineConfig) -> Result<ChainNodes, GraphError> {
    let name = |stage: &str| format!("{}.{}", cfg.source_id, stage);
    let updater_name = shared_updater_name(cfg.category);
    let updater = match host.find_node(updater_name) {
        Some(existing) => existing,
        None => host.add_node(updater_name, cfg.updater_spec())?,
    };
    let chain = ChainNodes {
        connection: host.add_node(&name("connection"), cfg.connection_spec())?,
        extractor: host.add_node(&name("extractor"), cfg.extractor_spec())?,
        filter: host.add_node(&name("filter"), cfg.filter_spec())?,
        processor: host.add_node(&name("processor"), cfg.processor_spec())?,
        updater,
    };
    for pair in chain.in_order().windows(2) {
        host.connect(pair[0], pair[1])?;
    }
    Ok(chain)
}
