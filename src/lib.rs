//! Market-data normalization pipeline.
//!
//! Raw venue messages flow through a graph of stages: connection inboxes feed
//! extractors, filters admit and order, processors map to canonical records
//! and updaters sequence, reconcile and recover them per currency pair.

pub mod config;
pub mod engine;
pub mod graph;
pub mod market_data;
pub mod persist;
pub mod pipeline;
pub mod telemetry;

pub use config::PipelineConfig;
pub use engine::types::{
    MessageCategory, MessageFormat, Normalized, NormalizedOrderbook, NormalizedTrade, PipelineError, PipelineResult,
};
pub use graph::{GraphError, GraphHost, NodeId, NodeSpec, PipelineEvent, TickReport};
pub use pipeline::{build_from_config, build_standard_graph, ChainNodes};
