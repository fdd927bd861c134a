// Node, pin and stage model. Pins carry their owning node id instead of a
// back-pointer; their data types are derived from the node's configuration.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{GraphError, PipelineEvent, TickReport};
use crate::engine::queue::BoundedQueue;
use crate::engine::types::{MessageCategory, MessageFormat, Normalized, RawMessage};
use crate::market_data::extractor::{ExtractedEnvelope, ExtractorConfig, MessageExtractor};
use crate::market_data::filter::{Admission, FilterConfig, FilteredMessage, MessageFilter};
use crate::market_data::processor::{MessageProcessor, ProcessOutcome, ProcessorConfig};
use crate::market_data::updater::{DataUpdater, UpdaterConfig};

macro_rules! graph_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

graph_id!(NodeId, "n");
graph_id!(PinId, "p");
graph_id!(LinkId, "l");

/// One counter for nodes, pins and links, owned by the host.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    next: u32,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl IdGenerator {
    pub fn node(&mut self) -> NodeId {
        NodeId(self.bump())
    }

    pub fn pin(&mut self) -> PinId {
        PinId(self.bump())
    }

    pub fn link(&mut self) -> LinkId {
        LinkId(self.bump())
    }

    // Keeps restored ids from being handed out again
    pub fn observe(&mut self, raw: u32) {
        if raw >= self.next {
            self.next = raw + 1;
        }
    }

    fn bump(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// What flows over a pin. `None` formats act as wildcards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataType {
    RawMessages,
    Extracted { format: Option<MessageFormat>, category: MessageCategory },
    Filtered { format: Option<MessageFormat>, category: MessageCategory },
    Normalized { category: MessageCategory },
}

fn formats_agree(a: Option<MessageFormat>, b: Option<MessageFormat>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl DataType {
    /// Whether an input pin of this type can take what `produced` carries.
    pub fn accepts(&self, produced: &DataType) -> bool {
        use DataType::*;
        match (self, produced) {
            (RawMessages, RawMessages) => true,
            (Extracted { format: a, category: c }, Extracted { format: b, category: d })
            | (Filtered { format: a, category: c }, Filtered { format: b, category: d }) => {
                c == d && formats_agree(*a, *b)
            }
            (Normalized { category: c }, Normalized { category: d }) => c == d,
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_name = |format: &Option<MessageFormat>| format.map_or_else(|| "any".to_string(), |x| x.to_string());
        match self {
            DataType::RawMessages => write!(f, "raw"),
            DataType::Extracted { format, category } => write!(f, "extracted<{}, {}>", fmt_name(format), category),
            DataType::Filtered { format, category } => write!(f, "filtered<{}, {}>", fmt_name(format), category),
            DataType::Normalized { category } => write!(f, "normalized<{}>", category),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinDirection {
    Input,
    Output,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub node: NodeId,
    // position among the node's pins of the same direction
    pub slot: usize,
    pub name: String,
    pub direction: PinDirection,
    pub data_type: DataType,
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Connection,
    Extractor,
    Filter,
    Processor,
    Updater,
}

impl NodeKind {
    /// Scheduling rank; data only moves to a higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            NodeKind::Connection => 0,
            NodeKind::Extractor => 1,
            NodeKind::Filter => 2,
            NodeKind::Processor => 3,
            NodeKind::Updater => 4,
        }
    }
}

impl NodeKind {
    /// Merge points take one extra input per producer instead of a fixed set.
    pub fn grows_inputs(&self) -> bool {
        matches!(self, NodeKind::Updater)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn default_inbox_capacity() -> usize {
    1_000
}

/// Serializable description of a node. Pin types follow from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum NodeSpec {
    Connection {
        source_id: String,
        #[serde(default = "default_inbox_capacity")]
        inbox_capacity: usize,
    },
    Extractor(ExtractorConfig),
    Filter(FilterConfig),
    Processor(ProcessorConfig),
    Updater(UpdaterConfig),
}

pub(crate) struct PinLayout {
    pub inputs: Vec<(&'static str, DataType)>,
    pub outputs: Vec<(&'static str, DataType)>,
}

impl NodeSpec {
    pub fn connection(source_id: &str) -> Self {
        NodeSpec::Connection { source_id: source_id.to_string(), inbox_capacity: default_inbox_capacity() }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSpec::Connection { .. } => NodeKind::Connection,
            NodeSpec::Extractor(_) => NodeKind::Extractor,
            NodeSpec::Filter(_) => NodeKind::Filter,
            NodeSpec::Processor(_) => NodeKind::Processor,
            NodeSpec::Updater(_) => NodeKind::Updater,
        }
    }

    pub(crate) fn pin_layout(&self) -> PinLayout {
        match self {
            NodeSpec::Connection { .. } => PinLayout { inputs: vec![], outputs: vec![("raw", DataType::RawMessages)] },
            NodeSpec::Extractor(cfg) => PinLayout {
                inputs: vec![("raw", DataType::RawMessages)],
                outputs: vec![(
                    "extracted",
                    DataType::Extracted { format: Some(cfg.format()), category: cfg.category },
                )],
            },
            NodeSpec::Filter(cfg) => {
                let category = cfg.domain.category();
                PinLayout {
                    inputs: vec![("extracted", DataType::Extracted { format: None, category })],
                    outputs: vec![("filtered", DataType::Filtered { format: None, category })],
                }
            }
            NodeSpec::Processor(cfg) => PinLayout {
                inputs: vec![(
                    "filtered",
                    DataType::Filtered { format: Some(cfg.kind.format()), category: cfg.kind.category() },
                )],
                outputs: vec![("normalized", DataType::Normalized { category: cfg.kind.category() })],
            },
            NodeSpec::Updater(cfg) => PinLayout {
                inputs: vec![("normalized", DataType::Normalized { category: cfg.category })],
                outputs: vec![],
            },
        }
    }
}

/// A unit of data between two pins. Fan-out clones it.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Raw(RawMessage),
    Extracted(ExtractedEnvelope),
    Filtered(FilteredMessage),
    Normalized(Normalized),
}

/// The live stage behind a node.
pub(crate) enum Stage {
    Connection { source_id: String, inbox: Arc<BoundedQueue<RawMessage>> },
    Extractor(MessageExtractor),
    Filter(MessageFilter),
    Processor(MessageProcessor),
    Updater(DataUpdater),
}

impl Stage {
    pub(crate) fn build(name: &str, spec: &NodeSpec) -> Result<Stage, GraphError> {
        Ok(match spec {
            NodeSpec::Connection { source_id, inbox_capacity } => Stage::Connection {
                source_id: source_id.clone(),
                inbox: Arc::new(BoundedQueue::new(*inbox_capacity)),
            },
            NodeSpec::Extractor(cfg) => Stage::Extractor(MessageExtractor::new(name, cfg.clone())),
            NodeSpec::Filter(cfg) => Stage::Filter(MessageFilter::new(name, cfg.clone())?),
            NodeSpec::Processor(cfg) => Stage::Processor(MessageProcessor::new(name, cfg.clone())),
            NodeSpec::Updater(cfg) => Stage::Updater(DataUpdater::new(name, cfg.clone())),
        })
    }

    /// Hot-swaps the configuration. The caller has already checked the kind.
    pub(crate) fn reconfigure(&self, spec: &NodeSpec) -> Result<(), GraphError> {
        match (self, spec) {
            (Stage::Connection { source_id, inbox }, NodeSpec::Connection { source_id: wanted, inbox_capacity }) => {
                if source_id != wanted {
                    return Err(GraphError::Rejected(format!(
                        "connection {source_id} cannot be renamed to {wanted}; add a new node instead"
                    )));
                }
                inbox.set_capacity(*inbox_capacity);
            }
            (Stage::Extractor(e), NodeSpec::Extractor(cfg)) => e.set_config(cfg.clone()),
            (Stage::Filter(f), NodeSpec::Filter(cfg)) => f.set_config(cfg.clone())?,
            (Stage::Processor(p), NodeSpec::Processor(cfg)) => p.set_config(cfg.clone()),
            (Stage::Updater(u), NodeSpec::Updater(cfg)) => u.set_config(cfg.clone())?,
            _ => return Err(GraphError::Rejected("stage and spec kinds differ".into())),
        }
        Ok(())
    }

    /// Consumes this tick's inputs and returns what goes out of the output pin.
    pub(crate) fn run(&self, node_name: &str, inputs: Vec<Packet>, now_ms: u64, report: &mut TickReport) -> Vec<Packet> {
        match self {
            Stage::Connection { inbox, .. } => {
                let raw = inbox.drain();
                report.raw_received += raw.len();
                raw.into_iter().map(Packet::Raw).collect()
            }
            Stage::Extractor(extractor) => inputs
                .into_iter()
                .filter_map(|p| match p {
                    Packet::Raw(raw) => Some(raw),
                    other => {
                        warn!(node = node_name, packet = ?other, "Extractor got a packet it cannot read");
                        None
                    }
                })
                .map(|raw| {
                    let info = extractor.extract_at(&raw, now_ms);
                    report.extracted += 1;
                    if !info.is_valid {
                        report.invalid += 1;
                    }
                    Packet::Extracted(ExtractedEnvelope {
                        info,
                        source_connection: raw.source_id,
                        source_extractor: node_name.to_string(),
                        received_ms: raw.arrival_ms,
                    })
                })
                .collect(),
            Stage::Filter(filter) => {
                for packet in inputs {
                    let Packet::Extracted(env) = packet else {
                        continue;
                    };
                    match filter.offer_at(FilteredMessage::from(env), now_ms) {
                        Admission::Admitted => {}
                        Admission::Rejected(reason) => {
                            report.rejected += 1;
                            trace!(node = node_name, ?reason, "Message rejected");
                        }
                        Admission::Duplicate => report.duplicates += 1,
                        Admission::Closed => {}
                    }
                }
                let admitted = filter.drain();
                report.admitted += admitted.len();
                admitted.into_iter().map(Packet::Filtered).collect()
            }
            Stage::Processor(processor) => {
                let mut out = Vec::new();
                for packet in inputs {
                    let Packet::Filtered(msg) = packet else {
                        continue;
                    };
                    match processor.process(&msg) {
                        ProcessOutcome::Normalized { record, warnings } => {
                            if !warnings.is_empty() {
                                debug!(node = node_name, ?warnings, "Normalized with warnings");
                            }
                            report.normalized += 1;
                            out.push(Packet::Normalized(record));
                        }
                        ProcessOutcome::Rejected(err) => report.processing_errors.push(err),
                        ProcessOutcome::Skipped(reason) => trace!(node = node_name, reason = %reason, "Message skipped"),
                        ProcessOutcome::Disabled => {
                            report.dropped_disabled += 1;
                        }
                    }
                }
                out
            }
            Stage::Updater(updater) => {
                for packet in inputs {
                    let Packet::Normalized(record) = packet else {
                        continue;
                    };
                    let events = updater.apply(record, now_ms);
                    report.events.extend(events.into_iter().map(|e| PipelineEvent::from_updater(node_name, e)));
                }
                let events = updater.tick(now_ms);
                report.events.extend(events.into_iter().map(|e| PipelineEvent::from_updater(node_name, e)));
                Vec::new()
            }
        }
    }

    /// Stops intake and releases queues and caches.
    pub(crate) fn shutdown(&self, node_name: &str) -> Vec<PipelineEvent> {
        match self {
            Stage::Connection { inbox, .. } => {
                let discarded = inbox.close();
                debug!(node = node_name, discarded, "Connection closed");
                Vec::new()
            }
            Stage::Extractor(e) => {
                e.shutdown();
                Vec::new()
            }
            Stage::Filter(f) => {
                f.shutdown();
                Vec::new()
            }
            Stage::Processor(p) => {
                p.shutdown();
                Vec::new()
            }
            Stage::Updater(u) => u.shutdown().into_iter().map(|e| PipelineEvent::from_updater(node_name, e)).collect(),
        }
    }
}

pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) spec: NodeSpec,
    pub(crate) inputs: Vec<Pin>,
    pub(crate) outputs: Vec<Pin>,
    pub(crate) stage: Stage,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.spec.kind()
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn inputs(&self) -> &[Pin] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Pin] {
        &self.outputs
    }

    pub fn pins(&self) -> impl Iterator<Item = &Pin> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    pub fn extractor(&self) -> Option<&MessageExtractor> {
        match &self.stage {
            Stage::Extractor(e) => Some(e),
            _ => None,
        }
    }

    pub fn filter(&self) -> Option<&MessageFilter> {
        match &self.stage {
            Stage::Filter(f) => Some(f),
            _ => None,
        }
    }

    pub fn processor(&self) -> Option<&MessageProcessor> {
        match &self.stage {
            Stage::Processor(p) => Some(p),
            _ => None,
        }
    }

    pub fn updater(&self) -> Option<&DataUpdater> {
        match &self.stage {
            Stage::Updater(u) => Some(u),
            _ => None,
        }
    }

    // Re-derives pin types from the current spec; ids and slots stay put
    pub(crate) fn refresh_pin_types(&mut self) {
        let layout = self.spec.pin_layout();
        for pin in self.inputs.iter_mut() {
            if let Some((_, data_type)) = layout_entry(&layout.inputs, pin.slot) {
                pin.data_type = *data_type;
            }
        }
        for pin in self.outputs.iter_mut() {
            if let Some((_, data_type)) = layout_entry(&layout.outputs, pin.slot) {
                pin.data_type = *data_type;
            }
        }
    }
}

// Slots past the layout repeat its last entry
fn layout_entry<'a>(layout: &'a [(&'static str, DataType)], slot: usize) -> Option<&'a (&'static str, DataType)> {
    layout.get(slot).or_else(|| layout.last())
}

/// Pin for `slot`. Slots past the declared layout are optional extras named
/// after the last declared pin.
pub(crate) fn pin_at(
    node: NodeId,
    direction: PinDirection,
    layout: &[(&'static str, DataType)],
    slot: usize,
    id: PinId,
) -> Option<Pin> {
    let (name, data_type) = layout_entry(layout, slot)?;
    let declared = slot < layout.len();
    Some(Pin {
        id,
        node,
        slot,
        name: if declared { (*name).to_string() } else { format!("{name}.{slot}") },
        direction,
        data_type: *data_type,
        required: declared && direction == PinDirection::Input,
    })
}

pub(crate) fn make_pins(
    node: NodeId,
    direction: PinDirection,
    layout: &[(&'static str, DataType)],
    ids: &[PinId],
) -> Vec<Pin> {
    ids.iter().enumerate().filter_map(|(slot, id)| pin_at(node, direction, layout, slot, *id)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::processor::ProcessorKind;

    #[test]
    fn test_wildcard_formats_match_either_side() {
        let any = DataType::Filtered { format: None, category: MessageCategory::Trade };
        let json = DataType::Filtered { format: Some(MessageFormat::Json), category: MessageCategory::Trade };
        let fix = DataType::Filtered { format: Some(MessageFormat::Fix), category: MessageCategory::Trade };
        assert!(json.accepts(&any));
        assert!(any.accepts(&fix));
        assert!(!json.accepts(&fix));
        let book = DataType::Filtered { format: None, category: MessageCategory::Orderbook };
        assert!(!json.accepts(&book));
        assert!(!DataType::RawMessages.accepts(&json));
    }

    #[test]
    fn test_pin_types_follow_config() {
        let spec = NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(
            MessageFormat::Fix,
            MessageCategory::Orderbook,
        )));
        let layout = spec.pin_layout();
        assert_eq!(
            layout.inputs[0].1,
            DataType::Filtered { format: Some(MessageFormat::Fix), category: MessageCategory::Orderbook }
        );
        assert_eq!(layout.outputs[0].1, DataType::Normalized { category: MessageCategory::Orderbook });
        assert!(NodeSpec::Updater(UpdaterConfig::trades()).pin_layout().outputs.is_empty());
    }

    #[test]
    fn test_extra_pins_repeat_last_layout_entry() {
        let layout = NodeSpec::Updater(UpdaterConfig::trades()).pin_layout();
        let pins = make_pins(NodeId(1), PinDirection::Input, &layout.inputs, &[PinId(2), PinId(3)]);
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[1].data_type, pins[0].data_type);
        assert_eq!(pins[1].name, "normalized.1");
        assert!(pins[0].required);
        assert!(!pins[1].required);
        assert!(NodeKind::Updater.grows_inputs());
        assert!(!NodeKind::Filter.grows_inputs());
    }

    #[test]
    fn test_id_generator_skips_observed() {
        let mut ids = IdGenerator::default();
        assert_eq!(ids.node(), NodeId(1));
        ids.observe(10);
        assert_eq!(ids.pin(), PinId(11));
        ids.observe(3);
        assert_eq!(ids.link(), LinkId(12));
    }

    #[test]
    fn test_spec_serde_is_tagged_by_node() {
        let spec = NodeSpec::connection("venue-a");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["node"], "connection");
        let back: NodeSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
