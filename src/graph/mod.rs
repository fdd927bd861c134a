//! Graph host: owns the stage nodes, their typed pins and the links between
//! them, and drives one scheduling pass per `tick`.
//!
//! Links always run from an output pin to an input pin. An input has at most
//! one producer; an output may feed any number of inputs and every consumer
//! gets its own copy of each packet. Updaters are merge points: `connect`
//! gives every new producer its own input pin.

pub mod node;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use node::{DataType, IdGenerator, LinkId, Node, NodeId, NodeKind, NodeSpec, Packet, Pin, PinDirection, PinId};

use crate::engine::types::{NormalizedOrderbook, NormalizedTrade, PipelineError};
use crate::market_data::adapters::ConnectionHandle;
use crate::market_data::processor::ProcessingError;
use crate::market_data::updater::{DataConflict, RecoverySink, SequenceGap, SnapshotRequest, SyncState, UpdaterEvent};
use node::{make_pins, pin_at, Stage};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("unknown pin {0}")]
    UnknownPin(PinId),

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("link must run from an output pin to an input pin ({from} -> {to})")]
    WrongDirection { from: PinId, to: PinId },

    #[error("node {0} cannot link to itself")]
    SelfLoop(NodeId),

    #[error("input {pin} already fed by link {link}")]
    InputOccupied { pin: PinId, link: LinkId },

    #[error("type mismatch: input expects {expected}, output carries {found}")]
    TypeMismatch { expected: DataType, found: DataType },

    #[error("node {node} is a {actual}, expected {expected}")]
    WrongKind { node: NodeId, expected: NodeKind, actual: NodeKind },

    #[error("node {node} cannot change kind from {from} to {to}")]
    KindChange { node: NodeId, from: NodeKind, to: NodeKind },

    #[error("id {0} already in use")]
    DuplicateId(u32),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Stage(#[from] PipelineError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    pub from: PinId,
    pub to: PinId,
}

/// Problems `validate` reports. The graph is never changed by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    UnconnectedInput { node: NodeId, pin: PinId },
    TypeMismatch { link: LinkId, expected: DataType, found: DataType },
}

/// Everything the pipeline emits, tagged with the updater that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Trade(NormalizedTrade),
    Orderbook(NormalizedOrderbook),
    Conflict(DataConflict),
    Gap(SequenceGap),
    SnapshotRequested(SnapshotRequest),
    StateChanged { updater: String, currency_pair: String, from: SyncState, to: SyncState },
}

impl PipelineEvent {
    pub fn from_updater(updater: &str, event: UpdaterEvent) -> Self {
        match event {
            UpdaterEvent::Trade(t) => PipelineEvent::Trade(t),
            UpdaterEvent::Orderbook(b) => PipelineEvent::Orderbook(b),
            UpdaterEvent::Conflict(c) => PipelineEvent::Conflict(c),
            UpdaterEvent::Gap(g) => PipelineEvent::Gap(g),
            UpdaterEvent::SnapshotRequested(r) => PipelineEvent::SnapshotRequested(r),
            UpdaterEvent::StateChanged { currency_pair, from, to } => {
                PipelineEvent::StateChanged { updater: updater.to_string(), currency_pair, from, to }
            }
        }
    }
}

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub now_ms: u64,
    pub raw_received: usize,
    pub extracted: usize,
    pub invalid: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub duplicates: usize,
    pub normalized: usize,
    pub dropped_disabled: usize,
    pub processing_errors: Vec<ProcessingError>,
    pub events: Vec<PipelineEvent>,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.raw_received == 0 && self.events.is_empty()
    }

    pub fn trades(&self) -> impl Iterator<Item = &NormalizedTrade> {
        self.events.iter().filter_map(|e| match e {
            PipelineEvent::Trade(t) => Some(t),
            _ => None,
        })
    }

    pub fn orderbooks(&self) -> impl Iterator<Item = &NormalizedOrderbook> {
        self.events.iter().filter_map(|e| match e {
            PipelineEvent::Orderbook(b) => Some(b),
            _ => None,
        })
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &DataConflict> {
        self.events.iter().filter_map(|e| match e {
            PipelineEvent::Conflict(c) => Some(c),
            _ => None,
        })
    }
}

#[derive(Default)]
pub struct GraphHost {
    ids: IdGenerator,
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeMap<LinkId, Link>,
    // pin -> owning node
    pin_owner: AHashMap<PinId, NodeId>,
}

impl GraphHost {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(level = "debug", skip(self, spec), fields(kind = %spec.kind()))]
    pub fn add_node(&mut self, name: &str, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let stage = Stage::build(name, &spec)?;
        let id = self.ids.node();
        let layout = spec.pin_layout();
        let input_ids: Vec<PinId> = layout.inputs.iter().map(|_| self.ids.pin()).collect();
        let output_ids: Vec<PinId> = layout.outputs.iter().map(|_| self.ids.pin()).collect();
        self.insert(id, name, spec, stage, &input_ids, &output_ids);
        debug!(node = %id, "Node added");
        Ok(id)
    }

    // Places a node under known ids; used when restoring a stored topology
    pub(crate) fn add_node_with_ids(
        &mut self,
        id: NodeId,
        name: &str,
        spec: NodeSpec,
        input_ids: &[PinId],
        output_ids: &[PinId],
    ) -> Result<(), GraphError> {
        let layout = spec.pin_layout();
        let inputs_fit = input_ids.len() == layout.inputs.len()
            || (spec.kind().grows_inputs() && input_ids.len() > layout.inputs.len());
        if !inputs_fit || output_ids.len() != layout.outputs.len() {
            return Err(GraphError::Rejected(format!("pin count for node {id} does not match its spec")));
        }
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateId(id.0));
        }
        if let Some(taken) = input_ids.iter().chain(output_ids).find(|p| self.pin_owner.contains_key(p)) {
            return Err(GraphError::DuplicateId(taken.0));
        }
        let stage = Stage::build(name, &spec)?;
        self.ids.observe(id.0);
        for pin in input_ids.iter().chain(output_ids) {
            self.ids.observe(pin.0);
        }
        self.insert(id, name, spec, stage, input_ids, output_ids);
        Ok(())
    }

    fn insert(&mut self, id: NodeId, name: &str, spec: NodeSpec, stage: Stage, input_ids: &[PinId], output_ids: &[PinId]) {
        let layout = spec.pin_layout();
        let inputs = make_pins(id, PinDirection::Input, &layout.inputs, input_ids);
        let outputs = make_pins(id, PinDirection::Output, &layout.outputs, output_ids);
        for pin in inputs.iter().chain(outputs.iter()) {
            self.pin_owner.insert(pin.id, id);
        }
        self.nodes.insert(id, Node { id, name: name.to_string(), spec, inputs, outputs, stage });
    }

    /// Removes the node's links first, then shuts the stage down.
    pub fn remove_node(&mut self, id: NodeId) -> Result<Vec<PipelineEvent>, GraphError> {
        let node = self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))?;
        let pins: Vec<PinId> = node.pins().map(|p| p.id).collect();
        let incident: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| pins.contains(&l.from) || pins.contains(&l.to))
            .map(|l| l.id)
            .collect();
        for link in &incident {
            self.links.remove(link);
        }
        for pin in &pins {
            self.pin_owner.remove(pin);
        }
        let events = match self.nodes.remove(&id) {
            Some(node) => node.stage.shutdown(&node.name),
            None => Vec::new(),
        };
        debug!(node = %id, links = incident.len(), "Node removed");
        Ok(events)
    }

    /// Connects an output pin to an input pin. On error the graph is unchanged.
    pub fn add_link(&mut self, from: PinId, to: PinId) -> Result<LinkId, GraphError> {
        self.can_accept_input(from, to)?;
        let id = self.ids.link();
        self.links.insert(id, Link { id, from, to });
        debug!(link = %id, %from, %to, "Link added");
        Ok(id)
    }

    /// Every check `add_link` makes, without linking.
    pub fn can_accept_input(&self, from: PinId, to: PinId) -> Result<(), GraphError> {
        let out = self.pin(from)?;
        let input = self.pin(to)?;
        if out.direction != PinDirection::Output || input.direction != PinDirection::Input {
            return Err(GraphError::WrongDirection { from, to });
        }
        if out.node == input.node {
            return Err(GraphError::SelfLoop(out.node));
        }
        if let Some(existing) = self.links.values().find(|l| l.to == to) {
            return Err(GraphError::InputOccupied { pin: to, link: existing.id });
        }
        if !input.data_type.accepts(&out.data_type) {
            return Err(GraphError::TypeMismatch { expected: input.data_type, found: out.data_type });
        }
        Ok(())
    }

    pub(crate) fn add_link_with_id(&mut self, id: LinkId, from: PinId, to: PinId) -> Result<(), GraphError> {
        if self.links.contains_key(&id) || self.pin_owner.contains_key(&PinId(id.0)) {
            return Err(GraphError::DuplicateId(id.0));
        }
        let assigned = self.add_link(from, to)?;
        // swap the freshly assigned id for the stored one
        if let Some(mut link) = self.links.remove(&assigned) {
            link.id = id;
            self.links.insert(id, link);
        }
        self.ids.observe(id.0);
        Ok(())
    }

    pub fn remove_link(&mut self, id: LinkId) -> Result<Link, GraphError> {
        self.links.remove(&id).ok_or(GraphError::UnknownLink(id))
    }

    /// Reports unconnected required inputs and mistyped links.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        for node in self.nodes.values() {
            for pin in node.inputs.iter().filter(|p| p.required) {
                if !self.links.values().any(|l| l.to == pin.id) {
                    issues.push(ValidationIssue::UnconnectedInput { node: node.id, pin: pin.id });
                }
            }
        }
        for link in self.links.values() {
            if let (Ok(out), Ok(input)) = (self.pin(link.from), self.pin(link.to)) {
                if !input.data_type.accepts(&out.data_type) {
                    issues.push(ValidationIssue::TypeMismatch {
                        link: link.id,
                        expected: input.data_type,
                        found: out.data_type,
                    });
                }
            }
        }
        issues
    }

    /// Hot-swaps a node's configuration and re-derives its pin types. Existing
    /// links are kept even when they no longer type-check; `validate` reports them.
    pub fn reconfigure_node(&mut self, id: NodeId, spec: NodeSpec) -> Result<(), GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        if node.kind() != spec.kind() {
            return Err(GraphError::KindChange { node: id, from: node.kind(), to: spec.kind() });
        }
        node.stage.reconfigure(&spec)?;
        node.spec = spec;
        node.refresh_pin_types();
        info!(node = %id, name = %node.name, "Node reconfigured");
        Ok(())
    }

    /// Producer handle for a connection node's inbox.
    pub fn connection_handle(&self, id: NodeId) -> Result<ConnectionHandle, GraphError> {
        let node = self.node(id)?;
        match &node.stage {
            Stage::Connection { source_id, inbox } => Ok(ConnectionHandle::new(source_id, Arc::clone(inbox))),
            _ => Err(GraphError::WrongKind { node: id, expected: NodeKind::Connection, actual: node.kind() }),
        }
    }

    pub fn set_recovery_sink(&self, id: NodeId, sink: Arc<dyn RecoverySink>) -> Result<(), GraphError> {
        self.updater_node(id)?.set_recovery_sink(sink);
        Ok(())
    }

    pub fn resolve_conflict(
        &self,
        id: NodeId,
        conflict_id: &str,
        winner_source: &str,
        now_ms: u64,
    ) -> Result<Vec<PipelineEvent>, GraphError> {
        let node = self.node(id)?;
        let updater = self.updater_node(id)?;
        let events = updater.resolve_conflict(conflict_id, winner_source, now_ms)?;
        Ok(events.into_iter().map(|e| PipelineEvent::from_updater(&node.name, e)).collect())
    }

    fn updater_node(&self, id: NodeId) -> Result<&crate::market_data::updater::DataUpdater, GraphError> {
        let node = self.node(id)?;
        node.updater()
            .ok_or(GraphError::WrongKind { node: id, expected: NodeKind::Updater, actual: node.kind() })
    }

    /// One pass over every node in stage order. Packets produced this tick
    /// travel all the way down in the same tick.
    #[instrument(level = "debug", skip(self))]
    pub fn tick(&self, now_ms: u64) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport { now_ms, ..TickReport::default() };
        let mut inboxes: AHashMap<PinId, Vec<Packet>> = AHashMap::new();

        for node in self.schedule() {
            let inputs: Vec<Packet> = node.inputs.iter().flat_map(|p| inboxes.remove(&p.id).unwrap_or_default()).collect();
            if inputs.is_empty() && node.kind() != NodeKind::Connection && node.kind() != NodeKind::Updater {
                continue;
            }
            let produced = node.stage.run(&node.name, inputs, now_ms, &mut report);
            if produced.is_empty() {
                continue;
            }
            for pin in &node.outputs {
                let targets: Vec<PinId> = self.links.values().filter(|l| l.from == pin.id).map(|l| l.to).collect();
                for target in targets {
                    inboxes.entry(target).or_default().extend(produced.iter().cloned());
                }
            }
        }
        for (pin, dropped) in inboxes {
            if !dropped.is_empty() {
                warn!(%pin, count = dropped.len(), "Packets left on a pin with no consumer");
            }
        }

        metrics::counter!("mdpipe_graph_ticks_total").increment(1);
        metrics::histogram!("mdpipe_graph_tick_us").record(started.elapsed().as_secs_f64() * 1e6);
        report
    }

    // Stage rank first, then creation order
    fn schedule(&self) -> Vec<&Node> {
        let mut order: Vec<&Node> = self.nodes.values().collect();
        order.sort_by_key(|n| (n.kind().rank(), n.id));
        order
    }

    /// Shuts every node down, producers first.
    pub fn shutdown(&mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        for node in self.schedule() {
            events.extend(node.stage.shutdown(&node.name));
        }
        info!(nodes = self.nodes.len(), "Graph shut down");
        events
    }

    pub fn node(&self, id: NodeId) -> Result<&Node, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownNode(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    pub fn pin(&self, id: PinId) -> Result<&Pin, GraphError> {
        let owner = self.pin_owner.get(&id).ok_or(GraphError::UnknownPin(id))?;
        self.nodes
            .get(owner)
            .and_then(|n| n.pins().find(|p| p.id == id))
            .ok_or(GraphError::UnknownPin(id))
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find(|n| n.name == name).map(|n| n.id)
    }

    pub fn input_pin(&self, id: NodeId, slot: usize) -> Result<PinId, GraphError> {
        self.node(id)?.inputs.get(slot).map(|p| p.id).ok_or_else(|| GraphError::Rejected(format!("node {id} has no input {slot}")))
    }

    pub fn output_pin(&self, id: NodeId, slot: usize) -> Result<PinId, GraphError> {
        self.node(id)?
            .outputs
            .get(slot)
            .map(|p| p.id)
            .ok_or_else(|| GraphError::Rejected(format!("node {id} has no output {slot}")))
    }

    /// Links output 0 of `from` to the first free input of `to`. Updaters get
    /// a new input when every existing one is fed; other nodes report the
    /// occupied input.
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<LinkId, GraphError> {
        let out = self.output_pin(from, 0)?;
        let (input, grown) = self.free_input(to)?;
        let linked = self.add_link(out, input);
        if linked.is_err() && grown {
            self.drop_input_pin(to, input);
        }
        linked
    }

    /// Appends an input pin to a merge node and returns its id.
    pub fn add_input_pin(&mut self, id: NodeId) -> Result<PinId, GraphError> {
        let kind = self.node(id)?.kind();
        if !kind.grows_inputs() {
            return Err(GraphError::Rejected(format!("{kind} node {id} has a fixed set of inputs")));
        }
        let pin_id = self.ids.pin();
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        let layout = node.spec.pin_layout();
        let pin = pin_at(id, PinDirection::Input, &layout.inputs, node.inputs.len(), pin_id)
            .ok_or_else(|| GraphError::Rejected(format!("node {id} declares no inputs")))?;
        node.inputs.push(pin);
        self.pin_owner.insert(pin_id, id);
        debug!(node = %id, pin = %pin_id, "Input pin added");
        Ok(pin_id)
    }

    // First unfed input, growing one when the node allows it
    fn free_input(&mut self, id: NodeId) -> Result<(PinId, bool), GraphError> {
        let node = self.node(id)?;
        let grows = node.kind().grows_inputs();
        let free = node.inputs.iter().map(|p| p.id).find(|pin| !self.links.values().any(|l| l.to == *pin));
        match free {
            Some(pin) => Ok((pin, false)),
            None if grows => Ok((self.add_input_pin(id)?, true)),
            None => Ok((self.input_pin(id, 0)?, false)),
        }
    }

    fn drop_input_pin(&mut self, id: NodeId, pin: PinId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.inputs.retain(|p| p.id != pin);
        }
        self.pin_owner.remove(&pin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{MessageCategory, MessageFormat};
    use crate::market_data::extractor::ExtractorConfig;
    use crate::market_data::filter::FilterConfig;
    use crate::market_data::processor::{ProcessorConfig, ProcessorKind};
    use crate::market_data::updater::UpdaterConfig;

    const NOW: u64 = 1_690_000_001_000;

    fn chain(g: &mut GraphHost, category: MessageCategory) -> [NodeId; 5] {
        let conn = g.add_node("venue-a", NodeSpec::connection("venue-a")).unwrap();
        let ext = g.add_node("extract", NodeSpec::Extractor(ExtractorConfig::json(category))).unwrap();
        let filt = g.add_node("filter", NodeSpec::Filter(FilterConfig::for_category(category))).unwrap();
        let process = g
            .add_node(
                "process",
                NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, category))),
            )
            .unwrap();
        let upd = g.add_node("update", NodeSpec::Updater(UpdaterConfig::for_category(category))).unwrap();
        [conn, ext, filt, process, upd]
    }

    fn wire(g: &mut GraphHost, ids: [NodeId; 5]) {
        for pair in ids.windows(2) {
            g.connect(pair[0], pair[1]).unwrap();
        }
    }

    #[test]
    fn test_unwired_chain_reports_inputs() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        assert_eq!(g.validate().len(), 4);
        wire(&mut g, ids);
        assert!(g.validate().is_empty());
    }

    #[test]
    fn test_link_rules() {
        let mut g = GraphHost::new();
        let [conn, ext, filt, process, upd] = chain(&mut g, MessageCategory::Trade);
        let book_upd = g.add_node("books", NodeSpec::Updater(UpdaterConfig::orderbook())).unwrap();

        // wrong direction
        let err = g.add_link(g.input_pin(ext, 0).unwrap(), g.output_pin(conn, 0).unwrap()).unwrap_err();
        assert!(matches!(err, GraphError::WrongDirection { .. }));
        // type mismatch leaves the graph unchanged
        let err = g.connect(conn, filt).unwrap_err();
        assert!(matches!(err, GraphError::TypeMismatch { .. }));
        assert!(matches!(g.connect(process, book_upd), Err(GraphError::TypeMismatch { .. })));
        assert_eq!(g.links().count(), 0);

        assert!(g.can_accept_input(g.output_pin(conn, 0).unwrap(), g.input_pin(ext, 0).unwrap()).is_ok());
        g.connect(conn, ext).unwrap();
        let second = g.add_node("venue-b", NodeSpec::connection("venue-b")).unwrap();
        assert!(matches!(g.connect(second, ext), Err(GraphError::InputOccupied { .. })));

        // fan-out is fine
        let ext2 = g.add_node("extract-2", NodeSpec::Extractor(ExtractorConfig::json(MessageCategory::Trade))).unwrap();
        g.connect(conn, ext2).unwrap();
        g.connect(process, upd).unwrap();
        assert_eq!(g.links().count(), 3);
    }

    #[test]
    fn test_updater_grows_an_input_per_producer() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        wire(&mut g, ids);
        let upd = ids[4];
        let process2 = g
            .add_node(
                "process-2",
                NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(MessageFormat::Fix, MessageCategory::Trade))),
            )
            .unwrap();
        g.connect(process2, upd).unwrap();
        let inputs = g.node(upd).unwrap().inputs().len();
        assert_eq!(inputs, 2);

        // a mistyped producer leaves no stray pin behind
        let book_proc = g
            .add_node(
                "books",
                NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Orderbook))),
            )
            .unwrap();
        assert!(matches!(g.connect(book_proc, upd), Err(GraphError::TypeMismatch { .. })));
        assert_eq!(g.node(upd).unwrap().inputs().len(), inputs);

        // grown inputs are optional once unlinked, and get reused
        let extra = g.links().find(|l| l.to == g.node(upd).unwrap().inputs()[1].id).map(|l| l.id).unwrap();
        g.remove_link(extra).unwrap();
        g.remove_node(book_proc).unwrap();
        let issues = g.validate();
        assert_eq!(issues.len(), 1);
        assert!(matches!(issues[0], ValidationIssue::UnconnectedInput { node, .. } if node == process2));
        g.connect(process2, upd).unwrap();
        assert_eq!(g.node(upd).unwrap().inputs().len(), 2);

        assert!(matches!(g.add_input_pin(ids[2]), Err(GraphError::Rejected(_))));
    }

    #[test]
    fn test_remove_node_cascades() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        wire(&mut g, ids);
        let handle = g.connection_handle(ids[0]).unwrap();
        g.remove_node(ids[2]).unwrap();
        assert_eq!(g.links().count(), 2);
        assert!(matches!(g.node(ids[2]), Err(GraphError::UnknownNode(_))));
        assert!(!handle.is_closed());

        g.remove_node(ids[0]).unwrap();
        assert!(handle.is_closed());
        assert!(matches!(g.remove_node(ids[0]), Err(GraphError::UnknownNode(_))));
    }

    #[test]
    fn test_reconfigure_changes_pin_types() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        wire(&mut g, ids);
        g.reconfigure_node(
            ids[3],
            NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(MessageFormat::Fix, MessageCategory::Trade))),
        )
        .unwrap();
        // filter output has no fixed format, the link still holds
        assert!(g.validate().is_empty());

        g.reconfigure_node(
            ids[3],
            NodeSpec::Processor(ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Orderbook))),
        )
        .unwrap();
        let issues = g.validate();
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().all(|i| matches!(i, ValidationIssue::TypeMismatch { .. })));

        let err = g.reconfigure_node(ids[3], NodeSpec::connection("x")).unwrap_err();
        assert!(matches!(err, GraphError::KindChange { .. }));
    }

    #[test]
    fn test_tick_runs_chain_and_fans_out() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        wire(&mut g, ids);
        // second branch from the same connection
        let ext2 = g.add_node("extract-2", NodeSpec::Extractor(ExtractorConfig::json(MessageCategory::Trade))).unwrap();
        let filt2 = g.add_node("filter-2", NodeSpec::Filter(FilterConfig::trades())).unwrap();
        g.connect(ids[0], ext2).unwrap();
        g.connect(ext2, filt2).unwrap();

        let handle = g.connection_handle(ids[0]).unwrap();
        let payload = r#"{"id":"T1","price":"100.5","quantity":"2","side":"buy","symbol":"BTC/USD","timestamp":1690000000000}"#;
        handle.push(payload, NOW - 5);

        let report = g.tick(NOW);
        assert_eq!(report.raw_received, 1);
        assert_eq!(report.extracted, 2);
        // both filters admit their own copy
        assert_eq!(report.admitted, 2);
        let trades: Vec<_> = report.trades().collect();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].trade_id, "T1");

        assert!(g.tick(NOW + 1).is_idle());
    }

    #[test]
    fn test_wrong_kind_queries() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        assert!(matches!(g.connection_handle(ids[1]), Err(GraphError::WrongKind { .. })));
        assert!(matches!(g.resolve_conflict(ids[0], "c1", "a", NOW), Err(GraphError::WrongKind { .. })));
        assert!(matches!(g.resolve_conflict(ids[4], "c1", "a", NOW), Err(GraphError::Stage(_))));
    }

    #[test]
    fn test_shutdown_closes_inboxes() {
        let mut g = GraphHost::new();
        let ids = chain(&mut g, MessageCategory::Trade);
        wire(&mut g, ids);
        let handle = g.connection_handle(ids[0]).unwrap();
        g.shutdown();
        assert!(handle.is_closed());
        assert!(g.tick(NOW).trades().next().is_none());
    }
}
