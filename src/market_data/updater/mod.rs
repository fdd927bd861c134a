//! Data updaters: the synchronization core. They merge normalized records from
//! any number of sources into authoritative per-pair state, track ordering per
//! source, raise conflicts and gaps, and ask the connection layer for snapshots
//! when an orderbook cannot be repaired from what it has.
//!
//! Every pair has its own lock; merges for one pair are serialized while
//! different pairs proceed in parallel.

mod orderbook;
mod sequence;
mod trades;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use crossbeam::channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::engine::queue::BoundedHistory;
use crate::engine::stats::LatencyTracker;
use crate::engine::types::{MessageCategory, Normalized, NormalizedOrderbook, NormalizedTrade, PipelineError, PipelineResult};

pub use orderbook::{OrderbookMetrics, OrderbookUpdater};
pub use sequence::{SequenceCheck, SequenceCursor};
pub use trades::{TradeMetrics, TradesUpdater};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrder {
    ByTimestamp,
    #[default]
    BySequence,
    ByPriority,
    BySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    #[default]
    LatestWins,
    SourcePriority,
    ManualReview,
    Merge,
}

/// What happens to a held update once `max_wait_time_ms` has passed without
/// its predecessor showing up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LateUpdatePolicy {
    #[default]
    ForceApply,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Receiving,
    Stable,
    GapDetected,
    SnapshotRequested,
    ConflictPending,
    Resolved,
    Terminated,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Trade,
    Orderbook,
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConflict {
    pub conflict_id: String,
    pub currency_pair: String,
    pub kind: ConflictKind,
    pub description: String,
    pub detected_ms: u64,
    pub involved_sources: SmallVec<[String; 2]>,
    pub resolved: bool,
    pub resolution: Option<String>,
    pub winner: Option<String>,
}

impl DataConflict {
    pub fn as_error(&self) -> PipelineError {
        PipelineError::DataConflict { pair: self.currency_pair.clone(), description: self.description.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub currency_pair: String,
    pub source: String,
    pub expected: u64,
    pub received: u64,
    pub detected_ms: u64,
    pub recovery_requested: bool,
    pub recovered: bool,
}

impl SequenceGap {
    pub fn as_error(&self) -> PipelineError {
        PipelineError::SequenceGap { pair: self.currency_pair.clone(), expected: self.expected, received: self.received }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub currency_pair: String,
    pub source: String,
    pub requested_ms: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterEvent {
    Trade(NormalizedTrade),
    Orderbook(NormalizedOrderbook),
    Conflict(DataConflict),
    Gap(SequenceGap),
    SnapshotRequested(SnapshotRequest),
    StateChanged { currency_pair: String, from: SyncState, to: SyncState },
}

/// Fire-and-forget channel back to the connection layer. Implementations must
/// not block.
pub trait RecoverySink: Send + Sync {
    fn request_snapshot(&self, request: SnapshotRequest);
}

/// Bounded crossbeam channel; requests are dropped when the receiver lags.
pub struct ChannelRecoverySink {
    tx: Sender<SnapshotRequest>,
}

impl ChannelRecoverySink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<SnapshotRequest>) {
        let (tx, rx) = crossbeam::channel::bounded(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl RecoverySink for ChannelRecoverySink {
    fn request_snapshot(&self, request: SnapshotRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(req)) => {
                warn!(pair = %req.currency_pair, "Recovery channel full, snapshot request dropped")
            }
            Err(TrySendError::Disconnected(_)) => debug!("Recovery channel closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeUpdaterSettings {
    pub allow_out_of_order_trades: bool,
    pub enable_duplicate_detection: bool,
    pub max_trade_id_cache: usize,
    // percent
    pub conflict_price_threshold_pct: f64,
    pub conflict_quantity_threshold_pct: f64,
}

impl Default for TradeUpdaterSettings {
    fn default() -> Self {
        Self {
            allow_out_of_order_trades: false,
            enable_duplicate_detection: true,
            max_trade_id_cache: 10_000,
            conflict_price_threshold_pct: 0.01,
            conflict_quantity_threshold_pct: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderbookUpdaterSettings {
    pub enable_snapshot_recovery: bool,
    pub enable_incremental_updates: bool,
    pub validate_integrity: bool,
    pub conflict_spread_threshold_pct: f64,
    // re-send an unanswered snapshot request after this long
    pub snapshot_timeout_ms: u64,
}

impl Default for OrderbookUpdaterSettings {
    fn default() -> Self {
        Self {
            enable_snapshot_recovery: true,
            enable_incremental_updates: true,
            validate_integrity: true,
            conflict_spread_threshold_pct: 1.0,
            snapshot_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    pub category: MessageCategory,
    pub update_order: UpdateOrder,
    pub conflict_resolution: ConflictResolution,
    pub enable_conflict_detection: bool,
    pub max_queue_size: usize,
    pub max_wait_time_ms: u64,
    pub late_update_policy: LateUpdatePolicy,
    pub max_sequence_gap: u64,
    pub conflict_window_ms: u64,
    // lower number wins; unknown sources rank last
    pub source_priorities: BTreeMap<String, i32>,
    pub conflict_history: usize,
    pub gap_history: usize,
    pub trades: TradeUpdaterSettings,
    pub orderbook: OrderbookUpdaterSettings,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self::trades()
    }
}

impl UpdaterConfig {
    pub fn trades() -> Self {
        Self {
            category: MessageCategory::Trade,
            update_order: UpdateOrder::ByTimestamp,
            conflict_resolution: ConflictResolution::LatestWins,
            enable_conflict_detection: true,
            max_queue_size: 1_000,
            max_wait_time_ms: 1_000,
            late_update_policy: LateUpdatePolicy::ForceApply,
            max_sequence_gap: 10,
            conflict_window_ms: 2_000,
            source_priorities: BTreeMap::new(),
            conflict_history: 50,
            gap_history: 50,
            trades: TradeUpdaterSettings::default(),
            orderbook: OrderbookUpdaterSettings::default(),
        }
    }

    pub fn orderbook() -> Self {
        Self {
            category: MessageCategory::Orderbook,
            update_order: UpdateOrder::BySequence,
            max_sequence_gap: 5,
            ..Self::trades()
        }
    }

    pub fn for_category(category: MessageCategory) -> Self {
        match category {
            MessageCategory::Trade => Self::trades(),
            MessageCategory::Orderbook => Self::orderbook(),
        }
    }

    pub fn source_rank(&self, source: &str) -> i64 {
        self.source_priorities.get(source).map_or(i64::MAX, |p| *p as i64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdaterStatistics {
    pub processed_count: u64,
    pub queued_count: u64,
    pub conflict_count: u64,
    pub out_of_order_count: u64,
    pub duplicate_count: u64,
    pub dropped_count: u64,
    pub average_latency_ms: f64,
    pub p99_latency_ms: u64,
}

/// Lock-per-pair table. The outer lock is only held to find or create an entry.
pub(crate) struct PairTable<S> {
    pairs: RwLock<AHashMap<String, Arc<Mutex<S>>>>,
}

impl<S: Default> PairTable<S> {
    fn new() -> Self {
        Self { pairs: RwLock::new(AHashMap::new()) }
    }

    fn entry(&self, pair: &str) -> Arc<Mutex<S>> {
        if let Some(state) = self.pairs.read().get(pair) {
            return Arc::clone(state);
        }
        let mut pairs = self.pairs.write();
        Arc::clone(pairs.entry(pair.to_string()).or_insert_with(|| Arc::new(Mutex::new(S::default()))))
    }

    fn get(&self, pair: &str) -> Option<Arc<Mutex<S>>> {
        self.pairs.read().get(pair).cloned()
    }

    fn all(&self) -> Vec<(String, Arc<Mutex<S>>)> {
        self.pairs.read().iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect()
    }

    fn clear(&self) {
        self.pairs.write().clear();
    }
}

/// Bookkeeping shared by both updater kinds: configuration, histories,
/// statistics and the recovery sink.
pub(crate) struct UpdaterCore {
    name: String,
    config: RwLock<UpdaterConfig>,
    conflicts: Mutex<BoundedHistory<DataConflict>>,
    gaps: Mutex<BoundedHistory<SequenceGap>>,
    sink: RwLock<Option<Arc<dyn RecoverySink>>>,
    next_conflict: AtomicU64,
    processed: AtomicU64,
    queued: AtomicU64,
    conflict_count: AtomicU64,
    out_of_order: AtomicU64,
    duplicates: AtomicU64,
    dropped: AtomicU64,
    latency: Mutex<LatencyTracker>,
    accepting: AtomicBool,
}

impl UpdaterCore {
    fn new(name: &str, config: UpdaterConfig) -> Self {
        Self {
            name: name.to_string(),
            conflicts: Mutex::new(BoundedHistory::new(config.conflict_history)),
            gaps: Mutex::new(BoundedHistory::new(config.gap_history)),
            config: RwLock::new(config),
            sink: RwLock::new(None),
            next_conflict: AtomicU64::new(1),
            processed: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            conflict_count: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency: Mutex::new(LatencyTracker::new()),
            accepting: AtomicBool::new(true),
        }
    }

    fn config(&self) -> UpdaterConfig {
        self.config.read().clone()
    }

    fn set_config(&self, config: UpdaterConfig) {
        self.conflicts.lock().set_capacity(config.conflict_history);
        self.gaps.lock().set_capacity(config.gap_history);
        *self.config.write() = config;
        debug!(updater = %self.name, "Updater reconfigured");
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    // Called once per attempt, successful or not
    fn record_attempt(&self, venue_ts_ms: u64, now_ms: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let latency = now_ms.saturating_sub(venue_ts_ms);
        self.latency.lock().record(latency);
        metrics::histogram!("mdpipe_updater_latency_ms", "updater" => self.name.clone()).record(latency as f64);
    }

    fn count_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn count_out_of_order(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }

    fn count_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    fn count_dropped(&self, what: &str, limit: usize) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        let err = PipelineError::CapacityExceeded { what: what.to_string(), limit };
        debug!(updater = %self.name, %err, "Dropped oldest queued update");
        metrics::counter!("mdpipe_updater_dropped_total", "updater" => self.name.clone()).increment(1);
    }

    fn raise_conflict(
        &self,
        pair: &str,
        kind: ConflictKind,
        description: String,
        sources: &[&str],
        now_ms: u64,
    ) -> DataConflict {
        let id = self.next_conflict.fetch_add(1, Ordering::Relaxed);
        self.conflict_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mdpipe_updater_conflicts_total", "updater" => self.name.clone()).increment(1);
        let conflict = DataConflict {
            conflict_id: format!("{}-c{id}", self.name),
            currency_pair: pair.to_string(),
            kind,
            description,
            detected_ms: now_ms,
            involved_sources: sources.iter().map(|s| s.to_string()).collect(),
            resolved: false,
            resolution: None,
            winner: None,
        };
        warn!(pair, conflict = %conflict.conflict_id, kind = ?kind, "{}", conflict.description);
        conflict
    }

    // Stores the final form of a conflict in the history
    fn store_conflict(&self, conflict: &DataConflict) {
        if let Some(pruned) = self.conflicts.lock().push(conflict.clone()) {
            if !pruned.resolved {
                debug!(conflict = %pruned.conflict_id, "Unresolved conflict pruned from history");
            }
        }
    }

    fn mark_conflict_resolved(&self, conflict_id: &str, resolution: &str, winner: Option<&str>) -> Option<DataConflict> {
        let mut history = self.conflicts.lock();
        let entry = history.iter_mut().find(|c| c.conflict_id == conflict_id)?;
        entry.resolved = true;
        entry.resolution = Some(resolution.to_string());
        entry.winner = winner.map(str::to_string);
        Some(entry.clone())
    }

    // Integrity conflicts are superseded by the snapshot that repairs the book
    fn supersede_conflicts(&self, pair: &str, kind: ConflictKind) {
        for c in self.conflicts.lock().iter_mut() {
            if c.currency_pair == pair && c.kind == kind && !c.resolved {
                c.resolved = true;
                c.resolution = Some("superseded by snapshot".into());
            }
        }
    }

    fn record_gap(&self, gap: &SequenceGap) {
        metrics::counter!("mdpipe_updater_gaps_total", "updater" => self.name.clone()).increment(1);
        warn!(pair = %gap.currency_pair, source = %gap.source, expected = gap.expected, received = gap.received, "Sequence gap");
        self.gaps.lock().push(gap.clone());
    }

    fn mark_gaps_recovered(&self, pair: &str, source: &str) {
        for g in self.gaps.lock().iter_mut() {
            if g.currency_pair == pair && g.source == source && !g.recovered {
                g.recovered = true;
            }
        }
    }

    fn request_snapshot(&self, pair: &str, source: &str, reason: &str, now_ms: u64) -> SnapshotRequest {
        let request = SnapshotRequest {
            currency_pair: pair.to_string(),
            source: source.to_string(),
            requested_ms: now_ms,
            reason: reason.to_string(),
        };
        if let Some(sink) = self.sink.read().as_ref() {
            sink.request_snapshot(request.clone());
        }
        info!(pair, source, reason, "Snapshot requested");
        metrics::counter!("mdpipe_snapshot_requests_total", "updater" => self.name.clone()).increment(1);
        request
    }

    fn conflicts(&self) -> Vec<DataConflict> {
        self.conflicts.lock().to_vec()
    }

    fn gaps(&self) -> Vec<SequenceGap> {
        self.gaps.lock().to_vec()
    }

    fn statistics(&self) -> UpdaterStatistics {
        let latency = self.latency.lock();
        UpdaterStatistics {
            processed_count: self.processed.load(Ordering::Relaxed),
            queued_count: self.queued.load(Ordering::Relaxed),
            conflict_count: self.conflict_count.load(Ordering::Relaxed),
            out_of_order_count: self.out_of_order.load(Ordering::Relaxed),
            duplicate_count: self.duplicates.load(Ordering::Relaxed),
            dropped_count: self.dropped.load(Ordering::Relaxed),
            average_latency_ms: latency.mean(),
            p99_latency_ms: latency.percentile(0.99),
        }
    }
}

/// Moves `state` to `to`, emitting an event when it actually changes.
pub(crate) fn transition(events: &mut Vec<UpdaterEvent>, pair: &str, state: &mut SyncState, to: SyncState) {
    if *state == to || *state == SyncState::Terminated {
        return;
    }
    debug!(pair, from = %state, to = %to, "State change");
    events.push(UpdaterEvent::StateChanged { currency_pair: pair.to_string(), from: *state, to });
    *state = to;
}

/// Release order for held updates under the configured `UpdateOrder`.
pub(crate) fn release_key(config: &UpdaterConfig, timestamp_ms: u64, sequence: Option<u64>, source: &str) -> (i64, String, i64) {
    let ts = timestamp_ms as i64;
    let seq_or_ts = sequence.map_or(ts, |s| s as i64);
    match config.update_order {
        UpdateOrder::ByTimestamp => (ts, source.to_string(), seq_or_ts),
        UpdateOrder::BySequence => (seq_or_ts, source.to_string(), ts),
        UpdateOrder::ByPriority => (config.source_rank(source), source.to_string(), seq_or_ts),
        UpdateOrder::BySource => (0, source.to_string(), seq_or_ts),
    }
}

/// Relative difference in percent, against the smaller magnitude.
pub(crate) fn pct_diff(a: f64, b: f64) -> f64 {
    let base = a.abs().min(b.abs());
    if base <= f64::EPSILON {
        return if (a - b).abs() <= f64::EPSILON { 0.0 } else { f64::INFINITY };
    }
    (a - b).abs() / base * 100.0
}

/// One updater node, either kind.
pub enum DataUpdater {
    Trades(TradesUpdater),
    Orderbook(OrderbookUpdater),
}

impl DataUpdater {
    pub fn new(name: &str, config: UpdaterConfig) -> Self {
        match config.category {
            MessageCategory::Trade => DataUpdater::Trades(TradesUpdater::new(name, config)),
            MessageCategory::Orderbook => DataUpdater::Orderbook(OrderbookUpdater::new(name, config)),
        }
    }

    fn core(&self) -> &UpdaterCore {
        match self {
            DataUpdater::Trades(u) => &u.core,
            DataUpdater::Orderbook(u) => &u.core,
        }
    }

    pub fn name(&self) -> &str {
        &self.core().name
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            DataUpdater::Trades(_) => MessageCategory::Trade,
            DataUpdater::Orderbook(_) => MessageCategory::Orderbook,
        }
    }

    /// Records of the wrong category are counted and ignored.
    pub fn apply(&self, record: Normalized, now_ms: u64) -> Vec<UpdaterEvent> {
        match (self, record) {
            (DataUpdater::Trades(u), Normalized::Trade(t)) => u.apply(t, now_ms),
            (DataUpdater::Orderbook(u), Normalized::Orderbook(b)) => u.apply(b, now_ms),
            (_, other) => {
                warn!(updater = %self.name(), category = %other.category(), "Record of the wrong category ignored");
                Vec::new()
            }
        }
    }

    pub fn tick(&self, now_ms: u64) -> Vec<UpdaterEvent> {
        match self {
            DataUpdater::Trades(u) => u.tick(now_ms),
            DataUpdater::Orderbook(u) => u.tick(now_ms),
        }
    }

    pub fn resolve_conflict(&self, conflict_id: &str, winner_source: &str, now_ms: u64) -> PipelineResult<Vec<UpdaterEvent>> {
        match self {
            DataUpdater::Trades(u) => u.resolve_conflict(conflict_id, winner_source, now_ms),
            DataUpdater::Orderbook(u) => u.resolve_conflict(conflict_id, winner_source, now_ms),
        }
    }

    pub fn state(&self, pair: &str) -> SyncState {
        match self {
            DataUpdater::Trades(u) => u.state(pair),
            DataUpdater::Orderbook(u) => u.state(pair),
        }
    }

    pub fn set_recovery_sink(&self, sink: Arc<dyn RecoverySink>) {
        *self.core().sink.write() = Some(sink);
    }

    pub fn config(&self) -> UpdaterConfig {
        self.core().config()
    }

    /// The category is fixed at construction; a config for the other category is refused.
    pub fn set_config(&self, config: UpdaterConfig) -> PipelineResult<()> {
        if config.category != self.category() {
            return Err(PipelineError::Config(format!(
                "cannot turn a {} updater into a {} updater",
                self.category(),
                config.category
            )));
        }
        self.core().set_config(config);
        Ok(())
    }

    pub fn conflicts(&self) -> Vec<DataConflict> {
        self.core().conflicts()
    }

    pub fn gaps(&self) -> Vec<SequenceGap> {
        self.core().gaps()
    }

    pub fn statistics(&self) -> UpdaterStatistics {
        self.core().statistics()
    }

    pub fn shutdown(&self) -> Vec<UpdaterEvent> {
        match self {
            DataUpdater::Trades(u) => u.shutdown(),
            DataUpdater::Orderbook(u) => u.shutdown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pct_diff() {
        assert_eq!(pct_diff(100.0, 100.0), 0.0);
        assert!((pct_diff(100.0, 101.0) - 1.0).abs() < 1e-9);
        assert_eq!(pct_diff(0.0, 1.0), f64::INFINITY);
    }

    #[test]
    fn test_transition_emits_only_on_change() {
        let mut events = Vec::new();
        let mut state = SyncState::Idle;
        transition(&mut events, "BTC/USD", &mut state, SyncState::Receiving);
        transition(&mut events, "BTC/USD", &mut state, SyncState::Receiving);
        assert_eq!(events.len(), 1);
        state = SyncState::Terminated;
        transition(&mut events, "BTC/USD", &mut state, SyncState::Receiving);
        assert_eq!(state, SyncState::Terminated);
    }

    #[test]
    fn test_channel_sink_never_blocks() {
        let (sink, rx) = ChannelRecoverySink::bounded(1);
        let req = SnapshotRequest {
            currency_pair: "BTC/USD".into(),
            source: "a".into(),
            requested_ms: 1,
            reason: "gap".into(),
        };
        sink.request_snapshot(req.clone());
        sink.request_snapshot(req.clone());
        assert_eq!(rx.try_recv().unwrap(), req);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_wrong_category_config_refused() {
        let updater = DataUpdater::new("u", UpdaterConfig::trades());
        assert!(updater.set_config(UpdaterConfig::orderbook()).is_err());
        assert!(updater.set_config(UpdaterConfig::trades()).is_ok());
    }
}
