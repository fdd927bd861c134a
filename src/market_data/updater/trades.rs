use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, instrument, trace};

use super::{
    pct_diff, release_key, transition, ConflictKind, ConflictResolution, LateUpdatePolicy, PairTable, SequenceCheck,
    SequenceCursor, SequenceGap, SyncState, UpdaterConfig, UpdaterCore, UpdaterEvent,
};
use crate::engine::queue::RecencyMap;
use crate::engine::types::{NormalizedTrade, PipelineError, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeMetrics {
    pub trade_count: u64,
    pub total_volume: f64,
    pub average_trade_size: f64,
    pub trades_by_pair: BTreeMap<String, u64>,
    pub trades_by_exchange: BTreeMap<String, u64>,
}

struct HeldTrade {
    trade: NormalizedTrade,
    held_since_ms: u64,
}

struct PendingConflict {
    candidates: SmallVec<[NormalizedTrade; 2]>,
}

struct TradePairState {
    state: SyncState,
    cursors: AHashMap<String, SequenceCursor>,
    // trade id -> accepted record
    seen: RecencyMap<String, NormalizedTrade>,
    last_trade: Option<NormalizedTrade>,
    held: Vec<HeldTrade>,
    pending: AHashMap<String, PendingConflict>,
}

impl Default for TradePairState {
    fn default() -> Self {
        Self {
            state: SyncState::Idle,
            cursors: AHashMap::new(),
            seen: RecencyMap::new(10_000),
            last_trade: None,
            held: Vec::new(),
            pending: AHashMap::new(),
        }
    }
}

pub struct TradesUpdater {
    pub(super) core: UpdaterCore,
    pairs: PairTable<TradePairState>,
    metrics: parking_lot::Mutex<TradeMetrics>,
}

impl TradesUpdater {
    pub fn new(name: &str, config: UpdaterConfig) -> Self {
        Self { core: UpdaterCore::new(name, config), pairs: PairTable::new(), metrics: parking_lot::Mutex::new(TradeMetrics::default()) }
    }

    #[instrument(level = "debug", skip_all, fields(updater = %self.core.name, pair = %trade.currency_pair, id = %trade.trade_id))]
    pub fn apply(&self, trade: NormalizedTrade, now_ms: u64) -> Vec<UpdaterEvent> {
        let mut events = Vec::new();
        if !self.core.is_accepting() {
            return events;
        }
        self.core.record_attempt(trade.timestamp_ms, now_ms);
        let config = self.core.config();
        let slot = self.pairs.entry(&trade.currency_pair);
        let mut st = slot.lock();
        if st.state == SyncState::Terminated {
            return events;
        }
        let pair = trade.currency_pair.clone();
        if st.state == SyncState::Idle {
            transition(&mut events, &pair, &mut st.state, SyncState::Receiving);
        }
        st.seen.set_capacity(config.trades.max_trade_id_cache);

        if config.trades.enable_duplicate_detection {
            if let Some(existing) = st.seen.get(&trade.trade_id).cloned() {
                self.advance_cursor(&mut st, &trade);
                if existing.source == trade.source
                    || !config.enable_conflict_detection
                    || !Self::disagrees(&config, &existing, &trade)
                {
                    self.core.count_duplicate();
                    trace!(source = %trade.source, "Duplicate trade ignored");
                } else {
                    self.handle_conflict(&mut st, &config, existing, trade, now_ms, &mut events);
                }
                self.settle(&pair, &mut st, &mut events);
                return events;
            }
        }

        let cursor = st.cursors.get(&trade.source).copied().unwrap_or_default();
        let check = match trade.sequence {
            Some(seq) => cursor.check(seq, config.max_sequence_gap),
            None => cursor.check_time(trade.timestamp_ms),
        };
        match check {
            SequenceCheck::First | SequenceCheck::InOrder => self.accept(&mut st, trade, &mut events),
            SequenceCheck::Duplicate => {
                // same sequence, different trade id: the venue replayed under a new id
                self.core.count_duplicate();
            }
            SequenceCheck::Behind { last } => {
                self.core.count_out_of_order();
                if config.trades.allow_out_of_order_trades {
                    self.accept(&mut st, trade, &mut events);
                } else {
                    debug!(last, "Late trade discarded");
                }
            }
            SequenceCheck::Ahead { expected } => {
                self.core.count_out_of_order();
                if config.trades.allow_out_of_order_trades {
                    self.accept(&mut st, trade, &mut events);
                } else {
                    trace!(expected, "Trade held until its predecessor arrives");
                    self.hold(&mut st, &config, trade, now_ms);
                }
            }
            SequenceCheck::Gap { expected } => {
                // trades cannot be rebuilt from a snapshot: record, accept, move on
                let gap = SequenceGap {
                    currency_pair: pair.clone(),
                    source: trade.source.clone(),
                    expected,
                    received: trade.sequence.unwrap_or(expected),
                    detected_ms: now_ms,
                    recovery_requested: false,
                    recovered: false,
                };
                self.core.record_gap(&gap);
                events.push(UpdaterEvent::Gap(gap));
                transition(&mut events, &pair, &mut st.state, SyncState::GapDetected);
                // anything held for the skipped range can never be released in order now
                let source = trade.source.clone();
                let received = trade.sequence.unwrap_or(expected);
                self.accept(&mut st, trade, &mut events);
                self.drop_held_before(&mut st, &source, received);
            }
        }

        self.release_held(&mut st, &config, &mut events);
        self.settle(&pair, &mut st, &mut events);
        events
    }

    fn disagrees(config: &UpdaterConfig, a: &NormalizedTrade, b: &NormalizedTrade) -> bool {
        pct_diff(a.price, b.price) > config.trades.conflict_price_threshold_pct
            || pct_diff(a.quantity, b.quantity) > config.trades.conflict_quantity_threshold_pct
            || a.side != b.side
    }

    fn advance_cursor(&self, st: &mut TradePairState, trade: &NormalizedTrade) {
        st.cursors.entry(trade.source.clone()).or_default().advance(trade.sequence, trade.timestamp_ms);
    }

    fn accept(&self, st: &mut TradePairState, trade: NormalizedTrade, events: &mut Vec<UpdaterEvent>) {
        self.advance_cursor(st, &trade);
        self.record_metrics(&trade);
        self.commit(st, trade, events);
    }

    // Makes `trade` the authoritative record for its id and emits it
    fn commit(&self, st: &mut TradePairState, trade: NormalizedTrade, events: &mut Vec<UpdaterEvent>) {
        st.seen.insert(trade.trade_id.clone(), trade.clone());
        let newer = st.last_trade.as_ref().map_or(true, |last| {
            trade.timestamp_ms >= last.timestamp_ms || last.trade_id == trade.trade_id
        });
        if newer {
            st.last_trade = Some(trade.clone());
        }
        events.push(UpdaterEvent::Trade(trade));
    }

    fn record_metrics(&self, trade: &NormalizedTrade) {
        let mut m = self.metrics.lock();
        m.trade_count += 1;
        m.total_volume += trade.quantity;
        m.average_trade_size = m.total_volume / m.trade_count as f64;
        *m.trades_by_pair.entry(trade.currency_pair.clone()).or_insert(0) += 1;
        *m.trades_by_exchange.entry(trade.exchange.clone()).or_insert(0) += 1;
        metrics::counter!("mdpipe_trades_merged_total", "pair" => trade.currency_pair.clone()).increment(1);
    }

    fn hold(&self, st: &mut TradePairState, config: &UpdaterConfig, trade: NormalizedTrade, now_ms: u64) {
        if st.held.iter().any(|h| h.trade.trade_id == trade.trade_id) {
            self.core.count_duplicate();
            trace!(source = %trade.source, "Trade already held");
            return;
        }
        let limit = config.max_queue_size.max(1);
        while st.held.len() >= limit {
            st.held.remove(0);
            self.core.count_dropped("held trades", limit);
        }
        self.core.count_queued();
        st.held.push(HeldTrade { trade, held_since_ms: now_ms });
    }

    fn drop_held_before(&self, st: &mut TradePairState, source: &str, sequence: u64) {
        let before = st.held.len();
        st.held.retain(|h| h.trade.source != source || h.trade.sequence.map_or(true, |s| s > sequence));
        for _ in st.held.len()..before {
            self.core.count_out_of_order();
        }
    }

    // Applies held trades whose predecessor has now been accepted, until none is ready
    fn release_held(&self, st: &mut TradePairState, config: &UpdaterConfig, events: &mut Vec<UpdaterEvent>) {
        loop {
            let cursors = &st.cursors;
            let (mut ready, waiting): (Vec<HeldTrade>, Vec<HeldTrade>) =
                std::mem::take(&mut st.held).into_iter().partition(|h| {
                    let expected = cursors.get(&h.trade.source).and_then(|c| c.expected());
                    h.trade.sequence.is_some() && h.trade.sequence == expected
                });
            st.held = waiting;
            if ready.is_empty() {
                break;
            }
            ready.sort_by_key(|h| release_key(config, h.trade.timestamp_ms, h.trade.sequence, &h.trade.source));
            for held in ready {
                // an earlier release may have moved the cursor past this one
                let expected = st.cursors.get(&held.trade.source).and_then(|c| c.expected());
                if st.seen.contains(&held.trade.trade_id) || held.trade.sequence != expected {
                    self.core.count_duplicate();
                    continue;
                }
                self.accept(st, held.trade, events);
            }
        }
    }

    fn handle_conflict(
        &self,
        st: &mut TradePairState,
        config: &UpdaterConfig,
        existing: NormalizedTrade,
        incoming: NormalizedTrade,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let pair = incoming.currency_pair.clone();
        let already_pending = st.pending.values().any(|p| {
            p.candidates.iter().any(|c| c.trade_id == incoming.trade_id && c.source == incoming.source)
        });
        if already_pending {
            self.core.count_duplicate();
            trace!(source = %incoming.source, "Trade already awaiting review");
            return;
        }
        let description = format!(
            "trade {} disagrees: {} {}@{} from {} vs {} {}@{} from {}",
            incoming.trade_id,
            existing.side,
            existing.quantity,
            existing.price,
            existing.source,
            incoming.side,
            incoming.quantity,
            incoming.price,
            incoming.source
        );
        let mut conflict =
            self.core.raise_conflict(&pair, ConflictKind::Trade, description, &[&existing.source, &incoming.source], now_ms);
        transition(events, &pair, &mut st.state, SyncState::ConflictPending);

        // merging two trades has no meaning; fall back to the newest record
        let policy = match config.conflict_resolution {
            ConflictResolution::Merge => ConflictResolution::LatestWins,
            other => other,
        };
        let incoming_wins = match policy {
            ConflictResolution::SourcePriority => {
                config.source_rank(&incoming.source) < config.source_rank(&existing.source)
            }
            ConflictResolution::ManualReview => {
                self.core.store_conflict(&conflict);
                st.pending.insert(
                    conflict.conflict_id.clone(),
                    PendingConflict { candidates: SmallVec::from_vec(vec![existing, incoming]) },
                );
                events.push(UpdaterEvent::Conflict(conflict));
                return;
            }
            _ => incoming.timestamp_ms >= existing.timestamp_ms,
        };

        let winner = if incoming_wins { incoming.source.clone() } else { existing.source.clone() };
        conflict.resolved = true;
        conflict.resolution = Some(format!("{policy:?}"));
        conflict.winner = Some(winner);
        self.core.store_conflict(&conflict);
        events.push(UpdaterEvent::Conflict(conflict));
        if incoming_wins {
            self.commit(st, incoming, events);
        }
        transition(events, &pair, &mut st.state, SyncState::Resolved);
    }

    // Picks the steady state once the current attempt is done
    fn settle(&self, pair: &str, st: &mut TradePairState, events: &mut Vec<UpdaterEvent>) {
        if st.state == SyncState::Terminated {
            return;
        }
        if !st.pending.is_empty() {
            transition(events, pair, &mut st.state, SyncState::ConflictPending);
            return;
        }
        if matches!(st.state, SyncState::Resolved | SyncState::GapDetected | SyncState::ConflictPending) {
            transition(events, pair, &mut st.state, SyncState::Receiving);
        }
        let target = if st.held.is_empty() { SyncState::Stable } else { SyncState::Receiving };
        transition(events, pair, &mut st.state, target);
    }

    /// Releases held trades that waited longer than `max_wait_time_ms`.
    pub fn tick(&self, now_ms: u64) -> Vec<UpdaterEvent> {
        let mut events = Vec::new();
        if !self.core.is_accepting() {
            return events;
        }
        let config = self.core.config();
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            if st.held.is_empty() {
                continue;
            }
            let (mut expired, waiting): (Vec<HeldTrade>, Vec<HeldTrade>) = std::mem::take(&mut st.held)
                .into_iter()
                .partition(|h| now_ms.saturating_sub(h.held_since_ms) >= config.max_wait_time_ms);
            st.held = waiting;
            if expired.is_empty() {
                continue;
            }
            expired.sort_by_key(|h| release_key(&config, h.trade.timestamp_ms, h.trade.sequence, &h.trade.source));
            for held in expired {
                match config.late_update_policy {
                    LateUpdatePolicy::ForceApply => {
                        debug!(pair = %pair, id = %held.trade.trade_id, "Force-applying held trade");
                        self.accept(&mut st, held.trade, &mut events);
                    }
                    LateUpdatePolicy::Discard => {
                        debug!(pair = %pair, id = %held.trade.trade_id, "Discarding held trade");
                        self.core.count_dropped("expired held trades", config.max_queue_size);
                    }
                }
            }
            self.release_held(&mut st, &config, &mut events);
            self.settle(&pair, &mut st, &mut events);
        }
        events
    }

    /// Settles a conflict left for manual review in favour of `winner_source`.
    pub fn resolve_conflict(&self, conflict_id: &str, winner_source: &str, _now_ms: u64) -> PipelineResult<Vec<UpdaterEvent>> {
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            let Some(pending) = st.pending.get(conflict_id) else {
                continue;
            };
            let Some(winner) = pending.candidates.iter().find(|t| t.source == winner_source).cloned() else {
                return Err(PipelineError::DataConflict {
                    pair,
                    description: format!("{winner_source} is not part of conflict {conflict_id}"),
                });
            };
            st.pending.remove(conflict_id);

            let mut events = Vec::new();
            if let Some(resolved) = self.core.mark_conflict_resolved(conflict_id, "manual review", Some(winner_source)) {
                events.push(UpdaterEvent::Conflict(resolved));
            }
            let current_source = st.seen.get(&winner.trade_id).map(|t| t.source.clone());
            if current_source.as_deref() != Some(winner_source) {
                self.commit(&mut st, winner, &mut events);
            }
            transition(&mut events, &pair, &mut st.state, SyncState::Resolved);
            self.settle(&pair, &mut st, &mut events);
            return Ok(events);
        }
        Err(PipelineError::DataConflict {
            pair: String::new(),
            description: format!("no pending conflict {conflict_id}"),
        })
    }

    pub fn state(&self, pair: &str) -> SyncState {
        self.pairs.get(pair).map_or(SyncState::Idle, |slot| slot.lock().state)
    }

    pub fn last_trade(&self, pair: &str) -> Option<NormalizedTrade> {
        self.pairs.get(pair).and_then(|slot| slot.lock().last_trade.clone())
    }

    /// The authoritative record for a trade id, if still cached.
    pub fn trade(&self, pair: &str, trade_id: &str) -> Option<NormalizedTrade> {
        self.pairs.get(pair).and_then(|slot| slot.lock().seen.get(&trade_id.to_string()).cloned())
    }

    pub fn held_count(&self, pair: &str) -> usize {
        self.pairs.get(pair).map_or(0, |slot| slot.lock().held.len())
    }

    pub fn metrics(&self) -> TradeMetrics {
        self.metrics.lock().clone()
    }

    /// Stops intake, drops held trades and cached ids, and terminates every pair.
    pub fn shutdown(&self) -> Vec<UpdaterEvent> {
        self.core.accepting.store(false, std::sync::atomic::Ordering::Release);
        let mut events = Vec::new();
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            st.held.clear();
            st.pending.clear();
            st.seen.clear();
            transition(&mut events, &pair, &mut st.state, SyncState::Terminated);
        }
        debug!(updater = %self.core.name, "Trades updater shut down");
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::Side;

    const NOW: u64 = 1_690_000_001_000;

    fn trade(id: &str, source: &str, price: f64, seq: Option<u64>, ts: u64) -> NormalizedTrade {
        NormalizedTrade {
            trade_id: id.into(),
            currency_pair: "BTC/USD".into(),
            exchange: source.into(),
            price,
            quantity: 1.0,
            side: Side::BUY,
            timestamp_ms: ts,
            received_ms: NOW,
            source: source.into(),
            original_message_id: id.into(),
            sequence: seq,
            order_id: None,
            fee: None,
            fee_currency: None,
            is_maker: None,
        }
    }

    fn merged(events: &[UpdaterEvent]) -> Vec<&NormalizedTrade> {
        events
            .iter()
            .filter_map(|e| match e {
                UpdaterEvent::Trade(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn priorities() -> UpdaterConfig {
        let mut cfg = UpdaterConfig::trades();
        cfg.conflict_resolution = ConflictResolution::SourcePriority;
        cfg.source_priorities.insert("primary".into(), 1);
        cfg.source_priorities.insert("backup".into(), 2);
        cfg
    }

    #[test]
    fn test_first_trade_goes_stable() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        let events = u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW);
        assert_eq!(merged(&events).len(), 1);
        assert_eq!(u.state("BTC/USD"), SyncState::Stable);
        assert_eq!(u.last_trade("BTC/USD").unwrap().trade_id, "T1");
    }

    #[test]
    fn test_replay_is_idempotent() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
        let before = u.last_trade("BTC/USD");
        let events = u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
        assert!(events.is_empty());
        assert_eq!(u.last_trade("BTC/USD"), before);
        assert_eq!(u.core.statistics().duplicate_count, 1);
    }

    #[test]
    fn test_source_priority_lower_number_wins_either_order() {
        for backup_first in [true, false] {
            let u = TradesUpdater::new("t", priorities());
            let primary = trade("T1", "primary", 100.0, None, NOW - 10);
            let backup = trade("T1", "backup", 101.0, None, NOW - 5);
            let (first, second) = if backup_first { (backup, primary.clone()) } else { (primary.clone(), backup) };
            u.apply(first, NOW);
            let events = u.apply(second, NOW);

            let conflict = events.iter().find_map(|e| match e {
                UpdaterEvent::Conflict(c) => Some(c.clone()),
                _ => None,
            });
            let conflict = conflict.expect("conflict raised");
            assert!(conflict.resolved);
            assert_eq!(conflict.winner.as_deref(), Some("primary"));
            assert_eq!(u.trade("BTC/USD", "T1").unwrap(), primary);
            assert_eq!(u.state("BTC/USD"), SyncState::Stable);
        }
    }

    #[test]
    fn test_agreeing_sources_are_duplicates_not_conflicts() {
        let u = TradesUpdater::new("t", priorities());
        u.apply(trade("T1", "primary", 100.0, None, NOW - 10), NOW);
        let events = u.apply(trade("T1", "backup", 100.0, None, NOW - 10), NOW);
        assert!(events.is_empty());
        assert_eq!(u.core.statistics().conflict_count, 0);
    }

    #[test]
    fn test_latest_wins_and_merge_fallback() {
        for policy in [ConflictResolution::LatestWins, ConflictResolution::Merge] {
            let mut cfg = UpdaterConfig::trades();
            cfg.conflict_resolution = policy;
            let u = TradesUpdater::new("t", cfg);
            u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW);
            let events = u.apply(trade("T1", "b", 105.0, None, NOW - 5), NOW);
            assert_eq!(merged(&events).len(), 1);
            assert_eq!(u.trade("BTC/USD", "T1").unwrap().source, "b");
        }
    }

    #[test]
    fn test_manual_review_waits_for_resolution() {
        let mut cfg = UpdaterConfig::trades();
        cfg.conflict_resolution = ConflictResolution::ManualReview;
        let u = TradesUpdater::new("t", cfg);
        u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW);
        u.apply(trade("T1", "b", 105.0, None, NOW - 5), NOW);
        assert_eq!(u.state("BTC/USD"), SyncState::ConflictPending);
        let conflict = u.core.conflicts().pop().unwrap();
        assert!(!conflict.resolved);

        // other trades keep flowing while the conflict waits
        let events = u.apply(trade("T2", "a", 100.0, None, NOW - 4), NOW);
        assert_eq!(merged(&events).len(), 1);
        assert_eq!(u.state("BTC/USD"), SyncState::ConflictPending);

        assert!(u.resolve_conflict(&conflict.conflict_id, "nobody", NOW).is_err());
        let events = u.resolve_conflict(&conflict.conflict_id, "b", NOW).unwrap();
        assert_eq!(merged(&events).len(), 1);
        assert_eq!(u.trade("BTC/USD", "T1").unwrap().source, "b");
        assert_eq!(u.state("BTC/USD"), SyncState::Stable);
        assert!(u.core.conflicts().iter().all(|c| c.resolved));
        assert!(u.resolve_conflict(&conflict.conflict_id, "b", NOW).is_err());
    }

    #[test]
    fn test_ahead_trade_held_until_predecessor() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
        let events = u.apply(trade("T3", "a", 100.0, Some(3), NOW - 8), NOW);
        assert!(merged(&events).is_empty());
        assert_eq!(u.held_count("BTC/USD"), 1);
        assert_eq!(u.state("BTC/USD"), SyncState::Receiving);

        let events = u.apply(trade("T2", "a", 100.0, Some(2), NOW - 9), NOW);
        let ids: Vec<_> = merged(&events).iter().map(|t| t.trade_id.clone()).collect();
        assert_eq!(ids, vec!["T2", "T3"]);
        assert_eq!(u.state("BTC/USD"), SyncState::Stable);
    }

    #[test]
    fn test_replayed_held_trade_released_once() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        let mut events = u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
        events.extend(u.apply(trade("T3", "a", 100.0, Some(3), NOW - 8), NOW));
        events.extend(u.apply(trade("T3", "a", 100.0, Some(3), NOW - 8), NOW));
        assert_eq!(u.held_count("BTC/USD"), 1);
        events.extend(u.apply(trade("T2", "a", 100.0, Some(2), NOW - 9), NOW));

        let ids: Vec<_> = merged(&events).iter().map(|t| t.trade_id.clone()).collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
        assert_eq!(u.held_count("BTC/USD"), 0);
        assert_eq!(u.core.statistics().duplicate_count, 1);
    }

    #[test]
    fn test_replay_during_manual_review_keeps_one_conflict() {
        let mut cfg = UpdaterConfig::trades();
        cfg.conflict_resolution = ConflictResolution::ManualReview;
        let u = TradesUpdater::new("t", cfg);
        u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW);
        u.apply(trade("T1", "b", 150.0, None, NOW - 5), NOW);
        let events = u.apply(trade("T1", "b", 150.0, None, NOW - 5), NOW);

        assert!(events.iter().all(|e| !matches!(e, UpdaterEvent::Conflict(_))));
        assert_eq!(u.core.conflicts().len(), 1);
        assert_eq!(u.core.statistics().conflict_count, 1);
        assert_eq!(u.state("BTC/USD"), SyncState::ConflictPending);
    }

    #[test]
    fn test_held_trade_force_applied_or_discarded_on_tick() {
        for policy in [LateUpdatePolicy::ForceApply, LateUpdatePolicy::Discard] {
            let mut cfg = UpdaterConfig::trades();
            cfg.late_update_policy = policy;
            cfg.max_wait_time_ms = 100;
            let u = TradesUpdater::new("t", cfg);
            u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
            u.apply(trade("T3", "a", 100.0, Some(3), NOW - 8), NOW);
            assert!(u.tick(NOW + 50).is_empty());
            let events = u.tick(NOW + 100);
            let applied = merged(&events).len();
            match policy {
                LateUpdatePolicy::ForceApply => assert_eq!(applied, 1),
                LateUpdatePolicy::Discard => assert_eq!(applied, 0),
            }
            assert_eq!(u.held_count("BTC/USD"), 0);
        }
    }

    #[test]
    fn test_trade_gap_is_recorded_and_accepted() {
        let mut cfg = UpdaterConfig::trades();
        cfg.max_sequence_gap = 2;
        let u = TradesUpdater::new("t", cfg);
        u.apply(trade("T1", "a", 100.0, Some(1), NOW - 10), NOW);
        let events = u.apply(trade("T9", "a", 100.0, Some(9), NOW - 5), NOW);
        assert!(events.iter().any(|e| matches!(e, UpdaterEvent::Gap(g) if g.expected == 2 && g.received == 9)));
        assert_eq!(merged(&events).len(), 1);
        assert_eq!(u.state("BTC/USD"), SyncState::Stable);
        assert_eq!(u.core.gaps().len(), 1);
    }

    #[test]
    fn test_late_trade_policy() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        u.apply(trade("T2", "a", 100.0, None, NOW - 5), NOW);
        assert!(u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW).is_empty());

        let mut cfg = UpdaterConfig::trades();
        cfg.trades.allow_out_of_order_trades = true;
        let lenient = TradesUpdater::new("t", cfg);
        lenient.apply(trade("T2", "a", 100.0, None, NOW - 5), NOW);
        assert_eq!(merged(&lenient.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW)).len(), 1);
        // last trade stays the newest
        assert_eq!(lenient.last_trade("BTC/USD").unwrap().trade_id, "T2");
        assert_eq!(lenient.core.statistics().out_of_order_count, 1);
    }

    #[test]
    fn test_metrics_and_shutdown() {
        let u = TradesUpdater::new("t", UpdaterConfig::trades());
        u.apply(trade("T1", "a", 100.0, None, NOW - 10), NOW);
        u.apply(trade("T2", "b", 100.0, None, NOW - 9), NOW);
        let m = u.metrics();
        assert_eq!(m.trade_count, 2);
        assert_eq!(m.trades_by_exchange.len(), 2);
        assert_eq!(m.average_trade_size, 1.0);

        let events = u.shutdown();
        assert_eq!(events.len(), 1);
        assert_eq!(u.state("BTC/USD"), SyncState::Terminated);
        assert!(u.apply(trade("T3", "a", 100.0, None, NOW), NOW).is_empty());
    }
}
