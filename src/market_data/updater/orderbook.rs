use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use tracing::{debug, instrument, trace};

use super::{
    pct_diff, release_key, transition, ConflictKind, ConflictResolution, LateUpdatePolicy, PairTable, SequenceCheck,
    SequenceCursor, SequenceGap, SyncState, UpdaterConfig, UpdaterCore, UpdaterEvent,
};
use crate::engine::book::LevelBook;
use crate::engine::types::{NormalizedOrderbook, PipelineError, PipelineResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderbookMetrics {
    pub snapshots_received: u64,
    pub incrementals_received: u64,
    pub average_spread: f64,
    pub updates_by_pair: BTreeMap<String, u64>,
    // last published spread
    pub spread_by_pair: BTreeMap<String, f64>,
    #[serde(skip)]
    spread_samples: u64,
}

/// One venue's view of the pair. The header is the last applied record with
/// its levels stripped; it carries the metadata for rendering.
struct SourceBook {
    book: LevelBook,
    cursor: SequenceCursor,
    header: NormalizedOrderbook,
}

struct Recovery {
    requested_ms: u64,
    buffer: Vec<NormalizedOrderbook>,
}

struct HeldUpdate {
    update: NormalizedOrderbook,
    held_since_ms: u64,
}

struct PendingConflict {
    sources: SmallVec<[String; 2]>,
}

#[derive(Default)]
struct BookPairState {
    state: SyncState,
    sources: AHashMap<String, SourceBook>,
    // last published book
    authoritative: Option<NormalizedOrderbook>,
    // keyed by source
    recovering: AHashMap<String, Recovery>,
    held: Vec<HeldUpdate>,
    pending: AHashMap<String, PendingConflict>,
}

fn strip(mut ob: NormalizedOrderbook) -> NormalizedOrderbook {
    ob.bids = Vec::new();
    ob.asks = Vec::new();
    ob
}

fn render(book: &LevelBook, header: &NormalizedOrderbook) -> NormalizedOrderbook {
    let (bids, asks) = book.to_levels();
    let mut ob = NormalizedOrderbook { bids, asks, ..header.clone() };
    ob.refresh_derived();
    ob
}

pub struct OrderbookUpdater {
    pub(super) core: UpdaterCore,
    pairs: PairTable<BookPairState>,
    metrics: Mutex<OrderbookMetrics>,
}

impl OrderbookUpdater {
    pub fn new(name: &str, config: UpdaterConfig) -> Self {
        Self { core: UpdaterCore::new(name, config), pairs: PairTable::new(), metrics: Mutex::new(OrderbookMetrics::default()) }
    }

    #[instrument(level = "debug", skip_all, fields(updater = %self.core.name, pair = %update.currency_pair, seq = ?update.sequence, snapshot = update.is_snapshot))]
    pub fn apply(&self, update: NormalizedOrderbook, now_ms: u64) -> Vec<UpdaterEvent> {
        let mut events = Vec::new();
        if !self.core.is_accepting() {
            return events;
        }
        self.core.record_attempt(update.timestamp_ms, now_ms);
        {
            let mut m = self.metrics.lock();
            if update.is_snapshot {
                m.snapshots_received += 1;
            } else {
                m.incrementals_received += 1;
            }
        }
        let config = self.core.config();
        let pair = update.currency_pair.clone();
        let slot = self.pairs.entry(&pair);
        let mut st = slot.lock();
        if st.state == SyncState::Terminated {
            return events;
        }
        if st.state == SyncState::Idle {
            transition(&mut events, &pair, &mut st.state, SyncState::Receiving);
        }
        if update.is_snapshot {
            self.on_snapshot(&pair, &mut st, &config, update, now_ms, &mut events);
        } else {
            self.on_incremental(&pair, &mut st, &config, update, now_ms, &mut events);
        }
        self.release_held(&pair, &mut st, &config, now_ms, &mut events);
        self.settle(&pair, &mut st, &mut events);
        events
    }

    fn on_snapshot(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        update: NormalizedOrderbook,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let source = update.source.clone();
        if let Some(existing) = st.sources.get(&source) {
            let h = &existing.header;
            if h.is_snapshot && h.original_message_id == update.original_message_id && h.sequence == update.sequence {
                self.core.count_duplicate();
                trace!(source = %source, "Snapshot replay ignored");
                return;
            }
        }

        let candidate = LevelBook::from_orderbook(&update);
        if config.orderbook.validate_integrity {
            if let Err(err) = candidate.check_integrity() {
                self.integrity_violation(pair, st, config, &source, err, now_ms, events);
                return;
            }
        }
        let snapshot_seq = update.sequence;
        let mut cursor = SequenceCursor::default();
        cursor.reset(update.sequence, update.timestamp_ms);
        st.sources.insert(source.clone(), SourceBook { book: candidate, cursor, header: strip(update) });
        self.publish(pair, st, config, &source, now_ms, events);

        let Some(recovery) = st.recovering.remove(&source) else {
            return;
        };
        self.core.mark_gaps_recovered(pair, &source);
        self.core.supersede_conflicts(pair, ConflictKind::Integrity);
        debug!(pair, source = %source, buffered = recovery.buffer.len(), "Snapshot received, replaying buffered updates");
        if st.recovering.is_empty() && st.pending.is_empty() {
            transition(events, pair, &mut st.state, SyncState::Receiving);
        }
        let mut buffered = recovery.buffer;
        buffered.sort_by_key(|u| (u.sequence.unwrap_or(0), u.timestamp_ms));
        for u in buffered {
            if let (Some(seq), Some(snap)) = (u.sequence, snapshot_seq) {
                if seq <= snap {
                    self.core.count_duplicate();
                    continue;
                }
            }
            self.on_incremental(pair, st, config, u, now_ms, events);
        }
    }

    fn on_incremental(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        update: NormalizedOrderbook,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let source = update.source.clone();
        if let Some(recovery) = st.recovering.get_mut(&source) {
            self.buffer(recovery, update, config.max_queue_size);
            return;
        }
        if !config.orderbook.enable_incremental_updates {
            trace!(source = %source, "Incremental updates disabled, update ignored");
            return;
        }
        let Some(current) = st.sources.get(&source) else {
            if config.orderbook.enable_snapshot_recovery {
                self.start_recovery(pair, st, &source, "incremental before snapshot", now_ms, events);
                if let Some(recovery) = st.recovering.get_mut(&source) {
                    self.buffer(recovery, update, config.max_queue_size);
                }
            } else {
                self.commit_incremental(pair, st, config, update, now_ms, events);
            }
            return;
        };

        let check = match update.sequence {
            Some(seq) => current.cursor.check(seq, config.max_sequence_gap),
            None if current.header.original_message_id == update.original_message_id => SequenceCheck::Duplicate,
            None => current.cursor.check_time(update.timestamp_ms),
        };
        match check {
            SequenceCheck::First | SequenceCheck::InOrder => {
                self.commit_incremental(pair, st, config, update, now_ms, events)
            }
            SequenceCheck::Duplicate => {
                self.core.count_duplicate();
                trace!(source = %source, "Incremental replay ignored");
            }
            SequenceCheck::Behind { last } => {
                self.core.count_out_of_order();
                trace!(source = %source, last, "Stale incremental ignored");
            }
            SequenceCheck::Ahead { expected } => {
                self.core.count_out_of_order();
                trace!(source = %source, expected, "Incremental held until its predecessor arrives");
                self.hold(st, config, update, now_ms);
            }
            SequenceCheck::Gap { expected } => {
                let recover = config.orderbook.enable_snapshot_recovery;
                let gap = SequenceGap {
                    currency_pair: pair.to_string(),
                    source: source.clone(),
                    expected,
                    received: update.sequence.unwrap_or(expected),
                    detected_ms: now_ms,
                    recovery_requested: recover,
                    recovered: false,
                };
                self.core.record_gap(&gap);
                events.push(UpdaterEvent::Gap(gap));
                transition(events, pair, &mut st.state, SyncState::GapDetected);
                if recover {
                    self.start_recovery(pair, st, &source, "sequence gap", now_ms, events);
                    if let Some(recovery) = st.recovering.get_mut(&source) {
                        self.buffer(recovery, update, config.max_queue_size);
                    }
                } else {
                    // no way to repair: apply on top of what we have
                    self.commit_incremental(pair, st, config, update, now_ms, events);
                }
            }
        }
    }

    // Applies the delta to a copy of the source book and commits it only if the copy holds up
    fn commit_incremental(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        update: NormalizedOrderbook,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let source = update.source.clone();
        let mut candidate = st.sources.get(&source).map(|s| s.book.clone()).unwrap_or_default();
        candidate.apply_delta(&update.bids, &update.asks, update.timestamp_ms);
        let verdict = if config.orderbook.validate_integrity { candidate.check_integrity() } else { Ok(()) };

        match verdict {
            Err(err) => {
                if let Some(sb) = st.sources.get_mut(&source) {
                    sb.cursor.advance(update.sequence, update.timestamp_ms);
                }
                self.integrity_violation(pair, st, config, &source, err, now_ms, events);
            }
            Ok(()) => {
                let header = strip(update);
                let sb = st.sources.entry(source.clone()).or_insert_with(|| SourceBook {
                    book: LevelBook::new(),
                    cursor: SequenceCursor::default(),
                    header: header.clone(),
                });
                sb.book = candidate;
                sb.cursor.advance(header.sequence, header.timestamp_ms);
                sb.header = header;
                self.publish(pair, st, config, &source, now_ms, events);
            }
        }
    }

    fn integrity_violation(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        source: &str,
        err: PipelineError,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let conflict = self.core.raise_conflict(pair, ConflictKind::Integrity, format!("{source}: {err}"), &[source], now_ms);
        self.core.store_conflict(&conflict);
        events.push(UpdaterEvent::Conflict(conflict));
        if config.orderbook.enable_snapshot_recovery && !st.recovering.contains_key(source) {
            self.start_recovery(pair, st, source, "integrity violation", now_ms, events);
        }
    }

    fn start_recovery(
        &self,
        pair: &str,
        st: &mut BookPairState,
        source: &str,
        reason: &str,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let request = self.core.request_snapshot(pair, source, reason, now_ms);
        events.push(UpdaterEvent::SnapshotRequested(request));
        // held updates from this source now wait for the snapshot with the rest
        let (moved, kept): (Vec<HeldUpdate>, Vec<HeldUpdate>) =
            std::mem::take(&mut st.held).into_iter().partition(|h| h.update.source == source);
        st.held = kept;
        let recovery = st
            .recovering
            .entry(source.to_string())
            .or_insert_with(|| Recovery { requested_ms: now_ms, buffer: Vec::new() });
        recovery.requested_ms = now_ms;
        recovery.buffer.extend(moved.into_iter().map(|h| h.update));
        transition(events, pair, &mut st.state, SyncState::SnapshotRequested);
    }

    fn buffer(&self, recovery: &mut Recovery, update: NormalizedOrderbook, limit: usize) {
        let limit = limit.max(1);
        while recovery.buffer.len() >= limit {
            recovery.buffer.remove(0);
            self.core.count_dropped("gap buffer", limit);
        }
        self.core.count_queued();
        recovery.buffer.push(update);
    }

    fn hold(&self, st: &mut BookPairState, config: &UpdaterConfig, update: NormalizedOrderbook, now_ms: u64) {
        let limit = config.max_queue_size.max(1);
        while st.held.len() >= limit {
            st.held.remove(0);
            self.core.count_dropped("held orderbook updates", limit);
        }
        self.core.count_queued();
        st.held.push(HeldUpdate { update, held_since_ms: now_ms });
    }

    /// The rival is the most recent other source inside the conflict window
    /// whose spread disagrees beyond the threshold.
    fn rival(&self, st: &BookPairState, config: &UpdaterConfig, source: &str) -> Option<String> {
        let candidate = st.sources.get(source)?;
        let spread = candidate.book.spread()?;
        st.sources
            .iter()
            .filter(|(name, _)| name.as_str() != source)
            .filter(|(_, other)| {
                other.header.timestamp_ms.abs_diff(candidate.header.timestamp_ms) <= config.conflict_window_ms
            })
            .filter(|(_, other)| {
                other
                    .book
                    .spread()
                    .map_or(false, |s| pct_diff(spread, s) > config.orderbook.conflict_spread_threshold_pct)
            })
            .max_by(|(a_name, a), (b_name, b)| {
                a.header.timestamp_ms.cmp(&b.header.timestamp_ms).then_with(|| b_name.cmp(a_name))
            })
            .map(|(name, _)| name.clone())
    }

    // Runs conflict detection for the source that just changed and publishes the outcome
    fn publish(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        source: &str,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        if !st.pending.is_empty() {
            trace!(pair, source, "Book frozen pending manual review");
            return;
        }
        let Some(candidate) = st.sources.get(source) else {
            return;
        };
        let mut winner = candidate.book.clone();
        let header = candidate.header.clone();

        let rival = if config.enable_conflict_detection { self.rival(st, config, source) } else { None };
        if let Some(rival) = rival {
            let Some(other) = st.sources.get(&rival) else {
                return;
            };
            let description = format!(
                "spread {:?} from {} vs {:?} from {}",
                winner.spread(),
                source,
                other.book.spread(),
                rival
            );
            let mut conflict = self.core.raise_conflict(pair, ConflictKind::Orderbook, description, &[source, &rival], now_ms);
            let latest_wins = header.timestamp_ms >= other.header.timestamp_ms;
            let candidate_wins = match config.conflict_resolution {
                ConflictResolution::ManualReview => {
                    self.core.store_conflict(&conflict);
                    st.pending.insert(
                        conflict.conflict_id.clone(),
                        PendingConflict { sources: smallvec![source.to_string(), rival.clone()] },
                    );
                    events.push(UpdaterEvent::Conflict(conflict));
                    transition(events, pair, &mut st.state, SyncState::ConflictPending);
                    return;
                }
                ConflictResolution::LatestWins => latest_wins,
                ConflictResolution::SourcePriority => config.source_rank(source) <= config.source_rank(&rival),
                ConflictResolution::Merge => {
                    let merged = winner.merge_union(&other.book);
                    if merged.check_integrity().is_ok() {
                        winner = merged;
                        true
                    } else {
                        debug!(pair, "Merged book crossed, falling back to latest");
                        latest_wins
                    }
                }
            };
            conflict.resolved = true;
            conflict.resolution = Some(format!("{:?}", config.conflict_resolution));
            conflict.winner = Some(if candidate_wins { source.to_string() } else { rival.clone() });
            self.core.store_conflict(&conflict);
            events.push(UpdaterEvent::Conflict(conflict));
            transition(events, pair, &mut st.state, SyncState::Resolved);
            if !candidate_wins {
                return;
            }
        }
        self.emit(pair, st, &winner, &header, events);
    }

    fn emit(
        &self,
        pair: &str,
        st: &mut BookPairState,
        book: &LevelBook,
        header: &NormalizedOrderbook,
        events: &mut Vec<UpdaterEvent>,
    ) {
        let ob = render(book, header);
        {
            let mut m = self.metrics.lock();
            *m.updates_by_pair.entry(pair.to_string()).or_insert(0) += 1;
            if let Some(spread) = ob.spread {
                m.spread_samples += 1;
                m.average_spread += (spread - m.average_spread) / m.spread_samples as f64;
                m.spread_by_pair.insert(pair.to_string(), spread);
                metrics::gauge!("mdpipe_orderbook_spread", "pair" => pair.to_string()).set(spread);
            }
        }
        metrics::counter!("mdpipe_orderbooks_merged_total", "pair" => pair.to_string()).increment(1);
        st.authoritative = Some(ob.clone());
        events.push(UpdaterEvent::Orderbook(ob));
    }

    // Applies held updates whose predecessor is now in place, until none is ready
    fn release_held(
        &self,
        pair: &str,
        st: &mut BookPairState,
        config: &UpdaterConfig,
        now_ms: u64,
        events: &mut Vec<UpdaterEvent>,
    ) {
        loop {
            let sources = &st.sources;
            let mut ready = Vec::new();
            let mut waiting = Vec::new();
            let mut stale = 0usize;
            for held in std::mem::take(&mut st.held) {
                let verdict = sources
                    .get(&held.update.source)
                    .and_then(|sb| held.update.sequence.map(|seq| sb.cursor.check(seq, u64::MAX)));
                match verdict {
                    Some(SequenceCheck::InOrder) => ready.push(held),
                    Some(SequenceCheck::Duplicate | SequenceCheck::Behind { .. }) => stale += 1,
                    _ => waiting.push(held),
                }
            }
            st.held = waiting;
            for _ in 0..stale {
                self.core.count_duplicate();
            }
            if ready.is_empty() {
                break;
            }
            ready.sort_by_key(|h| release_key(config, h.update.timestamp_ms, h.update.sequence, &h.update.source));
            for held in ready {
                self.on_incremental(pair, st, config, held.update, now_ms, events);
            }
        }
    }

    fn settle(&self, pair: &str, st: &mut BookPairState, events: &mut Vec<UpdaterEvent>) {
        if st.state == SyncState::Terminated {
            return;
        }
        if !st.pending.is_empty() {
            transition(events, pair, &mut st.state, SyncState::ConflictPending);
            return;
        }
        if !st.recovering.is_empty() {
            transition(events, pair, &mut st.state, SyncState::SnapshotRequested);
            return;
        }
        if matches!(
            st.state,
            SyncState::Resolved | SyncState::GapDetected | SyncState::ConflictPending | SyncState::SnapshotRequested
        ) {
            transition(events, pair, &mut st.state, SyncState::Receiving);
        }
        let target = if st.held.is_empty() { SyncState::Stable } else { SyncState::Receiving };
        transition(events, pair, &mut st.state, target);
    }

    /// Re-sends unanswered snapshot requests and expires held updates.
    pub fn tick(&self, now_ms: u64) -> Vec<UpdaterEvent> {
        let mut events = Vec::new();
        if !self.core.is_accepting() {
            return events;
        }
        let config = self.core.config();
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            if st.state == SyncState::Terminated {
                continue;
            }
            let overdue: Vec<String> = st
                .recovering
                .iter()
                .filter(|(_, r)| now_ms.saturating_sub(r.requested_ms) >= config.orderbook.snapshot_timeout_ms)
                .map(|(source, _)| source.clone())
                .collect();
            for source in overdue {
                let request = self.core.request_snapshot(&pair, &source, "snapshot timeout", now_ms);
                events.push(UpdaterEvent::SnapshotRequested(request));
                if let Some(recovery) = st.recovering.get_mut(&source) {
                    recovery.requested_ms = now_ms;
                }
            }

            let (mut expired, waiting): (Vec<HeldUpdate>, Vec<HeldUpdate>) = std::mem::take(&mut st.held)
                .into_iter()
                .partition(|h| now_ms.saturating_sub(h.held_since_ms) >= config.max_wait_time_ms);
            st.held = waiting;
            expired.sort_by_key(|h| release_key(&config, h.update.timestamp_ms, h.update.sequence, &h.update.source));
            for held in expired {
                match config.late_update_policy {
                    LateUpdatePolicy::ForceApply => {
                        debug!(pair = %pair, seq = ?held.update.sequence, "Force-applying held update");
                        self.commit_incremental(&pair, &mut st, &config, held.update, now_ms, &mut events);
                    }
                    LateUpdatePolicy::Discard => {
                        debug!(pair = %pair, seq = ?held.update.sequence, "Discarding held update");
                        self.core.count_dropped("expired held orderbook updates", config.max_queue_size);
                    }
                }
            }
            self.release_held(&pair, &mut st, &config, now_ms, &mut events);
            self.settle(&pair, &mut st, &mut events);
        }
        events
    }

    /// Publishes the chosen source's current book and unfreezes the pair.
    pub fn resolve_conflict(&self, conflict_id: &str, winner_source: &str, _now_ms: u64) -> PipelineResult<Vec<UpdaterEvent>> {
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            let Some(pending) = st.pending.get(conflict_id) else {
                continue;
            };
            if !pending.sources.iter().any(|s| s == winner_source) {
                return Err(PipelineError::DataConflict {
                    pair,
                    description: format!("{winner_source} is not part of conflict {conflict_id}"),
                });
            }
            st.pending.remove(conflict_id);

            let mut events = Vec::new();
            if let Some(resolved) = self.core.mark_conflict_resolved(conflict_id, "manual review", Some(winner_source)) {
                events.push(UpdaterEvent::Conflict(resolved));
            }
            transition(&mut events, &pair, &mut st.state, SyncState::Resolved);
            if st.pending.is_empty() {
                let chosen = st.sources.get(winner_source).map(|sb| (sb.book.clone(), sb.header.clone()));
                if let Some((book, header)) = chosen {
                    self.emit(&pair, &mut st, &book, &header, &mut events);
                }
            }
            self.settle(&pair, &mut st, &mut events);
            return Ok(events);
        }
        Err(PipelineError::DataConflict {
            pair: String::new(),
            description: format!("no pending conflict {conflict_id}"),
        })
    }

    pub fn current_orderbook(&self, pair: &str) -> Option<NormalizedOrderbook> {
        self.pairs.get(pair).and_then(|slot| slot.lock().authoritative.clone())
    }

    /// What a single venue currently says, regardless of conflict outcome.
    pub fn source_orderbook(&self, pair: &str, source: &str) -> Option<NormalizedOrderbook> {
        let slot = self.pairs.get(pair)?;
        let st = slot.lock();
        st.sources.get(source).map(|sb| render(&sb.book, &sb.header))
    }

    pub fn state(&self, pair: &str) -> SyncState {
        self.pairs.get(pair).map_or(SyncState::Idle, |slot| slot.lock().state)
    }

    pub fn held_count(&self, pair: &str) -> usize {
        self.pairs.get(pair).map_or(0, |slot| slot.lock().held.len())
    }

    pub fn buffered_count(&self, pair: &str) -> usize {
        self.pairs
            .get(pair)
            .map_or(0, |slot| slot.lock().recovering.values().map(|r| r.buffer.len()).sum())
    }

    pub fn metrics(&self) -> OrderbookMetrics {
        self.metrics.lock().clone()
    }

    pub fn shutdown(&self) -> Vec<UpdaterEvent> {
        self.core.accepting.store(false, std::sync::atomic::Ordering::Release);
        let mut events = Vec::new();
        for (pair, slot) in self.pairs.all() {
            let mut st = slot.lock();
            st.sources.clear();
            st.recovering.clear();
            st.held.clear();
            st.pending.clear();
            transition(&mut events, &pair, &mut st.state, SyncState::Terminated);
        }
        debug!(updater = %self.core.name, "Orderbook updater shut down");
        events
    }
}
