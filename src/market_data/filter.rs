//! Rule-based admission control over a bounded, ordered queue.
//!
//! A message goes through, in order: category and validity checks, the age
//! limit, the configured rules (ascending priority), the domain rules for trades
//! or orderbooks, the mandatory seen-id check and finally the ordering check.
//! Admitted messages wait in the queue until `drain` hands them out sorted.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ahash::AHashMap;
use itertools::Itertools;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::engine::queue::RecencyMap;
use crate::engine::types::{now_ms, MessageCategory, PipelineError, PipelineResult};
use crate::market_data::extractor::{ExtractedEnvelope, ExtractedMessageInfo};

#[derive(Debug, Clone, PartialEq)]
pub struct FilteredMessage {
    pub message_info: ExtractedMessageInfo,
    pub source_connection: String,
    pub source_extractor: String,
    pub received_ms: u64,
    // higher is better
    pub filter_score: i32,
}

impl From<ExtractedEnvelope> for FilteredMessage {
    fn from(env: ExtractedEnvelope) -> Self {
        Self {
            message_info: env.info,
            source_connection: env.source_connection,
            source_extractor: env.source_extractor,
            received_ms: env.received_ms,
            filter_score: 0,
        }
    }
}

impl FilteredMessage {
    pub fn currency_pair(&self) -> Option<&str> {
        self.message_info.summary.currency_pair.as_deref()
    }

    pub fn exchange(&self) -> &str {
        self.message_info.summary.exchange.as_deref().unwrap_or(&self.source_connection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterCriteria {
    ByAge,
    ById,
    ByTimestamp,
    ByDuplication,
    ByExchange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Greater,
    Less,
    Equal,
    Contains,
    Regex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterRule {
    pub criteria: FilterCriteria,
    pub comparison: Comparison,
    pub value: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    // lower runs first
    #[serde(default)]
    pub priority: i32,
}

fn enabled_default() -> bool {
    true
}

impl FilterRule {
    pub fn new(criteria: FilterCriteria, comparison: Comparison, value: impl Into<String>) -> Self {
        Self { criteria, comparison, value: value.into(), enabled: true, priority: 0 }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

// A rule plus its compiled pattern when the comparison is Regex
#[derive(Debug, Clone)]
struct CompiledRule {
    rule: FilterRule,
    pattern: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: FilterRule) -> PipelineResult<Self> {
        let pattern = match rule.comparison {
            Comparison::Regex => Some(
                Regex::new(&rule.value)
                    .map_err(|e| PipelineError::InvalidRule(format!("bad pattern {:?}: {e}", rule.value)))?,
            ),
            _ => None,
        };
        Ok(Self { rule, pattern })
    }

    fn passes(&self, msg: &FilteredMessage) -> bool {
        let info = &msg.message_info;
        let field = match self.rule.criteria {
            FilterCriteria::ByDuplication => return !info.previously_seen,
            FilterCriteria::ByAge => info.age_ms.to_string(),
            FilterCriteria::ById => info.message_id.clone(),
            FilterCriteria::ByTimestamp => info.timestamp_ms.to_string(),
            FilterCriteria::ByExchange => msg.exchange().to_string(),
        };
        match self.rule.comparison {
            Comparison::Contains => field.contains(self.rule.value.as_str()),
            Comparison::Regex => self.pattern.as_ref().map_or(false, |re| re.is_match(&field)),
            Comparison::Greater => compare_values(&field, &self.rule.value) == CmpOrdering::Greater,
            Comparison::Less => compare_values(&field, &self.rule.value) == CmpOrdering::Less,
            Comparison::Equal => compare_values(&field, &self.rule.value) == CmpOrdering::Equal,
        }
    }
}

/// Numeric when both sides parse, lexicographic otherwise.
fn compare_values(field: &str, value: &str) -> CmpOrdering {
    match (field.trim().parse::<f64>(), value.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(CmpOrdering::Equal),
        _ => field.cmp(value),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderingPolicy {
    #[default]
    ByTimestamp,
    BySequence,
    ByPriority,
    BySource,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OrderKey {
    // leads the comparison; only set when ordering by source
    pub group: Option<String>,
    pub primary: i64,
    pub secondary: i64,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TradeFilterConfig {
    pub min_size: Option<f64>,
    pub max_size: Option<f64>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub allowed_pairs: BTreeSet<String>,
    pub blocked_pairs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrderbookFilterConfig {
    // level bounds apply to each side separately
    pub min_levels: Option<usize>,
    pub max_levels: Option<usize>,
    pub min_spread: Option<f64>,
    pub max_spread: Option<f64>,
    pub require_full_book: bool,
    pub allowed_pairs: BTreeSet<String>,
    pub blocked_pairs: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterDomain {
    Trades(TradeFilterConfig),
    Orderbook(OrderbookFilterConfig),
}

impl FilterDomain {
    pub fn category(&self) -> MessageCategory {
        match self {
            FilterDomain::Trades(_) => MessageCategory::Trade,
            FilterDomain::Orderbook(_) => MessageCategory::Orderbook,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub rules: Vec<FilterRule>,
    pub ordering: OrderingPolicy,
    pub strict_ordering: bool,
    pub max_queue_size: usize,
    pub max_processed_ids: usize,
    pub max_message_age_ms: u64,
    // lower number ranks first; unknown sources rank last
    pub source_priorities: BTreeMap<String, i32>,
    pub domain: FilterDomain,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self::trades()
    }
}

impl FilterConfig {
    pub fn trades() -> Self {
        Self {
            rules: Vec::new(),
            ordering: OrderingPolicy::ByTimestamp,
            strict_ordering: false,
            max_queue_size: 1_000,
            max_processed_ids: 10_000,
            max_message_age_ms: 5_000,
            source_priorities: BTreeMap::new(),
            domain: FilterDomain::Trades(TradeFilterConfig::default()),
        }
    }

    pub fn orderbook() -> Self {
        Self {
            ordering: OrderingPolicy::BySequence,
            domain: FilterDomain::Orderbook(OrderbookFilterConfig::default()),
            ..Self::trades()
        }
    }

    pub fn for_category(category: MessageCategory) -> Self {
        match category {
            MessageCategory::Trade => Self::trades(),
            MessageCategory::Orderbook => Self::orderbook(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    WrongCategory,
    Invalid(String),
    TooOld { age_ms: i64 },
    Rule { index: usize, criteria: FilterCriteria },
    Domain(String),
    OutOfOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted,
    Rejected(RejectReason),
    Duplicate,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterStatistics {
    pub processed_count: u64,
    pub output_count: u64,
    pub filtered_count: u64,
    pub duplicate_count: u64,
    pub overflow_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpreadInfo {
    pub current: f64,
    pub min: f64,
    pub max: f64,
    pub last_update_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeFlowMetrics {
    pub trade_count: u64,
    pub total_volume: f64,
    pub average_trade_size: f64,
    pub trades_by_pair: BTreeMap<String, u64>,
}

impl TradeFlowMetrics {
    pub fn most_active_pair(&self) -> Option<&str> {
        self.trades_by_pair
            .iter()
            .sorted_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)))
            .next()
            .map(|(pair, _)| pair.as_str())
    }
}

struct FilterState {
    config: FilterConfig,
    rules: Vec<CompiledRule>,
    seen: RecencyMap<String, u64>,
    queue: Vec<(OrderKey, u64, FilteredMessage)>,
    arrival: u64,
    last_emitted: Option<OrderKey>,
    spreads: AHashMap<String, SpreadInfo>,
    trade_flow: TradeFlowMetrics,
}

pub struct MessageFilter {
    name: String,
    state: Mutex<FilterState>,
    processed: AtomicU64,
    output: AtomicU64,
    filtered: AtomicU64,
    duplicates: AtomicU64,
    overflow: AtomicU64,
    accepting: AtomicBool,
}

impl MessageFilter {
    pub fn new(name: &str, config: FilterConfig) -> PipelineResult<Self> {
        let rules = config.rules.iter().cloned().map(CompiledRule::compile).collect::<PipelineResult<Vec<_>>>()?;
        let seen = RecencyMap::new(config.max_processed_ids);
        Ok(Self {
            name: name.to_string(),
            state: Mutex::new(FilterState {
                config,
                rules,
                seen,
                queue: Vec::new(),
                arrival: 0,
                last_emitted: None,
                spreads: AHashMap::new(),
                trade_flow: TradeFlowMetrics::default(),
            }),
            processed: AtomicU64::new(0),
            output: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            overflow: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> MessageCategory {
        self.state.lock().config.domain.category()
    }

    pub fn config(&self) -> FilterConfig {
        let st = self.state.lock();
        let mut cfg = st.config.clone();
        cfg.rules = st.rules.iter().map(|r| r.rule.clone()).collect();
        cfg
    }

    /// Swaps the whole configuration. Queued messages stay queued; an invalid
    /// rule leaves the previous configuration in place.
    pub fn set_config(&self, config: FilterConfig) -> PipelineResult<()> {
        let rules = config.rules.iter().cloned().map(CompiledRule::compile).collect::<PipelineResult<Vec<_>>>()?;
        let mut st = self.state.lock();
        st.seen.set_capacity(config.max_processed_ids);
        st.rules = rules;
        st.config = config;
        debug!(filter = %self.name, rules = st.rules.len(), "Filter reconfigured");
        Ok(())
    }

    pub fn add_rule(&self, rule: FilterRule) -> PipelineResult<usize> {
        let compiled = CompiledRule::compile(rule)?;
        let mut st = self.state.lock();
        st.rules.push(compiled);
        Ok(st.rules.len() - 1)
    }

    pub fn remove_rule(&self, index: usize) -> PipelineResult<FilterRule> {
        let mut st = self.state.lock();
        if index >= st.rules.len() {
            return Err(PipelineError::InvalidRule(format!("no rule at index {index}")));
        }
        Ok(st.rules.remove(index).rule)
    }

    pub fn update_rule(&self, index: usize, rule: FilterRule) -> PipelineResult<()> {
        let compiled = CompiledRule::compile(rule)?;
        let mut st = self.state.lock();
        match st.rules.get_mut(index) {
            Some(slot) => {
                *slot = compiled;
                Ok(())
            }
            None => Err(PipelineError::InvalidRule(format!("no rule at index {index}"))),
        }
    }

    pub fn rules(&self) -> Vec<FilterRule> {
        self.state.lock().rules.iter().map(|r| r.rule.clone()).collect()
    }

    pub fn offer(&self, msg: FilteredMessage) -> Admission {
        self.offer_at(msg, now_ms())
    }

    #[instrument(level = "trace", skip_all, fields(filter = %self.name, id = %msg.message_info.message_id))]
    pub fn offer_at(&self, mut msg: FilteredMessage, now_ms: u64) -> Admission {
        if !self.accepting.load(Ordering::Acquire) {
            return Admission::Closed;
        }
        self.processed.fetch_add(1, Ordering::Relaxed);

        let mut st = self.state.lock();
        let verdict = Self::screen(&mut st, &mut msg, now_ms);
        match verdict {
            Admission::Admitted => {
                self.enqueue(&mut st, msg);
                Admission::Admitted
            }
            Admission::Duplicate => {
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mdpipe_filter_duplicates_total", "filter" => self.name.clone()).increment(1);
                trace!("Duplicate dropped");
                Admission::Duplicate
            }
            Admission::Rejected(reason) => {
                self.filtered.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("mdpipe_filter_rejected_total", "filter" => self.name.clone()).increment(1);
                trace!(?reason, "Message rejected");
                Admission::Rejected(reason)
            }
            Admission::Closed => Admission::Closed,
        }
    }

    fn screen(st: &mut FilterState, msg: &mut FilteredMessage, now_ms: u64) -> Admission {
        let info = &msg.message_info;
        if info.category != st.config.domain.category() {
            return Admission::Rejected(RejectReason::WrongCategory);
        }
        if !info.is_valid {
            return Admission::Rejected(RejectReason::Invalid(info.error.clone().unwrap_or_default()));
        }
        let age_ms = now_ms as i64 - info.timestamp_ms as i64;
        if age_ms > st.config.max_message_age_ms as i64 {
            return Admission::Rejected(RejectReason::TooOld { age_ms });
        }

        let failed_rule = st
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.rule.enabled)
            .sorted_by_key(|(_, r)| r.rule.priority)
            .find(|(_, r)| !r.passes(msg))
            .map(|(index, r)| RejectReason::Rule { index, criteria: r.rule.criteria });
        if let Some(reason) = failed_rule {
            return Admission::Rejected(reason);
        }

        if let Err(why) = Self::domain_check(&st.config.domain, msg) {
            return Admission::Rejected(RejectReason::Domain(why));
        }

        let dedup_key = msg.message_info.dedup_key.clone();
        if st.seen.contains(&dedup_key) {
            return Admission::Duplicate;
        }

        let key = Self::order_key(&st.config, msg);
        if st.config.strict_ordering {
            if let Some(last) = &st.last_emitted {
                if key < *last {
                    return Admission::Rejected(RejectReason::OutOfOrder);
                }
            }
        }

        st.seen.insert(dedup_key, now_ms);
        let freshness = if st.config.max_message_age_ms == 0 {
            1.0
        } else {
            1.0 - (age_ms.max(0) as f64 / st.config.max_message_age_ms as f64).min(1.0)
        };
        let priority_bonus = match st.config.source_priorities.get(&msg.source_connection) {
            Some(p) => (100 - *p).max(0),
            None => 0,
        };
        msg.filter_score = priority_bonus + (freshness * 100.0).round() as i32;
        Self::record_domain_metrics(st, msg, now_ms);
        Admission::Admitted
    }

    fn domain_check(domain: &FilterDomain, msg: &FilteredMessage) -> Result<(), String> {
        let summary = &msg.message_info.summary;
        let pair_ok = |allowed: &BTreeSet<String>, blocked: &BTreeSet<String>| -> Result<(), String> {
            let pair = summary.currency_pair.as_deref();
            if let Some(p) = pair {
                if blocked.contains(p) {
                    return Err(format!("pair {p} is blocked"));
                }
            }
            if !allowed.is_empty() && !pair.map_or(false, |p| allowed.contains(p)) {
                return Err(format!("pair {pair:?} not in allow list"));
            }
            Ok(())
        };

        match domain {
            FilterDomain::Trades(cfg) => {
                pair_ok(&cfg.allowed_pairs, &cfg.blocked_pairs)?;
                if let Some(qty) = summary.quantity {
                    if cfg.min_size.map_or(false, |min| qty < min) || cfg.max_size.map_or(false, |max| qty > max) {
                        return Err(format!("trade size {qty} out of bounds"));
                    }
                }
                if let Some(px) = summary.price {
                    if cfg.min_price.map_or(false, |min| px < min) || cfg.max_price.map_or(false, |max| px > max) {
                        return Err(format!("trade price {px} out of bounds"));
                    }
                }
            }
            FilterDomain::Orderbook(cfg) => {
                pair_ok(&cfg.allowed_pairs, &cfg.blocked_pairs)?;
                if cfg.require_full_book && (summary.bid_levels == 0 || summary.ask_levels == 0) {
                    return Err("book is missing one side".into());
                }
                for (side, levels) in [("bid", summary.bid_levels), ("ask", summary.ask_levels)] {
                    if levels == 0 {
                        continue;
                    }
                    if cfg.min_levels.map_or(false, |min| levels < min) || cfg.max_levels.map_or(false, |max| levels > max)
                    {
                        return Err(format!("{levels} {side} levels out of bounds"));
                    }
                }
                if let Some(spread) = summary.spread() {
                    if cfg.min_spread.map_or(false, |min| spread < min) || cfg.max_spread.map_or(false, |max| spread > max)
                    {
                        return Err(format!("spread {spread} out of bounds"));
                    }
                }
            }
        }
        Ok(())
    }

    fn record_domain_metrics(st: &mut FilterState, msg: &FilteredMessage, now_ms: u64) {
        let summary = &msg.message_info.summary;
        let Some(pair) = summary.currency_pair.clone() else {
            return;
        };
        match st.config.domain {
            FilterDomain::Trades(_) => {
                let flow = &mut st.trade_flow;
                flow.trade_count += 1;
                flow.total_volume += summary.quantity.unwrap_or(0.0);
                flow.average_trade_size = flow.total_volume / flow.trade_count as f64;
                *flow.trades_by_pair.entry(pair).or_insert(0) += 1;
            }
            FilterDomain::Orderbook(_) => {
                if let Some(spread) = summary.spread() {
                    st.spreads
                        .entry(pair)
                        .and_modify(|info| {
                            info.current = spread;
                            info.min = info.min.min(spread);
                            info.max = info.max.max(spread);
                            info.last_update_ms = now_ms;
                        })
                        .or_insert(SpreadInfo { current: spread, min: spread, max: spread, last_update_ms: now_ms });
                }
            }
        }
    }

    fn order_key(config: &FilterConfig, msg: &FilteredMessage) -> OrderKey {
        let info = &msg.message_info;
        let ts = info.timestamp_ms as i64;
        let source = msg.source_connection.clone();
        match config.ordering {
            OrderingPolicy::ByTimestamp => OrderKey { group: None, primary: ts, secondary: 0, source },
            OrderingPolicy::BySequence => match info.summary.sequence {
                Some(seq) => OrderKey { group: None, primary: seq as i64, secondary: ts, source },
                None => OrderKey { group: None, primary: ts, secondary: 0, source },
            },
            OrderingPolicy::ByPriority => {
                let priority = config.source_priorities.get(&source).copied().unwrap_or(i32::MAX);
                OrderKey { group: None, primary: priority as i64, secondary: ts, source }
            }
            OrderingPolicy::BySource => OrderKey { group: Some(source.clone()), primary: ts, secondary: 0, source },
        }
    }

    fn enqueue(&self, st: &mut FilterState, msg: FilteredMessage) {
        let key = Self::order_key(&st.config, &msg);
        let limit = st.config.max_queue_size.max(1);
        while st.queue.len() >= limit {
            // oldest by arrival, not by order key
            if let Some(pos) = st.queue.iter().position_min_by_key(|(_, arrival, _)| *arrival) {
                st.queue.remove(pos);
            }
            self.overflow.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("mdpipe_filter_overflow_total", "filter" => self.name.clone()).increment(1);
        }
        st.arrival += 1;
        let arrival = st.arrival;
        st.queue.push((key, arrival, msg));
    }

    /// Hands out admitted messages in final order and records the last emitted key.
    pub fn drain(&self) -> Vec<FilteredMessage> {
        let mut st = self.state.lock();
        if st.queue.is_empty() {
            return Vec::new();
        }
        let mut queued = std::mem::take(&mut st.queue);
        // stable sort keeps arrival order on equal keys
        queued.sort_by(|a, b| a.0.cmp(&b.0));
        let last = queued.iter().map(|(k, _, _)| k.clone()).max();
        if let Some(last) = last {
            if st.last_emitted.as_ref().map_or(true, |prev| last > *prev) {
                st.last_emitted = Some(last);
            }
        }
        drop(st);
        let out: Vec<FilteredMessage> = queued.into_iter().map(|(_, _, m)| m).collect();
        self.output.fetch_add(out.len() as u64, Ordering::Relaxed);
        out
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn statistics(&self) -> FilterStatistics {
        FilterStatistics {
            processed_count: self.processed.load(Ordering::Relaxed),
            output_count: self.output.load(Ordering::Relaxed),
            filtered_count: self.filtered.load(Ordering::Relaxed),
            duplicate_count: self.duplicates.load(Ordering::Relaxed),
            overflow_count: self.overflow.load(Ordering::Relaxed),
        }
    }

    /// Share of processed messages that made it out, 0.0 before any traffic.
    pub fn filter_efficiency(&self) -> f64 {
        let stats = self.statistics();
        if stats.processed_count == 0 {
            return 0.0;
        }
        stats.output_count as f64 / stats.processed_count as f64
    }

    pub fn spread_info(&self, pair: &str) -> Option<SpreadInfo> {
        self.state.lock().spreads.get(pair).copied()
    }

    pub fn trade_flow(&self) -> TradeFlowMetrics {
        self.state.lock().trade_flow.clone()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops intake, discards the queue and forgets seen ids.
    pub fn shutdown(&self) -> usize {
        self.accepting.store(false, Ordering::Release);
        let mut st = self.state.lock();
        let discarded = st.queue.len();
        st.queue.clear();
        st.seen.clear();
        debug!(filter = %self.name, discarded, "Filter shut down");
        discarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::MessageFormat;
    use crate::market_data::extractor::{MessageSummary, ParsedPayload};

    const NOW: u64 = 1_690_000_001_000;

    fn message(source: &str, id: &str, ts: u64) -> FilteredMessage {
        FilteredMessage {
            message_info: ExtractedMessageInfo {
                message_id: id.into(),
                dedup_key: format!("{source}:{id}"),
                timestamp_ms: ts,
                age_ms: NOW as i64 - ts as i64,
                original_message: String::new(),
                payload: ParsedPayload::Unparsed,
                category: MessageCategory::Trade,
                format: MessageFormat::Json,
                message_type: None,
                summary: MessageSummary {
                    currency_pair: Some("BTC/USD".into()),
                    price: Some(100.0),
                    quantity: Some(1.0),
                    ..MessageSummary::default()
                },
                is_valid: true,
                error: None,
                previously_seen: false,
            },
            source_connection: source.into(),
            source_extractor: "ex".into(),
            received_ms: NOW,
            filter_score: 0,
        }
    }

    fn book_message(id: &str, seq: u64, bids: usize, asks: usize) -> FilteredMessage {
        let mut m = message("venue-a", id, NOW - 10);
        m.message_info.category = MessageCategory::Orderbook;
        m.message_info.summary = MessageSummary {
            currency_pair: Some("ETH/USD".into()),
            sequence: Some(seq),
            bid_levels: bids,
            ask_levels: asks,
            best_bid: (bids > 0).then_some(100.0),
            best_ask: (asks > 0).then_some(101.0),
            ..MessageSummary::default()
        };
        m
    }

    #[test]
    fn test_same_source_and_id_admitted_once() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        assert_eq!(filter.offer_at(message("a", "T1", NOW - 5), NOW), Admission::Admitted);
        assert_eq!(filter.offer_at(message("a", "T1", NOW - 5), NOW), Admission::Duplicate);
        // same id from another venue is a different message
        assert_eq!(filter.offer_at(message("b", "T1", NOW - 5), NOW), Admission::Admitted);

        assert_eq!(filter.drain().len(), 2);
        let stats = filter.statistics();
        assert_eq!(stats.duplicate_count, 1);
        assert_eq!(stats.output_count, 2);
    }

    #[test]
    fn test_invalid_and_stale_rejected() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        let mut bad = message("a", "T1", NOW);
        bad.message_info.is_valid = false;
        assert!(matches!(filter.offer_at(bad, NOW), Admission::Rejected(RejectReason::Invalid(_))));
        assert!(matches!(
            filter.offer_at(message("a", "T2", NOW - 10_000), NOW),
            Admission::Rejected(RejectReason::TooOld { .. })
        ));
        assert_eq!(filter.statistics().filtered_count, 2);
    }

    #[test]
    fn test_drain_sorts_by_timestamp() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        filter.offer_at(message("a", "T3", NOW - 1), NOW);
        filter.offer_at(message("a", "T1", NOW - 3), NOW);
        filter.offer_at(message("a", "T2", NOW - 2), NOW);
        let ids: Vec<_> = filter.drain().into_iter().map(|m| m.message_info.message_id).collect();
        assert_eq!(ids, vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn test_strict_ordering_rejects_late_key() {
        let mut cfg = FilterConfig::trades();
        cfg.strict_ordering = true;
        let filter = MessageFilter::new("trades", cfg).unwrap();
        filter.offer_at(message("a", "T2", NOW - 2), NOW);
        filter.drain();
        assert_eq!(
            filter.offer_at(message("a", "T1", NOW - 3), NOW),
            Admission::Rejected(RejectReason::OutOfOrder)
        );
        assert_eq!(filter.offer_at(message("a", "T3", NOW - 1), NOW), Admission::Admitted);
    }

    #[test]
    fn test_by_source_strict_key_matches_drain_order() {
        let mut cfg = FilterConfig::trades();
        cfg.ordering = OrderingPolicy::BySource;
        cfg.strict_ordering = true;
        let filter = MessageFilter::new("trades", cfg).unwrap();
        filter.offer_at(message("b", "B1", NOW - 5), NOW);
        filter.offer_at(message("a", "A1", NOW - 1), NOW);
        filter.offer_at(message("a", "A0", NOW - 3), NOW);
        let ids: Vec<_> = filter.drain().into_iter().map(|m| m.message_info.message_id).collect();
        assert_eq!(ids, vec!["A0", "A1", "B1"]);

        // "b" was emitted last, so an older "b" message is late but "c" is not
        assert_eq!(
            filter.offer_at(message("b", "B0", NOW - 6), NOW),
            Admission::Rejected(RejectReason::OutOfOrder)
        );
        assert_eq!(filter.offer_at(message("c", "C1", NOW - 9), NOW), Admission::Admitted);
    }

    #[test]
    fn test_rules_in_priority_order() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        filter.add_rule(FilterRule::new(FilterCriteria::ById, Comparison::Contains, "T").with_priority(5)).unwrap();
        let idx = filter
            .add_rule(FilterRule::new(FilterCriteria::ByExchange, Comparison::Equal, "venue-a").with_priority(1))
            .unwrap();
        assert!(filter.offer_at(message("venue-a", "T1", NOW), NOW) == Admission::Admitted);
        match filter.offer_at(message("venue-b", "X1", NOW), NOW) {
            Admission::Rejected(RejectReason::Rule { index, .. }) => assert_eq!(index, idx),
            other => panic!("unexpected {other:?}"),
        }

        let mut disabled = filter.rules()[idx].clone();
        disabled.enabled = false;
        filter.update_rule(idx, disabled).unwrap();
        assert_eq!(filter.offer_at(message("venue-b", "T9", NOW), NOW), Admission::Admitted);
        assert!(filter.remove_rule(7).is_err());
    }

    #[test]
    fn test_numeric_versus_lexicographic_compare() {
        assert_eq!(compare_values("10", "9"), CmpOrdering::Greater);
        assert_eq!(compare_values("abc", "abd"), CmpOrdering::Less);
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        filter.add_rule(FilterRule::new(FilterCriteria::ByAge, Comparison::Less, "100")).unwrap();
        assert_eq!(filter.offer_at(message("a", "T1", NOW - 50), NOW), Admission::Admitted);
        assert!(matches!(filter.offer_at(message("a", "T2", NOW - 500), NOW), Admission::Rejected(_)));
    }

    #[test]
    fn test_invalid_regex_rejected_at_add() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        let err = filter.add_rule(FilterRule::new(FilterCriteria::ById, Comparison::Regex, "(unclosed"));
        assert!(matches!(err, Err(PipelineError::InvalidRule(_))));
        assert!(filter.rules().is_empty());

        filter.add_rule(FilterRule::new(FilterCriteria::ById, Comparison::Regex, "^T[0-9]+$")).unwrap();
        assert_eq!(filter.offer_at(message("a", "T12", NOW), NOW), Admission::Admitted);
        assert!(matches!(filter.offer_at(message("a", "Q1", NOW), NOW), Admission::Rejected(_)));
    }

    #[test]
    fn test_trade_domain_bounds_and_pairs() {
        let mut cfg = FilterConfig::trades();
        cfg.domain = FilterDomain::Trades(TradeFilterConfig {
            max_size: Some(0.5),
            blocked_pairs: ["DOGE/USD".to_string()].into_iter().collect(),
            ..TradeFilterConfig::default()
        });
        let filter = MessageFilter::new("trades", cfg).unwrap();
        assert!(matches!(filter.offer_at(message("a", "T1", NOW), NOW), Admission::Rejected(RejectReason::Domain(_))));

        let mut small = message("a", "T2", NOW);
        small.message_info.summary.quantity = Some(0.1);
        assert_eq!(filter.offer_at(small.clone(), NOW), Admission::Admitted);

        small.message_info.message_id = "T3".into();
        small.message_info.dedup_key = "a:T3".into();
        small.message_info.summary.currency_pair = Some("DOGE/USD".into());
        assert!(matches!(filter.offer_at(small, NOW), Admission::Rejected(RejectReason::Domain(_))));
    }

    #[test]
    fn test_orderbook_domain_and_spread_tracking() {
        let mut cfg = FilterConfig::orderbook();
        cfg.domain = FilterDomain::Orderbook(OrderbookFilterConfig {
            require_full_book: true,
            max_levels: Some(3),
            ..OrderbookFilterConfig::default()
        });
        let filter = MessageFilter::new("books", cfg).unwrap();
        assert!(matches!(filter.offer_at(book_message("B1", 1, 2, 0), NOW), Admission::Rejected(_)));
        assert!(matches!(filter.offer_at(book_message("B2", 2, 5, 1), NOW), Admission::Rejected(_)));
        assert_eq!(filter.offer_at(book_message("B3", 3, 2, 2), NOW), Admission::Admitted);

        let spread = filter.spread_info("ETH/USD").unwrap();
        assert_eq!(spread.current, 1.0);
        assert_eq!(spread.min, 1.0);
    }

    #[test]
    fn test_by_sequence_ordering() {
        let filter = MessageFilter::new("books", FilterConfig::orderbook()).unwrap();
        filter.offer_at(book_message("B5", 5, 1, 1), NOW);
        filter.offer_at(book_message("B4", 4, 1, 1), NOW);
        let seqs: Vec<_> = filter.drain().into_iter().filter_map(|m| m.message_info.summary.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut cfg = FilterConfig::trades();
        cfg.max_queue_size = 2;
        let filter = MessageFilter::new("trades", cfg).unwrap();
        for (i, id) in ["T1", "T2", "T3"].iter().enumerate() {
            filter.offer_at(message("a", id, NOW - 10 + i as u64), NOW);
        }
        let ids: Vec<_> = filter.drain().into_iter().map(|m| m.message_info.message_id).collect();
        assert_eq!(ids, vec!["T2", "T3"]);
        assert_eq!(filter.statistics().overflow_count, 1);
    }

    #[test]
    fn test_trade_flow_and_efficiency() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        filter.offer_at(message("a", "T1", NOW), NOW);
        filter.offer_at(message("a", "T1", NOW), NOW);
        filter.drain();
        assert_eq!(filter.filter_efficiency(), 0.5);
        let flow = filter.trade_flow();
        assert_eq!(flow.trade_count, 1);
        assert_eq!(flow.most_active_pair(), Some("BTC/USD"));
    }

    #[test]
    fn test_shutdown_discards_queue() {
        let filter = MessageFilter::new("trades", FilterConfig::trades()).unwrap();
        filter.offer_at(message("a", "T1", NOW), NOW);
        assert_eq!(filter.shutdown(), 1);
        assert_eq!(filter.offer_at(message("a", "T2", NOW), NOW), Admission::Closed);
    }
}
