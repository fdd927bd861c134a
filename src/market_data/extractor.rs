//! Message extractors: first stage after a connection. They parse just enough of
//! a raw message to know its id, venue timestamp and age, and pre-compute a
//! small summary the filters use without re-parsing.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, trace, warn};

use crate::engine::queue::RecencyMap;
use crate::engine::stats::RollingMean;
use crate::engine::types::{now_ms, MessageCategory, MessageFormat, PipelineError, RawMessage};
use crate::market_data::adapters::fix::{FixMessage, TAG_SENDING_TIME};
use crate::market_data::adapters::json_path::{lookup, lookup_string};
use crate::market_data::normaliser::{parse_fix_timestamp, parse_timestamp, value_as_f64, value_as_u64, TimestampFormat};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParsedPayload {
    Json(Value),
    Fix(FixMessage),
    Unparsed,
}

/// Best-effort fields pulled out at extraction time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub currency_pair: Option<String>,
    pub exchange: Option<String>,
    pub sequence: Option<u64>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
}

impl MessageSummary {
    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask? - self.best_bid?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMessageInfo {
    pub message_id: String,
    pub dedup_key: String,
    pub timestamp_ms: u64,
    pub age_ms: i64,
    pub original_message: String,
    pub payload: ParsedPayload,
    pub category: MessageCategory,
    pub format: MessageFormat,
    pub message_type: Option<String>,
    pub summary: MessageSummary,
    pub is_valid: bool,
    pub error: Option<String>,
    pub previously_seen: bool,
}

/// What an extractor node hands downstream: the info plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedEnvelope {
    pub info: ExtractedMessageInfo,
    pub source_connection: String,
    pub source_extractor: String,
    pub received_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonExtractFields {
    pub timestamp_path: String,
    pub timestamp_format: TimestampFormat,
    pub id_path: String,
    pub message_type_path: Option<String>,
    pub expected_message_type: Option<String>,
    pub pair_path: String,
    pub exchange_path: Option<String>,
    pub sequence_path: Option<String>,
    pub price_path: String,
    pub quantity_path: String,
    pub bids_path: String,
    pub asks_path: String,
    // key inside one level: array index ("0") or object field ("price")
    pub level_price_key: String,
    pub require_bids_and_asks: bool,
}

impl Default for JsonExtractFields {
    fn default() -> Self {
        Self {
            timestamp_path: "timestamp".into(),
            timestamp_format: TimestampFormat::Auto,
            id_path: "id".into(),
            message_type_path: None,
            expected_message_type: None,
            pair_path: "symbol".into(),
            exchange_path: None,
            sequence_path: None,
            price_path: "price".into(),
            quantity_path: "quantity".into(),
            bids_path: "bids".into(),
            asks_path: "asks".into(),
            level_price_key: "0".into(),
            require_bids_and_asks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixExtractFields {
    pub timestamp_tag: u32,
    pub id_tag: u32,
    pub expected_msg_types: Vec<String>,
    pub strict_validation: bool,
    pub symbol_tag: u32,
    pub exchange_tag: Option<u32>,
    pub sequence_tag: Option<u32>,
    pub price_tag: u32,
    pub quantity_tag: u32,
    pub no_entries_tag: u32,
    pub entry_type_tag: u32,
    pub entry_px_tag: u32,
    pub require_bids_and_asks: bool,
}

impl Default for FixExtractFields {
    fn default() -> Self {
        Self::trades()
    }
}

impl FixExtractFields {
    pub fn trades() -> Self {
        Self {
            timestamp_tag: TAG_SENDING_TIME,
            id_tag: 571,
            expected_msg_types: vec!["AE".into(), "8".into()],
            strict_validation: false,
            symbol_tag: 55,
            exchange_tag: Some(207),
            sequence_tag: None,
            price_tag: 31,
            quantity_tag: 32,
            no_entries_tag: 268,
            entry_type_tag: 269,
            entry_px_tag: 270,
            require_bids_and_asks: false,
        }
    }

    pub fn orderbook() -> Self {
        Self {
            id_tag: 262,
            expected_msg_types: vec!["W".into(), "X".into()],
            sequence_tag: Some(83),
            ..Self::trades()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum WireFields {
    Json(JsonExtractFields),
    Fix(FixExtractFields),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub category: MessageCategory,
    pub enabled: bool,
    pub max_message_age_ms: u64,
    // when false a missing timestamp falls back to arrival time
    pub validate_timestamps: bool,
    pub max_cache_size: usize,
    pub fields: WireFields,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self::json(MessageCategory::Trade)
    }
}

impl ExtractorConfig {
    pub fn json(category: MessageCategory) -> Self {
        let fields = match category {
            MessageCategory::Trade => JsonExtractFields::default(),
            MessageCategory::Orderbook => JsonExtractFields {
                sequence_path: Some("sequence".into()),
                ..JsonExtractFields::default()
            },
        };
        Self {
            category,
            enabled: true,
            max_message_age_ms: 5_000,
            validate_timestamps: true,
            max_cache_size: 1_000,
            fields: WireFields::Json(fields),
        }
    }

    pub fn fix(category: MessageCategory) -> Self {
        let fields = match category {
            MessageCategory::Trade => FixExtractFields::trades(),
            MessageCategory::Orderbook => FixExtractFields::orderbook(),
        };
        Self { fields: WireFields::Fix(fields), ..Self::json(category) }
    }

    pub fn for_format(format: MessageFormat, category: MessageCategory) -> Self {
        match format {
            MessageFormat::Json => Self::json(category),
            MessageFormat::Fix => Self::fix(category),
        }
    }

    pub fn format(&self) -> MessageFormat {
        match self.fields {
            WireFields::Json(_) => MessageFormat::Json,
            WireFields::Fix(_) => MessageFormat::Fix,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractorStatistics {
    pub processed_count: u64,
    pub valid_count: u64,
    pub error_count: u64,
    pub average_processing_time_us: f64,
}

// Parsed fields before age/validity are applied
struct Decoded {
    message_id: String,
    timestamp_ms: Option<u64>,
    message_type: Option<String>,
    payload: ParsedPayload,
    summary: MessageSummary,
    problem: Option<String>,
}

pub struct MessageExtractor {
    name: String,
    config: RwLock<ExtractorConfig>,
    cache: Mutex<RecencyMap<String, u64>>,
    processed: AtomicU64,
    valid: AtomicU64,
    errors: AtomicU64,
    timing: Mutex<RollingMean>,
    accepting: AtomicBool,
}

impl MessageExtractor {
    pub fn new(name: &str, config: ExtractorConfig) -> Self {
        let cache = RecencyMap::new(config.max_cache_size);
        Self {
            name: name.to_string(),
            config: RwLock::new(config),
            cache: Mutex::new(cache),
            processed: AtomicU64::new(0),
            valid: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timing: Mutex::new(RollingMean::default()),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ExtractorConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ExtractorConfig) {
        self.cache.lock().set_capacity(config.max_cache_size);
        *self.config.write() = config;
        debug!(extractor = %self.name, "Extractor reconfigured");
    }

    pub fn format(&self) -> MessageFormat {
        self.config.read().format()
    }

    pub fn category(&self) -> MessageCategory {
        self.config.read().category
    }

    pub fn extract(&self, raw: &RawMessage) -> ExtractedMessageInfo {
        self.extract_at(raw, now_ms())
    }

    /// Never fails: problems are reported through `is_valid` and `error`.
    #[instrument(level = "debug", skip_all, fields(extractor = %self.name, source = %raw.source_id))]
    pub fn extract_at(&self, raw: &RawMessage, now_ms: u64) -> ExtractedMessageInfo {
        let started = Instant::now();
        let config = self.config.read().clone();

        let original = String::from_utf8_lossy(&raw.payload).into_owned();
        let decoded = match raw.text() {
            Ok(text) => match &config.fields {
                WireFields::Json(fields) => Self::decode_json(text, fields, config.category),
                WireFields::Fix(fields) => Self::decode_fix(text, fields, config.category),
            },
            Err(e) => Err(e),
        };

        let mut info = match decoded {
            Ok(d) => self.finish(d, raw, &config, now_ms, original),
            Err(err) => ExtractedMessageInfo {
                message_id: String::new(),
                dedup_key: String::new(),
                timestamp_ms: raw.arrival_ms,
                age_ms: now_ms as i64 - raw.arrival_ms as i64,
                original_message: original,
                payload: ParsedPayload::Unparsed,
                category: config.category,
                format: config.format(),
                message_type: None,
                summary: MessageSummary::default(),
                is_valid: false,
                error: Some(err.to_string()),
                previously_seen: false,
            },
        };

        if !config.enabled && info.is_valid {
            info.is_valid = false;
            info.error = Some("extractor disabled".into());
        }
        if !self.accepting.load(Ordering::Acquire) {
            info.is_valid = false;
            info.error = Some("extractor shut down".into());
        }

        self.processed.fetch_add(1, Ordering::Relaxed);
        if info.is_valid {
            self.valid.fetch_add(1, Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("mdpipe_extractor_invalid_total", "extractor" => self.name.clone()).increment(1);
            debug!(error = ?info.error, "Extracted message marked invalid");
        }
        self.timing.lock().record(started.elapsed().as_secs_f64() * 1e6);
        info
    }

    fn finish(
        &self,
        d: Decoded,
        raw: &RawMessage,
        config: &ExtractorConfig,
        now_ms: u64,
        original: String,
    ) -> ExtractedMessageInfo {
        let mut problem = d.problem;
        let timestamp_ms = match d.timestamp_ms {
            Some(ts) => ts,
            None => {
                if config.validate_timestamps && problem.is_none() {
                    problem = Some("missing or unparseable timestamp".into());
                }
                raw.arrival_ms
            }
        };
        let age_ms = now_ms as i64 - timestamp_ms as i64;
        if problem.is_none() && age_ms > config.max_message_age_ms as i64 {
            problem = Some(format!("message too old: {age_ms}ms > {}ms", config.max_message_age_ms));
        }
        if problem.is_none() && d.message_id.is_empty() {
            problem = Some("missing message id".into());
        }

        let dedup_key = format!("{}:{}", raw.source_id, d.message_id);
        let previously_seen = if d.message_id.is_empty() {
            false
        } else {
            let mut cache = self.cache.lock();
            let seen = cache.contains(&dedup_key);
            let evicted = cache.insert(dedup_key.clone(), timestamp_ms);
            if evicted > 0 {
                trace!(evicted, "Recency cache evicted oldest ids");
            }
            seen
        };

        ExtractedMessageInfo {
            message_id: d.message_id,
            dedup_key,
            timestamp_ms,
            age_ms,
            original_message: original,
            payload: d.payload,
            category: config.category,
            format: config.format(),
            message_type: d.message_type,
            summary: d.summary,
            is_valid: problem.is_none(),
            error: problem,
            previously_seen,
        }
    }

    fn decode_json(text: &str, f: &JsonExtractFields, category: MessageCategory) -> Result<Decoded, PipelineError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PipelineError::MalformedMessage(format!("invalid JSON: {e}")))?;
        if !value.is_object() {
            return Err(PipelineError::MalformedMessage("JSON message is not an object".into()));
        }

        let mut problem = None;
        let message_type = f.message_type_path.as_deref().and_then(|p| lookup_string(&value, p));
        if let Some(expected) = &f.expected_message_type {
            if message_type.as_deref() != Some(expected.as_str()) {
                problem = Some(format!("unexpected message type {message_type:?}, wanted {expected}"));
            }
        }

        let message_id = lookup_string(&value, &f.id_path).unwrap_or_default();
        let timestamp_ms = lookup(&value, &f.timestamp_path).and_then(|v| parse_timestamp(v, f.timestamp_format));

        let mut summary = MessageSummary {
            currency_pair: lookup_string(&value, &f.pair_path),
            exchange: f.exchange_path.as_deref().and_then(|p| lookup_string(&value, p)),
            sequence: f.sequence_path.as_deref().and_then(|p| lookup(&value, p)).and_then(value_as_u64),
            ..MessageSummary::default()
        };

        match category {
            MessageCategory::Trade => {
                summary.price = lookup(&value, &f.price_path).and_then(value_as_f64);
                summary.quantity = lookup(&value, &f.quantity_path).and_then(value_as_f64);
            }
            MessageCategory::Orderbook => {
                let side_prices = |path: &str| -> Vec<f64> {
                    match lookup(&value, path) {
                        Some(Value::Array(levels)) => levels
                            .iter()
                            .filter_map(|lvl| lookup(lvl, &f.level_price_key).and_then(value_as_f64))
                            .collect(),
                        _ => Vec::new(),
                    }
                };
                let bids = side_prices(&f.bids_path);
                let asks = side_prices(&f.asks_path);
                summary.bid_levels = bids.len();
                summary.ask_levels = asks.len();
                summary.best_bid = bids.iter().copied().reduce(f64::max);
                summary.best_ask = asks.iter().copied().reduce(f64::min);
                if f.require_bids_and_asks && problem.is_none() && (bids.is_empty() || asks.is_empty()) {
                    problem = Some("orderbook message lacks bids or asks".into());
                }
            }
        }

        Ok(Decoded { message_id, timestamp_ms, message_type, payload: ParsedPayload::Json(value), summary, problem })
    }

    fn decode_fix(text: &str, f: &FixExtractFields, category: MessageCategory) -> Result<Decoded, PipelineError> {
        let msg = FixMessage::parse(text)?;
        let mut problem = None;

        let message_type = msg.msg_type().map(str::to_string);
        let type_ok = f.expected_msg_types.is_empty()
            || message_type.as_ref().map_or(false, |t| f.expected_msg_types.iter().any(|e| e == t));
        if !type_ok {
            let msg_text = format!("unexpected FIX MsgType {message_type:?}");
            if f.strict_validation {
                return Err(PipelineError::MalformedMessage(msg_text));
            }
            problem = Some(msg_text);
        }

        let timestamp_ms = msg.get(f.timestamp_tag).and_then(parse_fix_timestamp);
        let message_id = msg.get(f.id_tag).unwrap_or_default().to_string();

        let mut summary = MessageSummary {
            currency_pair: msg.get(f.symbol_tag).map(str::to_string),
            exchange: f.exchange_tag.and_then(|t| msg.get(t)).map(str::to_string),
            sequence: f.sequence_tag.and_then(|t| msg.get(t)).and_then(|s| s.trim().parse().ok()),
            ..MessageSummary::default()
        };

        match category {
            MessageCategory::Trade => {
                summary.price = msg.get(f.price_tag).and_then(crate::market_data::normaliser::parse_decimal);
                summary.quantity = msg.get(f.quantity_tag).and_then(crate::market_data::normaliser::parse_decimal);
            }
            MessageCategory::Orderbook => {
                let mut bids = Vec::new();
                let mut asks = Vec::new();
                for entry in msg.repeating_group(f.no_entries_tag) {
                    let px = entry.get(f.entry_px_tag).and_then(crate::market_data::normaliser::parse_decimal);
                    match (entry.get(f.entry_type_tag), px) {
                        (Some("0"), Some(p)) => bids.push(p),
                        (Some("1"), Some(p)) => asks.push(p),
                        _ => {}
                    }
                    if summary.currency_pair.is_none() {
                        summary.currency_pair = entry.get(f.symbol_tag).map(str::to_string);
                    }
                }
                summary.bid_levels = bids.len();
                summary.ask_levels = asks.len();
                summary.best_bid = bids.iter().copied().reduce(f64::max);
                summary.best_ask = asks.iter().copied().reduce(f64::min);
                if f.require_bids_and_asks && problem.is_none() && (bids.is_empty() || asks.is_empty()) {
                    problem = Some("orderbook message lacks bids or offers".into());
                }
            }
        }

        if f.strict_validation && problem.is_none() && summary.currency_pair.is_none() {
            warn!(tag = f.symbol_tag, "FIX message without symbol");
            problem = Some("missing symbol".into());
        }

        Ok(Decoded { message_id, timestamp_ms, message_type, payload: ParsedPayload::Fix(msg), summary, problem })
    }

    pub fn seen_recently(&self, dedup_key: &str) -> bool {
        self.cache.lock().contains(&dedup_key.to_string())
    }

    pub fn statistics(&self) -> ExtractorStatistics {
        ExtractorStatistics {
            processed_count: self.processed.load(Ordering::Relaxed),
            valid_count: self.valid.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            average_processing_time_us: self.timing.lock().mean,
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Stops intake and releases the recency cache.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.cache.lock().clear();
        debug!(extractor = %self.name, "Extractor shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_690_000_001_000;

    fn raw(payload: &str) -> RawMessage {
        RawMessage::new("venue-a", payload, NOW)
    }

    fn json_trade(id: &str, ts: u64) -> String {
        format!(
            r#"{{"id":"{id}","price":"100.5","quantity":"2","side":"buy","symbol":"BTC/USD","timestamp":{ts}}}"#
        )
    }

    #[test]
    fn test_json_trade_extraction() {
        let ex = MessageExtractor::new("json-trades", ExtractorConfig::json(MessageCategory::Trade));
        let info = ex.extract_at(&raw(&json_trade("T1", 1_690_000_000_000)), NOW);
        assert!(info.is_valid, "{:?}", info.error);
        assert_eq!(info.message_id, "T1");
        assert_eq!(info.dedup_key, "venue-a:T1");
        assert_eq!(info.age_ms, 1_000);
        assert_eq!(info.summary.currency_pair.as_deref(), Some("BTC/USD"));
        assert_eq!(info.summary.price, Some(100.5));
        assert!(!info.previously_seen);

        let again = ex.extract_at(&raw(&json_trade("T1", 1_690_000_000_000)), NOW);
        assert!(again.previously_seen);
    }

    #[test]
    fn test_stale_message_is_returned_invalid() {
        let ex = MessageExtractor::new("json-trades", ExtractorConfig::json(MessageCategory::Trade));
        let info = ex.extract_at(&raw(&json_trade("T2", NOW - 60_000)), NOW);
        assert!(!info.is_valid);
        assert_eq!(info.age_ms, 60_000);
        assert!(info.error.unwrap().contains("too old"));
        assert_eq!(info.message_id, "T2");
    }

    #[test]
    fn test_malformed_json_never_panics() {
        let ex = MessageExtractor::new("json-trades", ExtractorConfig::json(MessageCategory::Trade));
        let info = ex.extract_at(&raw("{not json"), NOW);
        assert!(!info.is_valid);
        assert_eq!(info.payload, ParsedPayload::Unparsed);

        let stats = ex.statistics();
        assert_eq!(stats.processed_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.valid_count, 0);
    }

    #[test]
    fn test_expected_message_type() {
        let mut cfg = ExtractorConfig::json(MessageCategory::Trade);
        if let WireFields::Json(f) = &mut cfg.fields {
            f.message_type_path = Some("type".into());
            f.expected_message_type = Some("trade".into());
        }
        let ex = MessageExtractor::new("typed", cfg);
        let ok = ex.extract_at(&raw(r#"{"type":"trade","id":"1","timestamp":1690000000500}"#), NOW);
        assert!(ok.is_valid);
        let bad = ex.extract_at(&raw(r#"{"type":"ticker","id":"2","timestamp":1690000000500}"#), NOW);
        assert!(!bad.is_valid);
    }

    #[test]
    fn test_json_orderbook_summary() {
        let ex = MessageExtractor::new("json-books", ExtractorConfig::json(MessageCategory::Orderbook));
        let msg = r#"{"id":"B1","symbol":"ETH/USD","timestamp":1690000000900,"sequence":12,
            "bids":[["100","1"],["99.5","2"]],"asks":[["101","1"]]}"#;
        let info = ex.extract_at(&raw(msg), NOW);
        assert!(info.is_valid);
        assert_eq!(info.summary.sequence, Some(12));
        assert_eq!(info.summary.bid_levels, 2);
        assert_eq!(info.summary.best_bid, Some(100.0));
        assert_eq!(info.summary.best_ask, Some(101.0));
        assert_eq!(info.summary.spread(), Some(1.0));
    }

    #[test]
    fn test_fix_trade_extraction() {
        let ex = MessageExtractor::new("fix-trades", ExtractorConfig::fix(MessageCategory::Trade));
        let msg = "8=FIX.4.4|35=AE|52=20230722-04:26:40.500|571=TR9|55=BTC/USD|31=100|32=1|";
        let info = ex.extract_at(&raw(msg), NOW);
        assert!(info.is_valid, "{:?}", info.error);
        assert_eq!(info.message_id, "TR9");
        assert_eq!(info.age_ms, 500);
        assert_eq!(info.message_type.as_deref(), Some("AE"));
    }

    #[test]
    fn test_fix_wrong_type_strict() {
        let mut cfg = ExtractorConfig::fix(MessageCategory::Trade);
        if let WireFields::Fix(f) = &mut cfg.fields {
            f.strict_validation = true;
        }
        let ex = MessageExtractor::new("fix-strict", cfg);
        let info = ex.extract_at(&raw("35=0|52=20230722-04:26:40|571=X|55=BTC/USD|"), NOW);
        assert!(!info.is_valid);
        assert_eq!(info.payload, ParsedPayload::Unparsed);
    }

    #[test]
    fn test_fix_orderbook_levels() {
        let ex = MessageExtractor::new("fix-books", ExtractorConfig::fix(MessageCategory::Orderbook));
        let msg = "35=W|52=20230722-04:26:40|262=REQ1|55=BTC/USD|83=5|268=2|269=0|270=100|271=1|269=1|270=101|271=2|";
        let info = ex.extract_at(&raw(msg), NOW);
        assert!(info.is_valid, "{:?}", info.error);
        assert_eq!(info.summary.sequence, Some(5));
        assert_eq!(info.summary.bid_levels, 1);
        assert_eq!(info.summary.ask_levels, 1);
    }

    #[test]
    fn test_recency_cache_is_bounded() {
        let mut cfg = ExtractorConfig::json(MessageCategory::Trade);
        cfg.max_cache_size = 2;
        let ex = MessageExtractor::new("small-cache", cfg);
        for id in ["a", "b", "c"] {
            ex.extract_at(&raw(&json_trade(id, NOW)), NOW);
        }
        assert!(!ex.seen_recently("venue-a:a"));
        assert!(ex.seen_recently("venue-a:c"));
    }

    #[test]
    fn test_shutdown_marks_invalid() {
        let ex = MessageExtractor::new("json-trades", ExtractorConfig::json(MessageCategory::Trade));
        ex.shutdown();
        let info = ex.extract_at(&raw(&json_trade("T1", NOW)), NOW);
        assert!(!info.is_valid);
    }
}
