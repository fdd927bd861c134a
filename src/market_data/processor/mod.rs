//! Message processors: decode filtered messages into `NormalizedTrade` /
//! `NormalizedOrderbook`. One processor type serves all four format/category
//! combinations; which decoder runs and with what field mapping is decided by
//! `ProcessorKind`.

mod fix;
mod json;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::engine::queue::BoundedHistory;
use crate::engine::stats::RollingMean;
use crate::engine::types::{
    now_ms, MessageCategory, MessageFormat, Normalized, NormalizedOrderbook, NormalizedOrderbookLevel, NormalizedTrade,
    PipelineError,
};
use crate::market_data::filter::FilteredMessage;

pub use fix::{FixOrderbookMapping, FixTradeMapping};
pub use json::{JsonOrderbookMapping, JsonTradeMapping};

pub const MAX_ERROR_LOG_SIZE: usize = 100;
const SNIPPET_LEN: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorKind {
    JsonTrade(JsonTradeMapping),
    JsonOrderbook(JsonOrderbookMapping),
    FixTrade(FixTradeMapping),
    FixOrderbook(FixOrderbookMapping),
}

impl ProcessorKind {
    pub fn new(format: MessageFormat, category: MessageCategory) -> Self {
        match (format, category) {
            (MessageFormat::Json, MessageCategory::Trade) => ProcessorKind::JsonTrade(JsonTradeMapping::default()),
            (MessageFormat::Json, MessageCategory::Orderbook) => {
                ProcessorKind::JsonOrderbook(JsonOrderbookMapping::default())
            }
            (MessageFormat::Fix, MessageCategory::Trade) => ProcessorKind::FixTrade(FixTradeMapping::default()),
            (MessageFormat::Fix, MessageCategory::Orderbook) => {
                ProcessorKind::FixOrderbook(FixOrderbookMapping::default())
            }
        }
    }

    pub fn format(&self) -> MessageFormat {
        match self {
            ProcessorKind::JsonTrade(_) | ProcessorKind::JsonOrderbook(_) => MessageFormat::Json,
            ProcessorKind::FixTrade(_) | ProcessorKind::FixOrderbook(_) => MessageFormat::Fix,
        }
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            ProcessorKind::JsonTrade(_) | ProcessorKind::FixTrade(_) => MessageCategory::Trade,
            ProcessorKind::JsonOrderbook(_) | ProcessorKind::FixOrderbook(_) => MessageCategory::Orderbook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationBounds {
    pub min_price: f64,
    pub max_price: f64,
    pub min_quantity: f64,
    pub max_quantity: f64,
}

impl Default for ValidationBounds {
    fn default() -> Self {
        Self { min_price: 0.0, max_price: 1e12, min_quantity: 0.0, max_quantity: 1e12 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BookShaping {
    pub sort_levels: bool,
    // 0 keeps every level
    pub max_levels_per_side: usize,
    pub min_level_quantity: f64,
    pub process_incremental: bool,
}

impl Default for BookShaping {
    fn default() -> Self {
        Self { sort_levels: true, max_levels_per_side: 0, min_level_quantity: 0.0, process_incremental: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub kind: ProcessorKind,
    pub validate_data: bool,
    pub strict_mode: bool,
    pub enable_error_logging: bool,
    // 0 never disables
    pub max_errors_before_disable: u64,
    pub bounds: ValidationBounds,
    pub require_order_id: bool,
    pub require_fee_info: bool,
    pub book: BookShaping,
    // used when the message carries no exchange field
    pub default_exchange: Option<String>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::new(ProcessorKind::JsonTrade(JsonTradeMapping::default()))
    }
}

impl ProcessorConfig {
    pub fn new(kind: ProcessorKind) -> Self {
        Self {
            kind,
            validate_data: true,
            strict_mode: false,
            enable_error_logging: true,
            max_errors_before_disable: 100,
            bounds: ValidationBounds::default(),
            require_order_id: false,
            require_fee_info: false,
            book: BookShaping::default(),
            default_exchange: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingError {
    pub timestamp_ms: u64,
    pub message_id: String,
    pub error: String,
    pub message_snippet: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Normalized { record: Normalized, warnings: Vec<String> },
    Rejected(ProcessingError),
    // not an error, e.g. incremental updates while they are switched off
    Skipped(String),
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessorStatistics {
    pub processed_count: u64,
    pub normalized_count: u64,
    pub error_count: u64,
    pub warning_count: u64,
    pub average_processing_time_us: f64,
}

// What a decoder hands back before shaping and validation
pub(crate) enum Decoded {
    Trade(NormalizedTrade),
    Orderbook(NormalizedOrderbook),
    Skip(String),
}

pub struct MessageProcessor {
    name: String,
    config: RwLock<ProcessorConfig>,
    errors: Mutex<BoundedHistory<ProcessingError>>,
    disabled: AtomicBool,
    accepting: AtomicBool,
    errors_since_enable: AtomicU64,
    processed: AtomicU64,
    normalized: AtomicU64,
    error_count: AtomicU64,
    warning_count: AtomicU64,
    timing: Mutex<RollingMean>,
}

impl MessageProcessor {
    pub fn new(name: &str, config: ProcessorConfig) -> Self {
        Self {
            name: name.to_string(),
            config: RwLock::new(config),
            errors: Mutex::new(BoundedHistory::new(MAX_ERROR_LOG_SIZE)),
            disabled: AtomicBool::new(false),
            accepting: AtomicBool::new(true),
            errors_since_enable: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            normalized: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            warning_count: AtomicU64::new(0),
            timing: Mutex::new(RollingMean::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> ProcessorConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: ProcessorConfig) {
        *self.config.write() = config;
        debug!(processor = %self.name, "Processor reconfigured");
    }

    pub fn kind(&self) -> ProcessorKind {
        self.config.read().kind.clone()
    }

    #[instrument(level = "debug", skip_all, fields(processor = %self.name, id = %msg.message_info.message_id))]
    pub fn process(&self, msg: &FilteredMessage) -> ProcessOutcome {
        if self.disabled.load(Ordering::Acquire) || !self.accepting.load(Ordering::Acquire) {
            return ProcessOutcome::Disabled;
        }
        let started = Instant::now();
        self.processed.fetch_add(1, Ordering::Relaxed);
        let config = self.config.read().clone();

        let outcome = match self.decode_and_validate(&config, msg) {
            Ok(Decoded::Skip(reason)) => ProcessOutcome::Skipped(reason),
            Ok(Decoded::Trade(t)) => self.accept(Normalized::Trade(t), Vec::new()),
            Ok(Decoded::Orderbook(b)) => self.accept(Normalized::Orderbook(b), Vec::new()),
            Err(Rejection::Hard(err)) => self.reject(&config, msg, err),
            Err(Rejection::Soft { record, warnings }) => self.accept(record, warnings),
        };
        self.timing.lock().record(started.elapsed().as_secs_f64() * 1e6);
        outcome
    }

    fn accept(&self, record: Normalized, warnings: Vec<String>) -> ProcessOutcome {
        self.normalized.fetch_add(1, Ordering::Relaxed);
        if !warnings.is_empty() {
            self.warning_count.fetch_add(warnings.len() as u64, Ordering::Relaxed);
            debug!(count = warnings.len(), first = %warnings[0], "Normalized with warnings");
        }
        metrics::counter!("mdpipe_processor_normalized_total", "processor" => self.name.clone()).increment(1);
        ProcessOutcome::Normalized { record, warnings }
    }

    fn reject(&self, config: &ProcessorConfig, msg: &FilteredMessage, err: PipelineError) -> ProcessOutcome {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mdpipe_processor_errors_total", "processor" => self.name.clone()).increment(1);

        let record = ProcessingError {
            timestamp_ms: now_ms(),
            message_id: msg.message_info.message_id.clone(),
            error: err.to_string(),
            message_snippet: msg.message_info.original_message.chars().take(SNIPPET_LEN).collect(),
        };
        if config.enable_error_logging {
            self.errors.lock().push(record.clone());
        }
        warn!(error = %record.error, "Message rejected by processor");

        let errors = self.errors_since_enable.fetch_add(1, Ordering::AcqRel) + 1;
        if config.max_errors_before_disable > 0 && errors >= config.max_errors_before_disable {
            if !self.disabled.swap(true, Ordering::AcqRel) {
                warn!(processor = %self.name, errors, "Error limit reached, processor disabled");
            }
        }
        ProcessOutcome::Rejected(record)
    }

    fn decode_and_validate(&self, config: &ProcessorConfig, msg: &FilteredMessage) -> Result<Decoded, Rejection> {
        if msg.message_info.category != config.kind.category() || msg.message_info.format != config.kind.format() {
            return Err(Rejection::Hard(PipelineError::MalformedMessage(format!(
                "{} {} message sent to {} {} processor",
                msg.message_info.format,
                msg.message_info.category,
                config.kind.format(),
                config.kind.category()
            ))));
        }

        let decoded = match &config.kind {
            ProcessorKind::JsonTrade(m) => json::decode_trade(m, config, msg),
            ProcessorKind::JsonOrderbook(m) => json::decode_orderbook(m, config, msg),
            ProcessorKind::FixTrade(m) => fix::decode_trade(m, config, msg),
            ProcessorKind::FixOrderbook(m) => fix::decode_orderbook(m, config, msg),
        }
        .map_err(Rejection::Hard)?;

        match decoded {
            Decoded::Skip(reason) => Ok(Decoded::Skip(reason)),
            Decoded::Trade(trade) => {
                let issues = if config.validate_data { validate_trade(config, &trade) } else { Vec::new() };
                settle(config, Decoded::Trade(trade), issues)
            }
            Decoded::Orderbook(mut book) => {
                shape_book(&config.book, &mut book);
                let issues = if config.validate_data { validate_book(config, &mut book) } else { Vec::new() };
                book.refresh_derived();
                settle(config, Decoded::Orderbook(book), issues)
            }
        }
    }

    pub fn errors(&self) -> Vec<ProcessingError> {
        self.errors.lock().to_vec()
    }

    pub fn clear_errors(&self) {
        self.errors.lock().clear();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Clears the disabled state and the error counter that tripped it.
    pub fn enable(&self) {
        self.errors_since_enable.store(0, Ordering::Release);
        if self.disabled.swap(false, Ordering::AcqRel) {
            debug!(processor = %self.name, "Processor re-enabled");
        }
    }

    pub fn statistics(&self) -> ProcessorStatistics {
        ProcessorStatistics {
            processed_count: self.processed.load(Ordering::Relaxed),
            normalized_count: self.normalized.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            warning_count: self.warning_count.load(Ordering::Relaxed),
            average_processing_time_us: self.timing.lock().mean,
        }
    }

    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        debug!(processor = %self.name, "Processor shut down");
    }
}

enum Rejection {
    Hard(PipelineError),
    Soft { record: Normalized, warnings: Vec<String> },
}

// Strict mode turns the first issue into a rejection; otherwise issues become warnings.
fn settle(config: &ProcessorConfig, decoded: Decoded, issues: Vec<String>) -> Result<Decoded, Rejection> {
    if issues.is_empty() {
        return Ok(decoded);
    }
    if config.strict_mode {
        return Err(Rejection::Hard(PipelineError::ValidationFailure(issues.join("; "))));
    }
    let record = match decoded {
        Decoded::Trade(t) => Normalized::Trade(t),
        Decoded::Orderbook(b) => Normalized::Orderbook(b),
        Decoded::Skip(reason) => return Ok(Decoded::Skip(reason)),
    };
    Err(Rejection::Soft { record, warnings: issues })
}

fn validate_trade(config: &ProcessorConfig, trade: &NormalizedTrade) -> Vec<String> {
    let b = &config.bounds;
    let mut issues = Vec::new();
    if trade.price < b.min_price || trade.price > b.max_price {
        issues.push(format!("price {} outside [{}, {}]", trade.price, b.min_price, b.max_price));
    }
    if trade.quantity < b.min_quantity || trade.quantity > b.max_quantity {
        issues.push(format!("quantity {} outside [{}, {}]", trade.quantity, b.min_quantity, b.max_quantity));
    }
    if config.require_order_id && trade.order_id.as_deref().map_or(true, str::is_empty) {
        issues.push("order id missing".into());
    }
    if config.require_fee_info && (trade.fee.is_none() || trade.fee_currency.is_none()) {
        issues.push("fee information missing".into());
    }
    issues
}

// Drops thin levels, sorts and truncates. Zero-quantity deletes in incremental
// updates survive the minimum; snapshots never carry empty levels.
fn shape_book(shaping: &BookShaping, book: &mut NormalizedOrderbook) {
    let snapshot = book.is_snapshot;
    let keep = |l: &NormalizedOrderbookLevel| {
        if l.quantity == 0.0 {
            !snapshot
        } else {
            l.quantity >= shaping.min_level_quantity
        }
    };
    let before = book.bids.len() + book.asks.len();
    book.bids.retain(keep);
    book.asks.retain(keep);
    let dropped = before - (book.bids.len() + book.asks.len());
    if dropped > 0 {
        debug!(dropped, "Dropped thin levels");
    }

    if shaping.sort_levels {
        book.bids.sort_by(|a, b| b.price.total_cmp(&a.price));
        book.asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    }
    if shaping.max_levels_per_side > 0 {
        book.bids.truncate(shaping.max_levels_per_side);
        book.asks.truncate(shaping.max_levels_per_side);
    }
}

fn validate_book(config: &ProcessorConfig, book: &mut NormalizedOrderbook) -> Vec<String> {
    let b = &config.bounds;
    let mut issues = Vec::new();
    for level in book.bids.iter().chain(book.asks.iter()) {
        if level.price < b.min_price || level.price > b.max_price {
            issues.push(format!("level price {} outside [{}, {}]", level.price, b.min_price, b.max_price));
        }
        if level.quantity < 0.0 || level.quantity > b.max_quantity {
            issues.push(format!("level quantity {} out of bounds", level.quantity));
        }
    }

    if let Err(e) = book.check_integrity(book.is_snapshot) {
        issues.push(e.to_string());
        if !config.strict_mode {
            // best effort: sort and collapse duplicate prices, keeping the last one seen
            book.bids.sort_by(|x, y| y.price.total_cmp(&x.price));
            book.asks.sort_by(|x, y| x.price.total_cmp(&y.price));
            dedup_prices(&mut book.bids);
            dedup_prices(&mut book.asks);
        }
    }
    issues
}

fn dedup_prices(levels: &mut Vec<NormalizedOrderbookLevel>) {
    let mut out: Vec<NormalizedOrderbookLevel> = Vec::with_capacity(levels.len());
    for level in levels.drain(..) {
        match out.last_mut() {
            Some(prev) if prev.price == level.price => *prev = level,
            _ => out.push(level),
        }
    }
    *levels = out;
}

// Fields shared by both decoders
pub(crate) fn exchange_or_default(found: Option<String>, config: &ProcessorConfig, msg: &FilteredMessage) -> String {
    found
        .or_else(|| msg.message_info.summary.exchange.clone())
        .or_else(|| config.default_exchange.clone())
        .unwrap_or_else(|| msg.source_connection.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{MessageFormat, Side};
    use crate::market_data::extractor::{ExtractorConfig, MessageExtractor};
    use crate::engine::types::RawMessage;

    const NOW: u64 = 1_690_000_001_000;

    pub(super) fn filtered(format: MessageFormat, category: MessageCategory, payload: &str) -> FilteredMessage {
        let ex = MessageExtractor::new("ex", ExtractorConfig::for_format(format, category));
        let info = ex.extract_at(&RawMessage::new("venue-a", payload, NOW), NOW);
        FilteredMessage {
            message_info: info,
            source_connection: "venue-a".into(),
            source_extractor: "ex".into(),
            received_ms: NOW,
            filter_score: 0,
        }
    }

    fn json_trade_processor(strict: bool) -> MessageProcessor {
        let mut cfg = ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Trade));
        cfg.strict_mode = strict;
        MessageProcessor::new("json-trade", cfg)
    }

    const TRADE: &str =
        r#"{"id":"T1","price":"100.5","quantity":"2","side":"buy","symbol":"BTC/USD","timestamp":1690000000000}"#;

    #[test]
    fn test_json_trade_default_mapping() {
        let p = json_trade_processor(false);
        match p.process(&filtered(MessageFormat::Json, MessageCategory::Trade, TRADE)) {
            ProcessOutcome::Normalized { record: Normalized::Trade(t), warnings } => {
                assert!(warnings.is_empty());
                assert_eq!(t.trade_id, "T1");
                assert_eq!(t.price, 100.5);
                assert_eq!(t.quantity, 2.0);
                assert_eq!(t.side, Side::BUY);
                assert_eq!(t.currency_pair, "BTC/USD");
                assert_eq!(t.exchange, "venue-a");
                assert_eq!(t.timestamp_ms, 1_690_000_000_000);
                assert_eq!(t.received_ms, NOW);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_strict_mode_rejects_out_of_bounds() {
        let payload = r#"{"id":"T2","price":"-1","quantity":"2","side":"sell","symbol":"BTC/USD","timestamp":1690000000000}"#;
        let strict = json_trade_processor(true);
        assert!(matches!(
            strict.process(&filtered(MessageFormat::Json, MessageCategory::Trade, payload)),
            ProcessOutcome::Rejected(_)
        ));
        let errors = strict.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message_id, "T2");
        assert!(errors[0].message_snippet.starts_with("{\"id\":\"T2\""));

        let lenient = json_trade_processor(false);
        match lenient.process(&filtered(MessageFormat::Json, MessageCategory::Trade, payload)) {
            ProcessOutcome::Normalized { warnings, .. } => assert_eq!(warnings.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_disable_after_error_limit_and_enable() {
        let mut cfg = ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Trade));
        cfg.max_errors_before_disable = 2;
        let p = MessageProcessor::new("flaky", cfg);
        let bad = filtered(MessageFormat::Json, MessageCategory::Trade, r#"{"id":"X","timestamp":1690000000000}"#);
        assert!(matches!(p.process(&bad), ProcessOutcome::Rejected(_)));
        assert!(!p.is_disabled());
        assert!(matches!(p.process(&bad), ProcessOutcome::Rejected(_)));
        assert!(p.is_disabled());
        assert_eq!(p.process(&filtered(MessageFormat::Json, MessageCategory::Trade, TRADE)), ProcessOutcome::Disabled);

        p.enable();
        assert!(matches!(
            p.process(&filtered(MessageFormat::Json, MessageCategory::Trade, TRADE)),
            ProcessOutcome::Normalized { .. }
        ));
        assert_eq!(p.statistics().error_count, 2);
    }

    #[test]
    fn test_error_log_is_bounded() {
        let mut cfg = ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Trade));
        cfg.max_errors_before_disable = 0;
        let p = MessageProcessor::new("noisy", cfg);
        let bad = filtered(MessageFormat::Json, MessageCategory::Trade, r#"{"id":"X","timestamp":1690000000000}"#);
        for _ in 0..(MAX_ERROR_LOG_SIZE + 5) {
            p.process(&bad);
        }
        assert_eq!(p.errors().len(), MAX_ERROR_LOG_SIZE);
        assert!(!p.is_disabled());
    }

    #[test]
    fn test_require_order_id() {
        let mut cfg = ProcessorConfig::new(ProcessorKind::new(MessageFormat::Json, MessageCategory::Trade));
        cfg.require_order_id = true;
        cfg.strict_mode = true;
        let p = MessageProcessor::new("orders", cfg);
        assert!(matches!(
            p.process(&filtered(MessageFormat::Json, MessageCategory::Trade, TRADE)),
            ProcessOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_wrong_format_is_rejected() {
        let p = json_trade_processor(false);
        let fix = filtered(MessageFormat::Fix, MessageCategory::Trade, "35=AE|52=20230722-04:26:40|571=T|55=X|31=1|32=1|54=1|");
        assert!(matches!(p.process(&fix), ProcessOutcome::Rejected(_)));
    }

    #[test]
    fn test_shape_book_sorts_truncates_and_drops() {
        let mut book = NormalizedOrderbook {
            orderbook_id: "b".into(),
            currency_pair: "BTC/USD".into(),
            exchange: "x".into(),
            bids: vec![NormalizedOrderbookLevel::new(99.0, 1.0), NormalizedOrderbookLevel::new(100.0, 0.01)],
            asks: vec![
                NormalizedOrderbookLevel::new(103.0, 1.0),
                NormalizedOrderbookLevel::new(101.0, 1.0),
                NormalizedOrderbookLevel::new(102.0, 1.0),
            ],
            timestamp_ms: 0,
            received_ms: 0,
            source: "a".into(),
            original_message_id: "m".into(),
            sequence: None,
            is_snapshot: true,
            spread: None,
            mid_price: None,
            total_levels: 0,
        };
        let shaping = BookShaping { max_levels_per_side: 2, min_level_quantity: 0.1, ..BookShaping::default() };
        shape_book(&shaping, &mut book);
        assert_eq!(book.bids.iter().map(|l| l.price).collect::<Vec<_>>(), vec![99.0]);
        assert_eq!(book.asks.iter().map(|l| l.price).collect::<Vec<_>>(), vec![101.0, 102.0]);
    }
}
