use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wall clock in unix milliseconds. All pipeline timestamps use this unit.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    BUY,
    SELL,
}

impl Side {
    /// Accepts the spellings venues actually send: words, single letters and FIX codes.
    pub fn from_wire(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" | "b" | "bid" | "1" => Some(Side::BUY),
            "sell" | "s" | "ask" | "offer" | "2" => Some(Side::SELL),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::BUY => "buy",
            Side::SELL => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    Json,
    Fix,
}

impl fmt::Display for MessageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageFormat::Json => f.write_str("JSON"),
            MessageFormat::Fix => f.write_str("FIX"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageCategory {
    #[default]
    Trade,
    Orderbook,
}

impl fmt::Display for MessageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageCategory::Trade => f.write_str("Trade"),
            MessageCategory::Orderbook => f.write_str("Orderbook"),
        }
    }
}

// Raw bytes as handed over by a connection source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub source_id: String,
    pub payload: Vec<u8>,
    pub arrival_ms: u64,
}

impl RawMessage {
    pub fn new(source_id: impl Into<String>, payload: impl Into<Vec<u8>>, arrival_ms: u64) -> Self {
        Self { source_id: source_id.into(), payload: payload.into(), arrival_ms }
    }

    pub fn text(&self) -> Result<&str, PipelineError> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| PipelineError::MalformedMessage(format!("payload is not utf-8: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedTrade {
    pub trade_id: String,
    pub currency_pair: String,
    pub exchange: String,
    pub price: f64,
    pub quantity: f64,
    pub side: Side,
    pub timestamp_ms: u64,
    pub received_ms: u64,
    pub source: String,
    pub original_message_id: String,
    pub sequence: Option<u64>,
    pub order_id: Option<String>,
    pub fee: Option<f64>,
    pub fee_currency: Option<String>,
    pub is_maker: Option<bool>,
}

impl NormalizedTrade {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrderbookLevel {
    pub price: f64,
    // zero means "remove this price" inside an incremental update
    pub quantity: f64,
    pub order_count: Option<u32>,
}

impl NormalizedOrderbookLevel {
    pub fn new(price: f64, quantity: f64) -> Self {
        Self { price, quantity, order_count: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedOrderbook {
    pub orderbook_id: String,
    pub currency_pair: String,
    pub exchange: String,
    pub bids: Vec<NormalizedOrderbookLevel>, // descending price
    pub asks: Vec<NormalizedOrderbookLevel>, // ascending price
    pub timestamp_ms: u64,
    pub received_ms: u64,
    pub source: String,
    pub original_message_id: String,
    pub sequence: Option<u64>,
    pub is_snapshot: bool,
    pub spread: Option<f64>,
    pub mid_price: Option<f64>,
    pub total_levels: usize,
}

impl NormalizedOrderbook {
    /// Best bid among levels that still carry quantity.
    pub fn best_bid(&self) -> Option<f64> {
        self.bids
            .iter()
            .filter(|l| l.quantity > 0.0)
            .map(|l| l.price)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))))
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks
            .iter()
            .filter(|l| l.quantity > 0.0)
            .map(|l| l.price)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
    }

    pub fn refresh_derived(&mut self) {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => {
                self.spread = Some(ask - bid);
                self.mid_price = Some((ask + bid) / 2.0);
            }
            _ => {
                self.spread = None;
                self.mid_price = None;
            }
        }
        self.total_levels = self.bids.len() + self.asks.len();
    }

    /// Checks sort order, duplicate prices and (when asked) that the book is not crossed.
    pub fn check_integrity(&self, check_cross: bool) -> Result<(), PipelineError> {
        for pair in self.bids.windows(2) {
            if pair[0].price <= pair[1].price {
                return Err(PipelineError::ValidationFailure(format!(
                    "bids not strictly descending at {} -> {}",
                    pair[0].price, pair[1].price
                )));
            }
        }
        for pair in self.asks.windows(2) {
            if pair[0].price >= pair[1].price {
                return Err(PipelineError::ValidationFailure(format!(
                    "asks not strictly ascending at {} -> {}",
                    pair[0].price, pair[1].price
                )));
            }
        }
        if check_cross {
            if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
                if bid >= ask {
                    return Err(PipelineError::ValidationFailure(format!(
                        "crossed book: best bid {bid} >= best ask {ask}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Output of a processor, input of an updater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Normalized {
    Trade(NormalizedTrade),
    Orderbook(NormalizedOrderbook),
}

impl Normalized {
    pub fn currency_pair(&self) -> &str {
        match self {
            Normalized::Trade(t) => &t.currency_pair,
            Normalized::Orderbook(b) => &b.currency_pair,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            Normalized::Trade(t) => &t.source,
            Normalized::Orderbook(b) => &b.source,
        }
    }

    pub fn category(&self) -> MessageCategory {
        match self {
            Normalized::Trade(_) => MessageCategory::Trade,
            Normalized::Orderbook(_) => MessageCategory::Orderbook,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("sequence gap on {pair}: expected {expected}, received {received}")]
    SequenceGap { pair: String, expected: u64, received: u64 },

    #[error("data conflict on {pair}: {description}")]
    DataConflict { pair: String, description: String },

    #[error("capacity exceeded: {what} (limit {limit})")]
    CapacityExceeded { what: String, limit: usize },

    #[error("graph wiring error: {0}")]
    GraphWiring(String),

    #[error("invalid filter rule: {0}")]
    InvalidRule(String),

    #[error("processor {0} is disabled")]
    ProcessorDisabled(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<crate::graph::GraphError> for PipelineError {
    fn from(err: crate::graph::GraphError) -> Self {
        PipelineError::GraphWiring(err.to_string())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn level(price: f64, quantity: f64) -> NormalizedOrderbookLevel {
        NormalizedOrderbookLevel::new(price, quantity)
    }

    fn book(bids: Vec<NormalizedOrderbookLevel>, asks: Vec<NormalizedOrderbookLevel>) -> NormalizedOrderbook {
        NormalizedOrderbook {
            orderbook_id: "ob".into(),
            currency_pair: "BTC/USD".into(),
            exchange: "test".into(),
            bids,
            asks,
            timestamp_ms: 1,
            received_ms: 2,
            source: "a".into(),
            original_message_id: "m".into(),
            sequence: None,
            is_snapshot: true,
            spread: None,
            mid_price: None,
            total_levels: 0,
        }
    }

    #[test]
    fn test_side_from_wire() {
        assert_eq!(Side::from_wire("BUY"), Some(Side::BUY));
        assert_eq!(Side::from_wire("2"), Some(Side::SELL));
        assert_eq!(Side::from_wire("ask"), Some(Side::SELL));
        assert_eq!(Side::from_wire("hold"), None);
        assert_eq!(serde_json::to_string(&Side::BUY).unwrap(), "\"buy\"");
    }

    #[test]
    fn test_derived_fields() {
        let mut ob = book(vec![level(100.0, 1.0), level(99.0, 2.0)], vec![level(101.0, 1.0)]);
        ob.refresh_derived();
        assert_eq!(ob.spread, Some(1.0));
        assert_eq!(ob.mid_price, Some(100.5));
        assert_eq!(ob.total_levels, 3);
    }

    #[test]
    fn test_integrity_detects_unsorted_and_crossed() {
        let unsorted = book(vec![level(99.0, 1.0), level(100.0, 1.0)], vec![]);
        assert!(unsorted.check_integrity(true).is_err());

        let crossed = book(vec![level(101.0, 1.0)], vec![level(100.0, 1.0)]);
        assert!(crossed.check_integrity(false).is_ok());
        assert!(crossed.check_integrity(true).is_err());

        let one_sided = book(vec![level(101.0, 1.0)], vec![]);
        assert!(one_sided.check_integrity(true).is_ok());
    }
}
