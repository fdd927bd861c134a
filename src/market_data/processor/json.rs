use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{exchange_or_default, Decoded, ProcessorConfig};
use crate::engine::types::{NormalizedOrderbook, NormalizedOrderbookLevel, NormalizedTrade, PipelineError, Side};
use crate::market_data::adapters::json_path::{lookup, lookup_string};
use crate::market_data::extractor::ParsedPayload;
use crate::market_data::filter::FilteredMessage;
use crate::market_data::normaliser::{parse_timestamp, value_as_bool, value_as_f64, value_as_u64, TimestampFormat};

/// Dot paths for each trade field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonTradeMapping {
    pub trade_id: String,
    pub price: String,
    pub quantity: String,
    pub side: String,
    pub timestamp: String,
    pub timestamp_format: TimestampFormat,
    pub currency_pair: String,
    pub order_id: String,
    pub fee: String,
    pub fee_currency: String,
    pub is_maker: String,
    pub exchange: Option<String>,
    pub sequence: Option<String>,
}

impl Default for JsonTradeMapping {
    fn default() -> Self {
        Self {
            trade_id: "id".into(),
            price: "price".into(),
            quantity: "quantity".into(),
            side: "side".into(),
            timestamp: "timestamp".into(),
            timestamp_format: TimestampFormat::Auto,
            currency_pair: "symbol".into(),
            order_id: "orderId".into(),
            fee: "fee".into(),
            fee_currency: "feeCurrency".into(),
            is_maker: "isMaker".into(),
            exchange: None,
            sequence: None,
        }
    }
}

/// Dot paths for orderbook fields. Level keys are either an array index or an
/// object field name inside each level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JsonOrderbookMapping {
    pub orderbook_id: String,
    pub currency_pair: String,
    pub timestamp: String,
    pub timestamp_format: TimestampFormat,
    pub bids: String,
    pub asks: String,
    pub level_price: String,
    pub level_quantity: String,
    pub level_count: String,
    pub sequence: Option<String>,
    pub snapshot_flag: Option<String>,
    // used when the snapshot flag is absent
    pub default_snapshot: bool,
    pub exchange: Option<String>,
}

impl Default for JsonOrderbookMapping {
    fn default() -> Self {
        Self {
            orderbook_id: "id".into(),
            currency_pair: "symbol".into(),
            timestamp: "timestamp".into(),
            timestamp_format: TimestampFormat::Auto,
            bids: "bids".into(),
            asks: "asks".into(),
            level_price: "0".into(),
            level_quantity: "1".into(),
            level_count: "count".into(),
            sequence: Some("sequence".into()),
            snapshot_flag: Some("isSnapshot".into()),
            default_snapshot: true,
            exchange: None,
        }
    }
}

fn document(msg: &FilteredMessage) -> Result<Cow<'_, Value>, PipelineError> {
    match &msg.message_info.payload {
        ParsedPayload::Json(v) => Ok(Cow::Borrowed(v)),
        _ => serde_json::from_str(&msg.message_info.original_message)
            .map(Cow::Owned)
            .map_err(|e| PipelineError::MalformedMessage(format!("invalid JSON: {e}"))),
    }
}

fn required_f64(doc: &Value, path: &str, what: &str) -> Result<f64, PipelineError> {
    let value = lookup(doc, path).ok_or_else(|| PipelineError::MalformedMessage(format!("missing {what} at {path:?}")))?;
    value_as_f64(value).ok_or_else(|| PipelineError::MalformedMessage(format!("{what} at {path:?} is not a number")))
}

fn optional_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        None
    } else {
        lookup(doc, path)
    }
}

pub(super) fn decode_trade(
    m: &JsonTradeMapping,
    config: &ProcessorConfig,
    msg: &FilteredMessage,
) -> Result<Decoded, PipelineError> {
    let doc = document(msg)?;
    let info = &msg.message_info;

    let price = required_f64(&doc, &m.price, "price")?;
    let quantity = required_f64(&doc, &m.quantity, "quantity")?;
    let side_raw = lookup_string(&doc, &m.side)
        .ok_or_else(|| PipelineError::MalformedMessage(format!("missing side at {:?}", m.side)))?;
    let side = Side::from_wire(&side_raw)
        .ok_or_else(|| PipelineError::MalformedMessage(format!("unrecognised side {side_raw:?}")))?;
    let currency_pair = lookup_string(&doc, &m.currency_pair)
        .or_else(|| info.summary.currency_pair.clone())
        .ok_or_else(|| PipelineError::MalformedMessage("missing currency pair".into()))?;

    let trade_id = lookup_string(&doc, &m.trade_id).unwrap_or_else(|| info.message_id.clone());
    let timestamp_ms = lookup(&doc, &m.timestamp)
        .and_then(|v| parse_timestamp(v, m.timestamp_format))
        .unwrap_or(info.timestamp_ms);
    let exchange = m.exchange.as_deref().and_then(|p| lookup_string(&doc, p));

    Ok(Decoded::Trade(NormalizedTrade {
        trade_id,
        currency_pair,
        exchange: exchange_or_default(exchange, config, msg),
        price,
        quantity,
        side,
        timestamp_ms,
        received_ms: msg.received_ms,
        source: msg.source_connection.clone(),
        original_message_id: info.message_id.clone(),
        sequence: m.sequence.as_deref().and_then(|p| lookup(&doc, p)).and_then(value_as_u64),
        order_id: optional_path(&doc, &m.order_id).and_then(|_| lookup_string(&doc, &m.order_id)),
        fee: optional_path(&doc, &m.fee).and_then(value_as_f64),
        fee_currency: optional_path(&doc, &m.fee_currency).and_then(|_| lookup_string(&doc, &m.fee_currency)),
        is_maker: optional_path(&doc, &m.is_maker).and_then(value_as_bool),
    }))
}

fn levels(doc: &Value, m: &JsonOrderbookMapping, path: &str) -> Result<Vec<NormalizedOrderbookLevel>, PipelineError> {
    let raw = match lookup(doc, path) {
        Some(Value::Array(items)) => items,
        Some(_) => return Err(PipelineError::MalformedMessage(format!("{path:?} is not an array"))),
        None => return Ok(Vec::new()),
    };
    raw.iter()
        .map(|level| {
            let price = lookup(level, &m.level_price).and_then(value_as_f64);
            let quantity = lookup(level, &m.level_quantity).and_then(value_as_f64);
            match (price, quantity) {
                (Some(price), Some(quantity)) => Ok(NormalizedOrderbookLevel {
                    price,
                    quantity,
                    order_count: lookup(level, &m.level_count).and_then(value_as_u64).and_then(|c| u32::try_from(c).ok()),
                }),
                _ => Err(PipelineError::MalformedMessage(format!("unreadable level in {path:?}: {level}"))),
            }
        })
        .collect()
}

pub(super) fn decode_orderbook(
    m: &JsonOrderbookMapping,
    config: &ProcessorConfig,
    msg: &FilteredMessage,
) -> Result<Decoded, PipelineError> {
    let doc = document(msg)?;
    let info = &msg.message_info;

    let is_snapshot = m
        .snapshot_flag
        .as_deref()
        .and_then(|p| lookup(&doc, p))
        .and_then(value_as_bool)
        .unwrap_or(m.default_snapshot);
    if !is_snapshot && !config.book.process_incremental {
        return Ok(Decoded::Skip("incremental updates are disabled".into()));
    }

    let bids = levels(&doc, m, &m.bids)?;
    let asks = levels(&doc, m, &m.asks)?;
    if bids.is_empty() && asks.is_empty() && is_snapshot {
        return Err(PipelineError::MalformedMessage("snapshot without levels".into()));
    }
    let currency_pair = lookup_string(&doc, &m.currency_pair)
        .or_else(|| info.summary.currency_pair.clone())
        .ok_or_else(|| PipelineError::MalformedMessage("missing currency pair".into()))?;
    let exchange = m.exchange.as_deref().and_then(|p| lookup_string(&doc, p));

    Ok(Decoded::Orderbook(NormalizedOrderbook {
        orderbook_id: lookup_string(&doc, &m.orderbook_id).unwrap_or_else(|| info.message_id.clone()),
        currency_pair,
        exchange: exchange_or_default(exchange, config, msg),
        bids,
        asks,
        timestamp_ms: lookup(&doc, &m.timestamp)
            .and_then(|v| parse_timestamp(v, m.timestamp_format))
            .unwrap_or(info.timestamp_ms),
        received_ms: msg.received_ms,
        source: msg.source_connection.clone(),
        original_message_id: info.message_id.clone(),
        sequence: m.sequence.as_deref().and_then(|p| lookup(&doc, p)).and_then(value_as_u64),
        is_snapshot,
        spread: None,
        mid_price: None,
        total_levels: 0,
    }))
}
