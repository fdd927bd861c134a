use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use super::{exchange_or_default, Decoded, ProcessorConfig};
use crate::engine::types::{NormalizedOrderbook, NormalizedOrderbookLevel, NormalizedTrade, PipelineError, Side};
use crate::market_data::adapters::fix::{FixMessage, TAG_SENDING_TIME};
use crate::market_data::extractor::ParsedPayload;
use crate::market_data::filter::FilteredMessage;
use crate::market_data::normaliser::{parse_decimal, parse_fix_timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixTradeMapping {
    pub trade_id_tag: u32,      // TradeReportID
    pub price_tag: u32,         // LastPx
    pub quantity_tag: u32,      // LastQty
    pub side_tag: u32,          // Side
    pub timestamp_tag: u32,     // TransactTime
    pub symbol_tag: u32,        // Symbol
    pub order_id_tag: u32,      // OrderID
    pub exec_id_tag: u32,       // ExecID, fallback trade id
    pub commission_tag: u32,    // Commission
    pub fee_currency_tag: u32,  // CommCurrency
    pub liquidity_tag: u32,     // LastLiquidityInd, 1 = added (maker)
    pub exchange_tag: Option<u32>,
    pub sequence_tag: Option<u32>,
}

impl Default for FixTradeMapping {
    fn default() -> Self {
        Self {
            trade_id_tag: 571,
            price_tag: 31,
            quantity_tag: 32,
            side_tag: 54,
            timestamp_tag: 60,
            symbol_tag: 55,
            order_id_tag: 37,
            exec_id_tag: 17,
            commission_tag: 12,
            fee_currency_tag: 479,
            liquidity_tag: 851,
            exchange_tag: Some(207),
            sequence_tag: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FixOrderbookMapping {
    pub request_id_tag: u32,     // MDReqID
    pub symbol_tag: u32,
    pub timestamp_tag: u32,
    pub no_entries_tag: u32,     // NoMDEntries
    pub entry_type_tag: u32,     // MDEntryType, 0 = bid, 1 = offer
    pub entry_px_tag: u32,
    pub entry_size_tag: u32,
    pub position_tag: u32,       // MDEntryPositionNo
    pub update_action_tag: u32,  // MDUpdateAction, 2 = delete
    pub order_count_tag: u32,    // NumberOfOrders
    pub sequence_tag: u32,       // RptSeq
    pub exchange_tag: Option<u32>,
    pub snapshot_msg_types: Vec<String>,
    pub incremental_msg_types: Vec<String>,
}

impl Default for FixOrderbookMapping {
    fn default() -> Self {
        Self {
            request_id_tag: 262,
            symbol_tag: 55,
            timestamp_tag: 60,
            no_entries_tag: 268,
            entry_type_tag: 269,
            entry_px_tag: 270,
            entry_size_tag: 271,
            position_tag: 290,
            update_action_tag: 279,
            order_count_tag: 346,
            sequence_tag: 83,
            exchange_tag: Some(207),
            snapshot_msg_types: vec!["W".into()],
            incremental_msg_types: vec!["X".into()],
        }
    }
}

const ACTION_DELETE: &str = "2";

fn fix_message(msg: &FilteredMessage) -> Result<Cow<'_, FixMessage>, PipelineError> {
    match &msg.message_info.payload {
        ParsedPayload::Fix(m) => Ok(Cow::Borrowed(m)),
        _ => FixMessage::parse(&msg.message_info.original_message).map(Cow::Owned),
    }
}

fn required_decimal(fix: &FixMessage, tag: u32, what: &str) -> Result<f64, PipelineError> {
    let raw = fix.get(tag).ok_or_else(|| PipelineError::MalformedMessage(format!("missing {what} (tag {tag})")))?;
    parse_decimal(raw).ok_or_else(|| PipelineError::MalformedMessage(format!("{what} (tag {tag}) is not a number: {raw:?}")))
}

// Falls back from the mapped tag to SendingTime, then to the extracted timestamp
fn timestamp(fix: &FixMessage, tag: u32, extracted: u64) -> u64 {
    fix.get(tag)
        .and_then(parse_fix_timestamp)
        .or_else(|| fix.get(TAG_SENDING_TIME).and_then(parse_fix_timestamp))
        .unwrap_or(extracted)
}

pub(super) fn decode_trade(
    m: &FixTradeMapping,
    config: &ProcessorConfig,
    msg: &FilteredMessage,
) -> Result<Decoded, PipelineError> {
    let fix = fix_message(msg)?;
    let info = &msg.message_info;

    let price = required_decimal(&fix, m.price_tag, "price")?;
    let quantity = required_decimal(&fix, m.quantity_tag, "quantity")?;
    let side_code = fix
        .get(m.side_tag)
        .ok_or_else(|| PipelineError::MalformedMessage(format!("missing side (tag {})", m.side_tag)))?;
    let side = match side_code.trim() {
        "1" => Side::BUY,
        "2" => Side::SELL,
        other => {
            return Err(PipelineError::MalformedMessage(format!("unsupported FIX side {other:?}")));
        }
    };
    let currency_pair = fix
        .get(m.symbol_tag)
        .map(str::to_string)
        .or_else(|| info.summary.currency_pair.clone())
        .ok_or_else(|| PipelineError::MalformedMessage("missing symbol".into()))?;

    let trade_id = fix
        .get(m.trade_id_tag)
        .or_else(|| fix.get(m.exec_id_tag))
        .map(str::to_string)
        .unwrap_or_else(|| info.message_id.clone());
    let exchange = m.exchange_tag.and_then(|t| fix.get(t)).map(str::to_string);

    Ok(Decoded::Trade(NormalizedTrade {
        trade_id,
        currency_pair,
        exchange: exchange_or_default(exchange, config, msg),
        price,
        quantity,
        side,
        timestamp_ms: timestamp(&fix, m.timestamp_tag, info.timestamp_ms),
        received_ms: msg.received_ms,
        source: msg.source_connection.clone(),
        original_message_id: info.message_id.clone(),
        sequence: m.sequence_tag.and_then(|t| fix.get(t)).and_then(|s| s.trim().parse().ok()),
        order_id: fix.get(m.order_id_tag).map(str::to_string),
        fee: fix.get(m.commission_tag).and_then(parse_decimal),
        fee_currency: fix.get(m.fee_currency_tag).map(str::to_string),
        is_maker: fix.get(m.liquidity_tag).and_then(|v| match v.trim() {
            "1" => Some(true),
            "2" => Some(false),
            _ => None,
        }),
    }))
}

pub(super) fn decode_orderbook(
    m: &FixOrderbookMapping,
    config: &ProcessorConfig,
    msg: &FilteredMessage,
) -> Result<Decoded, PipelineError> {
    let fix = fix_message(msg)?;
    let info = &msg.message_info;

    let msg_type = fix.msg_type().unwrap_or_default();
    let is_snapshot = if m.snapshot_msg_types.iter().any(|t| t == msg_type) {
        true
    } else if m.incremental_msg_types.iter().any(|t| t == msg_type) {
        if !config.book.process_incremental {
            return Ok(Decoded::Skip("incremental updates are disabled".into()));
        }
        false
    } else {
        return Err(PipelineError::MalformedMessage(format!("unexpected MsgType {msg_type:?} for orderbook")));
    };

    let mut currency_pair = fix.get(m.symbol_tag).map(str::to_string);
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    for entry in fix.repeating_group(m.no_entries_tag) {
        // incremental refreshes carry the symbol per entry
        if currency_pair.is_none() {
            currency_pair = entry.get(m.symbol_tag).map(str::to_string);
        }
        let book_side = match entry.get(m.entry_type_tag) {
            Some("0") => &mut bids,
            Some("1") => &mut asks,
            _ => continue,
        };
        let price = entry
            .get(m.entry_px_tag)
            .and_then(parse_decimal)
            .ok_or_else(|| PipelineError::MalformedMessage(format!("entry without price (tag {})", m.entry_px_tag)))?;
        let deleted = entry.get(m.update_action_tag) == Some(ACTION_DELETE);
        let quantity = if deleted {
            0.0
        } else {
            entry
                .get(m.entry_size_tag)
                .and_then(parse_decimal)
                .ok_or_else(|| PipelineError::MalformedMessage(format!("entry without size (tag {})", m.entry_size_tag)))?
        };
        let position = entry.get(m.position_tag).and_then(|p| p.trim().parse::<usize>().ok());
        book_side.push((
            position,
            NormalizedOrderbookLevel {
                price,
                quantity,
                order_count: entry.get(m.order_count_tag).and_then(|c| c.trim().parse().ok()),
            },
        ));
    }
    if is_snapshot && bids.is_empty() && asks.is_empty() {
        return Err(PipelineError::MalformedMessage("snapshot without entries".into()));
    }

    let currency_pair = currency_pair
        .or_else(|| info.summary.currency_pair.clone())
        .ok_or_else(|| PipelineError::MalformedMessage("missing symbol".into()))?;
    let exchange = m.exchange_tag.and_then(|t| fix.get(t)).map(str::to_string);

    Ok(Decoded::Orderbook(NormalizedOrderbook {
        orderbook_id: fix.get(m.request_id_tag).map(str::to_string).unwrap_or_else(|| info.message_id.clone()),
        currency_pair,
        exchange: exchange_or_default(exchange, config, msg),
        bids: by_position(bids),
        asks: by_position(asks),
        timestamp_ms: timestamp(&fix, m.timestamp_tag, info.timestamp_ms),
        received_ms: msg.received_ms,
        source: msg.source_connection.clone(),
        original_message_id: info.message_id.clone(),
        sequence: fix.get(m.sequence_tag).and_then(|s| s.trim().parse().ok()),
        is_snapshot,
        spread: None,
        mid_price: None,
        total_levels: 0,
    }))
}

// Entries with a position number go first in position order; the rest keep wire order.
fn by_position(mut entries: Vec<(Option<usize>, NormalizedOrderbookLevel)>) -> Vec<NormalizedOrderbookLevel> {
    entries.sort_by_key(|(pos, _)| pos.unwrap_or(usize::MAX));
    entries.into_iter().map(|(_, level)| level).collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::filtered;
    use super::super::{MessageProcessor, ProcessOutcome, ProcessorConfig, ProcessorKind};
    use crate::engine::types::{MessageCategory, MessageFormat, Normalized, Side};

    fn processor(category: MessageCategory) -> MessageProcessor {
        MessageProcessor::new("fix", ProcessorConfig::new(ProcessorKind::new(MessageFormat::Fix, category)))
    }

    #[test]
    fn test_fix_trade_capture_report() {
        let msg = "8=FIX.4.4|35=AE|52=20230722-04:26:40.500|571=TR1|55=BTC/USD|31=100.5|32=2|54=2|\
                   60=20230722-04:26:40.250|37=ORD1|12=0.05|479=USD|851=1|";
        let p = processor(MessageCategory::Trade);
        match p.process(&filtered(MessageFormat::Fix, MessageCategory::Trade, msg)) {
            ProcessOutcome::Normalized { record: Normalized::Trade(t), warnings } => {
                assert!(warnings.is_empty());
                assert_eq!(t.trade_id, "TR1");
                assert_eq!(t.side, Side::SELL);
                assert_eq!(t.timestamp_ms, 1_690_000_000_250);
                assert_eq!(t.order_id.as_deref(), Some("ORD1"));
                assert_eq!(t.fee, Some(0.05));
                assert_eq!(t.is_maker, Some(true));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exec_id_fallback_and_sending_time() {
        let mut cfg = ProcessorConfig::new(ProcessorKind::new(MessageFormat::Fix, MessageCategory::Trade));
        cfg.default_exchange = Some("fixvenue".into());
        let p = MessageProcessor::new("fix", cfg);
        // extractor keys on 571, so give it one; the processor mapping looks elsewhere
        let msg = "35=8|52=20230722-04:26:40|571=R1|17=EX9|55=ETH/USD|31=10|32=1|54=1|";
        let mut filtered = filtered(MessageFormat::Fix, MessageCategory::Trade, msg);
        if let ProcessorKind::FixTrade(mut m) = p.kind() {
            m.trade_id_tag = 9999;
            let mut cfg = p.config();
            cfg.kind = ProcessorKind::FixTrade(m);
            p.set_config(cfg);
        }
        filtered.message_info.summary.exchange = None;
        match p.process(&filtered) {
            ProcessOutcome::Normalized { record: Normalized::Trade(t), .. } => {
                assert_eq!(t.trade_id, "EX9");
                assert_eq!(t.exchange, "fixvenue");
                assert_eq!(t.timestamp_ms, 1_690_000_000_000);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_side_is_rejected() {
        let msg = "35=AE|52=20230722-04:26:40|571=TR2|55=BTC/USD|31=1|32=1|54=7|";
        let p = processor(MessageCategory::Trade);
        assert!(matches!(
            p.process(&filtered(MessageFormat::Fix, MessageCategory::Trade, msg)),
            ProcessOutcome::Rejected(_)
        ));
    }

    #[test]
    fn test_fix_snapshot_full_refresh() {
        let msg = "35=W|52=20230722-04:26:40|262=REQ1|55=BTC/USD|83=11|268=3|\
                   269=0|270=100|271=1|346=4|269=1|270=101|271=2|269=0|270=99.5|271=3|";
        let p = processor(MessageCategory::Orderbook);
        match p.process(&filtered(MessageFormat::Fix, MessageCategory::Orderbook, msg)) {
            ProcessOutcome::Normalized { record: Normalized::Orderbook(b), warnings } => {
                assert!(warnings.is_empty());
                assert!(b.is_snapshot);
                assert_eq!(b.orderbook_id, "REQ1");
                assert_eq!(b.sequence, Some(11));
                assert_eq!(b.bids.len(), 2);
                assert_eq!(b.bids[0].order_count, Some(4));
                assert_eq!(b.spread, Some(1.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fix_incremental_delete_action() {
        let msg = "35=X|52=20230722-04:26:40|262=REQ1|83=12|268=2|\
                   279=2|269=0|55=BTC/USD|270=100|279=0|269=1|55=BTC/USD|270=100.5|271=4|";
        let p = processor(MessageCategory::Orderbook);
        match p.process(&filtered(MessageFormat::Fix, MessageCategory::Orderbook, msg)) {
            ProcessOutcome::Normalized { record: Normalized::Orderbook(b), .. } => {
                assert!(!b.is_snapshot);
                assert_eq!(b.currency_pair, "BTC/USD");
                assert_eq!(b.bids[0].quantity, 0.0);
                assert_eq!(b.asks[0].quantity, 4.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
