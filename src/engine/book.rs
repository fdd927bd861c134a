use std::collections::BTreeMap;

use ordered_float::OrderedFloat;
use tracing::{debug, instrument, trace};

use crate::engine::types::{NormalizedOrderbook, NormalizedOrderbookLevel, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub quantity: f64,
    pub order_count: Option<u32>,
    pub updated_ms: u64,
}

/// Price-keyed depth for one instrument. Both sides are kept in ascending key
/// order; the best bid is the last bid key, the best ask the first ask key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LevelBook {
    pub bids: BTreeMap<OrderedFloat<f64>, BookLevel>,
    pub asks: BTreeMap<OrderedFloat<f64>, BookLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LevelChanges {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl LevelBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_orderbook(ob: &NormalizedOrderbook) -> Self {
        let mut book = LevelBook::new();
        book.apply_snapshot(&ob.bids, &ob.asks, ob.timestamp_ms);
        book
    }

    // Replace the whole book with a fresh snapshot
    #[instrument(level = "trace", skip_all, fields(bids = bids.len(), asks = asks.len()))]
    pub fn apply_snapshot(&mut self, bids: &[NormalizedOrderbookLevel], asks: &[NormalizedOrderbookLevel], ts_ms: u64) {
        self.bids.clear();
        self.asks.clear();
        for lvl in bids.iter().filter(|l| l.quantity > 0.0) {
            self.bids.insert(OrderedFloat(lvl.price), Self::level(lvl, ts_ms));
        }
        for lvl in asks.iter().filter(|l| l.quantity > 0.0) {
            self.asks.insert(OrderedFloat(lvl.price), Self::level(lvl, ts_ms));
        }
        trace!(bid_levels = self.bids.len(), ask_levels = self.asks.len(), "Applied snapshot");
    }

    /// Level-by-level insert/update/delete. Quantity zero deletes the price.
    pub fn apply_delta(&mut self, bids: &[NormalizedOrderbookLevel], asks: &[NormalizedOrderbookLevel], ts_ms: u64) -> LevelChanges {
        let mut changes = LevelChanges::default();
        Self::apply_side(&mut self.bids, bids, ts_ms, &mut changes);
        Self::apply_side(&mut self.asks, asks, ts_ms, &mut changes);
        debug!(
            inserted = changes.inserted,
            updated = changes.updated,
            deleted = changes.deleted,
            "Applied incremental update"
        );
        changes
    }

    fn apply_side(
        side: &mut BTreeMap<OrderedFloat<f64>, BookLevel>,
        levels: &[NormalizedOrderbookLevel],
        ts_ms: u64,
        changes: &mut LevelChanges,
    ) {
        for lvl in levels {
            let key = OrderedFloat(lvl.price);
            if lvl.quantity <= 0.0 {
                if side.remove(&key).is_some() {
                    changes.deleted += 1;
                }
            } else if side.insert(key, Self::level(lvl, ts_ms)).is_some() {
                changes.updated += 1;
            } else {
                changes.inserted += 1;
            }
        }
    }

    fn level(lvl: &NormalizedOrderbookLevel, ts_ms: u64) -> BookLevel {
        BookLevel { quantity: lvl.quantity, order_count: lvl.order_count, updated_ms: ts_ms }
    }

    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.iter().next_back().map(|(p, l)| (p.0, l.quantity))
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.iter().next().map(|(p, l)| (p.0, l.quantity))
    }

    pub fn spread(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some(ask - bid)
    }

    pub fn mid_price(&self) -> Option<f64> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((ask + bid) / 2.0)
    }

    pub fn total_levels(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Best bid must stay strictly below best ask, and no level may carry a
    /// non-positive quantity. Sort order and unique prices hold by construction.
    pub fn check_integrity(&self) -> Result<(), PipelineError> {
        if let (Some((bid, _)), Some((ask, _))) = (self.best_bid(), self.best_ask()) {
            if bid >= ask {
                return Err(PipelineError::ValidationFailure(format!(
                    "crossed book: best bid {bid} >= best ask {ask}"
                )));
            }
        }
        let bad = self
            .bids
            .iter()
            .chain(self.asks.iter())
            .find(|(_, l)| l.quantity <= 0.0 || !l.quantity.is_finite());
        if let Some((price, lvl)) = bad {
            return Err(PipelineError::ValidationFailure(format!(
                "level {} carries invalid quantity {}",
                price.0, lvl.quantity
            )));
        }
        Ok(())
    }

    /// Union keyed by price; where both books hold a price the later update wins.
    pub fn merge_union(&self, other: &LevelBook) -> LevelBook {
        LevelBook {
            bids: Self::merge_side(&self.bids, &other.bids),
            asks: Self::merge_side(&self.asks, &other.asks),
        }
    }

    fn merge_side(
        left: &BTreeMap<OrderedFloat<f64>, BookLevel>,
        right: &BTreeMap<OrderedFloat<f64>, BookLevel>,
    ) -> BTreeMap<OrderedFloat<f64>, BookLevel> {
        let mut merged = left.clone();
        for (price, lvl) in right {
            match merged.get(price) {
                Some(existing) if existing.updated_ms > lvl.updated_ms => {}
                _ => {
                    merged.insert(*price, *lvl);
                }
            }
        }
        merged
    }

    /// Bids descending, asks ascending.
    pub fn to_levels(&self) -> (Vec<NormalizedOrderbookLevel>, Vec<NormalizedOrderbookLevel>) {
        let convert = |(p, l): (&OrderedFloat<f64>, &BookLevel)| NormalizedOrderbookLevel {
            price: p.0,
            quantity: l.quantity,
            order_count: l.order_count,
        };
        let bids = self.bids.iter().rev().map(convert).collect();
        let asks = self.asks.iter().map(convert).collect();
        (bids, asks)
    }
}
