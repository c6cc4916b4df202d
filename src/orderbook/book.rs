//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management. The book only
//! knows how to apply levels; sequencing is the synchronizer's job.

use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{BookView, DiffEvent, Level, OrderBookMetrics, Side};
use crate::parser::{OrderBookSnapshot, PriceLevel};

/// Order book for a single symbol
#[derive(Debug)]
pub struct OrderBook {
    symbol: String,
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Last applied update ID
    last_update_id: u64,
    /// Server timestamp of the last applied message
    last_update_time: u64,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            last_update_time: 0,
        }
    }

    /// Replace the whole book with a REST snapshot
    pub fn load_snapshot(&mut self, snapshot: &OrderBookSnapshot) {
        self.clear();

        for level in &snapshot.bids {
            self.update_side(Side::Bid, level);
        }
        for level in &snapshot.asks {
            self.update_side(Side::Ask, level);
        }

        self.last_update_id = snapshot.last_update_id;
        // REST reports milliseconds, streams microseconds
        self.last_update_time = snapshot.timestamp.saturating_mul(1000);
    }

    /// Apply the level changes of a diff. Callers are responsible for
    /// checking that the diff is in sequence.
    pub fn apply_diff(&mut self, diff: &DiffEvent) {
        for level in &diff.bid_changes {
            self.update_side(Side::Bid, level);
        }
        for level in &diff.ask_changes {
            self.update_side(Side::Ask, level);
        }

        self.last_update_id = diff.final_update_id;
        self.last_update_time = diff.server_timestamp;
    }

    /// Sizes are absolute; zero removes the level
    fn update_side(&mut self, side: Side, level: &PriceLevel) {
        match side {
            Side::Bid => {
                if level.quantity.is_zero() {
                    self.bids.remove(&Reverse(level.price));
                } else {
                    self.bids.insert(Reverse(level.price), level.quantity);
                }
            }
            Side::Ask => {
                if level.quantity.is_zero() {
                    self.asks.remove(&level.price);
                } else {
                    self.asks.insert(level.price, level.quantity);
                }
            }
        }
    }

    /// Drop all levels and sequencing state
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
        self.last_update_time = 0;
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    pub fn bid_size(&self, price: Decimal) -> Option<Decimal> {
        self.bids.get(&Reverse(price)).copied()
    }

    pub fn ask_size(&self, price: Decimal) -> Option<Decimal> {
        self.asks.get(&price).copied()
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }

    /// Calculate order book imbalance at top N levels
    pub fn imbalance(&self, levels: usize) -> Option<Decimal> {
        let bid_volume: Decimal = self.bids.iter().take(levels).map(|(_, q)| q).sum();
        let ask_volume: Decimal = self.asks.iter().take(levels).map(|(_, q)| q).sum();

        let total = bid_volume + ask_volume;
        if total > Decimal::ZERO {
            Some((bid_volume - ask_volume) / total)
        } else {
            None
        }
    }

    /// Get last update ID
    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    /// Immutable view of the top `depth` levels per side
    pub fn view(&self, depth: usize) -> BookView {
        BookView {
            symbol: self.symbol.clone(),
            timestamp: self.last_update_time,
            last_update_id: self.last_update_id,
            bids: self
                .bids
                .iter()
                .take(depth)
                .map(|(Reverse(p), q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            asks: self
                .asks
                .iter()
                .take(depth)
                .map(|(p, q)| Level {
                    price: *p,
                    quantity: *q,
                })
                .collect(),
            metrics: self.calculate_metrics(),
        }
    }

    /// Calculate order book metrics
    fn calculate_metrics(&self) -> OrderBookMetrics {
        OrderBookMetrics {
            mid_price: self.mid_price(),
            spread_bps: self.spread_bps(),
            imbalance: self.imbalance(5),
            bid_depth: self.bids.values().copied().sum(),
            ask_depth: self.asks.values().copied().sum(),
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
        }
    }
}
