//! Order book module
//!
//! Maintains synchronized order book state from Backpack depth snapshots and
//! diffs. Each symbol's book is owned by one task (see `manager`); everything
//! else only ever sees immutable `BookView`s.

mod book;
mod manager;
mod metrics;
mod sync;

pub use book::OrderBook;
pub use manager::{BookCommand, OrderBookManager};
pub use metrics::OrderBookMetrics;
pub use sync::{OrderBookSynchronizer, SyncAction, SyncConfig, SyncPhase};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::parser::{DepthUpdate, PriceLevel, Trade};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Point-in-time view of a synchronized book, shared as `Arc<BookView>`
#[derive(Debug, Clone, Serialize)]
pub struct BookView {
    pub symbol: String,
    /// Server time of the last applied message (microseconds)
    pub timestamp: u64,
    pub last_update_id: u64,
    pub bids: Vec<Level>,
    pub asks: Vec<Level>,
    pub metrics: OrderBookMetrics,
}

impl BookView {
    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.first()
    }
}

/// Incremental book change covering update ids `first_update_id..=final_update_id`
#[derive(Debug, Clone)]
pub struct DiffEvent {
    pub symbol: String,
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub bid_changes: Vec<PriceLevel>,
    pub ask_changes: Vec<PriceLevel>,
    pub server_timestamp: u64,
}

impl From<DepthUpdate> for DiffEvent {
    fn from(update: DepthUpdate) -> Self {
        Self {
            symbol: update.symbol,
            first_update_id: update.first_update_id,
            final_update_id: update.final_update_id,
            bid_changes: update.bids,
            ask_changes: update.asks,
            server_timestamp: update.event_time,
        }
    }
}

/// Public trade forwarded to the host
#[derive(Debug, Clone, Serialize)]
pub struct TradeEvent {
    pub symbol: String,
    pub trade_id: u64,
    pub price: Decimal,
    pub quantity: Decimal,
    pub is_buyer_maker: bool,
    pub timestamp: u64,
}

impl From<Trade> for TradeEvent {
    fn from(trade: Trade) -> Self {
        Self {
            symbol: trade.symbol,
            trade_id: trade.trade_id,
            price: trade.price,
            quantity: trade.quantity,
            is_buyer_maker: trade.is_buyer_maker,
            timestamp: trade.event_time,
        }
    }
}
