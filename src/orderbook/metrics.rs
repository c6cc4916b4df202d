//! Order book metrics calculation

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Computed metrics attached to every published view
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderBookMetrics {
    /// Mid price (average of best bid and ask)
    pub mid_price: Option<Decimal>,

    /// Spread in basis points
    pub spread_bps: Option<Decimal>,

    /// Simple imbalance: (bid_vol - ask_vol) / (bid_vol + ask_vol)
    pub imbalance: Option<Decimal>,

    /// Total bid depth (volume)
    pub bid_depth: Decimal,

    /// Total ask depth (volume)
    pub ask_depth: Decimal,

    pub bid_levels: usize,
    pub ask_levels: usize,
}

impl OrderBookMetrics {
    /// Both sides populated and not crossed
    pub fn is_healthy(&self) -> bool {
        self.mid_price.is_some()
            && self.spread_bps.map_or(false, |s| s >= Decimal::ZERO)
            && self.bid_levels > 0
            && self.ask_levels > 0
    }
}
