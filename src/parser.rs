//! Parser module for Backpack REST and WebSocket payloads
//!
//! Handles deserialization of depth diffs, trades, order updates and REST
//! bodies. Stream messages arrive wrapped as `{"stream": ..., "data": ...}`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;

/// Backpack depth diff (`depth.<symbol>`)
#[derive(Debug, Clone, Deserialize)]
pub struct DepthUpdate {
    /// Event time (microseconds)
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// First update ID in event
    #[serde(rename = "U")]
    pub first_update_id: u64,

    /// Final update ID in event
    #[serde(rename = "u")]
    pub final_update_id: u64,

    #[serde(rename = "b", deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(rename = "a", deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,

    /// Engine timestamp (microseconds)
    #[serde(rename = "T", default)]
    pub engine_time: u64,
}

/// Backpack public trade (`trade.<symbol>`)
#[derive(Debug, Clone, Deserialize)]
pub struct Trade {
    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    #[serde(rename = "t")]
    pub trade_id: u64,

    #[serde(rename = "p", deserialize_with = "deserialize_decimal")]
    pub price: Decimal,

    #[serde(rename = "q", deserialize_with = "deserialize_decimal")]
    pub quantity: Decimal,

    /// Is buyer maker
    #[serde(rename = "m")]
    pub is_buyer_maker: bool,

    #[serde(rename = "T", default)]
    pub trade_time: u64,
}

/// Private order update (`account.orderUpdate`)
#[derive(Debug, Clone, Deserialize)]
pub struct OrderUpdate {
    /// Event type (orderAccepted, orderFill, orderCancelled, ...)
    #[serde(rename = "e")]
    pub event_type: String,

    #[serde(rename = "E")]
    pub event_time: u64,

    #[serde(rename = "s")]
    pub symbol: String,

    /// Client order id
    #[serde(rename = "c", default)]
    pub client_id: Option<u32>,

    /// Exchange order id
    #[serde(rename = "i")]
    pub order_id: String,

    /// Order status
    #[serde(rename = "X")]
    pub status: String,

    /// Cumulative filled quantity
    #[serde(rename = "z", default, deserialize_with = "deserialize_opt_decimal")]
    pub executed_quantity: Option<Decimal>,

    /// Engine timestamp (microseconds)
    #[serde(rename = "T")]
    pub engine_time: u64,
}

/// Price level (price, quantity pair)
#[derive(Debug, Clone, PartialEq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Order book snapshot from `GET /depth`
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookSnapshot {
    #[serde(rename = "lastUpdateId", deserialize_with = "deserialize_u64_lenient")]
    pub last_update_id: u64,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub bids: Vec<PriceLevel>,

    #[serde(deserialize_with = "deserialize_price_levels")]
    pub asks: Vec<PriceLevel>,

    /// Server time in milliseconds
    #[serde(default)]
    pub timestamp: u64,
}

/// Market description from `GET /markets`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketInfo {
    pub symbol: String,
    #[serde(default)]
    pub base_symbol: Option<String>,
    #[serde(default)]
    pub quote_symbol: Option<String>,
    #[serde(default)]
    pub order_book_state: Option<String>,
}

impl MarketInfo {
    pub fn is_online(&self) -> bool {
        self.order_book_state.as_deref().map_or(true, |s| s == "Open")
    }
}

/// Balance entry from `GET /balances` (keyed by asset in the response)
#[derive(Debug, Clone, Deserialize)]
pub struct Balance {
    #[serde(deserialize_with = "deserialize_decimal")]
    pub available: Decimal,
    #[serde(deserialize_with = "deserialize_decimal")]
    pub locked: Decimal,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub staked: Option<Decimal>,
}

/// Order body returned by `POST /order` and `DELETE /order`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub id: String,
    #[serde(default)]
    pub client_id: Option<u32>,
    pub symbol: String,
    pub status: String,
    #[serde(default, deserialize_with = "deserialize_opt_decimal")]
    pub executed_quantity: Option<Decimal>,
    /// Creation time in milliseconds
    #[serde(default)]
    pub created_at: u64,
}

/// Combined stream message wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub data: serde_json::Value,
}

/// Stream family, from the `<type>.<symbol>` stream name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    Depth(String),
    Trade(String),
    OrderUpdate,
    Other(String),
}

impl StreamKind {
    pub fn from_stream_name(stream: &str) -> Self {
        if let Some(symbol) = stream.strip_prefix("depth.") {
            StreamKind::Depth(symbol.to_string())
        } else if let Some(symbol) = stream.strip_prefix("trade.") {
            StreamKind::Trade(symbol.to_string())
        } else if stream == "account.orderUpdate" || stream.starts_with("account.orderUpdate.") {
            StreamKind::OrderUpdate
        } else {
            StreamKind::Other(stream.to_string())
        }
    }
}

/// Parsed WebSocket message
#[derive(Debug, Clone)]
pub enum ParsedMessage {
    DepthUpdate(DepthUpdate),
    Trade(Trade),
    OrderUpdate(OrderUpdate),
    /// Stream we do not consume
    Unknown(String),
    /// Non-stream frame (subscription result, server error)
    Control(serde_json::Value),
}

impl ParsedMessage {
    /// Parse a raw WebSocket message
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if value.get("stream").is_none() {
            return Ok(ParsedMessage::Control(value));
        }
        let stream_msg: StreamMessage = serde_json::from_value(value)?;
        Self::parse_stream_data(&stream_msg.stream, stream_msg.data)
    }

    fn parse_stream_data(stream: &str, data: serde_json::Value) -> Result<Self, serde_json::Error> {
        match StreamKind::from_stream_name(stream) {
            StreamKind::Depth(_) => Ok(ParsedMessage::DepthUpdate(serde_json::from_value(data)?)),
            StreamKind::Trade(_) => Ok(ParsedMessage::Trade(serde_json::from_value(data)?)),
            StreamKind::OrderUpdate => Ok(ParsedMessage::OrderUpdate(serde_json::from_value(data)?)),
            StreamKind::Other(name) => Ok(ParsedMessage::Unknown(name)),
        }
    }
}

/// Custom deserializer for Decimal from string
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    Decimal::from_str(&s).map_err(serde::de::Error::custom)
}

fn deserialize_opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(deserializer)?;
    s.map(|s| Decimal::from_str(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Backpack sends `lastUpdateId` as a string; accept both forms
fn deserialize_u64_lenient<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Custom deserializer for price levels from array of string pairs
fn deserialize_price_levels<'de, D>(deserializer: D) -> Result<Vec<PriceLevel>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Vec<Vec<String>> = Deserialize::deserialize(deserializer)?;
    raw.into_iter()
        .map(|pair| {
            if pair.len() != 2 {
                return Err(serde::de::Error::custom("Invalid price level format"));
            }
            Ok(PriceLevel {
                price: Decimal::from_str(&pair[0]).map_err(serde::de::Error::custom)?,
                quantity: Decimal::from_str(&pair[1]).map_err(serde::de::Error::custom)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_depth_update() {
        let raw = r#"{
            "stream": "depth.SOL_USDC",
            "data": {
                "e": "depth",
                "E": 1694687965941000,
                "s": "SOL_USDC",
                "a": [["18.70", "1.000"]],
                "b": [["18.67", "0.832"], ["18.68", "0.000"]],
                "U": 94978271,
                "u": 94978271,
                "T": 1694687965940999
            }
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::DepthUpdate(depth) = msg {
            assert_eq!(depth.symbol, "SOL_USDC");
            assert_eq!(depth.first_update_id, 94978271);
            assert_eq!(depth.bids.len(), 2);
            assert_eq!(depth.bids[1].quantity, Decimal::ZERO);
            assert_eq!(depth.asks[0].price, dec!(18.70));
        } else {
            panic!("Expected DepthUpdate");
        }
    }

    #[test]
    fn test_parse_trade() {
        let raw = r#"{
            "stream": "trade.SOL_USDC",
            "data": {"e": "trade", "E": 1694688638091000, "s": "SOL_USDC",
                     "p": "18.68", "q": "0.122", "b": "111", "a": "222",
                     "t": 12345, "T": 1694688638089000, "m": true}
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::Trade(trade) = msg {
            assert_eq!(trade.symbol, "SOL_USDC");
            assert_eq!(trade.price, dec!(18.68));
            assert!(trade.is_buyer_maker);
        } else {
            panic!("Expected Trade");
        }
    }

    #[test]
    fn test_parse_order_update() {
        let raw = r#"{
            "stream": "account.orderUpdate",
            "data": {"e": "orderFill", "E": 1694687692980000, "s": "SOL_USDC",
                     "c": 123, "S": "Bid", "o": "LIMIT", "f": "GTC", "q": "32123",
                     "p": "20", "X": "PartiallyFilled", "i": "1111343026172067",
                     "z": "12", "T": 1694687692989999}
        }"#;

        let msg = ParsedMessage::parse(raw).unwrap();
        if let ParsedMessage::OrderUpdate(update) = msg {
            assert_eq!(update.client_id, Some(123));
            assert_eq!(update.status, "PartiallyFilled");
            assert_eq!(update.executed_quantity, Some(dec!(12)));
            assert_eq!(update.engine_time, 1694687692989999);
        } else {
            panic!("Expected OrderUpdate");
        }
    }

    #[test]
    fn test_parse_snapshot_with_string_update_id() {
        let raw = r#"{"asks": [["101", "1"]], "bids": [["100", "1"]],
                      "lastUpdateId": "10", "timestamp": 1700000000000}"#;
        let snapshot: OrderBookSnapshot = serde_json::from_str(raw).unwrap();
        assert_eq!(snapshot.last_update_id, 10);
        assert_eq!(snapshot.bids[0].price, dec!(100));
    }

    #[test]
    fn test_missing_field_is_error() {
        let raw = r#"{"stream": "depth.SOL_USDC", "data": {"e": "depth", "s": "SOL_USDC"}}"#;
        assert!(ParsedMessage::parse(raw).is_err());
    }

    #[test]
    fn test_unknown_and_control_frames() {
        let unknown = ParsedMessage::parse(r#"{"stream": "kline.1m.SOL_USDC", "data": {}}"#).unwrap();
        assert!(matches!(unknown, ParsedMessage::Unknown(ref s) if s == "kline.1m.SOL_USDC"));

        let control = ParsedMessage::parse(r#"{"id": null, "result": null}"#).unwrap();
        assert!(matches!(control, ParsedMessage::Control(_)));
    }

    #[test]
    fn test_stream_kind() {
        assert_eq!(
            StreamKind::from_stream_name("depth.BTC_USDC"),
            StreamKind::Depth("BTC_USDC".into())
        );
        assert_eq!(
            StreamKind::from_stream_name("account.orderUpdate.SOL_USDC"),
            StreamKind::OrderUpdate
        );
    }
}
