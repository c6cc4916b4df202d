//! Order lifecycle tracking
//!
//! Orders are keyed by the client id we generate at submission. Updates come
//! from two places (the REST response and the private order stream) in no
//! particular order; the reconciler decides which of them win.

mod reconciler;
mod tracker;

pub use reconciler::{IgnoreReason, OrderStateReconciler, ReconcileOutcome};
pub use tracker::{OrderCommand, OrderTracker};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};
use crate::parser::{OrderResponse, OrderUpdate};
use crate::signing::{ParamValue, Params};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    /// Filled, Cancelled and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Failed
        )
    }

    /// Map an exchange status string
    pub fn from_exchange_status(status: &str) -> Option<Self> {
        match status {
            "New" => Some(OrderState::Open),
            "PartiallyFilled" => Some(OrderState::PartiallyFilled),
            "Filled" => Some(OrderState::Filled),
            "Cancelled" | "Expired" => Some(OrderState::Cancelled),
            "TriggerPending" => Some(OrderState::Pending),
            "TriggerFailed" => Some(OrderState::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Bid,
    Ask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

/// What the host asks us to place
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: Option<String>,
    pub post_only: bool,
}

impl OrderRequest {
    pub fn limit(symbol: &str, side: OrderSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            time_in_force: None,
            post_only: false,
        }
    }

    pub fn market(symbol: &str, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            post_only: false,
        }
    }

    /// Parameters for `POST /order`, signed and sent as the JSON body
    pub fn to_params(&self, client_id: u32) -> Result<Params> {
        if self.quantity <= Decimal::ZERO {
            return Err(ConnectorError::Encoding {
                key: "quantity".to_string(),
                reason: format!("must be positive, got {}", self.quantity),
            });
        }

        let mut params: Params = vec![
            ("clientId".to_string(), ParamValue::from(client_id)),
            ("symbol".to_string(), ParamValue::from(self.symbol.as_str())),
            (
                "side".to_string(),
                ParamValue::from(match self.side {
                    OrderSide::Bid => "Bid",
                    OrderSide::Ask => "Ask",
                }),
            ),
            (
                "orderType".to_string(),
                ParamValue::from(match self.order_type {
                    OrderType::Limit => "Limit",
                    OrderType::Market => "Market",
                }),
            ),
            ("quantity".to_string(), ParamValue::from(self.quantity)),
        ];

        match (self.order_type, self.price) {
            (OrderType::Limit, Some(price)) => {
                params.push(("price".to_string(), ParamValue::from(price)))
            }
            (OrderType::Limit, None) => {
                return Err(ConnectorError::Encoding {
                    key: "price".to_string(),
                    reason: "limit order without price".to_string(),
                })
            }
            (OrderType::Market, _) => {}
        }

        if let Some(tif) = &self.time_in_force {
            params.push(("timeInForce".to_string(), ParamValue::from(tif.as_str())));
        }
        if self.post_only {
            params.push(("postOnly".to_string(), ParamValue::from(true)));
        }

        Ok(params)
    }
}

/// Local view of one order
#[derive(Debug, Clone, Serialize)]
pub struct TrackedOrder {
    pub client_order_id: u32,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub state: OrderState,
    pub filled_amount: Decimal,
    /// Sequence of the last applied event (microseconds)
    pub last_event_sequence: u64,
    pub failure_reason: Option<String>,
}

impl TrackedOrder {
    pub fn new(client_order_id: u32, request: &OrderRequest) -> Self {
        Self {
            client_order_id,
            exchange_order_id: None,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            state: OrderState::Pending,
            filled_amount: Decimal::ZERO,
            last_event_sequence: 0,
            failure_reason: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Rest,
    Stream,
}

/// One observation of an order's state, from either source
#[derive(Debug, Clone)]
pub struct OrderEvent {
    pub client_order_id: Option<u32>,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub state: OrderState,
    pub filled_amount: Option<Decimal>,
    pub sequence: u64,
    pub source: EventSource,
    pub reason: Option<String>,
}

impl OrderEvent {
    /// Local failure (rejected submission); always sorts after anything seen
    pub fn failure(client_order_id: u32, symbol: &str, reason: String) -> Self {
        Self {
            client_order_id: Some(client_order_id),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            state: OrderState::Failed,
            filled_amount: None,
            sequence: u64::MAX,
            source: EventSource::Rest,
            reason: Some(reason),
        }
    }
}

impl TryFrom<&OrderUpdate> for OrderEvent {
    type Error = ConnectorError;

    fn try_from(update: &OrderUpdate) -> Result<Self> {
        let state = OrderState::from_exchange_status(&update.status).ok_or_else(|| {
            ConnectorError::Protocol(format!("unknown order status {}", update.status))
        })?;
        Ok(Self {
            client_order_id: update.client_id,
            exchange_order_id: Some(update.order_id.clone()),
            symbol: update.symbol.clone(),
            state,
            filled_amount: update.executed_quantity,
            sequence: update.engine_time,
            source: EventSource::Stream,
            reason: None,
        })
    }
}

impl TryFrom<&OrderResponse> for OrderEvent {
    type Error = ConnectorError;

    fn try_from(response: &OrderResponse) -> Result<Self> {
        let state = OrderState::from_exchange_status(&response.status).ok_or_else(|| {
            ConnectorError::Protocol(format!("unknown order status {}", response.status))
        })?;
        Ok(Self {
            client_order_id: response.client_id,
            exchange_order_id: Some(response.id.clone()),
            symbol: response.symbol.clone(),
            state,
            filled_amount: response.executed_quantity,
            // REST reports milliseconds, the stream microseconds
            sequence: response.created_at.saturating_mul(1000),
            source: EventSource::Rest,
            reason: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_status_mapping() {
        assert_eq!(OrderState::from_exchange_status("New"), Some(OrderState::Open));
        assert_eq!(OrderState::from_exchange_status("Expired"), Some(OrderState::Cancelled));
        assert_eq!(OrderState::from_exchange_status("TriggerFailed"), Some(OrderState::Failed));
        assert_eq!(OrderState::from_exchange_status("Bogus"), None);
        assert!(OrderState::Filled.is_terminal());
        assert!(!OrderState::PartiallyFilled.is_terminal());
    }

    #[test]
    fn test_limit_order_params() {
        let request = OrderRequest::limit("SOL_USDC", OrderSide::Bid, dec!(1.5), dec!(20.25));
        let params = request.to_params(42).unwrap();
        let keys: Vec<&str> = params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["clientId", "symbol", "side", "orderType", "quantity", "price"]);
        assert_eq!(params[5].1.canonical("price").unwrap(), "20.25");
    }

    #[test]
    fn test_invalid_orders_rejected_before_signing() {
        let mut request = OrderRequest::limit("SOL_USDC", OrderSide::Ask, dec!(0), dec!(1));
        assert!(matches!(request.to_params(1), Err(ConnectorError::Encoding { .. })));

        request.quantity = dec!(1);
        request.price = None;
        assert!(matches!(request.to_params(1), Err(ConnectorError::Encoding { .. })));
    }

    #[test]
    fn test_rest_sequence_in_microseconds() {
        let response = OrderResponse {
            id: "abc".to_string(),
            client_id: Some(7),
            symbol: "SOL_USDC".to_string(),
            status: "New".to_string(),
            executed_quantity: None,
            created_at: 1_700_000_000_000,
        };
        let event = OrderEvent::try_from(&response).unwrap();
        assert_eq!(event.sequence, 1_700_000_000_000_000);
        assert_eq!(event.state, OrderState::Open);
    }
}
