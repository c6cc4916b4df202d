//! Routes inbound stream frames
//!
//! Frames are parsed once and handed to the owner of the affected state:
//! depth diffs and trades to the symbol's book worker, order updates to the
//! order tracker. Per-symbol channels are FIFO, so exchange order is kept
//! within each stream. Nothing here fails the connection; bad frames are
//! logged and dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::orderbook::{BookCommand, DiffEvent, TradeEvent};
use crate::orders::{OrderEvent, OrderTracker};
use crate::parser::ParsedMessage;
use crate::telemetry::ConnectorMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Routed,
    /// Stream or symbol nobody consumes
    Unrouted,
    Malformed,
    /// Subscription results and server notices
    Control,
    /// Receiving task has stopped
    Closed,
}

pub struct StreamDispatcher {
    books: HashMap<String, mpsc::Sender<BookCommand>>,
    orders: Option<OrderTracker>,
    metrics: Arc<ConnectorMetrics>,
}

impl StreamDispatcher {
    pub fn new(
        books: HashMap<String, mpsc::Sender<BookCommand>>,
        orders: Option<OrderTracker>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            books,
            orders,
            metrics,
        }
    }

    /// Connection entered Live: every book rebuilds from a new snapshot.
    /// Sent before any frame of the new session is routed.
    pub async fn resync_all(&self) {
        for (symbol, tx) in &self.books {
            if tx.send(BookCommand::Resync).await.is_err() {
                warn!(symbol = %symbol, "Book worker gone, cannot resync");
            }
        }
    }

    pub async fn dispatch(&self, raw: &str) -> DispatchOutcome {
        let parsed = match ParsedMessage::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "Failed to parse message");
                return self.dropped("malformed", DispatchOutcome::Malformed);
            }
        };

        match parsed {
            ParsedMessage::DepthUpdate(update) => {
                let symbol = update.symbol.clone();
                self.route_book(&symbol, BookCommand::Diff(DiffEvent::from(update)))
                    .await
            }
            ParsedMessage::Trade(trade) => {
                trace!(
                    symbol = %trade.symbol,
                    price = %trade.price,
                    qty = %trade.quantity,
                    "Trade received"
                );
                let symbol = trade.symbol.clone();
                self.route_book(&symbol, BookCommand::Trade(TradeEvent::from(trade)))
                    .await
            }
            ParsedMessage::OrderUpdate(update) => {
                let Some(orders) = &self.orders else {
                    return self.dropped("no_order_tracker", DispatchOutcome::Unrouted);
                };
                match OrderEvent::try_from(&update) {
                    Ok(event) => match orders.apply(event).await {
                        Ok(()) => DispatchOutcome::Routed,
                        Err(_) => DispatchOutcome::Closed,
                    },
                    Err(e) => {
                        warn!(error = %e, order_id = %update.order_id, "Unusable order update");
                        self.dropped("malformed", DispatchOutcome::Malformed)
                    }
                }
            }
            ParsedMessage::Unknown(stream) => {
                trace!(stream = %stream, "Unknown stream");
                self.dropped("unknown_stream", DispatchOutcome::Unrouted)
            }
            ParsedMessage::Control(value) => {
                if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
                    warn!(error = %error, "Server reported an error");
                } else {
                    debug!(frame = %value, "Control frame");
                }
                DispatchOutcome::Control
            }
        }
    }

    async fn route_book(&self, symbol: &str, command: BookCommand) -> DispatchOutcome {
        let Some(tx) = self.books.get(symbol) else {
            debug!(symbol = %symbol, "Message for untracked symbol");
            return self.dropped("unknown_symbol", DispatchOutcome::Unrouted);
        };
        match tx.send(command).await {
            Ok(()) => DispatchOutcome::Routed,
            Err(_) => DispatchOutcome::Closed,
        }
    }

    fn dropped(&self, reason: &str, outcome: DispatchOutcome) -> DispatchOutcome {
        self.metrics.record_dispatch_drop(reason);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::{OrderCommand, OrderState};

    fn dispatcher() -> (
        StreamDispatcher,
        mpsc::Receiver<BookCommand>,
        mpsc::Receiver<OrderCommand>,
    ) {
        let (book_tx, book_rx) = mpsc::channel(16);
        let (order_tx, order_rx) = mpsc::channel(16);
        let mut books = HashMap::new();
        books.insert("SOL_USDC".to_string(), book_tx);
        let metrics = Arc::new(ConnectorMetrics::new().unwrap());
        (
            StreamDispatcher::new(books, Some(OrderTracker::from_sender(order_tx)), metrics),
            book_rx,
            order_rx,
        )
    }

    fn depth(symbol: &str, first: u64, last: u64) -> String {
        format!(
            r#"{{"stream":"depth.{s}","data":{{"e":"depth","E":1,"s":"{s}","a":[],"b":[["20","1"]],"U":{f},"u":{l},"T":1}}}}"#,
            s = symbol,
            f = first,
            l = last
        )
    }

    #[tokio::test]
    async fn test_depth_routed_in_order() {
        let (dispatcher, mut books, _) = dispatcher();
        for i in 1..=3 {
            assert_eq!(dispatcher.dispatch(&depth("SOL_USDC", i, i)).await, DispatchOutcome::Routed);
        }
        for i in 1..=3 {
            match books.recv().await.unwrap() {
                BookCommand::Diff(diff) => assert_eq!(diff.first_update_id, i),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_untracked_symbol_dropped() {
        let (dispatcher, mut books, _) = dispatcher();
        assert_eq!(
            dispatcher.dispatch(&depth("BTC_USDC", 1, 1)).await,
            DispatchOutcome::Unrouted
        );
        assert!(books.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_order_update_routed() {
        let (dispatcher, _, mut orders) = dispatcher();
        let raw = r#"{"stream":"account.orderUpdate","data":{"e":"orderAccepted","E":1,"s":"SOL_USDC","c":5,"i":"99","X":"New","T":1700000000000001}}"#;
        assert_eq!(dispatcher.dispatch(raw).await, DispatchOutcome::Routed);
        match orders.recv().await.unwrap() {
            OrderCommand::Event(event) => {
                assert_eq!(event.client_order_id, Some(5));
                assert_eq!(event.state, OrderState::Open);
                assert_eq!(event.sequence, 1700000000000001);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_propagate() {
        let (dispatcher, _, _) = dispatcher();
        assert_eq!(dispatcher.dispatch("not json").await, DispatchOutcome::Malformed);
        let unknown_status = r#"{"stream":"account.orderUpdate","data":{"e":"x","E":1,"s":"SOL_USDC","i":"1","X":"Weird","T":1}}"#;
        assert_eq!(dispatcher.dispatch(unknown_status).await, DispatchOutcome::Malformed);
        assert_eq!(
            dispatcher.dispatch(r#"{"stream":"ticker.SOL_USDC","data":{}}"#).await,
            DispatchOutcome::Unrouted
        );
        assert_eq!(
            dispatcher.dispatch(r#"{"error":{"code":4000,"message":"Invalid"}}"#).await,
            DispatchOutcome::Control
        );
    }

    #[tokio::test]
    async fn test_resync_all_reaches_every_book() {
        let (dispatcher, mut books, _) = dispatcher();
        dispatcher.resync_all().await;
        assert!(matches!(books.recv().await, Some(BookCommand::Resync)));
    }
}
