//! Connector facade
//!
//! Wires the supervisor, dispatcher, book workers and order tracker together
//! and exposes the operations a host needs: start/stop, order entry, and
//! read access to books, markets and balances.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, HostEnvironment};
use crate::dispatcher::{DispatchOutcome, StreamDispatcher};
use crate::error::{ConnectorError, Result};
use crate::orderbook::{BookView, OrderBookManager};
use crate::orders::{OrderEvent, OrderRequest, OrderTracker, TrackedOrder};
use crate::parser::{Balance, MarketInfo};
use crate::publisher::EventSink;
use crate::rest::{OrderGateway, RestClient, SnapshotSource};
use crate::signing::RequestSigner;
use crate::telemetry::ConnectorMetrics;
use crate::websocket::{
    ConnectionState, ConnectionStatus, InboundEvent, SupervisorHandle, TungsteniteConnector,
    WsConnector,
};

const INBOUND_BUFFER: usize = 4096;
const ORDER_STREAM: &str = "account.orderUpdate";
const CLIENT_ID_ATTEMPTS: usize = 3;

/// Swappable transports
pub struct ConnectorParts {
    pub ws: Arc<dyn WsConnector>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub gateway: Arc<dyn OrderGateway>,
}

struct Running {
    cancel: CancellationToken,
    supervisor: SupervisorHandle,
    supervisor_task: JoinHandle<()>,
    books: OrderBookManager,
    orders: OrderTracker,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Connector {
    config: Config,
    sink: Arc<dyn EventSink>,
    rest: Arc<RestClient>,
    parts: ConnectorParts,
    signer: Option<Arc<RequestSigner>>,
    metrics: Arc<ConnectorMetrics>,
    running: Mutex<Option<Running>>,
}

impl Connector {
    /// Production connector talking to the configured endpoints
    pub fn new(config: Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        let signer = Self::signer_for(&config)?;
        let rest = Arc::new(RestClient::new(
            &config.rest_endpoint,
            signer.clone(),
            config.window_ms,
            config.rest_rate_limit_per_sec,
        )?);
        let parts = ConnectorParts {
            ws: Arc::new(TungsteniteConnector),
            snapshots: rest.clone(),
            gateway: rest.clone(),
        };
        Self::assemble(config, sink, rest, parts, signer)
    }

    /// Connector with caller-supplied transports
    pub fn with_parts(config: Config, sink: Arc<dyn EventSink>, parts: ConnectorParts) -> Result<Self> {
        let signer = Self::signer_for(&config)?;
        let rest = Arc::new(RestClient::new(
            &config.rest_endpoint,
            signer.clone(),
            config.window_ms,
            config.rest_rate_limit_per_sec,
        )?);
        Self::assemble(config, sink, rest, parts, signer)
    }

    fn signer_for(config: &Config) -> Result<Option<Arc<RequestSigner>>> {
        config
            .credentials()
            .map(|c| RequestSigner::from_credentials(&c).map(Arc::new))
            .transpose()
    }

    fn assemble(
        config: Config,
        sink: Arc<dyn EventSink>,
        rest: Arc<RestClient>,
        parts: ConnectorParts,
        signer: Option<Arc<RequestSigner>>,
    ) -> Result<Self> {
        let metrics = ConnectorMetrics::new()
            .map_err(|e| ConnectorError::Config(format!("metrics registry: {}", e)))?;
        Ok(Self {
            config,
            sink,
            rest,
            parts,
            signer,
            metrics: Arc::new(metrics),
            running: Mutex::new(None),
        })
    }

    /// Start streaming `symbols` (the configured ones when empty). Must be
    /// called inside a tokio runtime.
    pub fn start(&self, symbols: &[String]) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(ConnectorError::Config("connector already started".to_string()));
        }

        let symbols = if symbols.is_empty() {
            self.config.configured_symbols()
        } else {
            symbols.to_vec()
        };
        if symbols.is_empty() {
            return Err(ConnectorError::Config("no symbols to track".to_string()));
        }

        let cancel = CancellationToken::new();

        let (orders, orders_task) = OrderTracker::spawn(
            Duration::from_secs(self.config.pending_event_timeout_secs),
            self.sink.clone(),
            self.metrics.clone(),
            cancel.child_token(),
        );

        let supervisor_config = self.config.supervisor_config();
        let books = OrderBookManager::spawn(
            &symbols,
            self.parts.snapshots.clone(),
            self.sink.clone(),
            self.config.sync_config(),
            supervisor_config.backoff,
            self.metrics.clone(),
            cancel.child_token(),
        );

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (supervisor, supervisor_task) = SupervisorHandle::spawn(
            supervisor_config,
            self.parts.ws.clone(),
            self.signer.clone(),
            inbound_tx,
            self.metrics.clone(),
            cancel.child_token(),
        );

        let streams: Vec<String> = symbols
            .iter()
            .flat_map(|s| [format!("depth.{}", s), format!("trade.{}", s)])
            .collect();
        supervisor.subscribe(&streams)?;
        if self.signer.is_some() {
            supervisor.subscribe_private(&[ORDER_STREAM.to_string()])?;
        }

        let dispatcher =
            StreamDispatcher::new(books.senders(), Some(orders.clone()), self.metrics.clone());
        let dispatch_task = tokio::spawn(dispatch_loop(
            dispatcher,
            inbound_rx,
            self.sink.clone(),
            cancel.clone(),
        ));

        info!(
            symbols = ?symbols,
            private = self.signer.is_some(),
            "Connector started"
        );

        *running = Some(Running {
            cancel,
            supervisor,
            supervisor_task,
            books,
            orders,
            tasks: vec![orders_task, dispatch_task],
        });
        Ok(())
    }

    /// Stop every task. Queued outbound frames get a short chance to flush
    /// before the rest is torn down.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        info!("Stopping connector");
        running.supervisor.shutdown();
        let _ = running.supervisor_task.await;

        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        running.books.join().await;
        info!("Connector stopped");
    }

    /// Place an order; returns its tracked state after the REST round trip
    pub async fn submit_order(&self, request: OrderRequest) -> Result<TrackedOrder> {
        if self.signer.is_none() {
            return Err(ConnectorError::Authentication(
                "order entry requires credentials".to_string(),
            ));
        }
        let orders = self.orders()?;

        let mut registered = None;
        for _ in 0..CLIENT_ID_ATTEMPTS {
            let client_id: u32 = rand::random();
            match orders.register(client_id, request.clone()).await {
                Ok(_) => {
                    registered = Some(client_id);
                    break;
                }
                Err(ConnectorError::Config(reason)) => warn!(%reason, "Client id collision"),
                Err(e) => return Err(e),
            }
        }
        let client_id = registered
            .ok_or_else(|| ConnectorError::Config("could not allocate a client order id".to_string()))?;

        match self.parts.gateway.execute_order(&request, client_id).await {
            Ok(response) => match OrderEvent::try_from(&response) {
                Ok(mut event) => {
                    event.client_order_id = Some(client_id);
                    orders.apply(event).await?;
                }
                Err(e) => warn!(client_id, error = %e, "Unusable order response"),
            },
            Err(e) if e.is_retryable() => {
                // may or may not have reached the exchange; the stream decides
                warn!(client_id, error = %e, "Order submission outcome unknown");
                return Err(e);
            }
            Err(e) => {
                orders
                    .apply(OrderEvent::failure(client_id, &request.symbol, e.to_string()))
                    .await?;
                return Err(e);
            }
        }

        orders
            .get(client_id)
            .await?
            .ok_or_else(|| ConnectorError::UnknownOrder(client_id.to_string()))
    }

    /// Cancel by client order id; terminal orders are returned unchanged
    pub async fn cancel_order(&self, client_order_id: u32) -> Result<TrackedOrder> {
        let orders = self.orders()?;
        let order = orders
            .get(client_order_id)
            .await?
            .ok_or_else(|| ConnectorError::UnknownOrder(client_order_id.to_string()))?;
        if order.state.is_terminal() {
            return Ok(order);
        }

        let response = self
            .parts
            .gateway
            .cancel_order(&order.symbol, client_order_id)
            .await?;
        match OrderEvent::try_from(&response) {
            Ok(mut event) => {
                event.client_order_id = Some(client_order_id);
                // the response carries the creation time, not the cancel time
                event.sequence = chrono::Utc::now().timestamp_micros().max(0) as u64;
                orders.apply(event).await?;
            }
            Err(e) => warn!(client_order_id, error = %e, "Unusable cancel response"),
        }

        orders
            .get(client_order_id)
            .await?
            .ok_or_else(|| ConnectorError::UnknownOrder(client_order_id.to_string()))
    }

    pub async fn order(&self, client_order_id: u32) -> Result<Option<TrackedOrder>> {
        self.orders()?.get(client_order_id).await
    }

    /// Latest synchronized book; `BookUnavailable` while resyncing
    pub fn top_of_book(&self, symbol: &str) -> Result<Arc<BookView>> {
        match self.running.lock().as_ref() {
            Some(running) => running.books.top_of_book(symbol),
            None => Err(ConnectorError::BookUnavailable(
                "connector not started".to_string(),
            )),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.supervisor.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        self.running.lock().as_ref().map(|r| r.supervisor.status())
    }

    /// Synchronization state per tracked symbol
    pub fn book_status(&self) -> HashMap<String, bool> {
        match self.running.lock().as_ref() {
            Some(running) => running
                .books
                .symbols()
                .into_iter()
                .map(|s| {
                    let synced = running.books.is_synchronized(&s);
                    (s, synced)
                })
                .collect(),
            None => HashMap::new(),
        }
    }

    /// Markets currently open for trading
    pub async fn markets(&self) -> Result<Vec<MarketInfo>> {
        let markets = self.rest.markets().await?;
        Ok(markets.into_iter().filter(MarketInfo::is_online).collect())
    }

    pub async fn balances(&self) -> Result<HashMap<String, Balance>> {
        self.rest.balances().await
    }

    pub fn metrics(&self) -> Arc<ConnectorMetrics> {
        self.metrics.clone()
    }

    fn orders(&self) -> Result<OrderTracker> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.orders.clone())
            .ok_or_else(|| ConnectorError::NotConnected("connector not started".to_string()))
    }
}

async fn dispatch_loop(
    dispatcher: StreamDispatcher,
    mut inbound: mpsc::Receiver<InboundEvent>,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = inbound.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            InboundEvent::Live => dispatcher.resync_all().await,
            InboundEvent::Frame(text) => {
                if dispatcher.dispatch(&text).await == DispatchOutcome::Closed {
                    warn!("Downstream task closed, stopping dispatch");
                    break;
                }
            }
            InboundEvent::Fatal(e) => sink.report_error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::orders::{OrderSide, OrderState};
    use crate::parser::{OrderBookSnapshot, OrderResponse, PriceLevel};
    use crate::publisher::{ChannelSink, OrderBookEvent, SinkEvent};
    use crate::rest::{MockOrderGateway, MockSnapshotSource};
    use crate::websocket::testing::{fake_socket, FakeConnector, Remote, Script};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use ed25519_dalek::SigningKey;
    use rust_decimal_macros::dec;

    fn config(with_credentials: bool) -> Config {
        let credentials = with_credentials.then(|| {
            let seed = [3u8; 32];
            let key = SigningKey::from_bytes(&seed);
            Credentials {
                api_key: BASE64.encode(key.verifying_key().to_bytes()),
                api_secret: BASE64.encode(seed),
            }
        });
        Config {
            credentials,
            rest_endpoint: "http://127.0.0.1:9".to_string(),
            ..Config::default()
        }
    }

    fn snapshots() -> MockSnapshotSource {
        let mut source = MockSnapshotSource::new();
        source.expect_fetch_snapshot().returning(|_| {
            Ok(OrderBookSnapshot {
                last_update_id: 100,
                bids: vec![PriceLevel::new(dec!(20), dec!(1))],
                asks: vec![PriceLevel::new(dec!(21), dec!(1))],
                timestamp: 0,
            })
        });
        source
    }

    fn response(status: &str, client_id: u32) -> OrderResponse {
        OrderResponse {
            id: "ex-1".to_string(),
            client_id: Some(client_id),
            symbol: "SOL_USDC".to_string(),
            status: status.to_string(),
            executed_quantity: None,
            created_at: 1_700_000_000_000,
        }
    }

    fn build(
        with_credentials: bool,
        gateway: MockOrderGateway,
    ) -> (Connector, Remote, tokio::sync::mpsc::UnboundedReceiver<SinkEvent>) {
        let ws = Arc::new(FakeConnector::default());
        let (conn, remote) = fake_socket();
        ws.push(Script::Open(conn));
        let (sink, rx) = ChannelSink::new();
        let parts = ConnectorParts {
            ws,
            snapshots: Arc::new(snapshots()),
            gateway: Arc::new(gateway),
        };
        let connector = Connector::with_parts(config(with_credentials), Arc::new(sink), parts).unwrap();
        (connector, remote, rx)
    }

    async fn wait_for_snapshot(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SinkEvent>) {
        loop {
            if let Some(SinkEvent::Book { event: OrderBookEvent::Snapshot(_), .. }) = rx.recv().await {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_markets_lists_only_online_symbols() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/markets"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                { "symbol": "SOL_USDC", "orderBookState": "Open" },
                { "symbol": "OLD_USDC", "orderBookState": "Closed" },
                { "symbol": "NEW_USDC", "orderBookState": "PostOnly" },
                { "symbol": "BTC_USDC" }
            ])))
            .mount(&server)
            .await;

        let (sink, _rx) = ChannelSink::new();
        let parts = ConnectorParts {
            ws: Arc::new(FakeConnector::default()),
            snapshots: Arc::new(MockSnapshotSource::new()),
            gateway: Arc::new(MockOrderGateway::new()),
        };
        let config = Config {
            rest_endpoint: server.uri(),
            ..config(false)
        };
        let connector = Connector::with_parts(config, Arc::new(sink), parts).unwrap();

        let symbols: Vec<String> = connector
            .markets()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.symbol)
            .collect();
        assert_eq!(symbols, vec!["SOL_USDC", "BTC_USDC"]);
    }

    #[tokio::test]
    async fn test_stream_to_book_end_to_end() {
        let (connector, remote, mut rx) = build(false, MockOrderGateway::new());
        assert!(matches!(
            connector.top_of_book("SOL_USDC"),
            Err(ConnectorError::BookUnavailable(_))
        ));

        connector.start(&[]).unwrap();
        wait_for_snapshot(&mut rx).await;

        remote
            .tx
            .send(Some(
                r#"{"stream":"depth.SOL_USDC","data":{"e":"depth","E":1,"s":"SOL_USDC","a":[["21","0"],["20.5","3"]],"b":[],"U":101,"u":101,"T":1}}"#
                    .to_string(),
            ))
            .unwrap();

        loop {
            if let Some(SinkEvent::Book { event: OrderBookEvent::Update(view), .. }) = rx.recv().await {
                assert_eq!(view.best_ask().unwrap().price, dec!(20.5));
                break;
            }
        }
        let top = connector.top_of_book("SOL_USDC").unwrap();
        assert_eq!(top.last_update_id, 101);
        assert_eq!(connector.connection_state(), ConnectionState::Live);

        let sent = remote.sent.lock().clone();
        assert!(sent[0].contains("depth.SOL_USDC") && sent[0].contains("trade.SOL_USDC"));

        connector.stop().await;
        assert_eq!(connector.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_submit_then_stream_fill() {
        let mut gateway = MockOrderGateway::new();
        gateway
            .expect_execute_order()
            .returning(|_, client_id| Ok(response("New", client_id)));
        let (connector, remote, mut rx) = build(true, gateway);
        connector.start(&["SOL_USDC".to_string()]).unwrap();
        wait_for_snapshot(&mut rx).await;

        // public and signed private subscriptions
        let sent = remote.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].contains("account.orderUpdate") && sent[1].contains("signature"));

        let request = OrderRequest::limit("SOL_USDC", OrderSide::Bid, dec!(2), dec!(20));
        let order = connector.submit_order(request).await.unwrap();
        assert_eq!(order.state, OrderState::Open);
        assert_eq!(order.exchange_order_id.as_deref(), Some("ex-1"));

        let fill = format!(
            r#"{{"stream":"account.orderUpdate","data":{{"e":"orderFill","E":1,"s":"SOL_USDC","c":{},"i":"ex-1","X":"Filled","z":"2","T":1700000000000500}}}}"#,
            order.client_order_id
        );
        remote.tx.send(Some(fill)).unwrap();

        loop {
            if let Some(SinkEvent::Order(o)) = rx.recv().await {
                if o.state == OrderState::Filled {
                    assert_eq!(o.filled_amount, dec!(2));
                    break;
                }
            }
        }

        // cancel after fill is a no-op
        let cancelled = connector.cancel_order(order.client_order_id).await.unwrap();
        assert_eq!(cancelled.state, OrderState::Filled);
        connector.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_order_marked_failed() {
        let mut gateway = MockOrderGateway::new();
        gateway.expect_execute_order().returning(|_, _| {
            Err(ConnectorError::OrderRejected {
                status: 400,
                message: "Insufficient funds".to_string(),
            })
        });
        let (connector, _remote, _rx) = build(true, gateway);
        connector.start(&[]).unwrap();

        let request = OrderRequest::market("SOL_USDC", OrderSide::Ask, dec!(1));
        assert!(matches!(
            connector.submit_order(request).await,
            Err(ConnectorError::OrderRejected { .. })
        ));
        connector.stop().await;
    }

    #[tokio::test]
    async fn test_order_entry_requires_credentials_and_start() {
        let (connector, _remote, _rx) = build(false, MockOrderGateway::new());
        let request = OrderRequest::market("SOL_USDC", OrderSide::Bid, dec!(1));
        assert!(matches!(
            connector.submit_order(request.clone()).await,
            Err(ConnectorError::Authentication(_))
        ));

        let (connector, _remote, _rx) = build(true, MockOrderGateway::new());
        assert!(matches!(
            connector.submit_order(request).await,
            Err(ConnectorError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let (connector, _remote, _rx) = build(false, MockOrderGateway::new());
        tokio_test::assert_ok!(connector.start(&[]));
        assert!(matches!(connector.start(&[]), Err(ConnectorError::Config(_))));
        connector.stop().await;
    }
}
