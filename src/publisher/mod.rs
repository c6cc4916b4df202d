//! Event delivery to the host
//!
//! The connector never blocks on its host: `EventSink` methods are
//! synchronous and must return promptly. `ChannelSink` queues events on an
//! unbounded channel; `IpcPublisher` forwards them to another process over a
//! Unix socket as length-prefixed MessagePack frames.

use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::{ConnectorError, Result};
use crate::orderbook::{BookView, TradeEvent};
use crate::orders::TrackedOrder;

/// Market data events for one symbol
#[derive(Debug, Clone)]
pub enum OrderBookEvent {
    /// Book (re)synchronized from a snapshot
    Snapshot(Arc<BookView>),
    /// Diff applied
    Update(Arc<BookView>),
    Trade(TradeEvent),
    /// Book discarded while resyncing; no view until the next `Snapshot`
    Unavailable { reason: String },
    /// Gave up on this symbol
    Failed(ConnectorError),
}

/// Host-side receiver of connector events
pub trait EventSink: Send + Sync {
    fn publish_order_book_event(&self, symbol: &str, event: OrderBookEvent);

    fn publish_order_update(&self, order: &TrackedOrder);

    /// Fatal connector errors (authentication, exhausted resyncs)
    fn report_error(&self, error: &ConnectorError) {
        error!(error = %error, "Connector error");
    }
}

#[derive(Debug, Clone)]
pub enum SinkEvent {
    Book { symbol: String, event: OrderBookEvent },
    Order(TrackedOrder),
    Error(ConnectorError),
}

/// Sink backed by an unbounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn publish_order_book_event(&self, symbol: &str, event: OrderBookEvent) {
        self.send(SinkEvent::Book {
            symbol: symbol.to_string(),
            event,
        });
    }

    fn publish_order_update(&self, order: &TrackedOrder) {
        self.send(SinkEvent::Order(order.clone()));
    }

    fn report_error(&self, error: &ConnectorError) {
        error!(error = %error, "Connector error");
        self.send(SinkEvent::Error(error.clone()));
    }
}

/// Wire frame for IPC consumers
#[derive(Debug, Serialize)]
pub enum IpcFrame<'a> {
    Book(&'a BookView),
    Trade(&'a TradeEvent),
    Order(&'a TrackedOrder),
    Unavailable { symbol: &'a str, reason: &'a str },
}

impl<'a> IpcFrame<'a> {
    /// Frame for a sink event, if it has an IPC representation
    pub fn from_event(event: &'a SinkEvent) -> Option<Self> {
        match event {
            SinkEvent::Book { event, symbol } => match event {
                OrderBookEvent::Snapshot(view) | OrderBookEvent::Update(view) => {
                    Some(IpcFrame::Book(view))
                }
                OrderBookEvent::Trade(trade) => Some(IpcFrame::Trade(trade)),
                OrderBookEvent::Unavailable { reason } => Some(IpcFrame::Unavailable {
                    symbol,
                    reason,
                }),
                OrderBookEvent::Failed(_) => None,
            },
            SinkEvent::Order(order) => Some(IpcFrame::Order(order)),
            SinkEvent::Error(_) => None,
        }
    }

    /// 4-byte big-endian length followed by the MessagePack body
    pub fn encode(&self) -> Result<BytesMut> {
        let data = rmp_serde::to_vec_named(self).map_err(|e| {
            ConnectorError::Serialization(format!("Failed to serialize: {}", e))
        })?;

        let mut message = BytesMut::with_capacity(4 + data.len());
        message.put_u32(data.len() as u32);
        message.put_slice(&data);
        Ok(message)
    }
}

/// Publisher for forwarding events via Unix socket
pub struct IpcPublisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl IpcPublisher {
    pub async fn new(socket_path: &str) -> Result<Self> {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // Consumer may not be up yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        Ok(publisher)
    }

    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(ConnectorError::Ipc(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            ConnectorError::Ipc(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        let mut guard = self.stream.lock().await;
        *guard = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Publish one frame. Delivery is best effort: a missing consumer is
    /// logged, not returned.
    pub async fn publish(&self, frame: &IpcFrame<'_>) -> Result<()> {
        let message = frame.encode()?;

        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            if let Err(e) = stream.write_all(&message).await {
                warn!(error = %e, "Failed to write to IPC socket");
                *guard = None;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{Level, OrderBookMetrics};
    use rust_decimal_macros::dec;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    fn view() -> BookView {
        BookView {
            symbol: "SOL_USDC".to_string(),
            timestamp: 1,
            last_update_id: 42,
            bids: vec![Level {
                price: dec!(20),
                quantity: dec!(1),
            }],
            asks: vec![],
            metrics: OrderBookMetrics::default(),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_forwards_events() {
        let (sink, mut rx) = ChannelSink::new();
        sink.publish_order_book_event("SOL_USDC", OrderBookEvent::Update(Arc::new(view())));

        match rx.recv().await.unwrap() {
            SinkEvent::Book { symbol, event: OrderBookEvent::Update(v) } => {
                assert_eq!(symbol, "SOL_USDC");
                assert_eq!(v.last_update_id, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ipc_frame_is_length_prefixed_msgpack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bpx.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let publisher = IpcPublisher::new(path.to_str().unwrap()).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let v = view();
        publisher.publish(&IpcFrame::Book(&v)).await.unwrap();

        let len = server.read_u32().await.unwrap() as usize;
        let mut body = vec![0u8; len];
        server.read_exact(&mut body).await.unwrap();

        let decoded: serde_json::Value = rmp_serde::from_slice(&body).unwrap();
        assert_eq!(decoded["Book"]["symbol"], "SOL_USDC");
        assert_eq!(decoded["Book"]["last_update_id"], 42);
    }

    #[tokio::test]
    async fn test_publish_without_consumer_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let publisher = IpcPublisher::new(path.to_str().unwrap()).await.unwrap();
        let v = view();
        assert!(publisher.publish(&IpcFrame::Book(&v)).await.is_ok());
    }
}
