//! WebSocket module for the Backpack stream connection

mod backoff;
mod client;
mod supervisor;
#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{Backoff, BackoffPolicy};
pub use client::{TungsteniteConnector, WebSocketClient};
pub use supervisor::{
    ConnectionState, ConnectionStatus, DeliveryReceipt, InboundEvent, StateTransition,
    SupervisorConfig, SupervisorHandle,
};

use async_trait::async_trait;

use crate::error::Result;

/// One open socket
#[async_trait]
pub trait WsConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// `Ok(Some)` for data, `Ok(None)` for control frames, `Err` once the
    /// connection is unusable
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self);
}

/// Opens sockets; swapped out in tests
#[async_trait]
pub trait WsConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn WsConnection>>;
}
