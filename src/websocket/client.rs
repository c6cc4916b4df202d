//! WebSocket client for Backpack streams
//!
//! Handles connection and message reception. Subscriptions are sent as
//! ordinary text frames by the supervisor.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{WsConnection, WsConnector};
use crate::error::{ConnectorError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client for a single connection
pub struct WebSocketClient {
    stream: Option<WsStream>,
}

impl WebSocketClient {
    /// Connect to the WebSocket endpoint
    pub async fn connect(endpoint: &str) -> Result<Self> {
        info!(url = %endpoint, "Connecting to Backpack WebSocket");

        let (ws_stream, response) = connect_async(endpoint).await?;

        info!(status = ?response.status(), "WebSocket connected");
        Ok(Self {
            stream: Some(ws_stream),
        })
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| ConnectorError::NotConnected("socket closed".to_string()))
    }
}

#[async_trait]
impl WsConnection for WebSocketClient {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream()?.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Receive the next message
    async fn recv(&mut self) -> Result<Option<String>> {
        let stream = self.stream()?;

        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!(len = text.len(), "Received text message");
                Ok(Some(text))
            }
            Some(Ok(Message::Binary(data))) => {
                let text = String::from_utf8_lossy(&data).to_string();
                Ok(Some(text))
            }
            Some(Ok(Message::Ping(data))) => {
                debug!("Received ping, sending pong");
                if let Err(e) = stream.send(Message::Pong(data)).await {
                    debug!(error = %e, "Failed to send pong");
                }
                Ok(None)
            }
            Some(Ok(Message::Pong(_))) => {
                debug!("Received pong");
                Ok(None)
            }
            Some(Ok(Message::Close(frame))) => {
                warn!(frame = ?frame, "Received close frame");
                self.stream = None;
                Err(ConnectorError::TransientNetwork("Connection closed".to_string()))
            }
            Some(Ok(Message::Frame(_))) => Ok(None),
            Some(Err(e)) => {
                error!(error = %e, "WebSocket error");
                self.stream = None;
                Err(e.into())
            }
            None => {
                warn!("WebSocket stream ended");
                self.stream = None;
                Err(ConnectorError::TransientNetwork("Stream ended".to_string()))
            }
        }
    }

    /// Send a ping to keep connection alive
    async fn ping(&mut self) -> Result<()> {
        self.stream()?.send(Message::Ping(vec![])).await?;
        Ok(())
    }

    /// Close the connection
    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn WsConnection>> {
        Ok(Box::new(WebSocketClient::connect(endpoint).await?))
    }
}
