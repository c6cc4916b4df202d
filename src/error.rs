//! Error types for the connector core

use std::time::Duration;

use thiserror::Error;

/// Default delay applied to a rate-limited request when the server gives no hint
pub const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(1);

/// Connector errors
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Order book desync for {symbol}: {reason}")]
    Desync { symbol: String, reason: String },

    #[error("Persistent desync for {symbol}: {resyncs} resyncs within {window_secs}s")]
    PersistentDesync {
        symbol: String,
        resyncs: usize,
        window_secs: u64,
    },

    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid key format: {0}")]
    KeyFormat(String),

    #[error("Cannot encode parameter {key}: {reason}")]
    Encoding { key: String, reason: String },

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Outbound queue full ({capacity} frames)")]
    QueueFull { capacity: usize },

    #[error("Connector is shutting down")]
    ShuttingDown,

    #[error("Order book for {0} is not synchronized")]
    BookUnavailable(String),

    #[error("Order rejected (status {status}): {message}")]
    OrderRejected { status: u16, message: String },

    #[error("Unknown order: {0}")]
    UnknownOrder(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IPC error: {0}")]
    Ipc(String),
}

impl ConnectorError {
    /// Whether the operation may succeed if retried after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::TransientNetwork(_) | ConnectorError::RateLimited { .. }
        )
    }

    /// Delay the server asked for, if any
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            ConnectorError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Errors that must be surfaced to the host instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectorError::Authentication(_)
                | ConnectorError::KeyFormat(_)
                | ConnectorError::PersistentDesync { .. }
                | ConnectorError::Config(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectorError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) if response.status().as_u16() == 401 => {
                ConnectorError::Authentication(format!("handshake rejected: {}", response.status()))
            }
            WsError::Protocol(e) => ConnectorError::Protocol(e.to_string()),
            other => ConnectorError::TransientNetwork(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        ConnectorError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ConnectorError::Protocol(err.to_string())
        } else {
            ConnectorError::TransientNetwork(err.to_string())
        }
    }
}

impl From<std::io::Error> for ConnectorError {
    fn from(err: std::io::Error) -> Self {
        ConnectorError::Ipc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(ConnectorError::TransientNetwork("reset".into()).is_retryable());
        let limited = ConnectorError::RateLimited {
            retry_after: Duration::from_secs(3),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_delay(), Some(Duration::from_secs(3)));

        assert!(!ConnectorError::Authentication("bad key".into()).is_retryable());
        assert!(!ConnectorError::Protocol("garbage".into()).is_retryable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(ConnectorError::Authentication("401".into()).is_fatal());
        assert!(ConnectorError::PersistentDesync {
            symbol: "SOL_USDC".into(),
            resyncs: 6,
            window_secs: 60,
        }
        .is_fatal());
        assert!(!ConnectorError::Protocol("bad frame".into()).is_fatal());
        assert!(!ConnectorError::Desync {
            symbol: "SOL_USDC".into(),
            reason: "gap".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_serde_error_is_protocol() {
        let err: ConnectorError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, ConnectorError::Protocol(_)));
    }
}
