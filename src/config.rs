//! Configuration module for the connector

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::orderbook::SyncConfig;
use crate::websocket::{BackoffPolicy, SupervisorConfig};

/// API credentials as issued by the exchange (both values base64)
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// What the connector needs from its host beyond the event sink
pub trait HostEnvironment: Send + Sync {
    fn configured_symbols(&self) -> Vec<String>;
    fn credentials(&self) -> Option<Credentials>;
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange symbols to track (e.g., ["SOL_USDC", "BTC_USDC"])
    pub symbols: Vec<String>,

    /// WebSocket endpoint
    pub ws_endpoint: String,

    /// REST API endpoint
    pub rest_endpoint: String,

    pub credentials: Option<Credentials>,

    /// Signature validity window sent with private requests
    pub window_ms: u64,

    /// Depth levels included in published views
    pub depth_levels: usize,

    pub health_check_interval_secs: u64,
    pub stale_after_secs: u64,
    pub outbound_queue_capacity: usize,

    /// How long an order event for an unknown client id is held
    pub pending_event_timeout_secs: u64,

    /// Resyncs tolerated within `resync_window_secs` before giving up
    pub resync_limit: usize,
    pub resync_window_secs: u64,

    pub rest_rate_limit_per_sec: u32,

    /// Optional IPC socket for forwarding events
    pub ipc_socket_path: Option<String>,

    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let symbols: Vec<String> = env::var("BPX_SYMBOLS")
            .unwrap_or_else(|_| defaults.symbols.join(","))
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let credentials = match (env::var("BPX_API_KEY"), env::var("BPX_API_SECRET")) {
            (Ok(api_key), Ok(api_secret)) => Some(Credentials { api_key, api_secret }),
            (Ok(_), Err(_)) | (Err(_), Ok(_)) => {
                anyhow::bail!("BPX_API_KEY and BPX_API_SECRET must be set together")
            }
            _ => None,
        };

        Ok(Self {
            symbols,
            ws_endpoint: env::var("BPX_WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("BPX_REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            credentials,
            window_ms: parse_var("BPX_WINDOW_MS", defaults.window_ms),
            depth_levels: parse_var("BPX_DEPTH_LEVELS", defaults.depth_levels),
            health_check_interval_secs: parse_var(
                "BPX_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            ),
            stale_after_secs: parse_var("BPX_STALE_AFTER_SECS", defaults.stale_after_secs),
            outbound_queue_capacity: parse_var(
                "BPX_OUTBOUND_QUEUE_CAPACITY",
                defaults.outbound_queue_capacity,
            ),
            pending_event_timeout_secs: parse_var(
                "BPX_PENDING_EVENT_TIMEOUT_SECS",
                defaults.pending_event_timeout_secs,
            ),
            resync_limit: parse_var("BPX_RESYNC_LIMIT", defaults.resync_limit),
            resync_window_secs: parse_var("BPX_RESYNC_WINDOW_SECS", defaults.resync_window_secs),
            rest_rate_limit_per_sec: parse_var(
                "BPX_REST_RATE_LIMIT_PER_SEC",
                defaults.rest_rate_limit_per_sec,
            ),
            ipc_socket_path: env::var("BPX_IPC_SOCKET_PATH").ok(),
            health_port: parse_var("BPX_HEALTH_PORT", defaults.health_port),
        })
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            endpoint: self.ws_endpoint.clone(),
            health_check_interval: Duration::from_secs(self.health_check_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
            outbound_capacity: self.outbound_queue_capacity,
            window_ms: self.window_ms,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            depth_levels: self.depth_levels,
            resync_limit: self.resync_limit,
            resync_window: Duration::from_secs(self.resync_window_secs),
        }
    }
}

impl HostEnvironment for Config {
    fn configured_symbols(&self) -> Vec<String> {
        self.symbols.clone()
    }

    fn credentials(&self) -> Option<Credentials> {
        self.credentials.clone()
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["SOL_USDC".to_string()],
            ws_endpoint: "wss://ws.backpack.exchange".to_string(),
            rest_endpoint: "https://api.backpack.exchange/api/v1".to_string(),
            credentials: None,
            window_ms: 5000,
            depth_levels: 20,
            health_check_interval_secs: 30,
            stale_after_secs: 120,
            outbound_queue_capacity: 256,
            pending_event_timeout_secs: 10,
            resync_limit: 5,
            resync_window_secs: 60,
            rest_rate_limit_per_sec: 10,
            ipc_socket_path: None,
            health_port: 9090,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_connector_policy() {
        let config = Config::default();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.health_check_interval, Duration::from_secs(30));
        assert_eq!(supervisor.stale_after, Duration::from_secs(120));

        let sync = config.sync_config();
        assert_eq!(sync.resync_limit, 5);
        assert_eq!(sync.resync_window, Duration::from_secs(60));
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials {
            api_key: "pub".into(),
            api_secret: "very-secret".into(),
        };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("pub"));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn test_host_environment_for_config() {
        let config = Config {
            symbols: vec!["BTC_USDC".into()],
            ..Config::default()
        };
        assert_eq!(config.configured_symbols(), vec!["BTC_USDC".to_string()]);
        assert!(config.credentials().is_none());
    }
}
