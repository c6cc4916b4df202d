//! Backpack exchange connector core
//!
//! Keeps local order books consistent with the exchange (snapshot plus
//! sequenced diffs), supervises the stream connection, signs private
//! requests with ed25519, and reconciles order state reported over REST and
//! the private stream.

pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod orderbook;
pub mod orders;
pub mod parser;
pub mod publisher;
pub mod rate_limit;
pub mod rest;
pub mod signing;
pub mod telemetry;
pub mod websocket;

pub use config::{Config, Credentials, HostEnvironment};
pub use connector::{Connector, ConnectorParts};
pub use error::{ConnectorError, Result};
pub use orderbook::{BookView, OrderBook, OrderBookManager, OrderBookSynchronizer, SyncAction};
pub use orders::{OrderRequest, OrderState, OrderStateReconciler, TrackedOrder};
pub use parser::{DepthUpdate, OrderBookSnapshot, ParsedMessage, Trade};
pub use publisher::{ChannelSink, EventSink, OrderBookEvent, SinkEvent};
pub use signing::RequestSigner;
pub use websocket::{ConnectionState, SupervisorHandle};
