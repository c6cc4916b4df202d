//! Backpack connector daemon
//!
//! Streams the configured symbols, keeps their books synchronized, and
//! forwards book, trade and order events to an optional IPC consumer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use bpx_connector::publisher::{IpcFrame, IpcPublisher};
use bpx_connector::{ChannelSink, Config, Connector, ConnectionState, OrderBookEvent, SinkEvent};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Backpack connector");

    let config = Config::load()?;
    info!(
        symbols = ?config.symbols,
        private = config.credentials.is_some(),
        "Configuration loaded"
    );

    let publisher = match &config.ipc_socket_path {
        Some(path) => Some(IpcPublisher::new(path).await?),
        None => None,
    };

    let (sink, events) = ChannelSink::new();
    let health_port = config.health_port;
    let connector = Arc::new(Connector::new(config, Arc::new(sink))?);

    let forwarder = tokio::spawn(forward_events(events, publisher));

    let health_state = connector.clone();
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    connector.start(&[])?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    connector.stop().await;

    // Drain what the shutdown produced
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), forwarder).await;

    Ok(())
}

async fn forward_events(mut events: mpsc::UnboundedReceiver<SinkEvent>, publisher: Option<IpcPublisher>) {
    while let Some(event) = events.recv().await {
        match &event {
            SinkEvent::Book { symbol, event: OrderBookEvent::Unavailable { reason } } => {
                warn!(symbol = %symbol, reason = %reason, "Order book unavailable");
            }
            SinkEvent::Book { symbol, event: OrderBookEvent::Failed(e) } => {
                warn!(symbol = %symbol, error = %e, "Order book gave up");
            }
            SinkEvent::Order(order) => {
                info!(
                    client_order_id = order.client_order_id,
                    state = order.state.as_str(),
                    filled = %order.filled_amount,
                    "Order update"
                );
            }
            _ => {}
        }

        let Some(publisher) = &publisher else { continue };
        if let Some(frame) = IpcFrame::from_event(&event) {
            if let Err(e) = publisher.publish(&frame).await {
                debug!(error = %e, "Failed to publish event");
            }
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(connector: Arc<Connector>, port: u16) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(connector);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check(State(connector): State<Arc<Connector>>) -> Json<serde_json::Value> {
    let state = connector.connection_state();
    let books = connector.book_status();
    let healthy = state == ConnectionState::Live && books.values().all(|synced| *synced);

    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "component": "bpx-connector",
        "connection": state.as_str(),
        "books": books,
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics(State(connector): State<Arc<Connector>>) -> String {
    connector.metrics().encode()
}
