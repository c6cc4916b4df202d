//! Prometheus metrics for the connector

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

/// Counters shared by every connector task
pub struct ConnectorMetrics {
    registry: Registry,
    transitions: IntCounterVec,
    resyncs: IntCounterVec,
    book_updates: IntCounterVec,
    book_synced: IntGaugeVec,
    dispatch_dropped: IntCounterVec,
    order_events: IntCounterVec,
}

impl ConnectorMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let transitions = IntCounterVec::new(
            Opts::new("bpx_connection_transitions_total", "Connection state transitions"),
            &["to"],
        )?;
        let resyncs = IntCounterVec::new(
            Opts::new("bpx_book_resyncs_total", "Order book resyncs after a sequence gap"),
            &["symbol"],
        )?;
        let book_updates = IntCounterVec::new(
            Opts::new("bpx_book_updates_total", "Order book views published"),
            &["symbol"],
        )?;
        let book_synced = IntGaugeVec::new(
            Opts::new("bpx_book_synchronized", "1 while the book is synchronized"),
            &["symbol"],
        )?;
        let dispatch_dropped = IntCounterVec::new(
            Opts::new("bpx_dispatch_dropped_total", "Inbound frames dropped by the dispatcher"),
            &["reason"],
        )?;
        let order_events = IntCounterVec::new(
            Opts::new("bpx_orders_events_total", "Order events by reconciliation outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(book_updates.clone()))?;
        registry.register(Box::new(book_synced.clone()))?;
        registry.register(Box::new(dispatch_dropped.clone()))?;
        registry.register(Box::new(order_events.clone()))?;

        Ok(Self {
            registry,
            transitions,
            resyncs,
            book_updates,
            book_synced,
            dispatch_dropped,
            order_events,
        })
    }

    pub fn record_transition(&self, to: &str) {
        self.transitions.with_label_values(&[to]).inc();
    }

    pub fn record_resync(&self, symbol: &str) {
        self.resyncs.with_label_values(&[symbol]).inc();
    }

    pub fn record_book_update(&self, symbol: &str) {
        self.book_updates.with_label_values(&[symbol]).inc();
    }

    pub fn set_book_synchronized(&self, symbol: &str, synced: bool) {
        self.book_synced.with_label_values(&[symbol]).set(synced as i64);
    }

    pub fn record_dispatch_drop(&self, reason: &str) {
        self.dispatch_dropped.with_label_values(&[reason]).inc();
    }

    pub fn record_order_event(&self, outcome: &str) {
        self.order_events.with_label_values(&[outcome]).inc();
    }

    pub fn transitions_to(&self, to: &str) -> u64 {
        self.transitions.with_label_values(&[to]).get()
    }

    pub fn resyncs_for(&self, symbol: &str) -> u64 {
        self.resyncs.with_label_values(&[symbol]).get()
    }

    /// Text exposition format for `/metrics`
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
