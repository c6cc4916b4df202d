//! Order book manager
//!
//! One task per symbol owns that symbol's synchronizer. The dispatcher feeds
//! it through an mpsc channel, snapshot fetches report back through the same
//! channel, and the latest view is shared through a `watch` so readers never
//! touch the task's state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{BookView, DiffEvent, OrderBookSynchronizer, SyncAction, SyncConfig, TradeEvent};
use crate::error::{ConnectorError, Result};
use crate::parser::OrderBookSnapshot;
use crate::publisher::{EventSink, OrderBookEvent};
use crate::rest::SnapshotSource;
use crate::telemetry::ConnectorMetrics;
use crate::websocket::{Backoff, BackoffPolicy};

const COMMAND_BUFFER: usize = 4096;

#[derive(Debug)]
pub enum BookCommand {
    Diff(DiffEvent),
    Trade(TradeEvent),
    /// Connection (re)entered Live; rebuild from a fresh snapshot
    Resync,
    Snapshot {
        generation: u64,
        snapshot: OrderBookSnapshot,
    },
}

struct SymbolHandle {
    tx: mpsc::Sender<BookCommand>,
    view: watch::Receiver<Option<Arc<BookView>>>,
}

/// Manages order books for multiple symbols
pub struct OrderBookManager {
    books: HashMap<String, SymbolHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl OrderBookManager {
    /// Spawn a worker per symbol. Workers wait for `Resync` before fetching
    /// their first snapshot.
    pub fn spawn(
        symbols: &[String],
        source: Arc<dyn SnapshotSource>,
        sink: Arc<dyn EventSink>,
        config: SyncConfig,
        backoff: BackoffPolicy,
        metrics: Arc<ConnectorMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let mut books = HashMap::new();
        let mut tasks = Vec::new();

        for symbol in symbols {
            if books.contains_key(symbol) {
                continue;
            }
            let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
            let (view_tx, view_rx) = watch::channel(None);

            let worker = BookWorker {
                sync: OrderBookSynchronizer::new(symbol, config.clone()),
                symbol: symbol.clone(),
                tx: tx.clone(),
                view: view_tx,
                source: source.clone(),
                sink: sink.clone(),
                backoff,
                resync_backoff: Backoff::new(backoff),
                consecutive_resyncs: 0,
                metrics: metrics.clone(),
                cancel: cancel.clone(),
                generation: 0,
            };
            tasks.push(tokio::spawn(worker.run(rx)));
            books.insert(symbol.clone(), SymbolHandle { tx, view: view_rx });
        }

        info!(symbols = books.len(), "Order book workers started");
        Self { books, tasks }
    }

    /// Command channel per symbol, for routing
    pub fn senders(&self) -> HashMap<String, mpsc::Sender<BookCommand>> {
        self.books
            .iter()
            .map(|(symbol, handle)| (symbol.clone(), handle.tx.clone()))
            .collect()
    }

    /// Latest synchronized view; fails while the book is resyncing
    pub fn top_of_book(&self, symbol: &str) -> Result<Arc<BookView>> {
        let handle = self
            .books
            .get(symbol)
            .ok_or_else(|| ConnectorError::BookUnavailable(format!("{} is not tracked", symbol)))?;

        let view = handle.view.borrow().clone();
        view.ok_or_else(|| ConnectorError::BookUnavailable(format!("{} is not synchronized", symbol)))
    }

    pub fn is_synchronized(&self, symbol: &str) -> bool {
        self.books
            .get(symbol)
            .map(|handle| handle.view.borrow().is_some())
            .unwrap_or(false)
    }

    /// Get list of symbols being tracked
    pub fn symbols(&self) -> Vec<String> {
        self.books.keys().cloned().collect()
    }

    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

struct BookWorker {
    sync: OrderBookSynchronizer,
    symbol: String,
    tx: mpsc::Sender<BookCommand>,
    view: watch::Sender<Option<Arc<BookView>>>,
    source: Arc<dyn SnapshotSource>,
    sink: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
    /// Spaces out gap-driven refetches so a lagging snapshot can catch up
    resync_backoff: Backoff,
    consecutive_resyncs: u32,
    metrics: Arc<ConnectorMetrics>,
    cancel: CancellationToken,
    /// Bumped on every snapshot request; older responses are dropped
    generation: u64,
}

impl BookWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<BookCommand>) {
        loop {
            let command = tokio::select! {
                _ = self.cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                BookCommand::Diff(diff) => {
                    let action = self.sync.on_diff(diff);
                    self.handle(action, false);
                }
                BookCommand::Trade(trade) => {
                    self.sink
                        .publish_order_book_event(&self.symbol, OrderBookEvent::Trade(trade));
                }
                BookCommand::Resync => {
                    debug!(symbol = %self.symbol, "Resync requested after reconnect");
                    self.sync.reset();
                    self.clear_resync_backoff();
                    self.mark_unavailable("reconnected".to_string());
                    self.request_snapshot(Duration::ZERO);
                }
                BookCommand::Snapshot { generation, snapshot } => {
                    if generation != self.generation {
                        debug!(symbol = %self.symbol, generation, "Dropping superseded snapshot");
                        continue;
                    }
                    let action = self.sync.on_snapshot(&snapshot);
                    self.handle(action, true);
                }
            }
        }

        debug!(symbol = %self.symbol, "Order book worker stopped");
    }

    fn handle(&mut self, action: SyncAction, from_snapshot: bool) {
        match action {
            SyncAction::Applied(view) => {
                if !from_snapshot {
                    self.clear_resync_backoff();
                }
                self.view.send_replace(Some(view.clone()));
                self.metrics.record_book_update(&self.symbol);
                self.metrics.set_book_synchronized(&self.symbol, true);
                let event = if from_snapshot {
                    if !view.metrics.is_healthy() {
                        warn!(
                            symbol = %self.symbol,
                            bid_levels = view.metrics.bid_levels,
                            ask_levels = view.metrics.ask_levels,
                            "Synchronized book is one-sided or crossed"
                        );
                    }
                    OrderBookEvent::Snapshot(view)
                } else {
                    OrderBookEvent::Update(view)
                };
                self.sink.publish_order_book_event(&self.symbol, event);
            }
            SyncAction::ResyncRequired { reason } => {
                self.metrics.record_resync(&self.symbol);
                let desync = ConnectorError::Desync {
                    symbol: self.symbol.clone(),
                    reason,
                };
                self.mark_unavailable(desync.to_string());
                let delay = if self.consecutive_resyncs == 0 {
                    Duration::ZERO
                } else {
                    self.resync_backoff.next_delay()
                };
                self.consecutive_resyncs += 1;
                self.request_snapshot(delay);
            }
            SyncAction::Failed(e) => {
                self.generation += 1;
                self.view.send_replace(None);
                self.metrics.set_book_synchronized(&self.symbol, false);
                self.sink
                    .publish_order_book_event(&self.symbol, OrderBookEvent::Failed(e.clone()));
                self.sink.report_error(&e);
            }
            SyncAction::Buffered | SyncAction::Stale | SyncAction::Ignored => {}
        }
    }

    fn clear_resync_backoff(&mut self) {
        self.consecutive_resyncs = 0;
        self.resync_backoff.reset();
    }

    fn mark_unavailable(&mut self, reason: String) {
        let was_available = self.view.send_replace(None).is_some();
        self.metrics.set_book_synchronized(&self.symbol, false);
        if was_available {
            self.sink
                .publish_order_book_event(&self.symbol, OrderBookEvent::Unavailable { reason });
        }
    }

    /// Fetch a snapshot in the background after `delay`, retrying every
    /// failure with backoff. Only a snapshot comes back, as a `Snapshot`
    /// command.
    fn request_snapshot(&mut self, delay: Duration) {
        self.generation += 1;
        let generation = self.generation;
        let symbol = self.symbol.clone();
        let source = self.source.clone();
        let sink = self.sink.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let mut backoff = Backoff::new(self.backoff);

        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(symbol = %symbol, delay_secs = delay.as_secs_f64(), "Delaying snapshot refetch");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }

            let snapshot = loop {
                let attempt = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = source.fetch_snapshot(&symbol) => r,
                };
                let e = match attempt {
                    Ok(snapshot) => break snapshot,
                    Err(e) => e,
                };

                let delay = e.retry_delay().unwrap_or_else(|| backoff.next_delay());
                if e.is_retryable() {
                    warn!(
                        symbol = %symbol,
                        error = %e,
                        delay_secs = delay.as_secs_f64(),
                        "Snapshot fetch failed, retrying"
                    );
                } else {
                    error!(
                        symbol = %symbol,
                        error = %e,
                        delay_secs = delay.as_secs_f64(),
                        "Snapshot fetch failed, retrying"
                    );
                    sink.report_error(&e);
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            };
            let _ = tx.send(BookCommand::Snapshot { generation, snapshot }).await;
        });
    }
}
