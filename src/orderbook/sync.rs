//! Snapshot + diff synchronization for one symbol
//!
//! Diffs arriving before a snapshot is loaded are buffered. Once the snapshot
//! (last update id `S`) is in, buffered diffs with `final <= S` are dropped,
//! the first diff applied after it, buffered or live, must bridge `S + 1`,
//! and every later diff must start exactly one past the previous `final`. Any gap discards the book and
//! asks for a new snapshot.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{BookView, DiffEvent, OrderBook};
use crate::error::ConnectorError;
use crate::parser::OrderBookSnapshot;

/// Diffs held while waiting for a snapshot. Beyond this the oldest are
/// dropped and the bridging check will request another snapshot.
const MAX_BUFFERED_DIFFS: usize = 10_000;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Levels per side in published views
    pub depth_levels: usize,
    /// Resyncs tolerated inside `resync_window`
    pub resync_limit: usize,
    pub resync_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            depth_levels: 20,
            resync_limit: 5,
            resync_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Buffering diffs until a snapshot is loaded
    Bootstrapping,
    /// Applying diffs in sequence
    Live,
    /// Gave up after too many resyncs
    Failed,
}

/// What the owner should do after feeding the synchronizer
#[derive(Debug)]
pub enum SyncAction {
    /// Book changed; publish the view
    Applied(Arc<BookView>),
    /// Held until a snapshot arrives
    Buffered,
    /// Diff already covered by the book, dropped
    Stale,
    /// Book discarded; fetch a new snapshot
    ResyncRequired { reason: String },
    /// Resync limit exceeded; surface to the host
    Failed(ConnectorError),
    /// Nothing to do (late snapshot, or the symbol has failed)
    Ignored,
}

enum Step {
    Applied,
    Stale,
    Gap { expected: u64 },
}

pub struct OrderBookSynchronizer {
    config: SyncConfig,
    book: OrderBook,
    phase: SyncPhase,
    /// Set by a snapshot until the first diff on top of it is applied
    needs_bridge: bool,
    buffer: VecDeque<DiffEvent>,
    resyncs: VecDeque<Instant>,
}

impl OrderBookSynchronizer {
    pub fn new(symbol: &str, config: SyncConfig) -> Self {
        Self {
            config,
            book: OrderBook::new(symbol),
            phase: SyncPhase::Bootstrapping,
            needs_bridge: false,
            buffer: VecDeque::new(),
            resyncs: VecDeque::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        self.book.symbol()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn is_synchronized(&self) -> bool {
        self.phase == SyncPhase::Live
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn last_update_id(&self) -> Option<u64> {
        self.is_synchronized().then(|| self.book.last_update_id())
    }

    /// Current view, only while synchronized
    pub fn view(&self) -> Option<Arc<BookView>> {
        self.is_synchronized()
            .then(|| Arc::new(self.book.view(self.config.depth_levels)))
    }

    /// Feed one diff from the stream
    pub fn on_diff(&mut self, diff: DiffEvent) -> SyncAction {
        match self.phase {
            SyncPhase::Failed => SyncAction::Ignored,
            SyncPhase::Bootstrapping => {
                self.buffer_diff(diff);
                SyncAction::Buffered
            }
            SyncPhase::Live => match self.apply_in_sequence(&diff) {
                Step::Applied => SyncAction::Applied(self.current_view()),
                Step::Stale => {
                    debug!(
                        symbol = %self.symbol(),
                        final_update_id = diff.final_update_id,
                        "Dropping stale diff"
                    );
                    SyncAction::Stale
                }
                Step::Gap { expected } => {
                    let reason = format!(
                        "expected update {} but diff starts at {}",
                        expected, diff.first_update_id
                    );
                    self.resync(reason, vec![diff])
                }
            },
        }
    }

    /// Load a snapshot and replay the buffered diffs on top of it
    pub fn on_snapshot(&mut self, snapshot: &OrderBookSnapshot) -> SyncAction {
        if self.phase != SyncPhase::Bootstrapping {
            return SyncAction::Ignored;
        }

        self.book.load_snapshot(snapshot);
        self.needs_bridge = true;
        let snapshot_id = snapshot.last_update_id;

        let mut pending: Vec<DiffEvent> = self
            .buffer
            .drain(..)
            .filter(|d| d.final_update_id > snapshot_id)
            .collect();
        pending.sort_by_key(|d| d.first_update_id);

        let mut iter = pending.into_iter();
        while let Some(diff) = iter.next() {
            match self.apply_in_sequence(&diff) {
                Step::Applied | Step::Stale => {}
                Step::Gap { expected } => {
                    let reason = format!(
                        "snapshot {} cannot be bridged: expected update {} but buffered diff starts at {}",
                        snapshot_id, expected, diff.first_update_id
                    );
                    let mut keep = vec![diff];
                    keep.extend(iter);
                    return self.resync(reason, keep);
                }
            }
        }

        self.phase = SyncPhase::Live;
        info!(
            symbol = %self.symbol(),
            snapshot_id,
            last_update_id = self.book.last_update_id(),
            bid_levels = self.book.bid_levels(),
            ask_levels = self.book.ask_levels(),
            "Order book synchronized"
        );
        SyncAction::Applied(self.current_view())
    }

    /// Start over after a reconnect. Not counted against the resync limit,
    /// and a failed symbol gets a clean resync window.
    pub fn reset(&mut self) {
        if self.phase == SyncPhase::Failed {
            info!(symbol = %self.symbol(), "Retrying failed order book after reconnect");
            self.resyncs.clear();
        }
        self.book.clear();
        self.buffer.clear();
        self.phase = SyncPhase::Bootstrapping;
    }

    fn apply_in_sequence(&mut self, diff: &DiffEvent) -> Step {
        let last = self.book.last_update_id();
        let expected = last + 1;

        if diff.final_update_id <= last {
            return Step::Stale;
        }

        let in_sequence = if self.needs_bridge {
            diff.first_update_id <= expected
        } else {
            diff.first_update_id == expected
        };

        if in_sequence {
            self.book.apply_diff(diff);
            self.needs_bridge = false;
            Step::Applied
        } else {
            Step::Gap { expected }
        }
    }

    fn resync(&mut self, reason: String, keep: Vec<DiffEvent>) -> SyncAction {
        let now = Instant::now();
        let window = self.config.resync_window;
        while self
            .resyncs
            .front()
            .map_or(false, |t| now.duration_since(*t) > window)
        {
            self.resyncs.pop_front();
        }

        self.book.clear();
        self.buffer.clear();

        if self.resyncs.len() >= self.config.resync_limit {
            self.phase = SyncPhase::Failed;
            warn!(
                symbol = %self.symbol(),
                resyncs = self.resyncs.len(),
                %reason,
                "Giving up on order book after repeated resyncs"
            );
            return SyncAction::Failed(ConnectorError::PersistentDesync {
                symbol: self.symbol().to_string(),
                resyncs: self.resyncs.len(),
                window_secs: window.as_secs(),
            });
        }

        self.resyncs.push_back(now);
        self.phase = SyncPhase::Bootstrapping;
        for diff in keep {
            self.buffer_diff(diff);
        }

        warn!(symbol = %self.symbol(), %reason, "Order book desync, resyncing");
        SyncAction::ResyncRequired { reason }
    }

    fn buffer_diff(&mut self, diff: DiffEvent) {
        if self.buffer.len() >= MAX_BUFFERED_DIFFS {
            self.buffer.pop_front();
        }
        self.buffer.push_back(diff);
    }

    fn current_view(&self) -> Arc<BookView> {
        Arc::new(self.book.view(self.config.depth_levels))
    }
}
