//! Order state reconciliation
//!
//! Single-owner state: the tracker task is the only caller, so nothing here
//! locks. An event is applied only if its sequence is strictly newer than
//! the last one applied to that order, and terminal states are sticky.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{OrderEvent, OrderRequest, OrderState, TrackedOrder};
use crate::error::{ConnectorError, Result};

/// Terminal orders kept around for lookups
const ARCHIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Sequence not newer than what we already applied
    Outdated,
    /// Order already in a terminal state
    Terminal,
    /// No client id and the exchange id is unknown
    Untracked,
}

#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Applied(TrackedOrder),
    Ignored(IgnoreReason),
    /// Held until the order is registered (or the hold expires)
    Deferred,
}

impl ReconcileOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied(_) => "applied",
            ReconcileOutcome::Ignored(IgnoreReason::Outdated) => "outdated",
            ReconcileOutcome::Ignored(IgnoreReason::Terminal) => "terminal",
            ReconcileOutcome::Ignored(IgnoreReason::Untracked) => "untracked",
            ReconcileOutcome::Deferred => "deferred",
        }
    }
}

struct PendingEvent {
    event: OrderEvent,
    received_at: Instant,
}

pub struct OrderStateReconciler {
    orders: HashMap<u32, TrackedOrder>,
    by_exchange_id: HashMap<String, u32>,
    pending: HashMap<u32, Vec<PendingEvent>>,
    /// Retired orders by client id; `archive_order` holds retirement order
    archive: HashMap<u32, TrackedOrder>,
    archive_order: VecDeque<u32>,
    pending_timeout: Duration,
}

impl OrderStateReconciler {
    pub fn new(pending_timeout: Duration) -> Self {
        Self {
            orders: HashMap::new(),
            by_exchange_id: HashMap::new(),
            pending: HashMap::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            pending_timeout,
        }
    }

    /// Start tracking a freshly submitted order and replay anything that
    /// arrived for it before registration.
    pub fn register(
        &mut self,
        client_order_id: u32,
        request: &OrderRequest,
    ) -> Result<(TrackedOrder, Vec<ReconcileOutcome>)> {
        if self.orders.contains_key(&client_order_id) || self.archived(client_order_id).is_some() {
            return Err(ConnectorError::Config(format!(
                "client order id {} already in use",
                client_order_id
            )));
        }

        let order = TrackedOrder::new(client_order_id, request);
        self.orders.insert(client_order_id, order.clone());

        let mut replayed = Vec::new();
        if let Some(mut held) = self.pending.remove(&client_order_id) {
            held.sort_by_key(|p| p.event.sequence);
            debug!(client_order_id, events = held.len(), "Replaying early order events");
            for p in held {
                replayed.push(self.apply(p.event));
            }
        }

        Ok((order, replayed))
    }

    pub fn apply(&mut self, event: OrderEvent) -> ReconcileOutcome {
        let client_order_id = match event.client_order_id {
            Some(id) => id,
            None => match event
                .exchange_order_id
                .as_ref()
                .and_then(|id| self.by_exchange_id.get(id))
            {
                Some(id) => *id,
                None => return ReconcileOutcome::Ignored(IgnoreReason::Untracked),
            },
        };

        if self.archived(client_order_id).is_some() {
            return ReconcileOutcome::Ignored(IgnoreReason::Terminal);
        }

        let Some(order) = self.orders.get_mut(&client_order_id) else {
            self.pending
                .entry(client_order_id)
                .or_default()
                .push(PendingEvent {
                    event,
                    received_at: Instant::now(),
                });
            return ReconcileOutcome::Deferred;
        };

        if order.state.is_terminal() {
            return ReconcileOutcome::Ignored(IgnoreReason::Terminal);
        }
        if event.sequence <= order.last_event_sequence {
            return ReconcileOutcome::Ignored(IgnoreReason::Outdated);
        }

        order.state = event.state;
        order.last_event_sequence = event.sequence;
        if let Some(filled) = event.filled_amount {
            order.filled_amount = order.filled_amount.max(filled);
        }
        if order.state == OrderState::Filled && order.filled_amount == Decimal::ZERO {
            order.filled_amount = order.quantity;
        }
        if event.reason.is_some() {
            order.failure_reason = event.reason;
        }
        if order.exchange_order_id.is_none() {
            if let Some(id) = event.exchange_order_id {
                self.by_exchange_id.insert(id.clone(), client_order_id);
                order.exchange_order_id = Some(id);
            }
        }

        let updated = order.clone();
        if updated.state.is_terminal() {
            self.retire(client_order_id);
        }
        ReconcileOutcome::Applied(updated)
    }

    /// Drop held events older than the timeout; returns how many were dropped
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        let timeout = self.pending_timeout;
        let mut dropped = 0;
        self.pending.retain(|client_order_id, held| {
            let before = held.len();
            held.retain(|p| now.duration_since(p.received_at) < timeout);
            let expired = before - held.len();
            if expired > 0 {
                warn!(
                    client_order_id = *client_order_id,
                    expired, "Dropping order events for unknown client id"
                );
            }
            dropped += expired;
            !held.is_empty()
        });
        dropped
    }

    pub fn get(&self, client_order_id: u32) -> Option<&TrackedOrder> {
        self.orders
            .get(&client_order_id)
            .or_else(|| self.archived(client_order_id))
    }

    pub fn active(&self) -> impl Iterator<Item = &TrackedOrder> {
        self.orders.values()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    fn archived(&self, client_order_id: u32) -> Option<&TrackedOrder> {
        self.archive.get(&client_order_id)
    }

    fn retire(&mut self, client_order_id: u32) {
        if let Some(order) = self.orders.remove(&client_order_id) {
            if let Some(id) = &order.exchange_order_id {
                self.by_exchange_id.remove(id);
            }
            if self.archive_order.len() >= ARCHIVE_CAPACITY {
                if let Some(oldest) = self.archive_order.pop_front() {
                    self.archive.remove(&oldest);
                }
            }
            self.archive_order.push_back(client_order_id);
            self.archive.insert(client_order_id, order);
        }
    }
}
