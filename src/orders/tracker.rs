//! Task owning the order reconciler
//!
//! REST submissions and the private stream both send into one mpsc channel;
//! the task applies them in arrival order and publishes every state change.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{OrderEvent, OrderRequest, OrderStateReconciler, ReconcileOutcome, TrackedOrder};
use crate::error::{ConnectorError, Result};
use crate::publisher::EventSink;
use crate::telemetry::ConnectorMetrics;

const COMMAND_BUFFER: usize = 1024;
const EXPIRY_TICK: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum OrderCommand {
    Register {
        client_order_id: u32,
        request: OrderRequest,
        reply: oneshot::Sender<Result<TrackedOrder>>,
    },
    Event(OrderEvent),
    Get {
        client_order_id: u32,
        reply: oneshot::Sender<Option<TrackedOrder>>,
    },
}

/// Cloneable handle to the tracker task
#[derive(Clone)]
pub struct OrderTracker {
    tx: mpsc::Sender<OrderCommand>,
}

impl OrderTracker {
    pub fn spawn(
        pending_timeout: Duration,
        sink: Arc<dyn EventSink>,
        metrics: Arc<ConnectorMetrics>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let reconciler = OrderStateReconciler::new(pending_timeout);
        let handle = tokio::spawn(run(reconciler, rx, sink, metrics, cancel));
        (Self { tx }, handle)
    }

    pub(crate) fn from_sender(tx: mpsc::Sender<OrderCommand>) -> Self {
        Self { tx }
    }

    pub async fn register(&self, client_order_id: u32, request: OrderRequest) -> Result<TrackedOrder> {
        let (reply, rx) = oneshot::channel();
        self.send(OrderCommand::Register {
            client_order_id,
            request,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ConnectorError::ShuttingDown)?
    }

    pub async fn apply(&self, event: OrderEvent) -> Result<()> {
        self.send(OrderCommand::Event(event)).await
    }

    pub async fn get(&self, client_order_id: u32) -> Result<Option<TrackedOrder>> {
        let (reply, rx) = oneshot::channel();
        self.send(OrderCommand::Get {
            client_order_id,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ConnectorError::ShuttingDown)
    }

    async fn send(&self, command: OrderCommand) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ConnectorError::ShuttingDown)
    }
}

async fn run(
    mut reconciler: OrderStateReconciler,
    mut rx: mpsc::Receiver<OrderCommand>,
    sink: Arc<dyn EventSink>,
    metrics: Arc<ConnectorMetrics>,
    cancel: CancellationToken,
) {
    let mut expiry = interval(EXPIRY_TICK);
    expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let publish = |outcome: &ReconcileOutcome| {
        metrics.record_order_event(outcome.label());
        match outcome {
            ReconcileOutcome::Applied(order) => {
                debug!(
                    client_order_id = order.client_order_id,
                    state = order.state.as_str(),
                    filled = %order.filled_amount,
                    "Order updated"
                );
                sink.publish_order_update(order);
            }
            other => debug!(outcome = other.label(), "Order event not applied"),
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = expiry.tick() => {
                let dropped = reconciler.expire_pending(Instant::now());
                for _ in 0..dropped {
                    metrics.record_order_event("expired");
                }
            }
            command = rx.recv() => {
                let Some(command) = command else { break };
                match command {
                    OrderCommand::Register { client_order_id, request, reply } => {
                        match reconciler.register(client_order_id, &request) {
                            Ok((order, replayed)) => {
                                sink.publish_order_update(&order);
                                for outcome in &replayed {
                                    publish(outcome);
                                }
                                let current = reconciler.get(client_order_id).cloned().unwrap_or(order);
                                let _ = reply.send(Ok(current));
                            }
                            Err(e) => {
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    OrderCommand::Event(event) => {
                        let outcome = reconciler.apply(event);
                        publish(&outcome);
                    }
                    OrderCommand::Get { client_order_id, reply } => {
                        let _ = reply.send(reconciler.get(client_order_id).cloned());
                    }
                }
            }
        }
    }

    info!(active = reconciler.active().count(), "Order tracker stopped");
}
