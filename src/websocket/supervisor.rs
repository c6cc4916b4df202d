//! Connection supervisor
//!
//! Owns the single WebSocket connection: connects, subscribes, watches
//! liveness and reconnects with backoff. Inbound frames are forwarded in
//! arrival order on one mpsc channel, preceded by `InboundEvent::Live` every
//! time the connection (re)enters Live so downstream state can resync.
//!
//! Outbound frames go through a bounded queue that is drained only while
//! Live; frames queued during an outage are sent after resubscription.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Backoff, BackoffPolicy, WsConnection, WsConnector};
use crate::error::{ConnectorError, Result};
use crate::signing::RequestSigner;
use crate::telemetry::ConnectorMetrics;

/// Time allowed to push queued frames out on shutdown
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub endpoint: String,
    pub health_check_interval: Duration,
    /// No inbound traffic for longer than this forces a reconnect
    pub stale_after: Duration,
    pub outbound_capacity: usize,
    pub window_ms: u64,
    pub backoff: BackoffPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://ws.backpack.exchange".to_string(),
            health_check_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(120),
            outbound_capacity: 256,
            window_ms: 5000,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribing,
    Live,
    Reconnecting,
    ShuttingDown,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Subscribing => "subscribing",
            ConnectionState::Live => "live",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::ShuttingDown => "shutting_down",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub consecutive_failures: u32,
    /// Delay of the current (or most recent) reconnect wait
    pub backoff: Duration,
    pub last_message_at: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
pub enum InboundEvent {
    /// Subscriptions are in place; everything after this is fresh
    Live,
    Frame(String),
    /// Supervisor gave up (bad credentials)
    Fatal(ConnectorError),
}

/// Resolves once a queued frame was written to the socket
pub struct DeliveryReceipt(oneshot::Receiver<Result<()>>);

impl DeliveryReceipt {
    pub async fn delivered(self) -> Result<()> {
        self.0.await.map_err(|_| ConnectorError::ShuttingDown)?
    }
}

struct OutboundFrame {
    text: String,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct Outbound {
    frames: VecDeque<OutboundFrame>,
    closed: bool,
}

struct Shared {
    config: SupervisorConfig,
    signer: Option<Arc<RequestSigner>>,
    outbound: Mutex<Outbound>,
    notify: Notify,
    public_streams: Mutex<BTreeSet<String>>,
    private_streams: Mutex<BTreeSet<String>>,
    status: watch::Sender<ConnectionStatus>,
    transitions: broadcast::Sender<StateTransition>,
}

/// Cloneable handle to the supervisor task
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl SupervisorHandle {
    pub fn spawn(
        config: SupervisorConfig,
        connector: Arc<dyn WsConnector>,
        signer: Option<Arc<RequestSigner>>,
        inbound: mpsc::Sender<InboundEvent>,
        metrics: Arc<ConnectorMetrics>,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let backoff = Backoff::new(config.backoff);
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            consecutive_failures: 0,
            backoff: backoff.current(),
            last_message_at: None,
        });
        let (transitions, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            config,
            signer,
            outbound: Mutex::new(Outbound::default()),
            notify: Notify::new(),
            public_streams: Mutex::new(BTreeSet::new()),
            private_streams: Mutex::new(BTreeSet::new()),
            status,
            transitions,
        });

        let supervisor = Supervisor {
            shared: shared.clone(),
            connector,
            inbound,
            metrics,
            cancel: cancel.clone(),
            backoff,
            failures: 0,
            last_message: Instant::now(),
        };
        let handle = tokio::spawn(supervisor.run());

        (Self { shared, cancel }, handle)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status.borrow().state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions.subscribe()
    }

    /// Queue a text frame. Fails immediately when the queue is full.
    pub fn send(&self, text: String) -> Result<DeliveryReceipt> {
        let state = self.state();
        let capacity = self.shared.config.outbound_capacity;

        let mut outbound = self.shared.outbound.lock();
        if outbound.closed || state == ConnectionState::ShuttingDown {
            return Err(ConnectorError::ShuttingDown);
        }
        if outbound.frames.len() >= capacity {
            return Err(if state == ConnectionState::Live {
                ConnectorError::QueueFull { capacity }
            } else {
                ConnectorError::NotConnected(format!(
                    "outbound queue full ({}) while {}",
                    capacity,
                    state.as_str()
                ))
            });
        }

        let (done, rx) = oneshot::channel();
        outbound.frames.push_back(OutboundFrame { text, done });
        drop(outbound);

        self.shared.notify.notify_one();
        Ok(DeliveryReceipt(rx))
    }

    /// Add public streams. Sent now if connected, and on every reconnect.
    pub fn subscribe(&self, streams: &[String]) -> Result<()> {
        let added = add_streams(&self.shared.public_streams, streams);
        if added.is_empty() || !self.is_connected() {
            return Ok(());
        }
        self.send(subscribe_frame(&added).to_string()).map(|_| ())
    }

    /// Add private streams; requires credentials
    pub fn subscribe_private(&self, streams: &[String]) -> Result<()> {
        let signer = self.shared.signer.clone().ok_or_else(|| {
            ConnectorError::Authentication("private streams require credentials".to_string())
        })?;
        let added = add_streams(&self.shared.private_streams, streams);
        if added.is_empty() || !self.is_connected() {
            return Ok(());
        }
        let frame = signer.subscribe_frame(
            &added,
            chrono::Utc::now().timestamp_millis(),
            self.shared.config.window_ms,
        )?;
        self.send(frame.to_string()).map(|_| ())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Subscribing | ConnectionState::Live
        )
    }
}

fn add_streams(set: &Mutex<BTreeSet<String>>, streams: &[String]) -> Vec<String> {
    let mut set = set.lock();
    streams
        .iter()
        .filter(|s| set.insert((*s).clone()))
        .cloned()
        .collect()
}

fn subscribe_frame(streams: &[String]) -> serde_json::Value {
    json!({ "method": "SUBSCRIBE", "params": streams })
}

enum SessionEnd {
    Shutdown,
    Stale,
    Failed(ConnectorError),
}

struct Supervisor {
    shared: Arc<Shared>,
    connector: Arc<dyn WsConnector>,
    inbound: mpsc::Sender<InboundEvent>,
    metrics: Arc<ConnectorMetrics>,
    cancel: CancellationToken,
    backoff: Backoff,
    failures: u32,
    last_message: Instant,
}

impl Supervisor {
    async fn run(mut self) {
        info!(endpoint = %self.shared.config.endpoint, "Starting connection supervisor");

        loop {
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.shared.config.endpoint) => result,
            };

            let end = match connected {
                Ok(mut conn) => {
                    let end = self.session(conn.as_mut()).await;
                    conn.close().await;
                    end
                }
                Err(e) => SessionEnd::Failed(e),
            };

            let reason = match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Failed(e) if e.is_fatal() => {
                    error!(error = %e, "Connection failed permanently");
                    let _ = self.inbound.send(InboundEvent::Fatal(e)).await;
                    break;
                }
                SessionEnd::Failed(e) => e.to_string(),
                SessionEnd::Stale => "connection stale".to_string(),
            };

            self.failures += 1;
            let delay = self.backoff.next_delay();
            self.shared.status.send_modify(|status| status.backoff = delay);
            self.transition(ConnectionState::Reconnecting);
            warn!(
                attempt = self.failures,
                delay_secs = delay.as_secs_f64(),
                %reason,
                "Reconnecting after error..."
            );

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.shut_down();
    }

    async fn session(&mut self, conn: &mut dyn WsConnection) -> SessionEnd {
        self.transition(ConnectionState::Subscribing);
        if let Err(e) = self.subscribe_all(conn).await {
            return SessionEnd::Failed(e);
        }

        self.last_message = Instant::now();
        self.failures = 0;
        self.transition(ConnectionState::Live);
        if self.inbound.send(InboundEvent::Live).await.is_err() {
            return SessionEnd::Shutdown;
        }
        if let Err(e) = self.flush_outbound(conn).await {
            return SessionEnd::Failed(e);
        }

        let period = self.shared.config.health_check_interval;
        let stale_after = self.shared.config.stale_after;
        let mut health = interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    self.transition(ConnectionState::ShuttingDown);
                    if timeout(SHUTDOWN_FLUSH_TIMEOUT, self.flush_outbound(conn)).await.is_err() {
                        warn!("Timed out flushing outbound frames");
                    }
                    return SessionEnd::Shutdown;
                }
                message = conn.recv() => match message {
                    Ok(frame) => {
                        self.mark_alive();
                        if let Some(text) = frame {
                            if self.inbound.send(InboundEvent::Frame(text)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                    }
                    Err(e) => return SessionEnd::Failed(e),
                },
                _ = self.shared.notify.notified() => {
                    if let Err(e) = self.flush_outbound(conn).await {
                        return SessionEnd::Failed(e);
                    }
                }
                _ = health.tick() => {
                    let idle = self.last_message.elapsed();
                    if idle > stale_after {
                        warn!(idle_secs = idle.as_secs(), "No message received within timeout");
                        return SessionEnd::Stale;
                    }
                    if idle >= period {
                        debug!(idle_secs = idle.as_secs(), "Sending keepalive ping");
                        if let Err(e) = conn.ping().await {
                            return SessionEnd::Failed(e);
                        }
                    }
                }
            }
        }
    }

    /// Send every known subscription on a fresh connection. The exchange
    /// does not acknowledge subscriptions, so a completed write counts.
    async fn subscribe_all(&self, conn: &mut dyn WsConnection) -> Result<()> {
        let public: Vec<String> = self.shared.public_streams.lock().iter().cloned().collect();
        let private: Vec<String> = self.shared.private_streams.lock().iter().cloned().collect();

        if !public.is_empty() {
            conn.send_text(subscribe_frame(&public).to_string()).await?;
        }

        if !private.is_empty() {
            let signer = self.shared.signer.as_ref().ok_or_else(|| {
                ConnectorError::Authentication("private streams require credentials".to_string())
            })?;
            let frame = signer.subscribe_frame(
                &private,
                chrono::Utc::now().timestamp_millis(),
                self.shared.config.window_ms,
            )?;
            conn.send_text(frame.to_string()).await?;
        }

        info!(
            public = public.len(),
            private = private.len(),
            "Subscriptions sent"
        );
        Ok(())
    }

    /// Write queued frames in order. A frame that fails to send goes back
    /// to the front of the queue for the next connection.
    async fn flush_outbound(&self, conn: &mut dyn WsConnection) -> Result<()> {
        loop {
            let Some(frame) = self.shared.outbound.lock().frames.pop_front() else {
                return Ok(());
            };

            match conn.send_text(frame.text.clone()).await {
                Ok(()) => {
                    let _ = frame.done.send(Ok(()));
                }
                Err(e) => {
                    self.shared.outbound.lock().frames.push_front(frame);
                    return Err(e);
                }
            }
        }
    }

    fn mark_alive(&mut self) {
        let now = Instant::now();
        self.last_message = now;
        self.backoff.reset();
        let backoff = self.backoff.current();
        self.shared.status.send_modify(|status| {
            status.last_message_at = Some(now);
            status.backoff = backoff;
        });
    }

    fn transition(&self, to: ConnectionState) {
        let failures = self.failures;
        let mut from = to;
        self.shared.status.send_modify(|status| {
            from = status.state;
            status.state = to;
            status.consecutive_failures = failures;
        });

        if from == to {
            return;
        }

        self.metrics.record_transition(to.as_str());
        info!(
            from = from.as_str(),
            to = to.as_str(),
            consecutive_failures = failures,
            "Connection state changed"
        );
        let _ = self.shared.transitions.send(StateTransition {
            from,
            to,
            consecutive_failures: failures,
        });
    }

    /// Reject everything still queued and refuse new frames
    fn shut_down(&self) {
        self.transition(ConnectionState::ShuttingDown);

        let frames: Vec<OutboundFrame> = {
            let mut outbound = self.shared.outbound.lock();
            outbound.closed = true;
            outbound.frames.drain(..).collect()
        };
        let rejected = frames.len();
        for frame in frames {
            let _ = frame.done.send(Err(ConnectorError::ShuttingDown));
        }

        info!(rejected, "Connection supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::testing::{fake_socket, FakeConnector, Script};
    use std::sync::atomic::Ordering;

    fn config(capacity: usize) -> SupervisorConfig {
        SupervisorConfig {
            endpoint: "wss://test".to_string(),
            outbound_capacity: capacity,
            ..Default::default()
        }
    }

    fn start(
        connector: Arc<FakeConnector>,
        capacity: usize,
    ) -> (SupervisorHandle, JoinHandle<()>, mpsc::Receiver<InboundEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let metrics = Arc::new(ConnectorMetrics::new().unwrap());
        let (handle, task) =
            SupervisorHandle::spawn(config(capacity), connector, None, tx, metrics, cancel.clone());
        (handle, task, rx, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        let connector = Arc::new(FakeConnector::default());
        let begin = Instant::now();
        let (handle, task, _rx, _cancel) = start(connector.clone(), 4);

        sleep(Duration::from_millis(15_500)).await;
        assert_eq!(connector.attempt_offsets(begin), vec![0, 1, 3, 7, 15]);

        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.consecutive_failures, 5);
        assert_eq!(status.backoff, Duration::from_secs(16));

        handle.shutdown();
        task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_clears_failures_and_message_resets_backoff() {
        let connector = Arc::new(FakeConnector::default());
        connector.push(Script::Fail(ConnectorError::TransientNetwork("down".into())));
        connector.push(Script::Fail(ConnectorError::TransientNetwork("down".into())));
        let (conn, remote) = fake_socket();
        connector.push(Script::Open(conn));
        connector.push(Script::Fail(ConnectorError::TransientNetwork("down".into())));
        let (replacement, _remote2) = fake_socket();
        connector.push(Script::Open(replacement));

        let begin = Instant::now();
        let (handle, _task, mut rx, _cancel) = start(connector.clone(), 4);
        let mut transitions = handle.transitions();

        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));
        let status = handle.status();
        assert_eq!(status.state, ConnectionState::Live);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.backoff, Duration::from_secs(2));

        remote.tx.send(Some("{}".to_string())).unwrap();
        assert!(matches!(rx.recv().await, Some(InboundEvent::Frame(_))));
        assert_eq!(handle.status().backoff, Duration::from_secs(1));

        // the schedule starts over at one second after the drop
        remote.tx.send(None).unwrap();
        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));
        assert_eq!(connector.attempt_offsets(begin), vec![0, 1, 3, 4, 6]);
        assert_eq!(handle.status().consecutive_failures, 0);

        let mut live_failures = Vec::new();
        while let Ok(t) = transitions.try_recv() {
            if t.to == ConnectionState::Live {
                live_failures.push(t.consecutive_failures);
            }
        }
        assert_eq!(live_failures, vec![0, 0]);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_reconnects() {
        let connector = Arc::new(FakeConnector::default());
        let (conn, remote) = fake_socket();
        connector.push(Script::Open(conn));
        let (replacement, _remote2) = fake_socket();
        connector.push(Script::Open(replacement));

        let begin = Instant::now();
        let (handle, _task, mut rx, _cancel) = start(connector.clone(), 4);
        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));

        // silent but open: pings at 30, 60, 90 and 120s, reconnect at 150s
        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));
        let attempts = connector.attempt_offsets(begin);
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1] >= 150 && attempts[1] <= 151, "attempts {:?}", attempts);
        assert_eq!(remote.pings.load(Ordering::SeqCst), 4);
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        let connector = Arc::new(FakeConnector::default());
        let (first, first_remote) = fake_socket();
        let (second, second_remote) = fake_socket();
        connector.push(Script::Open(first));
        connector.push(Script::Open(second));

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let metrics = Arc::new(ConnectorMetrics::new().unwrap());
        let (handle, _task) = SupervisorHandle::spawn(
            config(4),
            connector.clone(),
            None,
            tx,
            metrics.clone(),
            cancel.clone(),
        );
        handle.subscribe(&["depth.SOL_USDC".to_string()]).unwrap();

        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));
        first_remote.tx.send(Some("frame-1".to_string())).unwrap();
        first_remote.tx.send(None).unwrap();

        assert!(matches!(rx.recv().await, Some(InboundEvent::Frame(f)) if f == "frame-1"));
        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));

        for remote in [&first_remote, &second_remote] {
            let sent = remote.sent.lock();
            assert_eq!(sent.len(), 1);
            assert!(sent[0].contains("SUBSCRIBE") && sent[0].contains("depth.SOL_USDC"));
        }
        assert_eq!(metrics.transitions_to("live"), 2);
        assert_eq!(metrics.transitions_to("reconnecting"), 1);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_frames_sent_after_subscriptions() {
        let connector = Arc::new(FakeConnector::default());
        connector.push(Script::Fail(ConnectorError::TransientNetwork("down".into())));
        let (conn, remote) = fake_socket();
        connector.push(Script::Open(conn));

        let (handle, _task, mut rx, _cancel) = start(connector.clone(), 4);
        handle.subscribe(&["trade.SOL_USDC".to_string()]).unwrap();
        let receipt = handle.send("hello".to_string()).unwrap();

        assert!(matches!(rx.recv().await, Some(InboundEvent::Live)));
        receipt.delivered().await.unwrap();

        let sent = remote.sent.lock().clone();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("trade.SOL_USDC"));
        assert_eq!(sent[1], "hello");
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_while_disconnected_is_not_connected() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, task, _rx, _cancel) = start(connector, 2);

        let first = handle.send("a".to_string()).unwrap();
        let _second = handle.send("b".to_string()).unwrap();
        assert!(matches!(
            handle.send("c".to_string()),
            Err(ConnectorError::NotConnected(_))
        ));

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(first.delivered().await, Err(ConnectorError::ShuttingDown)));
        assert!(matches!(
            handle.send("d".to_string()),
            Err(ConnectorError::ShuttingDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authentication_failure_is_fatal() {
        let connector = Arc::new(FakeConnector::default());
        connector.push(Script::Fail(ConnectorError::Authentication("401".into())));

        let (handle, task, mut rx, _cancel) = start(connector.clone(), 2);
        assert!(matches!(
            rx.recv().await,
            Some(InboundEvent::Fatal(ConnectorError::Authentication(_)))
        ));
        task.await.unwrap();
        assert_eq!(handle.state(), ConnectionState::ShuttingDown);
        assert_eq!(connector.attempts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_private_subscription_requires_credentials() {
        let connector = Arc::new(FakeConnector::default());
        let (handle, _task, _rx, cancel) = start(connector, 2);
        assert!(matches!(
            handle.subscribe_private(&["account.orderUpdate".to_string()]),
            Err(ConnectorError::Authentication(_))
        ));
        cancel.cancel();
    }
}
