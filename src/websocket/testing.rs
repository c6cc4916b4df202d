//! In-memory WebSocket fakes for tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{WsConnection, WsConnector};
use crate::error::{ConnectorError, Result};

pub(crate) enum Script {
    Fail(ConnectorError),
    Open(FakeConnection),
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    script: Mutex<VecDeque<Script>>,
    pub(crate) attempts: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    pub(crate) fn push(&self, step: Script) {
        self.script.lock().push_back(step);
    }

    pub(crate) fn attempt_offsets(&self, start: Instant) -> Vec<u64> {
        self.attempts
            .lock()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect()
    }
}

#[async_trait]
impl WsConnector for FakeConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn WsConnection>> {
        self.attempts.lock().push(Instant::now());
        match self.script.lock().pop_front() {
            Some(Script::Open(conn)) => Ok(Box::new(conn)),
            Some(Script::Fail(e)) => Err(e),
            None => Err(ConnectorError::TransientNetwork("refused".to_string())),
        }
    }
}

pub(crate) struct FakeConnection {
    incoming: mpsc::UnboundedReceiver<Option<String>>,
    sent: Arc<Mutex<Vec<String>>>,
    pings: Arc<AtomicUsize>,
}

/// Test side of a fake socket; `None` closes it
pub(crate) struct Remote {
    pub(crate) tx: mpsc::UnboundedSender<Option<String>>,
    pub(crate) sent: Arc<Mutex<Vec<String>>>,
    pub(crate) pings: Arc<AtomicUsize>,
}

pub(crate) fn fake_socket() -> (FakeConnection, Remote) {
    let (tx, incoming) = mpsc::unbounded_channel();
    let sent = Arc::new(Mutex::new(Vec::new()));
    let pings = Arc::new(AtomicUsize::new(0));
    (
        FakeConnection {
            incoming,
            sent: sent.clone(),
            pings: pings.clone(),
        },
        Remote { tx, sent, pings },
    )
}

#[async_trait]
impl WsConnection for FakeConnection {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.sent.lock().push(text);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        match self.incoming.recv().await {
            Some(Some(text)) => Ok(Some(text)),
            _ => Err(ConnectorError::TransientNetwork("closed".to_string())),
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {}
}
