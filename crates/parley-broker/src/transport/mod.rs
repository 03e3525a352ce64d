//! Session transports
//!
//! A transport carries encoded STOMP payloads in both directions for one
//! session.
//! Outbound sends never block: each transport owns a bounded FIFO queue that
//! is drained by its own writer, and a full queue is reported as an error so
//! the caller can drop the slow consumer.

mod negotiate;
mod polling;
pub mod sockjs;
mod websocket;

pub use negotiate::{EndpointRoute, Negotiated, Negotiator};
pub use polling::{PollResponse, PollingTransport};
pub use websocket::{Framing, WebSocketTransport};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use parley_config::TransportConfig;

use crate::frame::Frame;

/// Negotiated transport variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// STOMP straight over a WebSocket
    WebSocket,
    /// STOMP inside SockJS framing over a WebSocket
    SockJsWebSocket,
    /// SockJS XHR long polling
    XhrPolling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::SockJsWebSocket => "sockjs-websocket",
            TransportKind::XhrPolling => "xhr-polling",
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, TransportKind::XhrPolling)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("outbound queue full ({0} payloads)")]
    QueueFull(usize),

    #[error("network error: {0}")]
    Network(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no poll received for {0:?}")]
    PollTimeout(Duration),
}

/// Tunables shared by every transport
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub queue_capacity: usize,
    pub poll_timeout: Duration,
    pub disconnect_delay: Duration,
    pub sockjs_heartbeat: Duration,
}

impl TransportSettings {
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            queue_capacity: config.outbound_queue_capacity,
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
            disconnect_delay: Duration::from_secs(config.disconnect_delay_secs),
            sockjs_heartbeat: Duration::from_secs(config.sockjs_heartbeat_secs),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

/// Bidirectional message channel of one session
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Queue an encoded payload. Fails instead of waiting when the queue is
    /// full.
    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Next inbound payload. `None` once the peer is gone or the transport
    /// was closed. Only the session's receive loop calls this.
    async fn recv(&self) -> Option<Result<Vec<u8>, TransportError>>;

    /// Flush what is queued, then shut the channel. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send(frame.encode())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// In-memory transport recording everything sent to it
    #[derive(Debug)]
    pub struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
        inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
        closed: AtomicBool,
        fail_sends: AtomicBool,
        closed_token: tokio_util::sync::CancellationToken,
    }

    impl MockTransport {
        pub fn new() -> std::sync::Arc<Self> {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            std::sync::Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                inbound_tx,
                inbound_rx: tokio::sync::Mutex::new(inbound_rx),
                closed: AtomicBool::new(false),
                fail_sends: AtomicBool::new(false),
                closed_token: tokio_util::sync::CancellationToken::new(),
            })
        }

        /// Simulate the peer sending `payload`
        pub fn inject(&self, payload: &str) {
            let _ = self.inbound_tx.send(payload.as_bytes().to_vec());
        }

        /// Make every later send fail as a broken connection would
        pub fn break_connection(&self) {
            self.fail_sends.store(true, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .map(|payload| String::from_utf8_lossy(payload).into_owned())
                .collect()
        }

        pub fn sent_bytes(&self) -> Vec<Vec<u8>> {
            self.sent.lock().clone()
        }

        /// Sent payloads that are STOMP frames of `command`
        pub fn sent_frames(&self, command: &str) -> Vec<String> {
            self.sent()
                .into_iter()
                .filter(|p| p.starts_with(&format!("{}\n", command)))
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::WebSocket
        }

        fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::Network("connection reset".to_string()));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            self.sent.lock().push(payload);
            Ok(())
        }

        async fn recv(&self) -> Option<Result<Vec<u8>, TransportError>> {
            let mut rx = self.inbound_rx.lock().await;
            tokio::select! {
                msg = rx.recv() => msg.map(Ok),
                _ = self.closed_token.cancelled() => None,
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.closed_token.cancel();
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
