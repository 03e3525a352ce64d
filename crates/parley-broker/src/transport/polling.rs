//! XHR long-polling fallback
//!
//! Outbound payloads wait in a FIFO queue until the client's next poll picks
//! them up as one `a[...]` batch. Inbound payloads arrive through separate
//! `xhr_send` requests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{sockjs, Transport, TransportError, TransportKind, TransportSettings};

type Inbound = Result<Vec<u8>, TransportError>;

/// Answer to one poll request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResponse {
    /// First poll of a session
    Open,
    /// Queued payloads, in send order
    Messages(Vec<String>),
    /// Nothing arrived within the poll timeout
    Heartbeat,
    /// The session is gone
    Closed,
    /// Another poll is already waiting on this session
    AnotherConnection,
}

impl PollResponse {
    /// Response body, newline terminated
    pub fn to_body(&self) -> String {
        let frame = match self {
            PollResponse::Open => sockjs::OPEN.to_string(),
            PollResponse::Messages(messages) => sockjs::array_frame(messages),
            PollResponse::Heartbeat => sockjs::HEARTBEAT.to_string(),
            PollResponse::Closed => sockjs::close_frame(sockjs::GO_AWAY.0, sockjs::GO_AWAY.1),
            PollResponse::AnotherConnection => {
                sockjs::close_frame(sockjs::ANOTHER_CONNECTION.0, sockjs::ANOTHER_CONNECTION.1)
            }
        };
        format!("{}\n", frame)
    }
}

#[derive(Debug)]
struct PollState {
    queue: VecDeque<Vec<u8>>,
    opened: bool,
    poll_in_flight: bool,
    last_poll: Instant,
}

#[derive(Debug)]
pub struct PollingTransport {
    state: Mutex<PollState>,
    ready: Notify,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    cancel: CancellationToken,
    capacity: usize,
    poll_timeout: Duration,
    disconnect_delay: Duration,
}

impl PollingTransport {
    pub fn new(settings: &TransportSettings) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(settings.queue_capacity);
        Self {
            state: Mutex::new(PollState {
                queue: VecDeque::new(),
                opened: false,
                poll_in_flight: false,
                last_poll: Instant::now(),
            }),
            ready: Notify::new(),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            cancel: CancellationToken::new(),
            capacity: settings.queue_capacity,
            poll_timeout: settings.poll_timeout,
            disconnect_delay: settings.disconnect_delay,
        }
    }

    /// Serve one poll request.
    ///
    /// Returns as soon as something is queued, when the session closes, or
    /// after the poll timeout. Queued payloads are still handed out after the
    /// close so a final RECEIPT or ERROR reaches the client.
    pub async fn poll(&self) -> PollResponse {
        {
            let mut state = self.state.lock();
            if !state.opened {
                state.opened = true;
                state.last_poll = Instant::now();
                return PollResponse::Open;
            }
            if state.poll_in_flight {
                return PollResponse::AnotherConnection;
            }
            state.poll_in_flight = true;
        }
        let _in_flight = InFlight(self);

        let deadline = tokio::time::sleep(self.poll_timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(messages) = self.take_queued() {
                return PollResponse::Messages(messages);
            }
            if self.cancel.is_cancelled() {
                return PollResponse::Closed;
            }
            tokio::select! {
                _ = self.ready.notified() => {}
                _ = self.cancel.cancelled() => {}
                _ = &mut deadline => return PollResponse::Heartbeat,
            }
        }
    }

    /// Feed an `xhr_send` body to the session. Waits while the inbound
    /// queue is full, and gives up once the session closes.
    pub async fn accept_inbound(&self, body: &str) -> Result<usize, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let messages = sockjs::decode_client_payload(body)?;
        let count = messages.len();
        for message in messages {
            tokio::select! {
                sent = self.inbound_tx.send(Ok(message.into_bytes())) => {
                    sent.map_err(|_| TransportError::Closed)?;
                }
                _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            }
        }
        Ok(count)
    }

    /// No poll is waiting and none arrived within the disconnect delay
    pub fn is_abandoned(&self) -> bool {
        let state = self.state.lock();
        !state.poll_in_flight && state.last_poll.elapsed() > self.disconnect_delay
    }

    fn take_queued(&self) -> Option<Vec<String>> {
        let mut state = self.state.lock();
        if state.queue.is_empty() {
            None
        } else {
            Some(state.queue.drain(..).map(sockjs::message_text).collect())
        }
    }
}

/// Clears the in-flight flag when a poll finishes or is dropped
struct InFlight<'a>(&'a PollingTransport);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock();
        state.poll_in_flight = false;
        state.last_poll = Instant::now();
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::XhrPolling
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        {
            let mut state = self.state.lock();
            if state.queue.len() >= self.capacity {
                return Err(TransportError::QueueFull(self.capacity));
            }
            state.queue.push_back(payload);
        }
        self.ready.notify_one();
        Ok(())
    }

    async fn recv(&self) -> Option<Inbound> {
        let mut inbound = self.inbound_rx.lock().await;
        let period = (self.disconnect_delay / 2).max(Duration::from_millis(50));
        let mut watchdog = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = inbound.recv() => return msg,
                _ = self.cancel.cancelled() => return None,
                _ = watchdog.tick() => {
                    if self.is_abandoned() {
                        return Some(Err(TransportError::PollTimeout(self.disconnect_delay)));
                    }
                }
            }
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
