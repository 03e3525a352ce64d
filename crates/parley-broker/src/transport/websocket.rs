//! Native WebSocket transport, raw or SockJS framed
//!
//! Raw framing sends each payload as a text message, or as a binary message
//! when the encoded frame is not UTF-8.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{sockjs, Transport, TransportError, TransportKind, TransportSettings};

/// How payloads are wrapped on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// One STOMP payload per text message
    Raw,
    /// SockJS `o` / `a[...]` / `h` / `c[...]` frames
    SockJs,
}

type Inbound = Result<Vec<u8>, TransportError>;

#[derive(Debug)]
pub struct WebSocketTransport {
    framing: Framing,
    capacity: usize,
    outbound: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    cancel: CancellationToken,
}

impl WebSocketTransport {
    /// Take over an upgraded socket. Spawns the writer and reader tasks.
    pub fn spawn(socket: WebSocket, framing: Framing, settings: &TransportSettings) -> Arc<Self> {
        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.queue_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let heartbeat = match framing {
            Framing::SockJs => Some(settings.sockjs_heartbeat),
            Framing::Raw => None,
        };

        tokio::spawn(write_loop(sink, outbound_rx, framing, heartbeat, cancel.clone()));
        tokio::spawn(read_loop(stream, inbound_tx, framing, cancel.clone()));

        Arc::new(Self {
            framing,
            capacity: settings.queue_capacity,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            cancel,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        match self.framing {
            Framing::Raw => TransportKind::WebSocket,
            Framing::SockJs => TransportKind::SockJsWebSocket,
        }
    }

    fn send(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    async fn recv(&self) -> Option<Inbound> {
        self.inbound.lock().await.recv().await
    }

    fn close(&self) {
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    framing: Framing,
    heartbeat: Option<Duration>,
    cancel: CancellationToken,
) {
    if framing == Framing::SockJs
        && sink.send(Message::Text(sockjs::OPEN.to_string())).await.is_err()
    {
        cancel.cancel();
        return;
    }

    let mut heartbeat = heartbeat.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            biased;

            Some(payload) = outbound.recv() => {
                let message = match framing {
                    Framing::Raw => raw_message(payload),
                    Framing::SockJs => {
                        let mut batch = vec![sockjs::message_text(payload)];
                        while let Ok(next) = outbound.try_recv() {
                            batch.push(sockjs::message_text(next));
                        }
                        Message::Text(sockjs::array_frame(&batch))
                    }
                };
                if let Err(e) = sink.send(message).await {
                    debug!("WebSocket write failed: {}", e);
                    cancel.cancel();
                    return;
                }
            }
            _ = cancel.cancelled() => break,
            _ = tick(&mut heartbeat) => {
                if sink.send(Message::Text(sockjs::HEARTBEAT.to_string())).await.is_err() {
                    cancel.cancel();
                    return;
                }
            }
        }
    }

    // closed: flush what was queued before the close, then say goodbye
    let mut pending = Vec::new();
    while let Ok(payload) = outbound.try_recv() {
        pending.push(payload);
    }
    let last: Vec<Message> = match framing {
        Framing::Raw => pending.into_iter().map(raw_message).collect(),
        Framing::SockJs => {
            let pending: Vec<String> = pending.into_iter().map(sockjs::message_text).collect();
            let mut last = Vec::new();
            if !pending.is_empty() {
                last.push(Message::Text(sockjs::array_frame(&pending)));
            }
            last.push(Message::Text(sockjs::close_frame(
                sockjs::GO_AWAY.0,
                sockjs::GO_AWAY.1,
            )));
            last
        }
    };
    for message in last {
        if sink.send(message).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Text when the payload is UTF-8, binary otherwise
fn raw_message(payload: Vec<u8>) -> Message {
    match String::from_utf8(payload) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    inbound: mpsc::Sender<Inbound>,
    framing: Framing,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = stream.next() => msg,
        };

        let payloads: Vec<Inbound> = match msg {
            Some(Ok(Message::Text(text))) => match framing {
                Framing::Raw => vec![Ok(text.into_bytes())],
                Framing::SockJs => match sockjs::decode_client_payload(&text) {
                    Ok(messages) => messages.into_iter().map(|m| Ok(m.into_bytes())).collect(),
                    Err(e) => vec![Err(e)],
                },
            },
            Some(Ok(Message::Binary(bytes))) if framing == Framing::Raw => vec![Ok(bytes)],
            Some(Ok(Message::Binary(_))) => vec![Err(TransportError::Protocol(
                "binary message on a SockJS socket".to_string(),
            ))],
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket read failed: {}", e);
                let _ = inbound.send(Err(TransportError::Network(e.to_string()))).await;
                break;
            }
        };

        for payload in payloads {
            if inbound.send(payload).await.is_err() {
                return;
            }
        }
    }
}
