//! Broker
//!
//! Wires the session manager, registry, relay and router together and runs
//! the per-session receive loop.

use std::sync::Arc;
use std::time::Duration;

use parley_config::Config;
use parley_observability::{session_span, RelayMetrics};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use crate::destination::Destinations;
use crate::error::BrokerError;
use crate::frame::{Command, Frame, FrameDecoder};
use crate::handler::HandlerRegistry;
use crate::registry::SubscriptionRegistry;
use crate::relay::BroadcastRelay;
use crate::router::DestinationRouter;
use crate::session::{CloseReason, Heartbeat, SessionHandle, SessionManager};
use crate::transport::{Negotiator, TransportError, TransportSettings};

const SUPPORTED_VERSIONS: [&str; 3] = ["1.0", "1.1", "1.2"];

/// The relay core. One per process, shared behind an `Arc`.
#[derive(Debug)]
pub struct Broker {
    config: Arc<Config>,
    sessions: Arc<SessionManager>,
    registry: Arc<SubscriptionRegistry>,
    relay: Arc<BroadcastRelay>,
    router: DestinationRouter,
    negotiator: Negotiator,
    transport_settings: TransportSettings,
}

/// Whether the receive loop keeps going
enum Flow {
    Continue,
    Close(CloseReason),
}

impl Broker {
    pub fn new(config: Arc<Config>, handlers: HandlerRegistry) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::from_config(&config.broker));
        let registry = Arc::new(SubscriptionRegistry::new());
        sessions.add_listener(registry.clone());

        let relay = Arc::new(BroadcastRelay::new(registry.clone(), sessions.clone()));
        let router = DestinationRouter::new(
            Destinations::from_config(&config.broker),
            registry.clone(),
            relay.clone(),
            Arc::new(handlers),
        );

        info!(
            endpoint = %config.broker.endpoint,
            broadcast_prefix = %config.broker.broadcast_prefix,
            application_prefix = %config.broker.application_prefix,
            "Broker created"
        );

        Arc::new(Self {
            negotiator: Negotiator::new(&config.transport),
            transport_settings: TransportSettings::from_config(&config.transport),
            config,
            sessions,
            registry,
            relay,
            router,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.relay
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn transport_settings(&self) -> &TransportSettings {
        &self.transport_settings
    }

    /// Server-side publish
    pub fn publish(&self, topic: &str, body: &[u8], content_type: Option<&str>) -> usize {
        self.relay.publish(topic, body, content_type)
    }

    /// Close every session
    pub fn shutdown(&self) {
        let closed = self.sessions.shutdown();
        info!("Broker shut down, {} sessions closed", closed);
    }

    /// Receive loop of one session. Returns once the session is closed.
    pub async fn run_session(self: Arc<Self>, session: SessionHandle) {
        let span = session_span(session.id(), session.transport_kind().as_str());
        self.receive_loop(&session).instrument(span).await;
    }

    async fn receive_loop(&self, session: &SessionHandle) {
        let cancel = session.cancelled();
        let mut decoder = FrameDecoder::new(self.config.broker.max_frame_bytes);
        let mut heartbeat_out: Option<Interval> = None;
        let mut heartbeat_check: Option<Interval> = None;
        let mut last_inbound = Instant::now();

        let reason = loop {
            let flow = tokio::select! {
                _ = cancel.cancelled() => break None,
                inbound = session.transport().recv() => match inbound {
                    None => Flow::Close(CloseReason::ClientGone),
                    Some(Err(TransportError::Protocol(detail))) => {
                        RelayMetrics::frame_malformed();
                        self.reply(session, &BrokerError::MalformedFrame(detail).to_error_frame(None))
                    }
                    Some(Err(e)) => {
                        warn!("Transport failure: {}", e);
                        Flow::Close(CloseReason::from(&e))
                    }
                    Some(Ok(bytes)) => {
                        last_inbound = Instant::now();
                        decoder.push(&bytes);
                        self.drain_frames(session, &mut decoder, &mut heartbeat_out, &mut heartbeat_check)
                            .await
                    }
                },
                _ = tick(&mut heartbeat_out) => self.send_raw(session, "\n".to_string().into_bytes()),
                _ = tick(&mut heartbeat_check) => {
                    let window = session.heartbeat().incoming * 2;
                    if last_inbound.elapsed() > window {
                        warn!("No heart-beat from client within {:?}", window);
                        Flow::Close(CloseReason::HeartbeatTimeout)
                    } else {
                        Flow::Continue
                    }
                }
            };

            if let Flow::Close(reason) = flow {
                break Some(reason);
            }
        };

        if let Some(reason) = reason {
            self.sessions.close(session.id(), reason);
        }
        debug!("Receive loop finished");
    }

    async fn drain_frames(
        &self,
        session: &SessionHandle,
        decoder: &mut FrameDecoder,
        heartbeat_out: &mut Option<Interval>,
        heartbeat_check: &mut Option<Interval>,
    ) -> Flow {
        while let Some(decoded) = decoder.next_frame() {
            let flow = match decoded {
                Ok(frame) => {
                    self.handle_frame(session, frame, heartbeat_out, heartbeat_check)
                        .await
                }
                Err(e) => {
                    RelayMetrics::frame_malformed();
                    warn!("Dropping malformed frame: {}", e);
                    self.reply(session, &BrokerError::from(e).to_error_frame(None))
                }
            };
            if let Flow::Close(_) = flow {
                return flow;
            }
        }
        Flow::Continue
    }

    async fn handle_frame(
        &self,
        session: &SessionHandle,
        frame: Frame,
        heartbeat_out: &mut Option<Interval>,
        heartbeat_check: &mut Option<Interval>,
    ) -> Flow {
        RelayMetrics::frame_received(frame.command.as_str());
        let receipt = frame.receipt().map(str::to_string);

        match frame.command {
            Command::Connect | Command::Stomp => {
                return self.connect(session, &frame, heartbeat_out, heartbeat_check);
            }
            Command::Disconnect => {
                if let Some(id) = &receipt {
                    if let Flow::Close(reason) = self.reply(session, &Frame::receipt_for(id)) {
                        return Flow::Close(reason);
                    }
                }
                debug!("Client disconnected");
                return Flow::Close(CloseReason::ClientDisconnect);
            }
            _ => {}
        }

        match self.router.route(session, &frame).await {
            Ok(outcome) => {
                debug!(command = %frame.command, ?outcome, "Routed");
            }
            Err(BrokerError::TransportFailure(e)) => return Flow::Close(CloseReason::from(&e)),
            Err(e) if e.notifies_client() => {
                warn!(command = %frame.command, "{}", e);
                return self.reply(session, &e.to_error_frame(receipt.as_deref()));
            }
            Err(e) => {
                warn!(command = %frame.command, "Dropped: {}", e);
            }
        }

        match receipt {
            Some(id) => self.reply(session, &Frame::receipt_for(&id)),
            None => Flow::Continue,
        }
    }

    fn connect(
        &self,
        session: &SessionHandle,
        frame: &Frame,
        heartbeat_out: &mut Option<Interval>,
        heartbeat_check: &mut Option<Interval>,
    ) -> Flow {
        let Some(version) = negotiate_version(frame.get("accept-version")) else {
            let error = Frame::error(
                "Unsupported protocol version",
                &format!("Supported protocol versions are {}", SUPPORTED_VERSIONS.join(",")),
            )
            .header("version", SUPPORTED_VERSIONS.join(","));
            let _ = self.reply(session, &error);
            return Flow::Close(CloseReason::ClientDisconnect);
        };

        let heartbeat = match Heartbeat::negotiate(frame.get("heart-beat"), &self.config.broker.heartbeat) {
            Ok(heartbeat) => heartbeat,
            Err(e) => return self.reply(session, &e.to_error_frame(frame.receipt())),
        };
        session.set_heartbeat(heartbeat);
        *heartbeat_out = periodic(heartbeat.outgoing);
        *heartbeat_check = periodic(heartbeat.incoming);

        let server = &self.config.broker.heartbeat;
        debug!(version, ?heartbeat, "STOMP session connected");
        self.reply(
            session,
            &Frame::connected(version, (server.send_ms, server.receive_ms))
                .header("session", session.id()),
        )
    }

    fn reply(&self, session: &SessionHandle, frame: &Frame) -> Flow {
        self.send_raw(session, frame.encode())
    }

    fn send_raw(&self, session: &SessionHandle, payload: Vec<u8>) -> Flow {
        match session.send(payload) {
            Ok(()) => Flow::Continue,
            Err(e) => {
                warn!("Send to own session failed: {}", e);
                Flow::Close(CloseReason::from(&e))
            }
        }
    }
}

/// Highest version both sides speak. No header means 1.0.
fn negotiate_version(accept: Option<&str>) -> Option<&'static str> {
    let Some(accept) = accept else {
        return Some("1.0");
    };
    let offered: Vec<&str> = accept.split(',').map(str::trim).collect();
    SUPPORTED_VERSIONS
        .iter()
        .rev()
        .find(|version| offered.contains(*version))
        .copied()
}

fn periodic(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
