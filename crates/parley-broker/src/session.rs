//! Session management
//!
//! The [`SessionManager`] owns every live session. Other components refer to
//! sessions by id only, and learn about closes through [`SessionListener`]
//! (synchronously, before `close` returns) or the lifecycle event channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use parley_config::{BrokerConfig, HeartbeatConfig};
use parley_observability::RelayMetrics;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{BrokerError, HandshakeError, Result};
use crate::frame::Frame;
use crate::transport::{Transport, TransportError, TransportKind};

pub type SessionHandle = Arc<Session>;

/// Connection state. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Open,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// DISCONNECT frame
    ClientDisconnect,
    /// Peer closed the connection
    ClientGone,
    /// Network fault, or an abandoned polling session
    TransportFailure,
    /// Outbound queue overflowed
    SlowConsumer,
    /// No inbound traffic within the negotiated heart-beat window
    HeartbeatTimeout,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::ClientGone => "client_gone",
            CloseReason::TransportFailure => "transport_failure",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Abrupt closes skip CLOSING
    fn is_abrupt(&self) -> bool {
        matches!(self, CloseReason::TransportFailure | CloseReason::HeartbeatTimeout)
    }
}

impl From<&TransportError> for CloseReason {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::QueueFull(_) => CloseReason::SlowConsumer,
            TransportError::Closed => CloseReason::ClientGone,
            _ => CloseReason::TransportFailure,
        }
    }
}

/// Lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Opened {
        session_id: String,
        transport: TransportKind,
    },
    Closed {
        session_id: String,
        reason: CloseReason,
    },
}

/// Negotiated STOMP heart-beat. Zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    /// How often the server sends
    pub outgoing: Duration,
    /// How often the client promised to send
    pub incoming: Duration,
}

impl Heartbeat {
    /// Combine the client's `heart-beat: cx,cy` with the server settings
    pub fn negotiate(client: Option<&str>, server: &HeartbeatConfig) -> std::result::Result<Self, BrokerError> {
        let (cx, cy) = match client {
            None => (0, 0),
            Some(value) => {
                let parsed = value.split_once(',').and_then(|(x, y)| {
                    Some((x.trim().parse::<u64>().ok()?, y.trim().parse::<u64>().ok()?))
                });
                parsed.ok_or_else(|| {
                    BrokerError::MalformedFrame(format!("invalid heart-beat header: {:?}", value))
                })?
            }
        };

        let combine = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(ours.max(theirs))
            }
        };

        Ok(Self {
            outgoing: combine(server.send_ms, cy),
            incoming: combine(server.receive_ms, cx),
        })
    }
}

/// One client connection
pub struct Session {
    id: String,
    origin: Option<String>,
    transport: Arc<dyn Transport>,
    created_at: DateTime<Utc>,
    state: AtomicU8,
    /// subscription id -> topic
    subscriptions: Mutex<BTreeMap<String, String>>,
    heartbeat: Mutex<Heartbeat>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    fn new(origin: Option<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin,
            transport,
            created_at: Utc::now(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            subscriptions: Mutex::new(BTreeMap::new()),
            heartbeat: Mutex::new(Heartbeat::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Cancelled when the session closes
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn send(&self, payload: Vec<u8>) -> std::result::Result<(), TransportError> {
        self.transport.send(payload)
    }

    pub fn send_frame(&self, frame: &Frame) -> std::result::Result<(), TransportError> {
        self.transport.send_frame(frame)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        *self.heartbeat.lock()
    }

    pub fn set_heartbeat(&self, heartbeat: Heartbeat) {
        *self.heartbeat.lock() = heartbeat;
    }

    /// Record a subscription. `false` if the id is already taken.
    pub fn add_subscription(&self, id: &str, topic: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(id) {
            return false;
        }
        subscriptions.insert(id.to_string(), topic.to_string());
        true
    }

    /// Forget a subscription, returning its topic
    pub fn remove_subscription(&self, id: &str) -> Option<String> {
        self.subscriptions.lock().remove(id)
    }

    /// Forget every subscription to `topic`, returning their ids
    pub fn remove_topic(&self, topic: &str) -> Vec<String> {
        let mut subscriptions = self.subscriptions.lock();
        let ids: Vec<String> = subscriptions
            .iter()
            .filter(|(_, t)| t.as_str() == topic)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            subscriptions.remove(id);
        }
        ids
    }

    /// Distinct subscribed topics
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.subscriptions.lock().values().cloned().collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn subscriptions(&self) -> BTreeMap<String, String> {
        self.subscriptions.lock().clone()
    }
}

/// Notified synchronously while a session closes
pub trait SessionListener: Send + Sync {
    fn on_session_closed(&self, session: &Session);
}

/// Owns all live sessions
pub struct SessionManager {
    sessions: DashMap<String, SessionHandle>,
    allowed_origins: Vec<String>,
    max_sessions: usize,
    /// Admitted sessions, including ones not yet in the map
    reserved: AtomicUsize,
    events: broadcast::Sender<SessionEvent>,
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("allowed_origins", &self.allowed_origins)
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}

impl SessionManager {
    pub fn new(allowed_origins: Vec<String>, max_sessions: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            sessions: DashMap::new(),
            allowed_origins: allowed_origins.iter().map(|o| normalize_origin(o)).collect(),
            max_sessions,
            reserved: AtomicUsize::new(0),
            events,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.allowed_origins.clone(), config.max_sessions)
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn allowed_origins(&self) -> &[String] {
        &self.allowed_origins
    }

    /// Validate the request origin against the allow-list
    pub fn check_origin(&self, origin: Option<&str>) -> std::result::Result<(), HandshakeError> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Ok(());
        }
        let origin = origin.ok_or(HandshakeError::MissingOrigin)?;
        let normalized = normalize_origin(origin);
        if self.allowed_origins.iter().any(|o| *o == normalized) {
            Ok(())
        } else {
            Err(HandshakeError::OriginRejected(origin.to_string()))
        }
    }

    /// Pre-flight for the HTTP layer: would `accept` succeed right now?
    pub fn admit(&self, origin: Option<&str>) -> Result<()> {
        self.check_origin(origin)?;
        if self.reserved.load(Ordering::SeqCst) >= self.max_sessions {
            return Err(BrokerError::ResourceExhausted(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }
        Ok(())
    }

    /// Create an OPEN session on a negotiated transport
    pub fn accept(&self, origin: Option<&str>, transport: Arc<dyn Transport>) -> Result<SessionHandle> {
        if let Err(e) = self.check_origin(origin) {
            RelayMetrics::handshake_rejected();
            return Err(e.into());
        }

        let reserved = self.reserved.fetch_add(1, Ordering::SeqCst);
        if reserved >= self.max_sessions {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
            RelayMetrics::handshake_rejected();
            return Err(BrokerError::ResourceExhausted(format!(
                "session limit of {} reached",
                self.max_sessions
            )));
        }

        let kind = transport.kind();
        let session = Arc::new(Session::new(origin.map(str::to_string), transport));
        self.sessions.insert(session.id.clone(), Arc::clone(&session));
        session.transition(SessionState::Connecting, SessionState::Open);

        info!(
            session_id = %session.id,
            transport = %kind,
            origin = origin.unwrap_or("-"),
            "Session opened"
        );
        RelayMetrics::session_opened(kind.as_str());
        let _ = self.events.send(SessionEvent::Opened {
            session_id: session.id.clone(),
            transport: kind,
        });

        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_sessions(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Close a session. Returns `false` if it was unknown or already closing.
    ///
    /// Listeners have released every reference to the session by the time
    /// this returns.
    pub fn close(&self, id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };

        let target = if reason.is_abrupt() {
            SessionState::Closed
        } else {
            SessionState::Closing
        };
        let claimed = session.transition(SessionState::Open, target)
            || session.transition(SessionState::Connecting, target);
        if !claimed {
            return false;
        }

        for listener in self.listeners.read().iter() {
            listener.on_session_closed(&session);
        }

        session.cancel.cancel();
        session.transport.close();
        if self.sessions.remove(id).is_some() {
            self.reserved.fetch_sub(1, Ordering::SeqCst);
        }
        session.state.store(SessionState::Closed as u8, Ordering::SeqCst);

        info!(session_id = %id, reason = reason.as_str(), "Session closed");
        RelayMetrics::session_closed(reason.as_str());
        let _ = self.events.send(SessionEvent::Closed {
            session_id: id.to_string(),
            reason,
        });
        true
    }

    /// Close every session
    pub fn shutdown(&self) -> usize {
        let ids = self.list_sessions();
        debug!("Closing {} sessions for shutdown", ids.len());
        ids.iter()
            .filter(|id| self.close(id, CloseReason::Shutdown))
            .count()
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_string()
}
