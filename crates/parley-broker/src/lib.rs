//! Parley broker
//!
//! A STOMP publish/subscribe relay reachable over native WebSocket or the
//! SockJS fallbacks. Clients subscribe to broadcast topics, publish to them
//! directly, or send to application destinations whose handlers may reply
//! onto a topic.

pub mod broker;
pub mod destination;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod handler;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod transport;

pub use broker::Broker;
pub use destination::{Destinations, Namespace};
pub use error::{BrokerError, HandshakeError, Result};
pub use frame::{Command, Frame, FrameDecoder, FrameError};
pub use handler::{HandlerContext, HandlerError, HandlerRegistry, MessageHandler, Reply};
pub use registry::SubscriptionRegistry;
pub use relay::BroadcastRelay;
pub use router::{DestinationRouter, RouteOutcome};
pub use session::{CloseReason, Session, SessionEvent, SessionHandle, SessionManager, SessionState};
pub use transport::{Transport, TransportError, TransportKind};
