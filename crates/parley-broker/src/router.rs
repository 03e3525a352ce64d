//! Destination routing
//!
//! Dispatches client frames to the subscription registry (broadcast
//! namespace) or to an application handler (application namespace).

use std::sync::Arc;

use tracing::debug;

use crate::destination::{Destinations, Namespace};
use crate::error::{BrokerError, Result};
use crate::frame::{Command, Frame};
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::registry::SubscriptionRegistry;
use crate::relay::BroadcastRelay;
use crate::session::Session;

/// What routing a frame did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Subscribed {
        topic: String,
        subscription_id: String,
    },
    Unsubscribed {
        /// `None` when the subscription id was unknown
        topic: Option<String>,
    },
    /// SEND straight to a topic
    Published { topic: String, delivered: usize },
    /// SEND handled by an application route
    Handled {
        route: String,
        /// Topic and delivery count of the reply, if any
        published: Option<(String, usize)>,
    },
    /// Frame accepted without effect (ACK, NACK, transactions)
    Ignored,
}

#[derive(Debug)]
pub struct DestinationRouter {
    destinations: Destinations,
    registry: Arc<SubscriptionRegistry>,
    relay: Arc<BroadcastRelay>,
    handlers: Arc<HandlerRegistry>,
}

impl DestinationRouter {
    pub fn new(
        destinations: Destinations,
        registry: Arc<SubscriptionRegistry>,
        relay: Arc<BroadcastRelay>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            destinations,
            registry,
            relay,
            handlers,
        }
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    /// Route one frame from `session`
    pub async fn route(&self, session: &Session, frame: &Frame) -> Result<RouteOutcome> {
        match frame.command {
            Command::Subscribe => self.subscribe(session, frame),
            Command::Unsubscribe => self.unsubscribe(session, frame),
            Command::Send => self.send(session, frame).await,
            Command::Ack
            | Command::Nack
            | Command::Begin
            | Command::Commit
            | Command::Abort
            | Command::Connect
            | Command::Stomp
            | Command::Disconnect => Ok(RouteOutcome::Ignored),
            Command::Connected | Command::Message | Command::Receipt | Command::Error => Err(
                BrokerError::MalformedFrame(format!("{} is a server frame", frame.command)),
            ),
        }
    }

    fn subscribe(&self, session: &Session, frame: &Frame) -> Result<RouteOutcome> {
        let topic = required_destination(frame)?;
        if !self.destinations.is_topic(topic) {
            return Err(BrokerError::UnroutableDestination(topic.to_string()));
        }
        // STOMP 1.0 clients may omit the id
        let subscription_id = frame.get("id").unwrap_or(topic);

        if !session.add_subscription(subscription_id, topic) {
            return Err(BrokerError::MalformedFrame(format!(
                "subscription id {:?} already in use",
                subscription_id
            )));
        }
        self.registry.subscribe(session.id(), topic, subscription_id);

        // a close racing with this subscribe may have missed the entry
        if !session.is_open() {
            self.registry.remove_session(session.id(), [topic]);
        }

        debug!(session_id = %session.id(), topic, subscription_id, "Subscribed");
        Ok(RouteOutcome::Subscribed {
            topic: topic.to_string(),
            subscription_id: subscription_id.to_string(),
        })
    }

    fn unsubscribe(&self, session: &Session, frame: &Frame) -> Result<RouteOutcome> {
        if let Some(subscription_id) = frame.get("id") {
            let topic = session.remove_subscription(subscription_id);
            if let Some(topic) = &topic {
                self.registry.unsubscribe_id(session.id(), topic, subscription_id);
                debug!(session_id = %session.id(), topic = %topic, subscription_id, "Unsubscribed");
            }
            return Ok(RouteOutcome::Unsubscribed { topic });
        }

        let topic = frame.destination().ok_or_else(|| {
            BrokerError::MalformedFrame("UNSUBSCRIBE requires an id or destination header".to_string())
        })?;
        if !self.destinations.is_topic(topic) {
            return Err(BrokerError::UnroutableDestination(topic.to_string()));
        }
        session.remove_topic(topic);
        let removed = self.registry.unsubscribe(session.id(), topic);
        Ok(RouteOutcome::Unsubscribed {
            topic: removed.then(|| topic.to_string()),
        })
    }

    async fn send(&self, session: &Session, frame: &Frame) -> Result<RouteOutcome> {
        let destination = required_destination(frame)?;
        match self.destinations.classify(destination) {
            Some((Namespace::Broadcast, _)) => {
                let delivered = self
                    .relay
                    .publish(destination, &frame.body, frame.content_type());
                Ok(RouteOutcome::Published {
                    topic: destination.to_string(),
                    delivered,
                })
            }
            Some((Namespace::Application, remainder)) => {
                self.dispatch(session, frame, destination, remainder).await
            }
            None => Err(BrokerError::UnroutableDestination(destination.to_string())),
        }
    }

    async fn dispatch(
        &self,
        session: &Session,
        frame: &Frame,
        destination: &str,
        remainder: &str,
    ) -> Result<RouteOutcome> {
        let resolved = self
            .handlers
            .resolve(remainder)
            .ok_or_else(|| BrokerError::NoHandlerRegistered(destination.to_string()))?;

        let ctx = HandlerContext {
            session_id: session.id().to_string(),
            destination: destination.to_string(),
            path_vars: resolved.path_vars,
            headers: frame.headers.clone(),
        };

        let reply = resolved
            .handler
            .handle(ctx, frame.body.clone())
            .await
            .map_err(|source| BrokerError::Handler {
                destination: destination.to_string(),
                source,
            })?;

        let Some(reply) = reply else {
            return Ok(RouteOutcome::Handled {
                route: resolved.pattern,
                published: None,
            });
        };

        let topic = resolved
            .send_to
            .unwrap_or_else(|| self.destinations.default_topic(remainder));
        if !self.destinations.is_topic(&topic) {
            return Err(BrokerError::UnroutableDestination(topic));
        }

        let delivered = self
            .relay
            .publish(&topic, &reply.body, reply.content_type.as_deref());
        Ok(RouteOutcome::Handled {
            route: resolved.pattern,
            published: Some((topic, delivered)),
        })
    }
}

fn required_destination(frame: &Frame) -> Result<&str> {
    frame.destination().ok_or_else(|| {
        BrokerError::MalformedFrame(format!("{} requires a destination header", frame.command))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, Reply};
    use crate::session::{CloseReason, SessionHandle, SessionManager};
    use crate::transport::mock::MockTransport;

    struct Fixture {
        sessions: Arc<SessionManager>,
        registry: Arc<SubscriptionRegistry>,
        router: DestinationRouter,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionManager::new(vec!["*".to_string()], 100));
        let registry = Arc::new(SubscriptionRegistry::new());
        sessions.add_listener(registry.clone());
        let relay = Arc::new(BroadcastRelay::new(registry.clone(), sessions.clone()));

        let handlers = HandlerRegistry::new()
            .route_fn("/chat", Some("/topic/messages"), |_ctx, body| async move {
                Ok(Some(Reply::new(body, None)))
            })
            .unwrap()
            .route_fn("/room/{id}", Some("/topic/room/{id}"), |ctx, _body| async move {
                Ok(Some(Reply::new(format!("room {}", ctx.var("id").unwrap_or("?")), None)))
            })
            .unwrap()
            .route_fn("/echo", None, |_ctx, body| async move {
                Ok(Some(Reply::new(body, None)))
            })
            .unwrap()
            .route_fn("/silent", None, |_ctx, _body| async move { Ok(None) })
            .unwrap()
            .route_fn("/fail", None, |_ctx, _body| async move {
                Err(HandlerError::BadRequest("nope".to_string()))
            })
            .unwrap()
            .route_fn("/escape", Some("/queue/elsewhere"), |_ctx, body| async move {
                Ok(Some(Reply::new(body, None)))
            })
            .unwrap();

        let router = DestinationRouter::new(
            Destinations::new("/topic", "/app"),
            registry.clone(),
            relay,
            Arc::new(handlers),
        );
        Fixture {
            sessions,
            registry,
            router,
        }
    }

    fn connect(f: &Fixture) -> (SessionHandle, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let session = f.sessions.accept(None, transport.clone()).unwrap();
        (session, transport)
    }

    fn subscribe_frame(id: &str, topic: &str) -> Frame {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", topic)
    }

    fn send_frame(destination: &str, body: &str) -> Frame {
        Frame::new(Command::Send)
            .header("destination", destination)
            .with_body(body)
    }

    #[tokio::test]
    async fn test_chat_scenario() {
        let f = fixture();
        let (a, ta) = connect(&f);
        let (b, tb) = connect(&f);

        f.router
            .route(&a, &subscribe_frame("sub-0", "/topic/messages"))
            .await
            .unwrap();
        let outcome = f
            .router
            .route(&b, &send_frame("/app/chat", "{\"text\":\"hi\"}"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            RouteOutcome::Handled {
                route: "/chat".to_string(),
                published: Some(("/topic/messages".to_string(), 1)),
            }
        );
        let received = ta.sent_frames("MESSAGE");
        assert_eq!(received.len(), 1);
        assert!(received[0].ends_with("{\"text\":\"hi\"}\0"));
        // the sender is not subscribed and gets nothing back
        assert!(tb.sent().is_empty());
    }

    #[tokio::test]
    async fn test_path_variables_select_topic() {
        let f = fixture();
        let (a, ta) = connect(&f);
        f.router
            .route(&a, &subscribe_frame("s", "/topic/room/42"))
            .await
            .unwrap();
        f.router.route(&a, &send_frame("/app/room/42", "")).await.unwrap();
        f.router.route(&a, &send_frame("/app/room/7", "")).await.unwrap();

        let received = ta.sent_frames("MESSAGE");
        assert_eq!(received.len(), 1);
        assert!(received[0].ends_with("room 42\0"));
    }

    #[tokio::test]
    async fn test_default_reply_topic() {
        let f = fixture();
        let (a, ta) = connect(&f);
        f.router.route(&a, &subscribe_frame("s", "/topic/echo")).await.unwrap();
        let outcome = f.router.route(&a, &send_frame("/app/echo", "x")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Handled {
                route: "/echo".to_string(),
                published: Some(("/topic/echo".to_string(), 1)),
            }
        );
        assert_eq!(ta.sent_frames("MESSAGE").len(), 1);

        let outcome = f.router.route(&a, &send_frame("/app/silent", "x")).await.unwrap();
        assert!(matches!(outcome, RouteOutcome::Handled { published: None, .. }));
    }

    #[tokio::test]
    async fn test_send_to_topic_publishes() {
        let f = fixture();
        let (a, ta) = connect(&f);
        f.router.route(&a, &subscribe_frame("s", "/topic/direct")).await.unwrap();
        let outcome = f.router.route(&a, &send_frame("/topic/direct", "hey")).await.unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Published {
                topic: "/topic/direct".to_string(),
                delivered: 1
            }
        );
        assert_eq!(ta.sent_frames("MESSAGE").len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_then_publish_delivers_nothing() {
        let f = fixture();
        let (a, ta) = connect(&f);
        f.router.route(&a, &subscribe_frame("sub-0", "/topic/t")).await.unwrap();

        let outcome = f
            .router
            .route(&a, &Frame::new(Command::Unsubscribe).header("id", "sub-0"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Unsubscribed {
                topic: Some("/topic/t".to_string())
            }
        );

        f.router.route(&a, &send_frame("/topic/t", "x")).await.unwrap();
        assert!(ta.sent().is_empty());
        assert_eq!(f.registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_destination() {
        let f = fixture();
        let (a, _) = connect(&f);
        f.router.route(&a, &subscribe_frame("1", "/topic/t")).await.unwrap();
        f.router.route(&a, &subscribe_frame("2", "/topic/t")).await.unwrap();
        f.router
            .route(&a, &Frame::new(Command::Unsubscribe).header("destination", "/topic/t"))
            .await
            .unwrap();
        assert!(!f.registry.is_subscribed(a.id(), "/topic/t"));
        assert!(a.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_errors() {
        let f = fixture();
        let (a, _) = connect(&f);

        let err = f.router.route(&a, &send_frame("/queue/x", "")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnroutableDestination(d) if d == "/queue/x"));

        let err = f.router.route(&a, &subscribe_frame("s", "/app/chat")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnroutableDestination(_)));

        let err = f.router.route(&a, &send_frame("/app/missing", "")).await.unwrap_err();
        assert!(matches!(err, BrokerError::NoHandlerRegistered(d) if d == "/app/missing"));

        let err = f.router.route(&a, &send_frame("/app/fail", "")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Handler { .. }));

        let err = f.router.route(&a, &send_frame("/app/escape", "")).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnroutableDestination(d) if d == "/queue/elsewhere"));

        let err = f
            .router
            .route(&a, &Frame::new(Command::Send).with_body("no destination"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MalformedFrame(_)));

        f.router.route(&a, &subscribe_frame("dup", "/topic/a")).await.unwrap();
        let err = f.router.route(&a, &subscribe_frame("dup", "/topic/b")).await.unwrap_err();
        assert!(matches!(err, BrokerError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_ignored_commands() {
        let f = fixture();
        let (a, _) = connect(&f);
        for command in [Command::Ack, Command::Nack, Command::Begin, Command::Commit, Command::Abort] {
            assert_eq!(
                f.router.route(&a, &Frame::new(command)).await.unwrap(),
                RouteOutcome::Ignored
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_clears_every_topic() {
        let f = fixture();
        let (a, _) = connect(&f);
        for topic in ["/topic/x", "/topic/y", "/topic/z"] {
            f.router.route(&a, &subscribe_frame(topic, topic)).await.unwrap();
        }
        f.sessions.close(a.id(), CloseReason::ClientGone);
        for topic in ["/topic/x", "/topic/y", "/topic/z"] {
            assert!(!f.registry.is_subscribed(a.id(), topic));
        }
        assert_eq!(f.registry.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_leaves_no_entry() {
        let f = fixture();
        let (a, _) = connect(&f);
        f.sessions.close(a.id(), CloseReason::ClientGone);
        let _ = f.router.route(&a, &subscribe_frame("late", "/topic/x")).await;
        assert!(!f.registry.is_subscribed(a.id(), "/topic/x"));
    }

    #[tokio::test]
    async fn test_frame_order_preserved() {
        let f = fixture();
        let (a, ta) = connect(&f);
        f.router.route(&a, &subscribe_frame("s", "/topic/messages")).await.unwrap();
        for body in ["f1", "f2", "f3"] {
            f.router.route(&a, &send_frame("/app/chat", body)).await.unwrap();
        }
        let bodies: Vec<String> = ta
            .sent_frames("MESSAGE")
            .iter()
            .map(|m| m.rsplit("\n\n").next().unwrap().trim_end_matches('\0').to_string())
            .collect();
        assert_eq!(bodies, vec!["f1", "f2", "f3"]);
    }
}
