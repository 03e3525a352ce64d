//! Broadcast relay: fan-out of one message to every subscriber of a topic

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parley_observability::RelayMetrics;
use tracing::{debug, warn};

use crate::frame::{escape_header, Command, Frame};
use crate::registry::SubscriptionRegistry;
use crate::session::{CloseReason, SessionManager};

const PREFIX: &[u8] = b"MESSAGE\n";

/// A MESSAGE frame encoded once, minus its `subscription` header
struct Prepared {
    tail: Vec<u8>,
}

impl Prepared {
    fn new(topic: &str, message_id: &str, body: &[u8], content_type: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Message)
            .header("destination", topic)
            .header("message-id", message_id);
        if let Some(content_type) = content_type {
            frame = frame.header("content-type", content_type);
        }
        let frame = frame
            .header("content-length", body.len().to_string())
            .with_body(body);

        let mut tail = frame.encode();
        tail.drain(..PREFIX.len());
        Self { tail }
    }

    fn for_subscription(&self, subscription_id: &str) -> Vec<u8> {
        let id = escape_header(subscription_id);
        let mut payload = Vec::with_capacity(self.tail.len() + id.len() + 32);
        payload.extend_from_slice(PREFIX);
        payload.extend_from_slice(b"subscription:");
        payload.extend_from_slice(id.as_bytes());
        payload.push(b'\n');
        payload.extend_from_slice(&self.tail);
        payload
    }
}

#[derive(Debug)]
pub struct BroadcastRelay {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionManager>,
    next_message_id: AtomicU64,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<SubscriptionRegistry>, sessions: Arc<SessionManager>) -> Self {
        Self {
            registry,
            sessions,
            next_message_id: AtomicU64::new(0),
        }
    }

    /// Deliver `body` to every current subscriber of `topic` and return how
    /// many transports accepted it.
    ///
    /// A subscriber whose transport refuses the message is closed; the rest
    /// still receive it. Publishes to one topic are serialised so all
    /// subscribers observe the same order.
    pub fn publish(&self, topic: &str, body: &[u8], content_type: Option<&str>) -> usize {
        let Some(sequencer) = self.registry.sequencer(topic) else {
            RelayMetrics::published(0, 0);
            debug!(topic, "Publish to topic without subscribers");
            return 0;
        };

        let mut failed = Vec::new();
        let delivered = {
            let _order = sequencer.lock();
            let subscribers = self.registry.subscribers_of(topic);
            let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed).to_string();
            let prepared = Prepared::new(topic, &message_id, body, content_type);

            let mut delivered = 0;
            for subscriber in &subscribers {
                let Some(session) = self.sessions.get(&subscriber.session_id) else {
                    continue;
                };
                match session.send(prepared.for_subscription(&subscriber.subscription_id)) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(
                            session_id = %subscriber.session_id,
                            topic,
                            "Delivery failed: {}", e
                        );
                        failed.push((subscriber.session_id.clone(), CloseReason::from(&e)));
                    }
                }
            }
            delivered
        };
        self.registry.release(topic, sequencer);

        for (session_id, reason) in &failed {
            self.sessions.close(session_id, *reason);
        }

        RelayMetrics::published(delivered, failed.len());
        debug!(topic, delivered, failed = failed.len(), "Published");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use crate::transport::mock::MockTransport;

    struct Fixture {
        sessions: Arc<SessionManager>,
        registry: Arc<SubscriptionRegistry>,
        relay: BroadcastRelay,
    }

    fn fixture() -> Fixture {
        let sessions = Arc::new(SessionManager::new(vec!["*".to_string()], 100));
        let registry = Arc::new(SubscriptionRegistry::new());
        sessions.add_listener(registry.clone());
        let relay = BroadcastRelay::new(registry.clone(), sessions.clone());
        Fixture {
            sessions,
            registry,
            relay,
        }
    }

    fn subscribed(f: &Fixture, topic: &str) -> (SessionHandle, Arc<MockTransport>) {
        let transport = MockTransport::new();
        let session = f.sessions.accept(None, transport.clone()).unwrap();
        session.add_subscription("sub-0", topic);
        f.registry.subscribe(session.id(), topic, "sub-0");
        (session, transport)
    }

    #[test]
    fn test_each_subscriber_gets_exactly_one_copy() {
        let f = fixture();
        let (_a, ta) = subscribed(&f, "/topic/messages");
        let (_b, tb) = subscribed(&f, "/topic/messages");
        let (_c, tc) = subscribed(&f, "/topic/other");

        let delivered = f
            .relay
            .publish("/topic/messages", b"{\"text\":\"hi\"}", Some("application/json"));
        assert_eq!(delivered, 2);
        assert_eq!(ta.sent().len(), 1);
        assert_eq!(tb.sent().len(), 1);
        assert!(tc.sent().is_empty());

        let message = &ta.sent()[0];
        assert!(message.starts_with("MESSAGE\nsubscription:sub-0\n"));
        assert!(message.contains("destination:/topic/messages\n"));
        assert!(message.contains("content-type:application/json\n"));
        assert!(message.contains("content-length:13\n"));
        assert!(message.ends_with("\n\n{\"text\":\"hi\"}\0"));
    }

    #[test]
    fn test_failed_subscriber_is_closed_and_others_delivered() {
        let f = fixture();
        let (_a, _) = subscribed(&f, "/topic/messages");
        let (_b, _) = subscribed(&f, "/topic/messages");
        let (gone, broken) = subscribed(&f, "/topic/messages");
        broken.break_connection();

        assert_eq!(f.relay.publish("/topic/messages", b"x", None), 2);
        assert!(f.sessions.get(gone.id()).is_none());
        assert!(!f.registry.is_subscribed(gone.id(), "/topic/messages"));
        assert_eq!(f.registry.subscribers_of("/topic/messages").len(), 2);

        // later publishes never reference the closed session
        assert_eq!(f.relay.publish("/topic/messages", b"y", None), 2);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let f = fixture();
        let (_a, ta) = subscribed(&f, "/topic/a");
        f.relay.publish("/topic/a", b"1", None);
        f.relay.publish("/topic/a", b"2", None);

        let ids: Vec<String> = ta
            .sent()
            .iter()
            .filter_map(|m| m.lines().find(|l| l.starts_with("message-id:")).map(str::to_string))
            .collect();
        assert_eq!(ids.len(), 2);
        assert_ne!(ids[0], ids[1]);
    }

    #[test]
    fn test_binary_body_is_delivered_unchanged() {
        let f = fixture();
        let (_a, ta) = subscribed(&f, "/topic/bin");
        assert_eq!(f.relay.publish("/topic/bin", &[0xff, 0xfe, 0x01], None), 1);

        let sent = ta.sent_bytes();
        let payload = &sent[0];
        assert!(payload.starts_with(b"MESSAGE\nsubscription:sub-0\n"));
        assert!(payload.ends_with(&[b'\n', b'\n', 0xff, 0xfe, 0x01, 0]));

        let frame = crate::frame::FrameDecoder::new(1024)
            .decode(payload)
            .remove(0)
            .unwrap();
        assert_eq!(frame.get("content-length"), Some("3"));
        assert_eq!(frame.body, vec![0xff, 0xfe, 0x01]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let f = fixture();
        assert_eq!(f.relay.publish("/topic/empty", b"x", None), 0);
    }

    #[test]
    fn test_publish_order_per_subscriber() {
        let f = Arc::new(fixture());
        let (_a, ta) = subscribed(&f, "/topic/seq");
        for i in 0..50 {
            f.relay.publish("/topic/seq", i.to_string().as_bytes(), None);
        }
        let bodies: Vec<String> = ta
            .sent()
            .iter()
            .map(|m| m.rsplit("\n\n").next().unwrap().trim_end_matches('\0').to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(bodies, expected);
    }
}
