//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message envelope codec and broker primitives."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{MessagingError, QosLevel, Result, TopicFilter};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Message delivered by the broker for one of the connection's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on.
    pub topic: String,
    /// Raw payload bytes.
    pub payload: Bytes,
}

/// Events pushed by the connection layer to the owning worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Session established (initially or after a reconnect).
    Connected,
    /// Session lost; the connection layer keeps trying to reconnect.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// Inbound message for an active subscription.
    Message(InboundMessage),
}

/// Publish/subscribe operations on a single broker connection.
///
/// A client is owned by exactly one worker; inbound traffic arrives on the
/// paired event channel of [`BrokerConnection`].
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish a payload (retain disabled).
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()>;
    /// Request a subscription for `filter`.
    async fn subscribe(&self, filter: &TopicFilter, qos: QosLevel) -> Result<()>;
    /// Close the session and release connection resources.
    async fn disconnect(&mut self) -> Result<()>;
    /// Client identifier presented to the broker.
    fn client_id(&self) -> &str;
}

/// A connected client together with its inbound event stream.
pub struct BrokerConnection {
    /// Exclusive publish/subscribe handle.
    pub client: Box<dyn BrokerClient>,
    /// Connection events in arrival order.
    pub events: mpsc::Receiver<ConnectionEvent>,
}

/// Factory for broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection using `client_id`.
    async fn connect(&self, client_id: &str) -> Result<BrokerConnection>;
    /// Human-readable connector name for logging.
    fn name(&self) -> &'static str;
}

/// Record of a message accepted by the [`InMemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Publishing client.
    pub client_id: String,
    /// Destination topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// Requested delivery level.
    pub qos: QosLevel,
}

impl PublishedMessage {
    /// Payload as UTF-8 text (lossy).
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

struct Subscription {
    session: u64,
    filter: TopicFilter,
    sender: mpsc::Sender<ConnectionEvent>,
}

#[derive(Default)]
struct BrokerState {
    next_session: u64,
    sessions: Vec<(u64, String, mpsc::Sender<ConnectionEvent>)>,
    subscriptions: Vec<Subscription>,
    rejected_topics: HashSet<String>,
    published: Vec<PublishedMessage>,
}

/// Process-local broker with MQTT topic matching, used by tests and
/// single-process runs.
///
/// Delivery into a connection's channel never blocks: when the channel is
/// full the message is dropped and logged.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    channel_capacity: usize,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl InMemoryBroker {
    /// Create a broker with the default per-connection channel capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker whose connections buffer `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            channel_capacity: capacity.max(1),
        }
    }

    /// Fail every subsequent publish to `topic`.
    pub fn reject_publishes_to(&self, topic: impl Into<String>) {
        self.state.lock().rejected_topics.insert(topic.into());
    }

    /// All messages accepted so far, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Messages accepted for `topic`, in publish order.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|message| message.topic == topic)
            .cloned()
            .collect()
    }

    /// Number of active subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.state.lock().subscriptions.len()
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Simulate a dropped-and-restored session for `client_id`: subscriptions
    /// are cleared (clean session) and the client sees `Disconnected` then
    /// `Connected`.
    pub fn bounce(&self, client_id: &str) {
        let mut state = self.state.lock();
        let sessions: Vec<(u64, mpsc::Sender<ConnectionEvent>)> = state
            .sessions
            .iter()
            .filter(|(_, id, _)| id == client_id)
            .map(|(session, _, sender)| (*session, sender.clone()))
            .collect();
        for (session, sender) in sessions {
            state.subscriptions.retain(|sub| sub.session != session);
            let _ = sender.try_send(ConnectionEvent::Disconnected {
                reason: "session interrupted".into(),
            });
            let _ = sender.try_send(ConnectionEvent::Connected);
        }
    }

    fn open_session(&self, client_id: &str) -> (u64, mpsc::Receiver<ConnectionEvent>) {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let mut state = self.state.lock();
        state.next_session += 1;
        let session = state.next_session;
        let _ = sender.try_send(ConnectionEvent::Connected);
        state.sessions.push((session, client_id.to_owned(), sender));
        (session, receiver)
    }

    fn close_session(&self, session: u64) {
        let mut state = self.state.lock();
        state.sessions.retain(|(id, _, _)| *id != session);
        state.subscriptions.retain(|sub| sub.session != session);
    }

    fn is_open(&self, session: u64) -> bool {
        self.state.lock().sessions.iter().any(|(id, _, _)| *id == session)
    }

    fn route(&self, client_id: &str, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()> {
        let mut state = self.state.lock();
        if state.rejected_topics.contains(topic) {
            return Err(MessagingError::PublishFailed {
                topic: topic.to_owned(),
                reason: "rejected by broker".into(),
            });
        }

        let payload_bytes = Bytes::from(payload.clone());
        for subscription in state
            .subscriptions
            .iter()
            .filter(|sub| sub.filter.matches(topic))
        {
            let event = ConnectionEvent::Message(InboundMessage {
                topic: topic.to_owned(),
                payload: payload_bytes.clone(),
            });
            if subscription.sender.try_send(event).is_err() {
                warn!(topic, filter = %subscription.filter, "subscriber channel unavailable, message dropped");
            }
        }

        state.published.push(PublishedMessage {
            client_id: client_id.to_owned(),
            topic: topic.to_owned(),
            payload,
            qos,
        });
        Ok(())
    }

    fn add_subscription(&self, session: u64, filter: &TopicFilter) -> Result<()> {
        let mut state = self.state.lock();
        let Some(sender) = state
            .sessions
            .iter()
            .find(|(id, _, _)| *id == session)
            .map(|(_, _, sender)| sender.clone())
        else {
            return Err(MessagingError::SubscribeFailed {
                filter: filter.to_string(),
                reason: "session closed".into(),
            });
        };
        state
            .subscriptions
            .retain(|sub| !(sub.session == session && &sub.filter == filter));
        state.subscriptions.push(Subscription {
            session,
            filter: filter.clone(),
            sender,
        });
        Ok(())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, client_id: &str) -> Result<BrokerConnection> {
        let (session, events) = self.open_session(client_id);
        debug!(client_id, session, "in-memory session opened");
        Ok(BrokerConnection {
            client: Box::new(InMemoryClient {
                broker: self.clone(),
                session,
                client_id: client_id.to_owned(),
            }),
            events,
        })
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

/// Client half of an [`InMemoryBroker`] session.
pub struct InMemoryClient {
    broker: InMemoryBroker,
    session: u64,
    client_id: String,
}

#[async_trait]
impl BrokerClient for InMemoryClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()> {
        if !self.broker.is_open(self.session) {
            return Err(MessagingError::ConnectionClosed(self.client_id.clone()));
        }
        self.broker.route(&self.client_id, topic, payload, qos)
    }

    async fn subscribe(&self, filter: &TopicFilter, _qos: QosLevel) -> Result<()> {
        self.broker.add_subscription(self.session, filter)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.broker.close_session(self.session);
        debug!(client_id = %self.client_id, session = self.session, "in-memory session closed");
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_matching_messages() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.connect("consumer").await.expect("connect consumer");
        let producer = broker.connect("producer").await.expect("connect producer");

        assert_eq!(
            consumer.events.recv().await,
            Some(ConnectionEvent::Connected)
        );
        let filter = TopicFilter::parse("sandbox/#").unwrap();
        consumer
            .client
            .subscribe(&filter, QosLevel::AtLeastOnce)
            .await
            .expect("subscribe");

        producer
            .client
            .publish("sandbox/abc", b"hello".to_vec(), QosLevel::AtLeastOnce)
            .await
            .expect("publish");
        producer
            .client
            .publish("elsewhere/abc", b"ignored".to_vec(), QosLevel::AtMostOnce)
            .await
            .expect("publish");

        match consumer.events.recv().await {
            Some(ConnectionEvent::Message(message)) => {
                assert_eq!(message.topic, "sandbox/abc");
                assert_eq!(&message.payload[..], b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(consumer.events.try_recv().is_err());
        assert_eq!(broker.published().len(), 2);
        assert_eq!(broker.published_to("sandbox/abc")[0].client_id, "producer");
    }

    #[tokio::test]
    async fn rejected_topics_fail_publish() {
        let broker = InMemoryBroker::new();
        let producer = broker.connect("producer").await.unwrap();
        broker.reject_publishes_to("sandbox/blocked");

        let err = producer
            .client
            .publish("sandbox/blocked", b"x".to_vec(), QosLevel::AtLeastOnce)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::PublishFailed { .. }));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn disconnect_closes_session() {
        let broker = InMemoryBroker::new();
        let mut connection = broker.connect("worker").await.unwrap();
        let filter = TopicFilter::parse("a/+").unwrap();
        connection
            .client
            .subscribe(&filter, QosLevel::AtMostOnce)
            .await
            .unwrap();
        assert_eq!(broker.subscription_count(), 1);

        connection.client.disconnect().await.unwrap();
        assert_eq!(broker.subscription_count(), 0);
        assert_eq!(broker.session_count(), 0);
        assert!(matches!(
            connection
                .client
                .publish("a/b", Vec::new(), QosLevel::AtMostOnce)
                .await,
            Err(MessagingError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn bounce_clears_subscriptions_and_reconnects() {
        let broker = InMemoryBroker::new();
        let mut connection = broker.connect("worker").await.unwrap();
        let _ = connection.events.recv().await;
        let filter = TopicFilter::parse("a/#").unwrap();
        connection
            .client
            .subscribe(&filter, QosLevel::AtLeastOnce)
            .await
            .unwrap();

        broker.bounce("worker");
        assert_eq!(broker.subscription_count(), 0);
        assert!(matches!(
            connection.events.recv().await,
            Some(ConnectionEvent::Disconnected { .. })
        ));
        assert_eq!(
            connection.events.recv().await,
            Some(ConnectionEvent::Connected)
        );
    }
}
