//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Relay engine and source emitter lifecycle."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! Subscribe to the source topics, transform each message body and
//! republish it as an envelope on the forward topic.
//!
//! One worker owns the broker connection and handles messages strictly in
//! arrival order; the next message waits until the current one is published.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_common::AppConfig;
use relay_metrics::RelayMetrics;
use relay_msg::{
    decode_body, decode_payload, encode_envelope, extract_source_id, validate_topic_name,
    BrokerClient, BrokerConnection, ConnectionEvent, Connector, InboundMessage, QosLevel,
    TopicFilter,
};
use relay_transform::PayloadTransform;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::configured_qos;

/// Connection lifecycle of a relay worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Disconnected,
    /// Session requested or being re-established; no active subscription.
    Connecting,
    Subscribed,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Envelope published to the forward topic.
    Forwarded { source_id: String },
    /// Message arrived on the forward topic and was ignored.
    Skipped,
    /// Publish failed; the message is dropped.
    Dropped { source_id: String },
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub filter: TopicFilter,
    pub forward_topic: String,
    pub client_id: String,
    pub qos: QosLevel,
    pub transform_timeout: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let raw_filter = config.relay.effective_filter();
        let filter = TopicFilter::parse(&raw_filter)
            .with_context(|| format!("invalid relay topic filter {raw_filter}"))?;
        validate_topic_name(&config.relay.forward_topic).context("invalid forward topic")?;
        Ok(Self {
            filter,
            forward_topic: config.relay.forward_topic.clone(),
            client_id: config.relay.client_id.clone(),
            qos: configured_qos(&config.broker)?,
            transform_timeout: config.transform.timeout,
        })
    }
}

/// Stateless per-message pipeline plus the settings of one relay instance.
pub struct RelayEngine {
    settings: RelaySettings,
    transform: Arc<dyn PayloadTransform>,
    metrics: Option<RelayMetrics>,
    prefix_depth: usize,
    skip_forward_topic: bool,
}

impl RelayEngine {
    pub fn new(settings: RelaySettings, transform: Arc<dyn PayloadTransform>) -> Self {
        let prefix_depth = settings.filter.literal_prefix_depth();
        let skip_forward_topic = settings.filter.matches(&settings.forward_topic);
        if skip_forward_topic {
            info!(
                filter = %settings.filter,
                forward_topic = %settings.forward_topic,
                "forward topic matches subscription, relayed envelopes will be skipped"
            );
        }
        Self {
            settings,
            transform,
            metrics: None,
            prefix_depth,
            skip_forward_topic,
        }
    }

    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Relay one message: derive the source, transform the body and publish
    /// the envelope. Failures are logged and reported in the outcome.
    pub async fn handle_message(
        &self,
        client: &dyn BrokerClient,
        message: &InboundMessage,
    ) -> HandleOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.record_received();
        }
        if self.skip_forward_topic && message.topic == self.settings.forward_topic {
            debug!(topic = %message.topic, "skipping relayed envelope");
            if let Some(metrics) = &self.metrics {
                metrics.record_skipped();
            }
            return HandleOutcome::Skipped;
        }

        let source_id = extract_source_id(&message.topic, self.prefix_depth);
        let body = decode_body(&decode_payload(&message.payload));
        debug!(topic = %message.topic, source_id = %source_id, "message received");

        let transformed = self
            .transform
            .transform(&body, self.settings.transform_timeout)
            .await;

        let outcome = match encode_envelope(&source_id, &transformed) {
            Ok(envelope) => client
                .publish(
                    &self.settings.forward_topic,
                    envelope.into_bytes(),
                    self.settings.qos,
                )
                .await
                .map_err(anyhow::Error::from),
            Err(err) => Err(anyhow::Error::from(err).context("failed to encode envelope")),
        };

        match outcome {
            Ok(()) => {
                info!(
                    source_id = %source_id,
                    forward_topic = %self.settings.forward_topic,
                    "forwarded transformed payload"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_forwarded();
                }
                HandleOutcome::Forwarded { source_id }
            }
            Err(err) => {
                warn!(
                    source_id = %source_id,
                    forward_topic = %self.settings.forward_topic,
                    error = %err,
                    "failed to forward payload"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_publish_failure();
                }
                HandleOutcome::Dropped { source_id }
            }
        }
    }

    /// Open the broker session and start the relay worker.
    pub async fn start(self, connector: &dyn Connector) -> Result<RelayHandle> {
        let (state_tx, state_rx) = watch::channel(RelayState::Connecting);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        info!(
            client_id = %self.settings.client_id,
            filter = %self.settings.filter,
            forward_topic = %self.settings.forward_topic,
            transport = connector.name(),
            "relay starting"
        );
        let connection = connector
            .connect(&self.settings.client_id)
            .await
            .with_context(|| format!("failed to connect relay {}", self.settings.client_id))?;

        let task = tokio::spawn(run_relay(self, connection, state_tx, shutdown_rx));
        Ok(RelayHandle {
            shutdown: shutdown_tx,
            state: state_rx,
            task,
        })
    }

    fn set_state(&self, state: &watch::Sender<RelayState>, next: RelayState) {
        let _ = state.send(next);
        if let Some(metrics) = &self.metrics {
            metrics.set_subscribed(next == RelayState::Subscribed);
        }
    }
}

async fn run_relay(
    engine: RelayEngine,
    mut connection: BrokerConnection,
    state: watch::Sender<RelayState>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!("relay shutdown signal received");
                break;
            }
            event = connection.events.recv() => match event {
                Some(ConnectionEvent::Connected) => {
                    let filter = &engine.settings.filter;
                    match connection.client.subscribe(filter, engine.settings.qos).await {
                        Ok(()) => {
                            info!(filter = %filter, qos = %engine.settings.qos, "subscribed");
                            engine.set_state(&state, RelayState::Subscribed);
                        }
                        Err(err) => {
                            error!(filter = %filter, error = %err, "subscription failed");
                            engine.set_state(&state, RelayState::Connecting);
                        }
                    }
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!(reason = %reason, "relay connection lost, waiting for reconnect");
                    engine.set_state(&state, RelayState::Connecting);
                }
                Some(ConnectionEvent::Message(message)) => {
                    engine.handle_message(connection.client.as_ref(), &message).await;
                }
                None => {
                    warn!("relay event stream closed");
                    break;
                }
            }
        }
    }

    let closed = connection.client.disconnect().await;
    engine.set_state(&state, RelayState::Disconnected);
    closed.context("failed to close relay connection")?;
    info!("relay stopped");
    Ok(())
}

/// Handle to a running relay worker.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: broadcast::Sender<()>,
    state: watch::Receiver<RelayState>,
    task: JoinHandle<Result<()>>,
}

impl RelayHandle {
    pub fn state(&self) -> RelayState {
        *self.state.borrow()
    }

    /// Wait until the worker reaches `target` or the timeout elapses.
    pub async fn wait_for(&mut self, target: RelayState, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.state.wait_for(|state| *state == target))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    /// Stop accepting messages, finish the one in flight and disconnect.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(result) => result,
            Err(join) => Err(anyhow::Error::new(join)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_metrics::new_registry;
    use relay_msg::{Envelope, InMemoryBroker};
    use relay_transform::Passthrough;

    fn inbound(topic: &str, payload: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_owned(),
            payload: payload.as_bytes().to_vec().into(),
        }
    }

    struct Prefix(&'static str);

    #[async_trait]
    impl PayloadTransform for Prefix {
        async fn transform(&self, payload: &str, _timeout: Duration) -> String {
            format!("{}{}", self.0, payload)
        }
    }

    fn settings(filter: &str) -> RelaySettings {
        RelaySettings {
            filter: TopicFilter::parse(filter).unwrap(),
            forward_topic: "sandbox/processed".into(),
            client_id: "consumer-test".into(),
            qos: QosLevel::AtLeastOnce,
            transform_timeout: Duration::from_millis(200),
        }
    }

    fn forwarded(broker: &InMemoryBroker) -> Vec<Envelope> {
        broker
            .published_to("sandbox/processed")
            .iter()
            .map(|message| serde_json::from_slice(&message.payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn handle_message_wraps_transformed_body() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("consumer-test").await.unwrap();
        let engine = RelayEngine::new(settings("sandbox/#"), Arc::new(Prefix("T:")));

        let outcome = engine
            .handle_message(
                connection.client.as_ref(),
                &inbound("sandbox/abc123", r#"{"source_id":"spoofed","msg":"hello"}"#),
            )
            .await;

        assert_eq!(
            outcome,
            HandleOutcome::Forwarded {
                source_id: "abc123".into()
            }
        );
        assert_eq!(forwarded(&broker), vec![Envelope::new("abc123", "T:hello")]);
    }

    #[tokio::test]
    async fn forward_topic_is_skipped_when_subscribed() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("consumer-test").await.unwrap();
        let metrics = RelayMetrics::new(new_registry()).unwrap();
        let engine =
            RelayEngine::new(settings("sandbox/#"), Arc::new(Passthrough)).with_metrics(metrics.clone());

        let outcome = engine
            .handle_message(
                connection.client.as_ref(),
                &inbound("sandbox/processed", r#"{"source_id":"x","msg":"y"}"#),
            )
            .await;

        assert_eq!(outcome, HandleOutcome::Skipped);
        assert!(broker.published().is_empty());
        assert_eq!(metrics.skipped(), 1);
        assert_eq!(metrics.received(), 1);
    }

    #[tokio::test]
    async fn forward_topic_outside_filter_is_relayed() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("consumer-test").await.unwrap();
        let mut relay_settings = settings("sandbox/+");
        relay_settings.forward_topic = "processed/all".into();
        let engine = RelayEngine::new(relay_settings, Arc::new(Passthrough));

        let outcome = engine
            .handle_message(connection.client.as_ref(), &inbound("sandbox/a", "raw"))
            .await;
        assert_eq!(outcome, HandleOutcome::Forwarded { source_id: "a".into() });
        assert_eq!(broker.published_to("processed/all").len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_dropped_and_counted() {
        let broker = InMemoryBroker::new();
        broker.reject_publishes_to("sandbox/processed");
        let connection = broker.connect("consumer-test").await.unwrap();
        let metrics = RelayMetrics::new(new_registry()).unwrap();
        let engine =
            RelayEngine::new(settings("sandbox/#"), Arc::new(Passthrough)).with_metrics(metrics.clone());

        let outcome = engine
            .handle_message(connection.client.as_ref(), &inbound("sandbox/abc", "hi"))
            .await;
        assert_eq!(outcome, HandleOutcome::Dropped { source_id: "abc".into() });
        assert_eq!(metrics.publish_failures(), 1);
        assert_eq!(metrics.forwarded(), 0);
    }

    #[tokio::test]
    async fn worker_subscribes_relays_and_resubscribes() {
        let broker = InMemoryBroker::new();
        let engine = RelayEngine::new(settings("sandbox/#"), Arc::new(Prefix("P:")));
        let mut handle = engine.start(&broker).await.unwrap();
        assert!(handle.wait_for(RelayState::Subscribed, Duration::from_secs(1)).await);
        assert_eq!(broker.subscription_count(), 1);

        let producer = broker.connect("producer").await.unwrap();
        for body in ["one", "two", "three"] {
            producer
                .client
                .publish("sandbox/src", body.as_bytes().to_vec(), QosLevel::AtLeastOnce)
                .await
                .unwrap();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while forwarded(&broker).len() < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let msgs: Vec<String> = forwarded(&broker).into_iter().map(|env| env.msg).collect();
        assert_eq!(msgs, vec!["P:one", "P:two", "P:three"]);

        broker.bounce("consumer-test");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while broker.subscription_count() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.subscription_count(), 1);
        assert!(handle.wait_for(RelayState::Subscribed, Duration::from_secs(1)).await);

        handle.shutdown().await.unwrap();
        assert_eq!(broker.session_count(), 1);
    }
}
