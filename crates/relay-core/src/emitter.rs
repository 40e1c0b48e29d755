//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Relay engine and source emitter lifecycle."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! Periodic publishers: the multi-identity broadcaster and the single-topic
//! publisher share one worker loop per source.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use relay_common::{BroadcasterConfig, PublisherConfig};
use relay_metrics::EmitterMetrics;
use relay_msg::{
    source_topic, validate_topic_name, BrokerConnection, ConnectionEvent, Connector, QosLevel,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLIENT_ID_SUFFIX_LEN: usize = 8;

/// Identity of one broadcasting source; the last segment of its topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceIdentity(String);

impl SourceIdentity {
    /// Fresh random identity (hyphenated UUID v4).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters used to keep client ids unique but short.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(CLIENT_ID_SUFFIX_LEN) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `"<template> from <id> @ <timestamp>"`, or `"<template> @ <timestamp>"`
/// for anonymous sources. Timestamps are RFC 3339 with a `+00:00` offset.
pub fn compose_message(
    template: &str,
    identity: Option<&SourceIdentity>,
    at: DateTime<Utc>,
) -> String {
    let timestamp = at.to_rfc3339();
    match identity {
        Some(identity) => format!("{template} from {identity} @ {timestamp}"),
        None => format!("{template} @ {timestamp}"),
    }
}

/// One publishing connection: where it publishes and as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmitterSource {
    pub identity: Option<SourceIdentity>,
    pub topic: String,
    pub client_id: String,
}

impl EmitterSource {
    /// Source `index` (zero based) of a broadcaster publishing under `prefix`.
    pub fn broadcasting(
        prefix: &str,
        client_id_prefix: &str,
        index: usize,
        identity: SourceIdentity,
    ) -> Self {
        Self {
            topic: source_topic(prefix, identity.as_str()),
            client_id: format!("{}-{}-{}", client_id_prefix, index + 1, identity.short()),
            identity: Some(identity),
        }
    }

    /// Anonymous source publishing to a fixed topic.
    pub fn fixed(topic: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            identity: None,
            topic: topic.into(),
            client_id: client_id.into(),
        }
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> &str {
        match &self.identity {
            Some(identity) => identity.as_str(),
            None => &self.client_id,
        }
    }
}

#[derive(Debug)]
struct EmitterSettings {
    template: String,
    interval: Duration,
    qos: QosLevel,
}

/// Set of sources publishing the same template on a shared interval.
pub struct SourceEmitter {
    settings: Arc<EmitterSettings>,
    sources: Vec<EmitterSource>,
    metrics: Option<EmitterMetrics>,
}

impl SourceEmitter {
    pub fn new(
        template: impl Into<String>,
        interval: Duration,
        qos: QosLevel,
        sources: Vec<EmitterSource>,
    ) -> Result<Self> {
        ensure!(!interval.is_zero(), "publish interval must be positive");
        ensure!(!sources.is_empty(), "at least one source is required");
        for source in &sources {
            validate_topic_name(&source.topic)
                .with_context(|| format!("invalid publish topic for {}", source.client_id))?;
        }
        Ok(Self {
            settings: Arc::new(EmitterSettings {
                template: template.into(),
                interval,
                qos,
            }),
            sources,
            metrics: None,
        })
    }

    /// `clients` random identities, each on `<prefix>/<id>`.
    pub fn broadcaster(config: &BroadcasterConfig, qos: QosLevel) -> Result<Self> {
        let sources = (0..config.clients)
            .map(|index| {
                EmitterSource::broadcasting(
                    &config.topic_prefix,
                    &config.client_id_prefix,
                    index,
                    SourceIdentity::random(),
                )
            })
            .collect();
        Self::new(config.message.clone(), config.interval, qos, sources)
    }

    /// A single anonymous source on the configured topic.
    pub fn publisher(config: &PublisherConfig, qos: QosLevel) -> Result<Self> {
        let source = EmitterSource::fixed(config.topic.clone(), config.client_id.clone());
        Self::new(config.message.clone(), config.interval, qos, vec![source])
    }

    pub fn with_metrics(mut self, metrics: EmitterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sources(&self) -> &[EmitterSource] {
        &self.sources
    }

    /// Connect every source, then start one publish loop per source.
    ///
    /// Connections already opened are closed again if a later one fails.
    pub async fn start(self, connector: &dyn Connector) -> Result<EmitterHandle> {
        let mut connections = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match connector.connect(&source.client_id).await {
                Ok(connection) => connections.push(connection),
                Err(err) => {
                    for mut opened in connections {
                        let _ = opened.client.disconnect().await;
                    }
                    return Err(err)
                        .with_context(|| format!("failed to connect source {}", source.client_id));
                }
            }
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(self.sources.len());
        for (source, connection) in self.sources.iter().cloned().zip(connections) {
            info!(
                source = %source.label(),
                topic = %source.topic,
                client_id = %source.client_id,
                transport = connector.name(),
                "source publishing"
            );
            let label = source.label().to_owned();
            let task = tokio::spawn(run_source(
                source,
                connection,
                self.settings.clone(),
                self.metrics.clone(),
                shutdown_rx.resubscribe(),
            ));
            tasks.push((label, task));
        }

        Ok(EmitterHandle {
            shutdown: shutdown_tx,
            sources: self.sources,
            tasks,
        })
    }
}

async fn run_source(
    source: EmitterSource,
    mut connection: BrokerConnection,
    settings: Arc<EmitterSettings>,
    metrics: Option<EmitterMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Some(metrics) = &metrics {
        metrics.source_started();
    }
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!(source = %source.label(), "source shutdown signal received");
                break;
            }
            event = connection.events.recv(), if events_open => match event {
                Some(ConnectionEvent::Connected) => {
                    info!(source = %source.label(), client_id = %source.client_id, "connected");
                }
                Some(ConnectionEvent::Disconnected { reason }) => {
                    warn!(source = %source.label(), reason = %reason, "connection lost");
                }
                Some(ConnectionEvent::Message(message)) => {
                    debug!(source = %source.label(), topic = %message.topic, "ignoring inbound message");
                }
                None => {
                    warn!(source = %source.label(), "connection event stream closed");
                    events_open = false;
                }
            },
            _ = ticker.tick() => {
                let payload = compose_message(&settings.template, source.identity.as_ref(), Utc::now());
                match connection
                    .client
                    .publish(&source.topic, payload.clone().into_bytes(), settings.qos)
                    .await
                {
                    Ok(()) => {
                        info!(topic = %source.topic, payload = %payload, "published");
                        if let Some(metrics) = &metrics {
                            metrics.record_published(source.label());
                        }
                    }
                    Err(err) => {
                        warn!(source = %source.label(), topic = %source.topic, error = %err, "failed to publish message");
                        if let Some(metrics) = &metrics {
                            metrics.record_failure(source.label());
                        }
                    }
                }
            }
        }
    }

    if let Err(err) = connection.client.disconnect().await {
        error!(source = %source.label(), error = %err, "failed to close source connection");
    }
    if let Some(metrics) = &metrics {
        metrics.source_stopped();
    }
    info!(source = %source.label(), "source stopped");
}

/// Handle to running publish loops.
#[derive(Debug)]
pub struct EmitterHandle {
    shutdown: broadcast::Sender<()>,
    sources: Vec<EmitterSource>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl EmitterHandle {
    pub fn sources(&self) -> &[EmitterSource] {
        &self.sources
    }

    /// Stop every loop and wait until each connection is closed.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for (label, task) in self.tasks {
            if let Err(err) = task.await {
                error!(source = %label, error = %err, "source task join error");
            }
        }
        info!("emitter shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use relay_metrics::new_registry;
    use relay_msg::InMemoryBroker;

    fn broadcaster_config(clients: usize) -> BroadcasterConfig {
        BroadcasterConfig {
            clients,
            interval: Duration::from_millis(50),
            message: "Hello".into(),
            ..BroadcasterConfig::default()
        }
    }

    #[test]
    fn compose_message_formats_identity_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let identity = SourceIdentity::new("abc123");
        assert_eq!(
            compose_message("Hello", Some(&identity), at),
            "Hello from abc123 @ 2024-01-01T00:00:00+00:00"
        );
        assert_eq!(
            compose_message("Hello from publisher", None, at),
            "Hello from publisher @ 2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn broadcasting_sources_derive_topic_and_client_id() {
        let identity = SourceIdentity::new("0f9a8b7c-1234-4d5e-8f00-112233445566");
        let source = EmitterSource::broadcasting("sandbox", "broadcaster", 1, identity);
        assert_eq!(source.topic, "sandbox/0f9a8b7c-1234-4d5e-8f00-112233445566");
        assert_eq!(source.client_id, "broadcaster-2-0f9a8b7c");
        assert_eq!(SourceIdentity::new("abc").short(), "abc");
    }

    #[test]
    fn broadcaster_creates_distinct_identities() {
        let emitter =
            SourceEmitter::broadcaster(&broadcaster_config(3), QosLevel::AtLeastOnce).unwrap();
        let topics: std::collections::HashSet<&str> =
            emitter.sources().iter().map(|s| s.topic.as_str()).collect();
        assert_eq!(topics.len(), 3);
        assert!(emitter
            .sources()
            .iter()
            .all(|s| s.topic.starts_with("sandbox/") && s.identity.is_some()));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(SourceEmitter::broadcaster(&broadcaster_config(0), QosLevel::AtMostOnce).is_err());
        let wildcard = vec![EmitterSource::fixed("sandbox/#", "publisher")];
        assert!(
            SourceEmitter::new("x", Duration::from_secs(1), QosLevel::AtMostOnce, wildcard)
                .is_err()
        );
        let source = vec![EmitterSource::fixed("sandbox/events", "publisher")];
        assert!(SourceEmitter::new("x", Duration::ZERO, QosLevel::AtMostOnce, source).is_err());
    }

    #[tokio::test]
    async fn each_identity_publishes_on_its_own_topic() {
        let broker = InMemoryBroker::new();
        let emitter =
            SourceEmitter::broadcaster(&broadcaster_config(3), QosLevel::AtLeastOnce).unwrap();
        let handle = emitter.start(&broker).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for source in handle.sources() {
            let published = broker.published_to(&source.topic);
            assert!(!published.is_empty(), "{} published nothing", source.topic);
            let identity = source.identity.as_ref().unwrap();
            assert!(published[0]
                .payload_text()
                .starts_with(&format!("Hello from {identity} @ ")));
            assert_eq!(published[0].client_id, source.client_id);
        }

        handle.shutdown().await.unwrap();
        assert_eq!(broker.session_count(), 0);
    }

    #[tokio::test]
    async fn failing_source_does_not_stop_the_others() {
        let broker = InMemoryBroker::new();
        let registry = new_registry();
        let metrics = EmitterMetrics::new(&registry).unwrap();
        let emitter = SourceEmitter::broadcaster(&broadcaster_config(3), QosLevel::AtLeastOnce)
            .unwrap()
            .with_metrics(metrics.clone());
        let failing = emitter.sources()[1].clone();
        broker.reject_publishes_to(failing.topic.clone());

        let handle = emitter.start(&broker).await.unwrap();
        let sources = handle.sources().to_vec();
        tokio::time::sleep(Duration::from_millis(130)).await;
        handle.shutdown().await.unwrap();

        for source in &sources {
            let published = broker.published_to(&source.topic).len();
            if source == &failing {
                assert_eq!(published, 0);
                assert!(metrics.failures(source.label()) >= 2);
            } else {
                assert!(published >= 2, "{} stopped publishing", source.topic);
                assert_eq!(metrics.failures(source.label()), 0);
            }
        }
        assert_eq!(metrics.active_sources(), 0);
    }

    #[tokio::test]
    async fn publisher_uses_fixed_topic_without_identity() {
        let broker = InMemoryBroker::new();
        let config = PublisherConfig {
            interval: Duration::from_secs(60),
            ..PublisherConfig::default()
        };
        let emitter = SourceEmitter::publisher(&config, QosLevel::AtMostOnce).unwrap();
        let handle = emitter.start(&broker).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await.unwrap();

        let published = broker.published_to("sandbox/events");
        assert_eq!(published.len(), 1);
        assert!(published[0]
            .payload_text()
            .starts_with("Hello from publisher @ "));
        assert_eq!(published[0].client_id, "publisher-service");
        assert_eq!(published[0].qos, QosLevel::AtMostOnce);
    }
}
