//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Transport implementations for messaging layers."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! MQTT transport for the relay broker client.
//!
//! Each connection owns an `rumqttc` event loop driven by a dedicated task.
//! The driver converts broker traffic into [`ConnectionEvent`]s on a bounded
//! channel and keeps polling after errors, which is how `rumqttc` reconnects.
//! Resubscribing after a reconnect is left to the consumer of the
//! `Connected` event.
//!
//! Requests are queued with the non-blocking `try_*` calls. The request queue
//! is only drained while a session is up, so a full queue is reported as a
//! failed publish or subscribe instead of parking the caller until the broker
//! returns.

use std::time::Duration;

use async_trait::async_trait;
use relay_msg::{
    BrokerClient, BrokerConnection, ConnectionEvent, Connector, InboundMessage, MessagingError,
    QosLevel, Result, TopicFilter,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the request queue between [`AsyncClient`] and its event loop.
const REQUEST_CAPACITY: usize = 32;
/// Upper bound for flushing the DISCONNECT packet before the driver is stopped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Connection settings shared by every client created by a [`MqttConnector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    /// Pause between reconnection attempts after a connection error.
    pub reconnect_delay: Duration,
    /// Capacity of the event channel handed to the owning worker.
    pub channel_capacity: usize,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            keep_alive: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            channel_capacity: 64,
        }
    }

    fn options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        options.set_clean_session(true);
        options
    }
}

/// Map a relay QoS level onto the MQTT client's enum.
pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// [`Connector`] that opens MQTT 3.1.1 sessions.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, client_id: &str) -> Result<BrokerConnection> {
        let (client, eventloop) =
            AsyncClient::new(self.settings.options(client_id), REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(self.settings.channel_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            client_id,
            host = %self.settings.host,
            port = self.settings.port,
            "connecting to broker"
        );
        let driver = tokio::spawn(drive(
            eventloop,
            events_tx,
            shutdown_rx,
            client_id.to_owned(),
            self.settings.reconnect_delay,
        ));

        Ok(BrokerConnection {
            client: Box::new(MqttClient {
                client,
                client_id: client_id.to_owned(),
                shutdown: shutdown_tx,
                driver: Some(driver),
            }),
            events: events_rx,
        })
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

/// Publish/subscribe handle of one MQTT session.
pub struct MqttClient {
    client: AsyncClient,
    client_id: String,
    shutdown: watch::Sender<bool>,
    driver: Option<JoinHandle<()>>,
}

#[async_trait]
impl BrokerClient for MqttClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QosLevel) -> Result<()> {
        if self.driver.is_none() {
            return Err(MessagingError::ConnectionClosed(self.client_id.clone()));
        }
        self.client
            .try_publish(topic, to_mqtt_qos(qos), false, payload)
            .map_err(|err| MessagingError::PublishFailed {
                topic: topic.to_owned(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(&self, filter: &TopicFilter, qos: QosLevel) -> Result<()> {
        self.client
            .try_subscribe(filter.as_str(), to_mqtt_qos(qos))
            .map_err(|err| MessagingError::SubscribeFailed {
                filter: filter.to_string(),
                reason: err.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<()> {
        let Some(mut driver) = self.driver.take() else {
            return Ok(());
        };
        let flushed = match self.client.try_disconnect() {
            // The driver exits once DISCONNECT is flushed.
            Ok(()) => tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .map(|joined| joined.is_ok())
                .unwrap_or(false),
            Err(err) => {
                debug!(client_id = %self.client_id, error = %err, "disconnect request not queued");
                false
            }
        };
        if !flushed && !driver.is_finished() {
            let _ = self.shutdown.send(true);
            driver
                .await
                .map_err(|err| MessagingError::Connection(err.to_string()))?;
        }
        info!(client_id = %self.client_id, "broker connection closed");
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::Sender<ConnectionEvent>,
    mut shutdown: watch::Receiver<bool>,
    client_id: String,
    reconnect_delay: Duration,
) {
    let mut connected = false;
    loop {
        let polled = tokio::select! {
            _ = shutdown.changed() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    info!(client_id = %client_id, "connected to broker");
                    Some(ConnectionEvent::Connected)
                } else {
                    warn!(client_id = %client_id, code = ?ack.code, "connection refused by broker");
                    None
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                Some(ConnectionEvent::Message(InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                }))
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!(client_id = %client_id, pkid = ack.pkid, "broker rejected subscription");
                }
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client_id = %client_id, "disconnect flushed");
                break;
            }
            Ok(_) => None,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "broker connection error");
                let lost = if connected {
                    connected = false;
                    Some(ConnectionEvent::Disconnected {
                        reason: err.to_string(),
                    })
                } else {
                    None
                };
                if let Some(event) = lost {
                    if !forward(&events, event, &mut shutdown).await {
                        break;
                    }
                }
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                None
            }
        };

        if let Some(event) = event {
            if !forward(&events, event, &mut shutdown).await {
                break;
            }
        }
    }
    debug!(client_id = %client_id, "connection driver stopped");
}

/// Deliver an event to the worker; false when the driver should stop.
async fn forward(
    events: &mpsc::Sender<ConnectionEvent>,
    event: ConnectionEvent,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_levels_map_onto_mqtt() {
        assert_eq!(to_mqtt_qos(QosLevel::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(to_mqtt_qos(QosLevel::AtLeastOnce), QoS::AtLeastOnce);
        assert_eq!(to_mqtt_qos(QosLevel::ExactlyOnce), QoS::ExactlyOnce);
    }

    #[test]
    fn options_use_clean_sessions() {
        let settings = MqttSettings::new("localhost", 1883);
        let options = settings.options("relay-test");
        assert_eq!(options.client_id(), "relay-test");
        assert!(options.clean_session());
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[tokio::test]
    async fn disconnect_returns_when_broker_is_unreachable() {
        let mut settings = MqttSettings::new("127.0.0.1", 1);
        settings.reconnect_delay = Duration::from_millis(20);
        let connector = MqttConnector::new(settings);

        let mut connection = connector.connect("relay-test").await.expect("connect");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let closed = tokio::time::timeout(Duration::from_secs(5), connection.client.disconnect())
            .await
            .expect("disconnect completes");
        assert!(closed.is_ok());
        assert!(matches!(
            connection
                .client
                .publish("a/b", Vec::new(), QosLevel::AtMostOnce)
                .await,
            Err(MessagingError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn full_request_queue_fails_publishes_without_blocking() {
        let mut settings = MqttSettings::new("127.0.0.1", 1);
        settings.reconnect_delay = Duration::from_millis(20);
        let connector = MqttConnector::new(settings);
        let mut connection = connector.connect("relay-offline").await.expect("connect");

        let mut rejected = 0;
        for index in 0..(REQUEST_CAPACITY * 2) {
            let outcome = tokio::time::timeout(
                Duration::from_millis(500),
                connection.client.publish(
                    "sandbox/offline",
                    format!("message {index}").into_bytes(),
                    QosLevel::AtLeastOnce,
                ),
            )
            .await
            .expect("publish never waits for the broker");
            if let Err(err) = outcome {
                assert!(matches!(err, MessagingError::PublishFailed { .. }));
                rejected += 1;
            }
        }
        assert!(rejected >= REQUEST_CAPACITY, "rejected only {rejected} publishes");

        let subscribed = connection
            .client
            .subscribe(&TopicFilter::parse("sandbox/#").expect("filter"), QosLevel::AtLeastOnce)
            .await;
        assert!(matches!(subscribed, Err(MessagingError::SubscribeFailed { .. })));

        let closed = tokio::time::timeout(Duration::from_secs(5), connection.client.disconnect())
            .await
            .expect("disconnect completes with a full request queue");
        assert!(closed.is_ok());
    }
}
