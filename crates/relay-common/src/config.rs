//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Shared primitives and utilities for the relay services."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::formats::Flexible;
use serde_with::{serde_as, DurationSecondsWithFrac};
use tracing::debug;

use crate::logging::LogFormat;

fn default_broker_host() -> String {
    "broker".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_topic_prefix() -> String {
    "sandbox".to_owned()
}

fn default_forward_topic() -> String {
    "sandbox/processed".to_owned()
}

fn default_consumer_client_id() -> String {
    "consumer-service".to_owned()
}

fn default_channel_capacity() -> usize {
    64
}

fn default_transform_url() -> String {
    "http://transformer:8000/transform".to_owned()
}

fn default_transform_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_publish_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_broadcast_message() -> String {
    "Hello from broadcaster".to_owned()
}

fn default_broadcast_clients() -> usize {
    3
}

fn default_client_id_prefix() -> String {
    "broadcaster".to_owned()
}

fn default_publisher_topic() -> String {
    "sandbox/events".to_owned()
}

fn default_publisher_message() -> String {
    "Hello from publisher".to_owned()
}

fn default_publisher_client_id() -> String {
    "publisher-service".to_owned()
}

fn default_transformer_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9898))
}

/// Primary configuration object shared by every relay service.
///
/// Built once at process entry and handed to components by value; nothing
/// reads ambient environment state after [`AppConfig::load_with_source`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub transform: TransformConfig,
    #[serde(default)]
    pub broadcaster: BroadcasterConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when only defaults and environment overrides were applied.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "RELAY_CONFIG";

    /// Load configuration: defaults, then the TOML file (explicit path or
    /// `RELAY_CONFIG`), then the deployment environment variables.
    pub fn load_with_source(explicit: Option<&Path>) -> Result<LoadedAppConfig> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var(Self::ENV_CONFIG_PATH)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
        };

        let mut config = match &path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(LoadedAppConfig {
            config,
            source: path,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply overrides using the environment variable names of the original
    /// deployment. `lookup` returns the raw value for a variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = get("MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = get("MQTT_PORT") {
            self.broker.port = parse_var("MQTT_PORT", &port)?;
        }
        if let Some(qos) = get("MQTT_QOS") {
            self.broker.qos = parse_var("MQTT_QOS", &qos)?;
        }

        if let Some(prefix) = get("BROADCAST_TOPIC_PREFIX") {
            self.relay.topic_prefix = prefix.clone();
            self.broadcaster.topic_prefix = prefix;
        }
        if let Some(filter) = get("BROADCAST_TOPIC_FILTER") {
            self.relay.topic_filter = Some(filter);
        }
        if let Some(forward) = get("FORWARD_TOPIC") {
            self.relay.forward_topic = forward;
        }
        if let Some(client_id) = get("MQTT_CLIENT_ID") {
            self.relay.client_id = client_id.clone();
            self.publisher.client_id = client_id;
        }

        if let Some(url) = get("TRANSFORMER_URL") {
            self.transform.url = url;
        }
        if let Some(timeout) = get("TRANSFORMER_TIMEOUT") {
            self.transform.timeout = parse_seconds("TRANSFORMER_TIMEOUT", &timeout)?;
        }
        if let Some(listen) = get("TRANSFORMER_BIND") {
            self.transformer.listen = parse_var("TRANSFORMER_BIND", &listen)?;
        }

        if let Some(message) = get("PUBLISH_MESSAGE") {
            self.broadcaster.message = message.clone();
            self.publisher.message = message;
        }
        let broadcast_interval = ["BROADCAST_INTERVAL", "PUBLISH_INTERVAL", "PUBLISH_INTERVAL_SECONDS"]
            .into_iter()
            .find_map(|key| get(key).map(|value| (key, value)));
        if let Some((key, value)) = broadcast_interval {
            self.broadcaster.interval = parse_seconds(key, &value)?;
        }
        if let Some(interval) = get("PUBLISH_INTERVAL_SECONDS") {
            self.publisher.interval = parse_seconds("PUBLISH_INTERVAL_SECONDS", &interval)?;
        }
        if let Some(clients) = get("BROADCAST_CLIENTS") {
            self.broadcaster.clients = parse_var("BROADCAST_CLIENTS", &clients)?;
        }
        if let Some(prefix) = get("MQTT_CLIENT_PREFIX") {
            self.broadcaster.client_id_prefix = prefix;
        }
        if let Some(topic) = get("MQTT_TOPIC") {
            self.publisher.topic = topic;
        }
        Ok(())
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.relay.validate()?;
        self.transform.validate()?;
        self.broadcaster.validate()?;
        self.publisher.validate()?;
        Ok(())
    }
}

impl FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|err| anyhow!("invalid {key} value '{raw}': {err}"))
}

fn parse_seconds(key: &str, raw: &str) -> Result<Duration> {
    let secs: f64 = parse_var(key, raw)?;
    Duration::try_from_secs_f64(secs).map_err(|err| anyhow!("invalid {key} value '{raw}': {err}"))
}

fn ensure_publish_topic(label: &str, topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(anyhow!("{label} cannot be empty"));
    }
    if topic.contains(['+', '#']) {
        return Err(anyhow!("{label} '{topic}' must not contain wildcards"));
    }
    Ok(())
}

fn ensure_positive(label: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(anyhow!("{label} must be greater than zero"));
    }
    Ok(())
}

/// Broker connection settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    /// Delivery-assurance level: 0, 1 or 2.
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub keep_alive: Duration,
    /// Pause between reconnection attempts made by the connection driver.
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub reconnect_delay: Duration,
    /// Capacity of the event channel between each connection and its worker.
    /// Applies to every role's connections.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            qos: default_qos(),
            keep_alive: default_keep_alive(),
            reconnect_delay: default_reconnect_delay(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("broker host cannot be empty"));
        }
        if self.qos > 2 {
            return Err(anyhow!("broker qos must be 0, 1 or 2 (got {})", self.qos));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("broker channel_capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Relay (consumer) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// Subscription filter; defaults to `<topic_prefix>/#`.
    #[serde(default)]
    pub topic_filter: Option<String>,
    #[serde(default = "default_forward_topic")]
    pub forward_topic: String,
    #[serde(default = "default_consumer_client_id")]
    pub client_id: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            topic_filter: None,
            forward_topic: default_forward_topic(),
            client_id: default_consumer_client_id(),
        }
    }
}

impl RelayConfig {
    /// Subscription filter after applying the prefix default.
    pub fn effective_filter(&self) -> String {
        match &self.topic_filter {
            Some(filter) => filter.clone(),
            None => format!("{}/#", self.topic_prefix),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.effective_filter().trim().is_empty() {
            return Err(anyhow!("relay topic filter cannot be empty"));
        }
        ensure_publish_topic("relay forward_topic", &self.forward_topic)?;
        Ok(())
    }
}

/// Settings for the relay's outbound transform call.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default = "default_transform_url")]
    pub url: String,
    #[serde(default = "default_transform_timeout")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub timeout: Duration,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            url: default_transform_url(),
            timeout: default_transform_timeout(),
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(anyhow!("transform url cannot be empty"));
        }
        ensure_positive("transform timeout", self.timeout)
    }
}

/// Multi-source emitter settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcasterConfig {
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    #[serde(default = "default_broadcast_message")]
    pub message: String,
    #[serde(default = "default_publish_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub interval: Duration,
    #[serde(default = "default_broadcast_clients")]
    pub clients: usize,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            topic_prefix: default_topic_prefix(),
            message: default_broadcast_message(),
            interval: default_publish_interval(),
            clients: default_broadcast_clients(),
            client_id_prefix: default_client_id_prefix(),
        }
    }
}

impl BroadcasterConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_publish_topic("broadcaster topic_prefix", &self.topic_prefix)?;
        ensure_positive("broadcaster interval", self.interval)?;
        if self.clients == 0 {
            return Err(anyhow!("broadcaster clients must be at least 1"));
        }
        Ok(())
    }
}

/// Single fixed-topic emitter settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_publisher_topic")]
    pub topic: String,
    #[serde(default = "default_publisher_message")]
    pub message: String,
    #[serde(default = "default_publish_interval")]
    #[serde_as(as = "DurationSecondsWithFrac<f64, Flexible>")]
    pub interval: Duration,
    #[serde(default = "default_publisher_client_id")]
    pub client_id: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: default_publisher_topic(),
            message: default_publisher_message(),
            interval: default_publish_interval(),
            client_id: default_publisher_client_id(),
        }
    }
}

impl PublisherConfig {
    pub fn validate(&self) -> Result<()> {
        ensure_publish_topic("publisher topic", &self.topic)?;
        ensure_positive("publisher interval", self.interval)
    }
}

/// Transformer HTTP service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_transformer_listen")]
    pub listen: SocketAddr,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            listen: default_transformer_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Directory for the daily rolling log file; stdout only when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            directory: None,
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
