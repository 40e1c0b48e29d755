//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message envelope codec and broker primitives."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Messaging primitives shared by the relay, the emitters, and the MQTT
//! transport: the `{source_id, msg}` envelope, topic filters with MQTT
//! wildcard semantics, delivery-assurance levels, and the broker client seam.

pub mod envelope;
pub mod qos;
pub mod topic;
pub mod transport;

/// Shared result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;

/// Errors raised by topic parsing and broker clients.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Topic filter failed validation.
    #[error("invalid topic filter '{filter}': {reason}")]
    InvalidFilter {
        /// Filter as supplied.
        filter: String,
        /// Rule that was violated.
        reason: &'static str,
    },
    /// Topic name used for publishing failed validation.
    #[error("invalid topic name '{topic}': {reason}")]
    InvalidTopic {
        /// Topic as supplied.
        topic: String,
        /// Rule that was violated.
        reason: &'static str,
    },
    /// Delivery-assurance level outside 0..=2.
    #[error("invalid qos level {0}; expected 0, 1 or 2")]
    InvalidQos(u8),
    /// The broker refused or failed the publish.
    #[error("publish to '{topic}' failed: {reason}")]
    PublishFailed {
        /// Destination topic.
        topic: String,
        /// Failure detail from the broker client.
        reason: String,
    },
    /// The broker refused or failed the subscription.
    #[error("subscribe to '{filter}' failed: {reason}")]
    SubscribeFailed {
        /// Requested filter.
        filter: String,
        /// Failure detail from the broker client.
        reason: String,
    },
    /// The connection was already closed.
    #[error("connection '{0}' is closed")]
    ConnectionClosed(String),
    /// Connection could not be established or torn down cleanly.
    #[error("connection error: {0}")]
    Connection(String),
    /// Wrapper for JSON serialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub use envelope::{
    decode_body, decode_payload, encode_envelope, extract_source_id, Envelope, UNKNOWN_SOURCE,
};
pub use qos::QosLevel;
pub use topic::{source_topic, validate_topic_name, TopicFilter};
pub use transport::{
    BrokerClient, BrokerConnection, ConnectionEvent, Connector, InMemoryBroker, InboundMessage,
    PublishedMessage,
};
