//! ---
//! relay_section: "01-core-functionality"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Relay engine and source emitter lifecycle."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
//! Relay engine and periodic source emitters.

pub mod emitter;
pub mod relay;

use anyhow::{Context, Result};
use relay_common::BrokerConfig;
use relay_msg::QosLevel;

pub use emitter::{compose_message, EmitterHandle, EmitterSource, SourceEmitter, SourceIdentity};
pub use relay::{HandleOutcome, RelayEngine, RelayHandle, RelaySettings, RelayState};

/// Delivery level configured for every publish and subscription.
pub fn configured_qos(broker: &BrokerConfig) -> Result<QosLevel> {
    QosLevel::try_from(broker.qos).context("invalid broker qos")
}
