//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message envelope codec and broker primitives."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::MessagingError;

/// Delivery guarantees negotiated with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// Fire and forget; no acknowledgement.
    AtMostOnce,
    /// Acknowledged delivery; duplicates possible.
    #[default]
    AtLeastOnce,
    /// Four-step handshake between each hop.
    ExactlyOnce,
}

impl QosLevel {
    /// Numeric level as carried on the wire.
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = MessagingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(MessagingError::InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(value: QosLevel) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}
