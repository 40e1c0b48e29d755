//! ---
//! relay_section: "05-networking-external-interfaces"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Transform client and transformer HTTP service."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! The transformation stage of the relay pipeline.
//!
//! [`client`] calls a remote `/transform` endpoint with a bounded timeout and
//! degrades to the original payload on any failure. [`server`] is the
//! reference transformer that prefixes payloads with `PROCESSED: `.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

pub use client::{Passthrough, PayloadTransform, TransformClient, TransformError};
pub use server::{TransformerHandle, TransformerServer, PROCESSED_PREFIX};

/// Body exchanged in both directions of a transform call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformBody {
    /// Text (or arbitrary JSON) being transformed.
    pub payload: serde_json::Value,
}

/// Render a JSON value as transform text: strings verbatim, anything else compact.
pub fn payload_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_text_keeps_strings_verbatim() {
        assert_eq!(payload_text(&json!("hello")), "hello");
        assert_eq!(payload_text(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(payload_text(&json!(42)), "42");
    }
}
