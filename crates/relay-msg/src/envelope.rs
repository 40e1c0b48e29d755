//! ---
//! relay_section: "02-messaging-ipc-data-model"
//! relay_subsection: "module"
//! relay_type: "source"
//! relay_scope: "code"
//! relay_description: "Message envelope codec and broker primitives."
//! relay_version: "v0.0.0-prealpha"
//! relay_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::topic::SEPARATOR;
use crate::Result;

/// Identity reported when a topic carries no usable trailing segment.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Envelope republished by the relay on the forward topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Identity derived from the inbound topic.
    pub source_id: String,
    /// Message body, transformed when the transform call succeeded.
    pub msg: String,
}

impl Envelope {
    /// Construct an envelope from its parts.
    pub fn new(source_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            msg: msg.into(),
        }
    }

    /// Serialize to the compact JSON wire form.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Serialize `{source_id, msg}` as a compact JSON object.
pub fn encode_envelope(source_id: &str, msg: &str) -> Result<String> {
    Envelope::new(source_id, msg).encode()
}

/// Decode raw broker bytes as UTF-8, replacing invalid sequences.
pub fn decode_payload(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.to_owned(),
        Err(err) => {
            warn!(error = %err, len = raw.len(), "payload is not valid UTF-8, decoding lossily");
            String::from_utf8_lossy(raw).into_owned()
        }
    }
}

/// Extract the message body from an inbound payload.
///
/// A JSON object carrying `msg` yields that field (strings verbatim, any
/// other JSON value in compact form). Everything else, including JSON that
/// is not an object, is returned untouched. Never fails.
pub fn decode_body(raw_text: &str) -> String {
    match serde_json::from_str::<JsonValue>(raw_text) {
        Ok(JsonValue::Object(mut fields)) => match fields.remove("msg") {
            Some(JsonValue::String(msg)) => msg,
            Some(other) => other.to_string(),
            None => raw_text.to_owned(),
        },
        Ok(_) => raw_text.to_owned(),
        Err(err) => {
            warn!(error = %err, "payload not JSON, using raw text");
            raw_text.to_owned()
        }
    }
}

/// Return the trailing segment of `topic` once `prefix_depth` leading
/// segments are skipped, or [`UNKNOWN_SOURCE`] when nothing usable remains.
pub fn extract_source_id(topic: &str, prefix_depth: usize) -> String {
    topic
        .split(SEPARATOR)
        .skip(prefix_depth)
        .last()
        .filter(|segment| !segment.is_empty())
        .unwrap_or(UNKNOWN_SOURCE)
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_body_returns_embedded_msg() {
        let raw = r#"{"source_id":"spoofed","msg":"hello"}"#;
        assert_eq!(decode_body(raw), "hello");
    }

    #[test]
    fn decode_body_passes_raw_text_through() {
        let raw = "Hello from abc123 @ 2024-01-01T00:00:00+00:00";
        assert_eq!(decode_body(raw), raw);
        assert_eq!(decode_body(""), "");
        assert_eq!(decode_body("{not json"), "{not json");
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn raw_text_fallback_is_logged_as_warning() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let body = tracing::subscriber::with_default(subscriber, || decode_body("plain text"));
        assert_eq!(body, "plain text");

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("WARN"), "unexpected log output: {output}");
        assert!(output.contains("payload not JSON"));
    }

    #[test]
    fn decode_body_ignores_objects_without_msg_and_non_objects() {
        assert_eq!(decode_body(r#"{"payload":"x"}"#), r#"{"payload":"x"}"#);
        assert_eq!(decode_body("[1,2,3]"), "[1,2,3]");
        assert_eq!(decode_body("\"quoted\""), "\"quoted\"");
        assert_eq!(decode_body("42"), "42");
    }

    #[test]
    fn decode_body_renders_non_string_msg() {
        assert_eq!(decode_body(r#"{"msg":17}"#), "17");
        assert_eq!(decode_body(r#"{"msg":{"a":true}}"#), r#"{"a":true}"#);
        assert_eq!(decode_body(r#"{"msg":null}"#), "null");
    }

    #[test]
    fn encoded_envelope_decodes_back_to_msg() {
        let encoded = encode_envelope("abc123", "hello").expect("encode");
        assert_eq!(decode_body(&encoded), "hello");

        let parsed: Envelope = serde_json::from_str(&encoded).expect("parse envelope");
        assert_eq!(parsed, Envelope::new("abc123", "hello"));
    }

    #[test]
    fn extract_source_id_uses_last_segment() {
        assert_eq!(extract_source_id("sandbox/abc123", 0), "abc123");
        assert_eq!(extract_source_id("sandbox/abc123", 1), "abc123");
        assert_eq!(extract_source_id("a/b/c", 1), "c");
        assert_eq!(extract_source_id("events", 0), "events");
    }

    #[test]
    fn extract_source_id_falls_back_to_unknown() {
        assert_eq!(extract_source_id("", 0), UNKNOWN_SOURCE);
        assert_eq!(extract_source_id("sandbox/", 0), UNKNOWN_SOURCE);
        assert_eq!(extract_source_id("sandbox", 1), UNKNOWN_SOURCE);
    }

    #[test]
    fn decode_payload_is_lossy_on_invalid_utf8() {
        assert_eq!(decode_payload(b"plain"), "plain");
        assert_eq!(decode_payload(&[b'o', b'k', 0xff]), "ok\u{fffd}");
    }
}
