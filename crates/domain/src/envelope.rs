//! Envelope, the unit exchanged over the bus, and its JSON wire codec.
//!
//! Every backend carries JSON text. The MQTT backend ships the whole wire
//! envelope as the payload; the AMQP backend ships only `content` as the body
//! and maps `subject` / `reply-to` onto message properties.
//!
//! Wire shape:
//!
//! ```json
//! {"content": {"command": "on"}, "subject": "event.x", "reply-to": "...", "type": "request"}
//! ```
//!
//! `type` is absent for plain one-way messages. Peers that predate `type`
//! send requests with a bare `reply-to`; those decode as requests too.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Ordered key/value payload of an envelope.
pub type Content = serde_json::Map<String, serde_json::Value>;

/// What the receiver is expected to do with an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MessageKind {
    /// One-way message, no reply expected.
    #[default]
    Message,
    /// Request expecting exactly one reply at `reply_to`.
    Request,
    /// Reply to the request identified by `reply_to`.
    Reply,
}

/// Structured message with routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub content: Content,
    pub subject: Option<String>,
    reply_to: Option<String>,
    kind: MessageKind,
}

impl Envelope {
    /// One-way message.
    #[must_use]
    pub fn message(subject: Option<String>, content: Content) -> Self {
        Self {
            content,
            subject,
            reply_to: None,
            kind: MessageKind::Message,
        }
    }

    /// Request whose reply must be delivered to `reply_to`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyReplyAddress`] if `reply_to` is empty.
    pub fn request(
        subject: Option<String>,
        content: Content,
        reply_to: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let reply_to = non_empty(reply_to.into())?;
        Ok(Self {
            content,
            subject,
            reply_to: Some(reply_to),
            kind: MessageKind::Request,
        })
    }

    /// Reply answering the request identified by `reply_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyReplyAddress`] if `reply_id` is empty.
    pub fn reply(reply_id: impl Into<String>, content: Content) -> Result<Self, ValidationError> {
        let reply_id = non_empty(reply_id.into())?;
        Ok(Self {
            content,
            subject: None,
            reply_to: Some(reply_id),
            kind: MessageKind::Reply,
        })
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Reply address of a request, or the answered request id of a reply.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    #[must_use]
    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    /// The `command` verb carried in the content, if any.
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.content.get("command").and_then(serde_json::Value::as_str)
    }
}

fn non_empty(value: String) -> Result<String, ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::EmptyReplyAddress);
    }
    Ok(value)
}

/// Errors raised while encoding or decoding wire envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload is not valid JSON or does not have the envelope shape.
    #[error("malformed JSON payload")]
    Json(#[from] serde_json::Error),

    /// A request or reply arrived without its reply address.
    #[error("{kind} envelope without reply address")]
    MissingReplyAddress {
        /// Either `"request"` or `"reply"`.
        kind: &'static str,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum WireKind {
    Request,
    Reply,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject: Option<String>,
    #[serde(rename = "reply-to", default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<WireKind>,
}

/// Serialize an envelope into its JSON wire form.
///
/// # Errors
///
/// Returns [`CodecError::Json`] if serialization fails.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let kind = match envelope.kind {
        MessageKind::Message => None,
        MessageKind::Request => Some(WireKind::Request),
        MessageKind::Reply => Some(WireKind::Reply),
    };
    let wire = WireEnvelope {
        content: envelope.content.clone(),
        subject: envelope.subject.clone(),
        reply_to: envelope.reply_to.clone(),
        kind,
    };
    Ok(serde_json::to_vec(&wire)?)
}

/// Parse an envelope from its JSON wire form.
///
/// # Errors
///
/// Returns [`CodecError::Json`] on malformed JSON and
/// [`CodecError::MissingReplyAddress`] for a request/reply without address.
pub fn decode(payload: &[u8]) -> Result<Envelope, CodecError> {
    let wire: WireEnvelope = serde_json::from_slice(payload)?;
    let reply_to = wire.reply_to.filter(|addr| !addr.is_empty());
    let kind = match (wire.kind, &reply_to) {
        (Some(WireKind::Request), None) => {
            return Err(CodecError::MissingReplyAddress { kind: "request" });
        }
        (Some(WireKind::Reply), None) => {
            return Err(CodecError::MissingReplyAddress { kind: "reply" });
        }
        (Some(WireKind::Reply), Some(_)) => MessageKind::Reply,
        (Some(WireKind::Request), Some(_)) | (None, Some(_)) => MessageKind::Request,
        (None, None) => MessageKind::Message,
    };
    Ok(Envelope {
        content: wire.content,
        subject: wire.subject,
        reply_to,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn content(value: serde_json::Value) -> Content {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn should_roundtrip_nested_content() {
        let envelope = Envelope::request(
            Some("event.device.announce".to_string()),
            content(json!({
                "internalid": "d1",
                "levels": [1, -2, 3.5, true, null, "x"],
                "nested": {"big": u64::MAX, "small": i64::MIN, "flag": false},
            })),
            "homebus/abc/replies/1",
        )
        .unwrap();

        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.content["nested"]["big"].as_u64(), Some(u64::MAX));
        assert_eq!(decoded.content["nested"]["small"].as_i64(), Some(i64::MIN));
    }

    #[test]
    fn should_roundtrip_every_kind() {
        let nested = content(json!({
            "devices": {"d1": {"levels": [[0, 1], [], [-1, {"deep": [u64::MAX]}]]}},
            "empty_map": {},
            "text": "caf\u{e9} \"quoted\"",
        }));
        let envelopes = [
            Envelope::message(None, Content::new()),
            Envelope::message(Some("event.device.stale".to_string()), nested.clone()),
            Envelope::request(None, Content::new(), "r/2").unwrap(),
            Envelope::request(Some("x".to_string()), nested.clone(), "amq.gen-1").unwrap(),
            Envelope::reply("r/2", Content::new()).unwrap(),
            Envelope::reply("r/3", content(json!({"result": {"identifier": "success"}}))).unwrap(),
        ];

        for envelope in envelopes {
            let decoded = decode(&encode(&envelope).unwrap()).unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(decoded.kind(), envelope.kind());
        }
    }

    #[test]
    fn should_preserve_content_key_order() {
        let envelope = Envelope::message(None, content(json!({"z": 1, "a": 2, "m": 3})));
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        let keys: Vec<&str> = decoded.content.keys().map(String::as_str).collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn should_omit_type_for_plain_messages() {
        let envelope = Envelope::message(Some("event.x".to_string()), Content::new());
        let text = String::from_utf8(encode(&envelope).unwrap()).unwrap();
        assert_eq!(text, r#"{"content":{},"subject":"event.x"}"#);
    }

    #[test]
    fn should_decode_legacy_request_without_type() {
        let envelope = decode(br#"{"content":{"command":"on"},"reply-to":"r/1"}"#).unwrap();
        assert_eq!(envelope.kind(), MessageKind::Request);
        assert_eq!(envelope.reply_to(), Some("r/1"));
        assert_eq!(envelope.command(), Some("on"));
    }

    #[test]
    fn should_reject_request_without_reply_address() {
        let result = decode(br#"{"content":{},"type":"request"}"#);
        assert!(matches!(
            result,
            Err(CodecError::MissingReplyAddress { kind: "request" })
        ));
    }

    #[test]
    fn should_reject_malformed_json() {
        assert!(matches!(decode(b"{{bad"), Err(CodecError::Json(_))));
    }

    #[test]
    fn should_reject_empty_reply_address_on_construction() {
        let result = Envelope::reply("", Content::new());
        assert_eq!(result.unwrap_err(), ValidationError::EmptyReplyAddress);
    }
}
