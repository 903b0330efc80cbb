//! Protocol frame codec: the `Envelope` wire format, its validation gate,
//! and the pluggable byte-level encodings used to serialize it.
//!
//! JSON remains the default encoding because it is the only one that can
//! faithfully carry an arbitrary structured-clone body across a real
//! `postMessage` boundary; postcard is kept as a lower-overhead alternative
//! for native-to-native loopback use.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::limits::{MIN_SUPPORTED_PROTOCOL_VERSION, PROTOCOL_VERSION};

/// The `type` discriminant of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Request,
    Ack,
    Async,
    Response,
    Error,
    Received,
    Ping,
    Pong,
    StreamStart,
    StreamData,
    StreamEnd,
    StreamError,
    StreamCancel,
    StreamPull,
    StreamAck,
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side produced an envelope, used to disambiguate streams/requests
/// when multiple endpoints share one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

/// An acknowledgment reference, used both for request-level `requireAck`
/// and per-frame stream data acks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckRef {
    pub id: String,
}

/// A structured error payload carried on `error`/`stream_error` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    pub code: String,
}

/// The atomic unit on the wire.
///
/// `body` stands in for an arbitrary structured-clone value: the closest
/// idiomatic Rust analogue is an untyped `serde_json::Value`, since the
/// underlying host transport (or its in-process stand-in) does not constrain
/// the payload shape beyond "structured-cloneable".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "__protocol__")]
    pub protocol: u32,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(rename = "creatorId", skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    #[serde(rename = "targetId", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(rename = "secretKey", skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "statusText", skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    #[serde(rename = "requireAck", skip_serializing_if = "Option::is_none")]
    pub require_ack: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckRef>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Envelope {
    /// Stamps version and timestamp defaults for a new envelope.
    pub fn new(kind: EnvelopeType, request_id: impl Into<String>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION,
            timestamp: now_millis(),
            kind,
            request_id: request_id.into(),
            role: None,
            creator_id: None,
            target_id: None,
            secret_key: None,
            path: None,
            body: None,
            headers: None,
            cookies: None,
            status: None,
            status_text: None,
            error: None,
            require_ack: None,
            ack: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_creator_id(mut self, id: impl Into<String>) -> Self {
        self.creator_id = Some(id.into());
        self
    }

    pub fn with_target_id(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn with_secret_key(mut self, key: impl Into<String>) -> Self {
        self.secret_key = Some(key.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_headers(mut self, headers: serde_json::Value) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_cookies(mut self, cookies: serde_json::Value) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn with_status(mut self, status: u16, status_text: impl Into<String>) -> Self {
        self.status = Some(status);
        self.status_text = Some(status_text.into());
        self
    }

    pub fn with_require_ack(mut self, require_ack: bool) -> Self {
        self.require_ack = Some(require_ack);
        self
    }

    pub fn with_ack(mut self, id: impl Into<String>) -> Self {
        self.ack = Some(AckRef { id: id.into() });
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, code: impl Into<String>) -> Self {
        self.error = Some(ErrorPayload {
            message: message.into(),
            code: code.into(),
        });
        self
    }

    /// Validates an already-deserialized envelope against the protocol gate.
    ///
    /// This is a belt-and-suspenders check: malformed JSON/postcard fails at
    /// decode time, but `__protocol__` floor and structural checks that
    /// `serde` alone cannot express are re-verified here so that no caller
    /// can construct an Envelope outside this gate and have it treated as
    /// valid.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.protocol < MIN_SUPPORTED_PROTOCOL_VERSION {
            return Err(ValidationError::ProtocolVersionTooLow {
                found: self.protocol,
                minimum: MIN_SUPPORTED_PROTOCOL_VERSION,
            });
        }
        if self.request_id.is_empty() {
            return Err(ValidationError::MissingRequestId);
        }
        Ok(())
    }
}

/// Byte-level wire encoding for an `Envelope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Encoding {
    Json = 1,
    Postcard = 2,
}

impl TryFrom<u16> for Encoding {
    type Error = UnknownEncoding;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Encoding::Json),
            2 => Ok(Encoding::Postcard),
            other => Err(UnknownEncoding(other)),
        }
    }
}

impl From<Encoding> for u16 {
    fn from(value: Encoding) -> Self {
        value as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownEncoding(pub u16);

impl fmt::Display for UnknownEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown encoding id {}", self.0)
    }
}

impl std::error::Error for UnknownEncoding {}

#[derive(Debug, Clone)]
pub enum EncodeError {
    Json(String),
    Postcard(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::Json(msg) => write!(f, "json encode error: {msg}"),
            EncodeError::Postcard(msg) => write!(f, "postcard encode error: {msg}"),
        }
    }
}

impl std::error::Error for EncodeError {}

#[derive(Debug, Clone)]
pub enum DecodeError {
    Json(String),
    Postcard(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json(msg) => write!(f, "json decode error: {msg}"),
            DecodeError::Postcard(msg) => write!(f, "postcard decode error: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encodes and decodes an `Envelope` to/from bytes for a given wire encoding.
pub fn encode_envelope(envelope: &Envelope, encoding: Encoding) -> Result<Vec<u8>, EncodeError> {
    match encoding {
        Encoding::Json => serde_json::to_vec(envelope).map_err(|e| EncodeError::Json(e.to_string())),
        Encoding::Postcard => {
            postcard::to_allocvec(envelope).map_err(|e| EncodeError::Postcard(e.to_string()))
        }
    }
}

pub fn decode_envelope(bytes: &[u8], encoding: Encoding) -> Result<Envelope, DecodeError> {
    match encoding {
        Encoding::Json => serde_json::from_slice(bytes).map_err(|e| DecodeError::Json(e.to_string())),
        Encoding::Postcard => {
            postcard::from_bytes(bytes).map_err(|e| DecodeError::Postcard(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_stamps_protocol_version() {
        let env = Envelope::new(EnvelopeType::Request, "r1").with_path("/echo");
        assert_eq!(env.protocol, PROTOCOL_VERSION);
        assert!(env.validate().is_ok());
    }

    #[test]
    fn validate_rejects_version_below_floor() {
        let mut env = Envelope::new(EnvelopeType::Request, "r1");
        env.protocol = 0;
        assert_eq!(
            env.validate(),
            Err(ValidationError::ProtocolVersionTooLow { found: 0, minimum: MIN_SUPPORTED_PROTOCOL_VERSION })
        );
    }

    #[test]
    fn validate_rejects_missing_request_id() {
        let mut env = Envelope::new(EnvelopeType::Ping, "x");
        env.request_id.clear();
        assert_eq!(env.validate(), Err(ValidationError::MissingRequestId));
    }

    #[test]
    fn json_round_trip() {
        let env = Envelope::new(EnvelopeType::Response, "r2")
            .with_body(serde_json::json!({"ok": true}))
            .with_require_ack(true);
        let bytes = encode_envelope(&env, Encoding::Json).unwrap();
        let decoded = decode_envelope(&bytes, Encoding::Json).unwrap();
        assert_eq!(decoded.request_id, "r2");
        assert_eq!(decoded.body, Some(serde_json::json!({"ok": true})));
        assert_eq!(decoded.require_ack, Some(true));
    }

    #[test]
    fn postcard_round_trip() {
        let env = Envelope::new(EnvelopeType::Ack, "r3").with_creator_id("server-1");
        let bytes = encode_envelope(&env, Encoding::Postcard).unwrap();
        let decoded = decode_envelope(&bytes, Encoding::Postcard).unwrap();
        assert_eq!(decoded.request_id, "r3");
        assert_eq!(decoded.creator_id.as_deref(), Some("server-1"));
    }

    #[test]
    fn encoding_round_trips_through_u16() {
        for encoding in [Encoding::Json, Encoding::Postcard] {
            let id: u16 = encoding.into();
            assert_eq!(Encoding::try_from(id).unwrap(), encoding);
        }
        assert!(Encoding::try_from(99).is_err());
    }
}
