//! The server's view of an inbound request (§4.9).

use std::collections::HashMap;

use winrpc_core::{Envelope, StreamReader};

use crate::file::FileValue;
use crate::router::Params;

/// Constructed by the response path for every inbound `request` envelope
/// that reaches the middleware/route dispatch stage.
pub struct ServerRequest {
    pub request_id: String,
    pub path: String,
    pub params: Params,
    pub body: Option<serde_json::Value>,
    pub headers: Option<serde_json::Value>,
    pub cookies: HashMap<String, String>,
    pub origin: Option<String>,
    /// Present when the request body arrived as a stream (`stream_start`
    /// preceding or accompanying the logical request) and was not
    /// auto-resolved into a `file`.
    pub stream: Option<StreamReader>,
    /// Present when the stream body was auto-resolved into a file/blob
    /// before the handler ran.
    pub file: Option<FileValue>,
    pub target_id: Option<String>,
    pub creator_id: Option<String>,
}

impl ServerRequest {
    pub(crate) fn from_envelope(envelope: &Envelope, origin: Option<String>) -> Self {
        Self {
            request_id: envelope.request_id.clone(),
            path: envelope.path.clone().unwrap_or_default(),
            params: Params::new(),
            body: envelope.body.clone(),
            headers: envelope.headers.clone(),
            cookies: cookies_from_value(envelope.cookies.as_ref()),
            origin,
            stream: None,
            file: None,
            target_id: envelope.target_id.clone(),
            creator_id: envelope.creator_id.clone(),
        }
    }
}

fn cookies_from_value(value: Option<&serde_json::Value>) -> HashMap<String, String> {
    let Some(serde_json::Value::Object(map)) = value else {
        return HashMap::new();
    };
    map.iter()
        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use winrpc_core::EnvelopeType;

    #[test]
    fn builds_from_envelope_fields() {
        let envelope = Envelope::new(EnvelopeType::Request, "r1")
            .with_path("/api/users/42")
            .with_body(serde_json::json!({"x": 1}))
            .with_cookies(serde_json::json!({"session": "abc"}));
        let req = ServerRequest::from_envelope(&envelope, Some("https://example.com".to_string()));
        assert_eq!(req.path, "/api/users/42");
        assert_eq!(req.body, Some(serde_json::json!({"x": 1})));
        assert_eq!(req.cookies.get("session"), Some(&"abc".to_string()));
        assert_eq!(req.origin.as_deref(), Some("https://example.com"));
    }
}
