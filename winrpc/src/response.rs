//! The server's handle for producing a reply (§4.9 ServerResponse methods).
//!
//! At-most-once: after the first successful `send`/`json`/`sendFile`/
//! `sendStream`, the `sent` flag latches and further calls are no-ops that
//! return `false`, mirroring the "already sent" guard the middleware chain
//! also consults.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use winrpc_core::{
    Dispatcher, Envelope, EnvelopeType, Heartbeat, PendingOps, Role, StreamKind, StreamMode,
    StreamRegistry, StreamWriter, WriterOptions,
};

use crate::cookie::{format_set_cookie_header, CookieAttrs};
use crate::file::FileValue;

const ACK_BUCKET: &str = "response-acks";

struct Inner {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<StreamRegistry>,
    heartbeat: Option<Arc<Heartbeat>>,
    request_id: String,
    target_id: Option<String>,
    creator_id: String,
    sent: AtomicBool,
    status: parking_lot::Mutex<(u16, String)>,
    headers: parking_lot::Mutex<HashMap<String, serde_json::Value>>,
    set_cookies: parking_lot::Mutex<Vec<String>>,
    ack_waiters: Arc<PendingOps<oneshot::Sender<bool>>>,
}

#[derive(Clone)]
pub struct ServerResponse {
    inner: Arc<Inner>,
}

impl ServerResponse {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<StreamRegistry>,
        heartbeat: Option<Arc<Heartbeat>>,
        request_id: impl Into<String>,
        target_id: Option<String>,
        creator_id: impl Into<String>,
        ack_waiters: Arc<PendingOps<oneshot::Sender<bool>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                registry,
                heartbeat,
                request_id: request_id.into(),
                target_id,
                creator_id: creator_id.into(),
                sent: AtomicBool::new(false),
                status: parking_lot::Mutex::new((200, "OK".to_string())),
                headers: parking_lot::Mutex::new(HashMap::new()),
                set_cookies: parking_lot::Mutex::new(Vec::new()),
                ack_waiters,
            }),
        }
    }

    pub fn already_sent(&self) -> bool {
        self.inner.sent.load(Ordering::SeqCst)
    }

    /// Chainable status setter.
    pub fn status(self, code: u16, text: impl Into<String>) -> Self {
        *self.inner.status.lock() = (code, text.into());
        self
    }

    /// Multi-value headers (beyond `Set-Cookie`) join with `, `; repeated
    /// calls for the same name append.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let mut headers = self.inner.headers.lock();
        match headers.get_mut(&name) {
            Some(serde_json::Value::String(existing)) => {
                *existing = format!("{existing}, {value}");
            }
            _ => {
                headers.insert(name, serde_json::Value::String(value));
            }
        }
    }

    /// Alias kept for parity with the original `res.set(name, value)` spelling.
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.set_header(name, value);
    }

    pub fn cookie(&self, name: impl Into<String>, value: impl Into<String>, attrs: CookieAttrs) {
        let name = name.into();
        let entry = crate::cookie::CookieEntry { value: value.into(), attrs };
        self.inner.set_cookies.lock().push(format_set_cookie_header(&name, &entry));
    }

    pub fn clear_cookie(&self, name: impl Into<String>) {
        let attrs = CookieAttrs { max_age: Some(0), ..Default::default() };
        self.cookie(name, "", attrs);
    }

    /// Marks the request as matched by no route. Still an "already sent"
    /// terminal reply.
    pub(crate) fn not_found(&self) {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let error = Envelope::new(EnvelopeType::Error, self.inner.request_id.clone())
            .with_role(Role::Server)
            .with_creator_id(self.inner.creator_id.clone())
            .with_status(404, "Not Found")
            .with_error("no route matched", "METHOD_NOT_FOUND");
        let error = attach_target(error, self.inner.target_id.clone());
        let _ = self.inner.dispatcher.send_message(error);
    }

    /// Emitted when a route handler resolves without calling any `send*`
    /// method (§4.9 step 6).
    pub(crate) fn no_response(&self) {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let error = Envelope::new(EnvelopeType::Error, self.inner.request_id.clone())
            .with_role(Role::Server)
            .with_creator_id(self.inner.creator_id.clone())
            .with_status(500, "Internal Server Error")
            .with_error(
                format!("handler for request {} returned without sending a reply", self.inner.request_id),
                "NO_RESPONSE",
            );
        let error = attach_target(error, self.inner.target_id.clone());
        let _ = self.inner.dispatcher.send_message(error);
    }

    pub(crate) fn handler_error(&self, message: impl Into<String>) {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let error = Envelope::new(EnvelopeType::Error, self.inner.request_id.clone())
            .with_role(Role::Server)
            .with_creator_id(self.inner.creator_id.clone())
            .with_status(500, "Internal Server Error")
            .with_error(message, "REQUEST_ERROR");
        let error = attach_target(error, self.inner.target_id.clone());
        let _ = self.inner.dispatcher.send_message(error);
    }

    pub(crate) fn too_many_requests(
        dispatcher: &Arc<Dispatcher>,
        request_id: &str,
        creator_id: &str,
        target_id: Option<String>,
    ) {
        let error = Envelope::new(EnvelopeType::Error, request_id.to_string())
            .with_role(Role::Server)
            .with_creator_id(creator_id.to_string())
            .with_status(429, "Too Many Requests")
            .with_error("per-client concurrency limit exceeded", "TOO_MANY_REQUESTS");
        let error = attach_target(error, target_id);
        let _ = dispatcher.send_message(error);
    }

    fn build_envelope(&self, data: Option<serde_json::Value>) -> Envelope {
        let (status, status_text) = self.inner.status.lock().clone();
        let mut envelope = Envelope::new(EnvelopeType::Response, self.inner.request_id.clone())
            .with_role(Role::Server)
            .with_creator_id(self.inner.creator_id.clone())
            .with_status(status, status_text);
        if let Some(data) = data {
            envelope = envelope.with_body(data);
        }
        let headers = self.inner.headers.lock().clone();
        if !headers.is_empty() {
            envelope = envelope.with_headers(serde_json::Value::Object(headers.into_iter().collect()));
        }
        let set_cookies = self.inner.set_cookies.lock().clone();
        if !set_cookies.is_empty() {
            envelope = envelope.with_cookies(serde_json::json!(set_cookies));
        }
        attach_target(envelope, self.inner.target_id.clone())
    }

    /// Sends `data` as the response body. If `require_ack` is set, waits up
    /// to `ack_timeout` for the client's `received` envelope and resolves
    /// with whether it arrived.
    pub async fn send(
        self,
        data: serde_json::Value,
        require_ack: bool,
        ack_timeout: Duration,
    ) -> bool {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut envelope = self.build_envelope(Some(data));
        if require_ack {
            let ack_id = envelope.request_id.clone();
            envelope = envelope.with_require_ack(true).with_ack(ack_id.clone());
            let (tx, rx) = oneshot::channel();
            self.inner.ack_waiters.insert(ACK_BUCKET, ack_id.clone(), tx, None);
            let _ = self.inner.dispatcher.send_message(envelope);
            return matches!(tokio::time::timeout(ack_timeout, rx).await, Ok(Ok(true)));
        }
        let _ = self.inner.dispatcher.send_message(envelope);
        true
    }

    pub async fn json(self, data: serde_json::Value) -> bool {
        self.send(data, false, Duration::from_millis(0)).await
    }

    /// Creates a file writer stream, sets `Content-Type`/
    /// `Content-Disposition`, and emits `stream_start`.
    pub async fn send_file(
        self,
        content: FileValue,
        file_name: Option<String>,
        mime_type: Option<String>,
        auto_resolve: bool,
    ) -> bool {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        let name = file_name.or(content.file_name.clone());
        let mime = mime_type.or(content.mime_type.clone()).unwrap_or_else(|| "application/octet-stream".to_string());
        if let Some(name) = &name {
            self.set_header("Content-Disposition", format!("attachment; filename=\"{name}\""));
        }
        self.set_header("Content-Type", mime);

        let options = WriterOptions {
            mode: StreamMode::Push,
            kind: StreamKind::File,
            chunked: false,
            metadata: Some(serde_json::json!({"fileName": name, "size": content.size()})),
            auto_resolve,
            ..WriterOptions::default()
        };
        let mut writer = StreamWriter::new(self.inner.dispatcher.clone(), self.inner.registry.clone(), options);
        if let Some(heartbeat) = self.inner.heartbeat.clone() {
            writer = writer.with_heartbeat(heartbeat);
        }
        self.start_and_drain_writer(writer, Some(content.text().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null)))
            .await
    }

    /// Builds a `StreamWriter` wired to this response's dispatcher/registry
    /// (and heartbeat, if any), for handlers that want to drive `write`/`end`
    /// themselves before calling `send_stream`.
    pub fn writer(&self, options: WriterOptions) -> StreamWriter {
        let mut writer = StreamWriter::new(self.inner.dispatcher.clone(), self.inner.registry.clone(), options);
        if let Some(heartbeat) = self.inner.heartbeat.clone() {
            writer = writer.with_heartbeat(heartbeat);
        }
        writer
    }

    pub async fn send_stream(self, writer: StreamWriter) -> bool {
        if self.inner.sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.start_and_drain_writer(writer, None).await
    }

    async fn start_and_drain_writer(&self, writer: StreamWriter, immediate_chunk: Option<serde_json::Value>) -> bool {
        let binding = winrpc_core::StreamBinding {
            stream_id: writer.stream_id().to_string(),
            request_id: self.inner.request_id.clone(),
            role: Role::Server,
            creator_id: self.inner.creator_id.clone(),
            target_id: self.inner.target_id.clone(),
        };
        if writer.start(binding).await.is_err() {
            return false;
        }
        if let Some(chunk) = immediate_chunk {
            let _ = writer.write(chunk, true);
        }
        true
    }
}

fn attach_target(envelope: Envelope, target_id: Option<String>) -> Envelope {
    match target_id {
        Some(target_id) => envelope.with_target_id(target_id),
        None => envelope,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use winrpc_core::Channel;
    use winrpc_core::channel::mem::MemSource;

    fn pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let (a, b) = MemSource::pair();
        let chan_a = Channel::new(Arc::new(a), None);
        let chan_b = Channel::new(Arc::new(b), None);
        (Dispatcher::new(chan_a), Dispatcher::new(chan_b))
    }

    #[tokio::test]
    async fn send_is_at_most_once() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let ack_waiters = Arc::new(PendingOps::new());
        let res = ServerResponse::new(a, registry, None, "r1", None, "server-1", ack_waiters);
        assert!(res.clone().json(serde_json::json!({"ok": true})).await);
        assert!(!res.json(serde_json::json!({"ok": true})).await);
    }

    #[tokio::test]
    async fn cookie_accumulates_set_cookie_header() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let ack_waiters = Arc::new(PendingOps::new());
        let res = ServerResponse::new(a, registry, None, "r1", None, "server-1", ack_waiters);
        res.cookie("session", "abc", CookieAttrs::default());
        assert_eq!(res.inner.set_cookies.lock().len(), 1);
    }
}
