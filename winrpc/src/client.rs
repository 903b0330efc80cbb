//! Request path (client role): §4.8.
//!
//! Builds and sends `request` envelopes, tracks the ack→async→response
//! phase machine per in-flight request, applies the interceptor chains, and
//! auto-resolves file-stream bodies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use winrpc_core::{
    Dispatcher, EndpointHub, EndpointOptions, Envelope, EnvelopeType, ErrorCode, Heartbeat,
    MessageSource, PendingOps, ReaderOptions, Role, RpcError, StreamBinding, StreamKind,
    StreamReader, StreamRegistry, StreamWriter, WriterOptions,
};

use crate::cookie::CookieJar;
use crate::file::FileValue;
use crate::interceptor::InterceptorChain;

const REQUESTS_BUCKET: &str = "requests";

/// Derives a `Content-Type` from a request body's shape: plain object →
/// JSON, string → text, `key=value&...`-shaped string → url-encoded form.
/// Binary/file bodies never reach here; they're routed through
/// `send_file`/`send_stream` instead.
fn content_type_for_body(body: &serde_json::Value) -> &'static str {
    match body {
        serde_json::Value::String(s) if looks_url_encoded(s) => "application/x-www-form-urlencoded",
        serde_json::Value::String(_) => "text/plain",
        _ => "application/json",
    }
}

fn looks_url_encoded(s: &str) -> bool {
    if s.is_empty() || !s.contains('=') {
        return false;
    }
    s.split('&').all(|pair| {
        let mut parts = pair.splitn(2, '=');
        matches!(parts.next(), Some(key) if !key.is_empty()) && parts.next().is_some()
    })
}

/// Merges a derived `Content-Type` into `headers` unless the caller already
/// set one (case-insensitively).
fn headers_with_content_type(headers: Option<&serde_json::Value>, content_type: &str) -> serde_json::Value {
    let mut map = match headers {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if !map.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
        map.insert("Content-Type".to_string(), serde_json::Value::String(content_type.to_string()));
    }
    serde_json::Value::Object(map)
}

#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    pub path: String,
    pub body: Option<serde_json::Value>,
    pub headers: Option<serde_json::Value>,
    pub cookies: Option<HashMap<String, String>>,
    pub request_id: String,
    pub target_id: Option<String>,
}

impl RequestConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            request_id: winrpc_core::generate_request_id(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Clone)]
pub struct ResponseValue {
    pub data: Option<serde_json::Value>,
    pub status: u16,
    pub status_text: String,
    pub headers: Option<serde_json::Value>,
    pub cookies: Option<serde_json::Value>,
    pub request_id: String,
    /// Set when the server replied with a stream instead of a plain body
    /// (and `autoResolve` was not requested or did not apply).
    pub stream: Option<Arc<StreamReader>>,
    /// Set when a stream body was transparently drained into a file.
    pub file: Option<FileValue>,
}

pub struct ClientOptions {
    pub ack_timeout: Duration,
    pub timeout: Duration,
    pub async_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(winrpc_core::limits::DEFAULT_ACK_TIMEOUT_MS),
            timeout: Duration::from_millis(winrpc_core::limits::DEFAULT_TIMEOUT_MS),
            async_timeout: Duration::from_millis(winrpc_core::limits::DEFAULT_ASYNC_TIMEOUT_MS),
        }
    }
}

enum ClientEvent {
    Ack { creator_id: Option<String> },
    AsyncStarted,
    StreamStart { stream_id: String, kind: StreamKind, auto_resolve: bool, target_id: Option<String> },
    Response(Envelope),
    Error(Envelope),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ack,
    Response,
    Async,
}

pub struct Client {
    hub: EndpointHub,
    options: ClientOptions,
    pending: Arc<PendingOps<mpsc::UnboundedSender<ClientEvent>>>,
    target_id: Arc<RwLock<Option<String>>>,
    pub cookies: Arc<CookieJar>,
    pub request_interceptors: InterceptorChain<RequestConfig>,
    pub response_interceptors: InterceptorChain<ResponseValue>,
    registry: Arc<StreamRegistry>,
    heartbeat: Arc<Heartbeat>,
}

impl Client {
    pub fn new(
        backend: Arc<dyn MessageSource>,
        endpoint_options: EndpointOptions,
        client_options: ClientOptions,
    ) -> Arc<Self> {
        let pool_key = endpoint_options.secret_key.clone().unwrap_or_else(|| "__winrpc_default__".to_string());
        let hub = EndpointHub::new(pool_key, move || backend, endpoint_options);
        let registry = StreamRegistry::new(&hub.dispatcher);
        let heartbeat = Heartbeat::new(hub.dispatcher.clone());
        let pending: Arc<PendingOps<mpsc::UnboundedSender<ClientEvent>>> = Arc::new(PendingOps::new());
        let target_id: Arc<RwLock<Option<String>>> = Arc::new(RwLock::new(None));

        wire_phase_listeners(&hub.dispatcher, &pending);

        Arc::new(Self {
            hub,
            options: client_options,
            pending,
            target_id,
            cookies: Arc::new(CookieJar::new()),
            request_interceptors: InterceptorChain::new(),
            response_interceptors: InterceptorChain::new(),
            registry,
            heartbeat,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.hub.id
    }

    pub fn close(&self) {
        let waiters = winrpc_core::drain_all(&self.pending, &[REQUESTS_BUCKET]);
        for waiter in waiters {
            let _ = waiter.send(ClientEvent::Error(
                Envelope::new(EnvelopeType::Error, "").with_error("endpoint closed", "TARGET_WINDOW_CLOSED"),
            ));
        }
        self.hub.close();
    }

    /// Sends a request and drives it through the ack → (async) → response
    /// phase machine, returning the final `Response` or a typed error.
    pub async fn send(&self, config: RequestConfig) -> Result<ResponseValue, RpcError> {
        let config = self.request_interceptors.run(config).await?;
        let (mut rx, target_id) = self.send_request_envelope(&config).await?;
        let response = self.drive_phases(&config.request_id, &mut rx, target_id).await?;
        self.response_interceptors.run(response).await
    }

    /// Sends `content` as the request body over a file stream (§4.8.2)
    /// instead of inlining it in the `request` envelope's `body`.
    pub async fn send_file(&self, config: RequestConfig, content: FileValue) -> Result<ResponseValue, RpcError> {
        let config = self.request_interceptors.run(config).await?;
        let target_id = config.target_id.clone().or_else(|| self.target_id.read().clone());

        let options = WriterOptions {
            mode: winrpc_core::StreamMode::Push,
            kind: StreamKind::File,
            chunked: false,
            metadata: Some(serde_json::json!({"fileName": content.file_name, "size": content.size()})),
            ..WriterOptions::default()
        };
        let writer = StreamWriter::new(self.hub.dispatcher.clone(), self.registry.clone(), options)
            .with_heartbeat(self.heartbeat.clone());
        self.start_body_stream(&writer, &config, target_id.clone()).await?;
        let _ = writer.write(content.text().map(serde_json::Value::String).unwrap_or(serde_json::Value::Null), true);

        let (mut rx, target_id) = self.send_request_envelope(&config).await?;
        let response = self.drive_phases(&config.request_id, &mut rx, target_id).await?;
        self.response_interceptors.run(response).await
    }

    /// Sends a request whose body is produced incrementally by `writer`
    /// (§4.8.2). The caller drives `writer.write`/`writer.end` itself.
    pub async fn send_stream(&self, config: RequestConfig, writer: &StreamWriter) -> Result<ResponseValue, RpcError> {
        let config = self.request_interceptors.run(config).await?;
        let target_id = config.target_id.clone().or_else(|| self.target_id.read().clone());
        self.start_body_stream(writer, &config, target_id).await?;

        let (mut rx, target_id) = self.send_request_envelope(&config).await?;
        let response = self.drive_phases(&config.request_id, &mut rx, target_id).await?;
        self.response_interceptors.run(response).await
    }

    async fn start_body_stream(
        &self,
        writer: &StreamWriter,
        config: &RequestConfig,
        target_id: Option<String>,
    ) -> Result<(), RpcError> {
        let binding = StreamBinding {
            stream_id: writer.stream_id().to_string(),
            request_id: config.request_id.clone(),
            role: Role::Client,
            creator_id: self.hub.id.clone(),
            target_id,
        };
        writer.start(binding).await.map_err(RpcError::from)
    }

    async fn send_request_envelope(
        &self,
        config: &RequestConfig,
    ) -> Result<(mpsc::UnboundedReceiver<ClientEvent>, Option<String>), RpcError> {
        let merged_cookies = self.cookies.merge_for_request(&config.path, config.cookies.as_ref());
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(REQUESTS_BUCKET, config.request_id.clone(), tx, None);

        let mut envelope = Envelope::new(EnvelopeType::Request, config.request_id.clone())
            .with_role(Role::Client)
            .with_creator_id(self.hub.id.clone())
            .with_path(config.path.clone());
        if let Some(body) = &config.body {
            envelope = envelope.with_body(body.clone());
        }
        let headers = match &config.body {
            Some(body) => Some(headers_with_content_type(config.headers.as_ref(), content_type_for_body(body))),
            None => config.headers.clone(),
        };
        if let Some(headers) = &headers {
            envelope = envelope.with_headers(headers.clone());
        }
        if !merged_cookies.is_empty() {
            envelope = envelope.with_cookies(serde_json::json!(merged_cookies));
        }
        let target_id = config.target_id.clone().or_else(|| self.target_id.read().clone());
        if let Some(target_id) = &target_id {
            envelope = envelope.with_target_id(target_id.clone());
        }

        if !self.hub.dispatcher.send_message(envelope).unwrap_or(false) {
            tracing::debug!(request_id = %config.request_id, path = %config.path, "request send failed: target window closed");
            self.pending.take(REQUESTS_BUCKET, &config.request_id);
            return Err(RpcError::target_window_closed());
        }

        Ok((rx, target_id))
    }

    async fn drive_phases(
        &self,
        request_id: &str,
        rx: &mut mpsc::UnboundedReceiver<ClientEvent>,
        mut target_id: Option<String>,
    ) -> Result<ResponseValue, RpcError> {
        let mut phase = Phase::Ack;
        loop {
            let deadline = match phase {
                Phase::Ack => self.options.ack_timeout,
                Phase::Response => self.options.timeout,
                Phase::Async => self.options.async_timeout,
            };
            let event = match tokio::time::timeout(deadline, rx.recv()).await {
                Err(_) => {
                    self.pending.take(REQUESTS_BUCKET, request_id);
                    return Err(match phase {
                        Phase::Ack => RpcError::ack_timeout(request_id),
                        Phase::Response => RpcError::timeout(request_id),
                        Phase::Async => RpcError::async_timeout(request_id),
                    });
                }
                Ok(None) => {
                    self.pending.take(REQUESTS_BUCKET, request_id);
                    return Err(RpcError::new(ErrorCode::RequestError, "request channel closed unexpectedly"));
                }
                Ok(Some(event)) => event,
            };

            match event {
                ClientEvent::Ack { creator_id } => {
                    {
                        let mut guard = self.target_id.write();
                        if guard.is_none() {
                            if let Some(creator_id) = creator_id {
                                *guard = Some(creator_id.clone());
                                target_id = target_id.or(Some(creator_id));
                            }
                        }
                    }
                    phase = Phase::Response;
                }
                ClientEvent::AsyncStarted => {
                    phase = Phase::Async;
                }
                ClientEvent::StreamStart { stream_id, kind, auto_resolve, target_id: stream_target } => {
                    self.pending.take(REQUESTS_BUCKET, request_id);
                    let reader = StreamReader::new(
                        self.hub.dispatcher.clone(),
                        self.registry.clone(),
                        stream_id,
                        ReaderOptions { kind, ..ReaderOptions::default() },
                    )
                    .with_heartbeat(self.heartbeat.clone());
                    reader.bind(StreamBinding {
                        stream_id: reader.stream_id().to_string(),
                        request_id: request_id.to_string(),
                        role: Role::Client,
                        creator_id: self.hub.id.clone(),
                        target_id: stream_target.or(target_id),
                    });

                    if auto_resolve {
                        let value = reader.read().await.map_err(RpcError::from)?;
                        let text = value.as_str().unwrap_or_default().to_string();
                        return Ok(ResponseValue {
                            data: None,
                            status: 200,
                            status_text: "OK".to_string(),
                            headers: None,
                            cookies: None,
                            request_id: request_id.to_string(),
                            stream: None,
                            file: Some(FileValue::new(text)),
                        });
                    }
                    return Ok(ResponseValue {
                        data: None,
                        status: 200,
                        status_text: "OK".to_string(),
                        headers: None,
                        cookies: None,
                        request_id: request_id.to_string(),
                        stream: Some(Arc::new(reader)),
                        file: None,
                    });
                }
                ClientEvent::Response(envelope) => {
                    self.pending.take(REQUESTS_BUCKET, request_id);
                    if let Some(cookies) = &envelope.cookies {
                        self.cookies.absorb(cookies);
                    }
                    if envelope.require_ack == Some(true) {
                        let ack_id = envelope.ack.as_ref().map(|a| a.id.clone()).unwrap_or_default();
                        let received = Envelope::new(EnvelopeType::Received, envelope.request_id.clone()).with_ack(ack_id);
                        let _ = self.hub.dispatcher.send_message(received);
                    }
                    return Ok(ResponseValue {
                        data: envelope.body.clone(),
                        status: envelope.status.unwrap_or(200),
                        status_text: envelope.status_text.clone().unwrap_or_else(|| "OK".to_string()),
                        headers: envelope.headers.clone(),
                        cookies: envelope.cookies.clone(),
                        request_id: envelope.request_id.clone(),
                        stream: None,
                        file: None,
                    });
                }
                ClientEvent::Error(envelope) => {
                    self.pending.take(REQUESTS_BUCKET, request_id);
                    let message = envelope.error.as_ref().map(|e| e.message.clone()).unwrap_or_else(|| "request failed".to_string());
                    let code = envelope.error.as_ref().map(|e| e.code.clone()).unwrap_or_else(|| "REQUEST_ERROR".to_string());
                    return Err(RpcError::new(ErrorCode::from_wire(&code), message));
                }
            }
        }
    }
}

fn stream_kind_from_body(body: &serde_json::Value) -> StreamKind {
    match body.get("type").and_then(|v| v.as_str()) {
        Some("file") => StreamKind::File,
        _ => StreamKind::Data,
    }
}

fn wire_phase_listeners(dispatcher: &Arc<Dispatcher>, pending: &Arc<PendingOps<mpsc::UnboundedSender<ClientEvent>>>) {
    let ack_pending = pending.clone();
    dispatcher.on_type(
        EnvelopeType::Ack,
        Arc::new(move |envelope: &Envelope| {
            if let Some(tx) = ack_pending.peek(REQUESTS_BUCKET, &envelope.request_id) {
                let _ = tx.send(ClientEvent::Ack { creator_id: envelope.creator_id.clone() });
            }
        }),
    );

    let async_pending = pending.clone();
    dispatcher.on_type(
        EnvelopeType::Async,
        Arc::new(move |envelope: &Envelope| {
            if let Some(tx) = async_pending.peek(REQUESTS_BUCKET, &envelope.request_id) {
                let _ = tx.send(ClientEvent::AsyncStarted);
            }
        }),
    );

    let stream_pending = pending.clone();
    dispatcher.on_type(
        EnvelopeType::StreamStart,
        Arc::new(move |envelope: &Envelope| {
            let Some(body) = &envelope.body else { return };
            let Some(stream_id) = body.get("streamId").and_then(|v| v.as_str()) else { return };
            if let Some(tx) = stream_pending.peek(REQUESTS_BUCKET, &envelope.request_id) {
                let kind = stream_kind_from_body(body);
                let auto_resolve = body.get("autoResolve").and_then(|v| v.as_bool()).unwrap_or(false);
                let _ = tx.send(ClientEvent::StreamStart {
                    stream_id: stream_id.to_string(),
                    kind,
                    auto_resolve,
                    target_id: envelope.creator_id.clone(),
                });
            }
        }),
    );

    let response_pending = pending.clone();
    dispatcher.on_type(
        EnvelopeType::Response,
        Arc::new(move |envelope: &Envelope| {
            if let Some(tx) = response_pending.peek(REQUESTS_BUCKET, &envelope.request_id) {
                let _ = tx.send(ClientEvent::Response(envelope.clone()));
            }
        }),
    );

    let error_pending = pending.clone();
    dispatcher.on_type(
        EnvelopeType::Error,
        Arc::new(move |envelope: &Envelope| {
            if let Some(tx) = error_pending.peek(REQUESTS_BUCKET, &envelope.request_id) {
                let _ = tx.send(ClientEvent::Error(envelope.clone()));
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use winrpc_core::channel::mem::MemSource;
    use winrpc_core::{clear_channel_pool, Channel};

    fn client_and_server_dispatcher() -> (Arc<Client>, Arc<Dispatcher>) {
        clear_channel_pool();
        let (a, b) = MemSource::pair();
        let client = Client::new(Arc::new(a), EndpointOptions::default(), ClientOptions::default());
        let chan_b = Channel::new(Arc::new(b), None);
        let server_dispatcher = Dispatcher::new(chan_b);
        (client, server_dispatcher)
    }

    #[tokio::test]
    async fn basic_request_response_round_trip() {
        let (client, server) = client_and_server_dispatcher();
        let server_clone = server.clone();
        server.on_type(
            EnvelopeType::Request,
            Arc::new(move |envelope: &Envelope| {
                let ack = Envelope::new(EnvelopeType::Ack, envelope.request_id.clone()).with_creator_id("server-1");
                let _ = server_clone.send_message(ack);
                let response = Envelope::new(EnvelopeType::Response, envelope.request_id.clone())
                    .with_status(200, "OK")
                    .with_body(serde_json::json!({"ok": true}));
                let _ = server_clone.send_message(response);
            }),
        );

        let response = client.send(RequestConfig::new("/echo").with_body(serde_json::json!({"x": 1}))).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.data, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn ack_timeout_rejects_and_clears_pending_op() {
        clear_channel_pool();
        let (a, _b) = MemSource::pair();
        let options = ClientOptions { ack_timeout: Duration::from_millis(50), ..ClientOptions::default() };
        let client = Client::new(Arc::new(a), EndpointOptions::default(), options);
        let result = client.send(RequestConfig::new("/nobody-home")).await;
        assert!(matches!(result, Err(err) if err.code == ErrorCode::AckTimeout));
    }
}
