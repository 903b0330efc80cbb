//! Response path (server role): §4.9.
//!
//! Every inbound `request` gets an immediate `ack`, then an immediate
//! `async` (emitted right away rather than waiting for the ack timer to
//! expire, since every handler here is inherently async), then the
//! middleware/route chain runs to completion.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use winrpc_core::{
    Dispatcher, EndpointHub, EndpointOptions, Envelope, EnvelopeType, Heartbeat, MessageSource,
    PendingOps, ReaderOptions, Role, StreamKind, StreamReader, StreamRegistry,
};

use crate::request::ServerRequest;
use crate::response::ServerResponse;
use crate::router::Router;

const ACK_BUCKET: &str = "response-acks";

pub struct ServerOptions {
    pub max_concurrent_requests_per_client: Option<usize>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self { max_concurrent_requests_per_client: None }
    }
}

/// Tracks how many requests from each client (`creatorId`) are currently
/// in flight, enforcing `maxConcurrentRequestsPerClient`.
#[derive(Default)]
struct InFlight {
    counts: Mutex<HashMap<String, usize>>,
}

impl InFlight {
    /// Attempts to reserve a slot for `creator_id`. Returns `false` (no slot
    /// taken) if `limit` would be exceeded.
    fn try_acquire(&self, creator_id: &str, limit: Option<usize>) -> bool {
        let mut counts = self.counts.lock();
        let count = counts.entry(creator_id.to_string()).or_insert(0);
        if let Some(limit) = limit {
            if *count >= limit {
                return false;
            }
        }
        *count += 1;
        true
    }

    fn release(&self, creator_id: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(creator_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(creator_id);
            }
        }
    }
}

pub struct Server {
    hub: EndpointHub,
    pub router: Arc<Router>,
    registry: Arc<StreamRegistry>,
    heartbeat: Arc<Heartbeat>,
    ack_waiters: Arc<PendingOps<oneshot::Sender<bool>>>,
    in_flight: Arc<InFlight>,
    max_concurrent: Option<usize>,
    /// Inbound stream bodies (§4.8.2) keyed by `requestId`, stashed by the
    /// `stream_start` listener until the matching `request` envelope arrives.
    pending_bodies: Arc<Mutex<HashMap<String, (StreamReader, bool)>>>,
}

impl Server {
    pub fn new(
        backend: Arc<dyn MessageSource>,
        endpoint_options: EndpointOptions,
        server_options: ServerOptions,
    ) -> Arc<Self> {
        let pool_key = endpoint_options.secret_key.clone().unwrap_or_else(|| "__winrpc_default__".to_string());
        let hub = EndpointHub::new(pool_key, move || backend, endpoint_options);
        let registry = StreamRegistry::new(&hub.dispatcher);
        let heartbeat = Heartbeat::new(hub.dispatcher.clone());
        let ack_waiters: Arc<PendingOps<oneshot::Sender<bool>>> = Arc::new(PendingOps::new());
        let router = Arc::new(Router::new());
        let in_flight = Arc::new(InFlight::default());
        let pending_bodies: Arc<Mutex<HashMap<String, (StreamReader, bool)>>> = Arc::new(Mutex::new(HashMap::new()));

        wire_received_listener(&hub.dispatcher, &ack_waiters);

        let server = Arc::new(Self {
            hub,
            router,
            registry,
            heartbeat,
            ack_waiters,
            in_flight,
            max_concurrent: server_options.max_concurrent_requests_per_client,
            pending_bodies,
        });

        wire_stream_body_listener(&server.hub.dispatcher, &server.registry, &server.pending_bodies, &server.hub.id);
        wire_request_listener(&server);

        server
    }

    pub fn endpoint_id(&self) -> &str {
        &self.hub.id
    }

    pub fn close(&self) {
        self.hub.close();
    }
}

fn wire_received_listener(dispatcher: &Arc<Dispatcher>, ack_waiters: &Arc<PendingOps<oneshot::Sender<bool>>>) {
    let ack_waiters = ack_waiters.clone();
    dispatcher.on_type(
        EnvelopeType::Received,
        Arc::new(move |envelope: &Envelope| {
            if let Some(sender) = ack_waiters.take(ACK_BUCKET, &envelope.request_id) {
                let _ = sender.send(true);
            }
        }),
    );
}

/// Stashes an inbound request-body stream until its owning `request`
/// envelope is dispatched. `request_id` ties the two together; this server
/// endpoint (`server_id`) becomes the reader's local identity for any
/// `stream_pull` credit it sends back.
fn wire_stream_body_listener(
    dispatcher: &Arc<Dispatcher>,
    registry: &Arc<StreamRegistry>,
    pending_bodies: &Arc<Mutex<HashMap<String, (StreamReader, bool)>>>,
    server_id: &str,
) {
    let registry = registry.clone();
    let dispatcher_for_reader = dispatcher.clone();
    let pending_bodies = pending_bodies.clone();
    let server_id = server_id.to_string();
    dispatcher.on_type(
        EnvelopeType::StreamStart,
        Arc::new(move |envelope: &Envelope| {
            let Some(body) = &envelope.body else { return };
            let Some(stream_id) = body.get("streamId").and_then(|v| v.as_str()) else { return };
            let kind = match body.get("type").and_then(|v| v.as_str()) {
                Some("file") => StreamKind::File,
                _ => StreamKind::Data,
            };
            let auto_resolve = body.get("autoResolve").and_then(|v| v.as_bool()).unwrap_or(false);

            let reader = StreamReader::new(
                dispatcher_for_reader.clone(),
                registry.clone(),
                stream_id,
                ReaderOptions { kind, ..ReaderOptions::default() },
            );
            reader.bind(winrpc_core::StreamBinding {
                stream_id: reader.stream_id().to_string(),
                request_id: envelope.request_id.clone(),
                role: Role::Server,
                creator_id: server_id.clone(),
                target_id: envelope.creator_id.clone(),
            });
            pending_bodies.lock().insert(envelope.request_id.clone(), (reader, auto_resolve));
        }),
    );
}

fn wire_request_listener(server: &Arc<Server>) {
    let server = server.clone();
    server.hub.dispatcher.on_type(
        EnvelopeType::Request,
        Arc::new(move |envelope: &Envelope| {
            server.handle_request(envelope.clone());
        }),
    );
}

impl Server {
    fn handle_request(self: &Arc<Self>, envelope: Envelope) {
        let creator_id = envelope.creator_id.clone().unwrap_or_default();

        if !self.in_flight.try_acquire(&creator_id, self.max_concurrent) {
            tracing::debug!(request_id = %envelope.request_id, %creator_id, "rejecting request: per-client concurrency cap reached");
            ServerResponse::too_many_requests(&self.hub.dispatcher, &envelope.request_id, &self.hub.id, envelope.creator_id.clone());
            return;
        }

        let mut ack = Envelope::new(EnvelopeType::Ack, envelope.request_id.clone()).with_creator_id(self.hub.id.clone());
        if let Some(target) = &envelope.creator_id {
            ack = ack.with_target_id(target.clone());
        }
        let _ = self.hub.dispatcher.send_message(ack);

        let mut async_envelope = Envelope::new(EnvelopeType::Async, envelope.request_id.clone()).with_creator_id(self.hub.id.clone());
        if let Some(target) = &envelope.creator_id {
            async_envelope = async_envelope.with_target_id(target.clone());
        }
        let _ = self.hub.dispatcher.send_message(async_envelope);

        let server = self.clone();
        tokio::spawn(async move {
            server.dispatch_request(envelope).await;
            server.in_flight.release(&creator_id);
        });
    }

    async fn dispatch_request(self: &Arc<Self>, envelope: Envelope) {
        let origin: Option<String> = None;
        let mut req = ServerRequest::from_envelope(&envelope, origin);

        if let Some((reader, auto_resolve)) = self.pending_bodies.lock().remove(&envelope.request_id) {
            if auto_resolve {
                if let Ok(value) = reader.read().await {
                    req.file = Some(crate::file::FileValue::new(value.as_str().unwrap_or_default().to_string()));
                }
            } else {
                req.stream = Some(reader);
            }
        }

        let res = ServerResponse::new(
            self.hub.dispatcher.clone(),
            self.registry.clone(),
            Some(self.heartbeat.clone()),
            envelope.request_id.clone(),
            envelope.creator_id.clone(),
            self.hub.id.clone(),
            self.ack_waiters.clone(),
        );

        let already_sent = res.already_sent();
        if !already_sent {
            let result = self.router.dispatch(req, res.clone()).await;
            match result {
                Ok(()) => {
                    if !res.already_sent() {
                        res.no_response();
                    }
                }
                Err(err) => {
                    tracing::warn!(request_id = %envelope.request_id, path = %envelope.path.as_deref().unwrap_or(""), error = %err.message, "route handler returned an error");
                    if !res.already_sent() {
                        res.handler_error(err.message);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use winrpc_core::channel::mem::MemSource;
    use winrpc_core::Channel;

    #[tokio::test]
    async fn responds_with_not_found_for_unmatched_route() {
        winrpc_core::clear_channel_pool();
        let (a, b) = MemSource::pair();
        let server = Server::new(Arc::new(a), EndpointOptions::default(), ServerOptions::default());
        let chan_b = Channel::new(Arc::new(b), None);
        let client_dispatcher = Dispatcher::new(chan_b);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        client_dispatcher.on_type(
            EnvelopeType::Error,
            Arc::new(move |envelope: &Envelope| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(envelope.clone());
                }
            }),
        );

        let request = Envelope::new(EnvelopeType::Request, "r1")
            .with_path("/missing")
            .with_creator_id("client-1")
            .with_target_id(server.endpoint_id().to_string());
        client_dispatcher.send_message(request).unwrap();

        let error = tokio::time::timeout(Duration::from_millis(500), rx).await.unwrap().unwrap();
        assert_eq!(error.status, Some(404));
        let _ = server;
    }

    #[tokio::test]
    async fn enforces_per_client_concurrency_cap() {
        winrpc_core::clear_channel_pool();
        let (a, b) = MemSource::pair();
        let options = ServerOptions { max_concurrent_requests_per_client: Some(1) };
        let server = Server::new(Arc::new(a), EndpointOptions::default(), options);
        server.router.route(
            "/slow",
            Arc::new(|_req, res| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    res.json(serde_json::json!({"ok": true})).await;
                    Ok(())
                })
            }),
        );
        let chan_b = Channel::new(Arc::new(b), None);
        let client_dispatcher = Dispatcher::new(chan_b);

        let errors: Arc<Mutex<Vec<Envelope>>> = Arc::new(Mutex::new(Vec::new()));
        let errors2 = errors.clone();
        client_dispatcher.on_type(
            EnvelopeType::Error,
            Arc::new(move |envelope: &Envelope| errors2.lock().push(envelope.clone())),
        );

        for _ in 0..2 {
            let request = Envelope::new(EnvelopeType::Request, winrpc_core::generate_request_id())
                .with_path("/slow")
                .with_creator_id("client-1");
            client_dispatcher.send_message(request).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(errors.lock().iter().any(|e| e.status == Some(429)));
    }
}
