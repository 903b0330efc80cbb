//! Message dispatcher: validates inbound envelopes, fires hooks, auto-acks,
//! and routes by envelope type; frames and sends outbound envelopes.
//!
//! Demultiplexes by envelope `type` rather than by a single numeric method
//! id, since a peer may be waiting on several concurrent request/stream
//! phases at once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, Delivery};
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::TransportError;
use crate::hooks::{HookRegistry, Listener};

/// Outcome of an outbound send, passed to `afterSend` listeners.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub envelope: Envelope,
    pub delivered: bool,
}

type ClaimPredicate = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;
/// Decides whether an inbound delivery's origin is acceptable. `None` means
/// the backend could not determine an origin (e.g. the in-process loopback
/// backend), which is always accepted.
type OriginCheck = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Routes inbound envelopes by `type` and frames outbound ones.
pub struct Dispatcher {
    channel: Arc<Channel>,
    inbound_hook: HookRegistry<Envelope>,
    after_send_hook: HookRegistry<SendOutcome>,
    type_routes: Mutex<HashMap<EnvelopeType, Vec<Listener<Envelope>>>>,
    /// Decides whether an inbound envelope requiring ack is being accepted
    /// locally. Defaults to "always accept": by the time an envelope reaches
    /// the dispatcher it has already passed namespace and origin checks, so
    /// silently swallowing the ack would only be wrong once an endpoint
    /// wants to narrow that further (e.g. a router with no matching route
    /// for a request still acks delivery even though the handler will 404).
    claim_predicate: RwLock<ClaimPredicate>,
    /// Endpoint-supplied origin policy (§4.5). Defaults to "always accept";
    /// `EndpointHub` installs the real policy at construction.
    origin_check: RwLock<OriginCheck>,
}

impl Dispatcher {
    pub fn new(channel: Arc<Channel>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            channel,
            inbound_hook: HookRegistry::new(),
            after_send_hook: HookRegistry::new(),
            type_routes: Mutex::new(HashMap::new()),
            claim_predicate: RwLock::new(Arc::new(|_| true)),
            origin_check: RwLock::new(Arc::new(|_| true)),
        });
        let target = dispatcher.clone();
        dispatcher
            .channel
            .add_receiver(Arc::new(move |delivery: &Delivery| target.on_inbound(delivery.clone())));
        dispatcher
    }

    pub fn set_claim_predicate(&self, predicate: ClaimPredicate) {
        *self.claim_predicate.write() = predicate;
    }

    pub fn set_origin_check(&self, check: OriginCheck) {
        *self.origin_check.write() = check;
    }

    pub fn on_inbound_hook(&self, listener: Listener<Envelope>) {
        self.inbound_hook.subscribe(listener);
    }

    pub fn after_send_hook(&self, listener: Listener<SendOutcome>) {
        self.after_send_hook.subscribe(listener);
    }

    /// Subscribes `listener` to envelopes of a specific `kind`.
    pub fn on_type(&self, kind: EnvelopeType, listener: Listener<Envelope>) {
        self.type_routes.lock().entry(kind).or_default().push(listener);
    }

    fn on_inbound(&self, delivery: Delivery) {
        let Delivery { envelope, origin } = delivery;

        if !(self.origin_check.read())(origin.as_deref()) {
            tracing::trace!(origin = ?origin, request_id = %envelope.request_id, "dropping envelope: origin not allowed");
            return;
        }

        if let Err(err) = envelope.validate() {
            tracing::debug!(%err, request_id = %envelope.request_id, "dropping invalid envelope");
            if !envelope.request_id.is_empty() {
                let error_envelope = Envelope::new(EnvelopeType::Error, envelope.request_id.clone())
                    .with_error(err.to_string(), "PROTOCOL_UNSUPPORTED");
                let _ = self.channel.send(&error_envelope);
            }
            return;
        }

        self.inbound_hook.fire(&envelope);

        if envelope.require_ack == Some(true) && (self.claim_predicate.read())(&envelope) {
            let ack_id = envelope.ack.as_ref().map(|a| a.id.clone());
            let mut ack = Envelope::new(EnvelopeType::Ack, envelope.request_id.clone());
            if let Some(id) = ack_id {
                ack = ack.with_ack(id);
            }
            let _ = self.channel.send(&ack);
        }

        let listeners = self.type_routes.lock().get(&envelope.kind).cloned();
        if let Some(listeners) = listeners {
            for listener in listeners {
                listener(&envelope);
            }
        }
    }

    /// Sends `envelope`, firing the `afterSend` hook with the outcome.
    pub fn send_message(&self, envelope: Envelope) -> Result<bool, TransportError> {
        let result = self.channel.send(&envelope);
        let delivered = *result.as_ref().unwrap_or(&false);
        self.after_send_hook.fire(&SendOutcome {
            envelope,
            delivered,
        });
        result
    }
}
