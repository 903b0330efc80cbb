//! Endpoint hub: owns the channel, dispatcher, and origin policy, and
//! provides the open/close/destroy lifecycle shared by the client and
//! server roles built on top of this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::channel::{acquire_channel, Channel, MessageSource, PooledChannel};
use crate::dispatch::Dispatcher;
use crate::ids::generate_endpoint_id;
use crate::pending::PendingOps;

/// How an endpoint decides whether to accept an inbound delivery's origin.
#[derive(Clone)]
pub enum OriginPolicy {
    /// Accept from any origin (and from backends, like the in-process
    /// loopback, that report no origin at all).
    Wildcard,
    /// Accept only the listed origins verbatim.
    AllowList(Vec<String>),
    /// Accept only origins for which the predicate returns true.
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl OriginPolicy {
    fn accepts(&self, origin: Option<&str>) -> bool {
        match self {
            OriginPolicy::Wildcard => true,
            OriginPolicy::AllowList(list) => match origin {
                Some(origin) => list.iter().any(|allowed| allowed == origin),
                // No origin information (e.g. same-process loopback): trust it.
                None => true,
            },
            OriginPolicy::Predicate(predicate) => match origin {
                Some(origin) => predicate(origin),
                None => true,
            },
        }
    }
}

/// Options controlling an endpoint's identity, namespace, and origin policy.
pub struct EndpointOptions {
    pub id: Option<String>,
    pub secret_key: Option<String>,
    pub origin_policy: OriginPolicy,
    /// When true, `origin_policy` defaults to rejecting everything but an
    /// exact match on `strict_origin` (mirrors the "strict mode" option,
    /// which locks both outbound target and inbound accept-list to the
    /// current origin).
    pub strict_origin: Option<String>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            id: None,
            secret_key: None,
            origin_policy: OriginPolicy::Wildcard,
            strict_origin: None,
        }
    }
}

/// Composes a channel, dispatcher, and pending-ops registry behind an
/// open/close/destroy lifecycle. Both the client (`winrpc::request`) and
/// server (`winrpc::response`) roles are built on top of one `EndpointHub`.
pub struct EndpointHub {
    pub id: String,
    pub dispatcher: Arc<Dispatcher>,
    channel: PooledChannel,
    open: AtomicBool,
}

impl EndpointHub {
    /// Creates an endpoint over `backend`, pooled under `pool_key` (the
    /// namespace/`secretKey`, or a caller-chosen key for unnamespaced
    /// channels that should still be shared, such as "one channel per target
    /// window").
    pub fn new(
        pool_key: impl Into<String>,
        make_backend: impl FnOnce() -> Arc<dyn MessageSource>,
        options: EndpointOptions,
    ) -> Self {
        let id = options.id.unwrap_or_else(generate_endpoint_id);
        let secret_key = options.secret_key.clone();
        let pooled = acquire_channel(pool_key, move || Channel::new(make_backend(), secret_key));
        let dispatcher = Dispatcher::new(pooled.channel().clone());

        let policy = if let Some(strict_origin) = options.strict_origin {
            OriginPolicy::AllowList(vec![strict_origin])
        } else {
            options.origin_policy
        };
        dispatcher.set_origin_check(Arc::new(move |origin| policy.accepts(origin)));

        Self {
            id,
            dispatcher,
            channel: pooled,
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.channel.channel().is_closed()
    }

    /// Closes the endpoint's view of the channel. Idempotent: closing an
    /// already-closed endpoint is a no-op.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::debug!(endpoint_id = %self.id, "endpoint closed");
        }
    }

    /// Fully destroys the endpoint: closes it and releases its pooled
    /// channel reference (destroying the underlying channel once no other
    /// endpoint holds it). Idempotent.
    pub fn destroy(&self) {
        self.close();
    }
}

/// Cancels every pending op across every bucket, used when destroying an
/// endpoint that owns a `PendingOps` registry (request phases, ack waiters,
/// stream pulls, ...). Each bucket must be named explicitly by the owner
/// since `PendingOps` does not track bucket names centrally.
pub fn drain_all<V>(ops: &PendingOps<V>, buckets: &[&str]) -> Vec<V> {
    buckets.iter().flat_map(|bucket| ops.drain_bucket(bucket)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mem::MemSource;
    use crate::channel::clear_channel_pool;

    #[test]
    fn close_is_idempotent() {
        clear_channel_pool();
        let (a, _b) = MemSource::pair();
        let endpoint = EndpointHub::new("ep-test", move || Arc::new(a), EndpointOptions::default());
        assert!(endpoint.is_open());
        endpoint.close();
        endpoint.close();
        assert!(!endpoint.is_open());
    }

    #[test]
    fn allow_list_rejects_unlisted_origin() {
        let policy = OriginPolicy::AllowList(vec!["https://a.example".into()]);
        assert!(policy.accepts(Some("https://a.example")));
        assert!(!policy.accepts(Some("https://evil.example")));
        assert!(policy.accepts(None));
    }

    #[test]
    fn wildcard_accepts_everything() {
        let policy = OriginPolicy::Wildcard;
        assert!(policy.accepts(Some("https://anything.example")));
        assert!(policy.accepts(None));
    }
}
