//! The message channel: an adapter over a single asynchronous message
//! source (a `postMessage`-like primitive) that fans envelopes out to
//! multiple receivers, filters by namespace, and is shared across
//! endpoints via a reference-counted pool.

pub mod mem;
#[cfg(target_arch = "wasm32")]
pub mod wasm;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::hooks::{HookRegistry, Listener};

/// A single asynchronous message source. Implementations adapt a real
/// transport (a window's `postMessage`, an in-process loopback pair, a
/// websocket, ...) to this uniform contract.
pub trait MessageSource: Send + Sync + 'static {
    /// Attempts to deliver `envelope`. `Ok(false)` (not an error) means the
    /// peer is currently unreachable — e.g. a closed window — and callers
    /// should treat the send as having failed without it being an error in
    /// the channel itself.
    fn send(&self, envelope: &Envelope) -> Result<bool, TransportError>;

    /// Detaches the underlying listener. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Registers the callback invoked for each inbound envelope, along with
    /// the sender's origin when the backend can determine one (a real
    /// `postMessage` delivery always can; the in-process loopback backend
    /// reports `None`, meaning "trust this delivery", since there is no
    /// cross-origin boundary to check in a same-process test double).
    /// Called exactly once, by the owning `Channel`, immediately after
    /// construction.
    fn start_receiving(&self, on_message: Arc<dyn Fn(Envelope, Option<String>) + Send + Sync>);
}

/// Adapts one `MessageSource` to the channel contract: fan-out to multiple
/// receivers, namespace filtering, and isolated receiver errors.
/// An inbound delivery: the envelope plus the sender's origin, if known.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub envelope: Envelope,
    pub origin: Option<String>,
}

pub struct Channel {
    backend: Arc<dyn MessageSource>,
    receivers: HookRegistry<Delivery>,
    secret_key: Option<String>,
}

impl Channel {
    pub fn new(backend: Arc<dyn MessageSource>, secret_key: Option<String>) -> Arc<Self> {
        let channel = Arc::new(Self {
            backend,
            receivers: HookRegistry::new(),
            secret_key,
        });
        let dispatch_target = channel.clone();
        channel
            .backend
            .start_receiving(Arc::new(move |envelope, origin| dispatch_target.on_inbound(envelope, origin)));
        channel
    }

    fn on_inbound(&self, envelope: Envelope, origin: Option<String>) {
        if let Some(expected) = &self.secret_key {
            if envelope.secret_key.as_deref() != Some(expected.as_str()) {
                tracing::trace!(request_id = %envelope.request_id, "dropping envelope: namespace mismatch");
                return;
            }
        }
        self.receivers.fire(&Delivery { envelope, origin });
    }

    pub fn add_receiver(&self, listener: Listener<Delivery>) {
        self.receivers.subscribe(listener);
    }

    /// Sends `envelope` to the peer. Returns `false` if the peer is
    /// currently unreachable.
    pub fn send(&self, envelope: &Envelope) -> Result<bool, TransportError> {
        if self.backend.is_closed() {
            return Err(TransportError::Closed);
        }
        self.backend.send(envelope)
    }

    pub fn destroy(&self) {
        self.backend.close();
        self.receivers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.backend.is_closed()
    }
}

struct PoolEntry {
    channel: Arc<Channel>,
    ref_count: AtomicUsize,
}

fn pool() -> &'static Mutex<HashMap<String, PoolEntry>> {
    static POOL: OnceLock<Mutex<HashMap<String, PoolEntry>>> = OnceLock::new();
    POOL.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A handle into the shared channel pool. Dropping the last handle for a
/// given key destroys the underlying channel.
pub struct PooledChannel {
    key: String,
    channel: Arc<Channel>,
}

impl PooledChannel {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }
}

impl Clone for PooledChannel {
    fn clone(&self) -> Self {
        if let Some(entry) = pool().lock().get(&self.key) {
            entry.ref_count.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            key: self.key.clone(),
            channel: self.channel.clone(),
        }
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let mut guard = pool().lock();
        let Some(entry) = guard.get(&self.key) else {
            return;
        };
        if entry.ref_count.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(entry) = guard.remove(&self.key) {
                entry.channel.destroy();
            }
        }
    }
}

/// Acquires a pooled channel for `key` (typically the namespace/`secretKey`),
/// constructing it via `make` on first use. Subsequent acquisitions with the
/// same key reuse the existing channel and bump its reference count.
pub fn acquire_channel(key: impl Into<String>, make: impl FnOnce() -> Arc<Channel>) -> PooledChannel {
    let key = key.into();
    let mut guard = pool().lock();
    if let Some(entry) = guard.get(&key) {
        entry.ref_count.fetch_add(1, Ordering::SeqCst);
        return PooledChannel {
            key,
            channel: entry.channel.clone(),
        };
    }
    let channel = make();
    guard.insert(
        key.clone(),
        PoolEntry {
            channel: channel.clone(),
            ref_count: AtomicUsize::new(1),
        },
    );
    PooledChannel { key, channel }
}

/// Clears the entire pool, destroying every channel regardless of
/// outstanding reference counts. Intended for test isolation.
pub fn clear_channel_pool() {
    let mut guard = pool().lock();
    for (_, entry) in guard.drain() {
        entry.channel.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mem::MemSource;
    use crate::envelope::EnvelopeType;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn pool_reuses_channel_for_same_key() {
        clear_channel_pool();
        let (a, _b) = MemSource::pair();
        let made = Arc::new(AtomicBool::new(false));
        let made2 = made.clone();
        let pooled1 = acquire_channel("ns", move || {
            made2.store(true, Ordering::SeqCst);
            Channel::new(Arc::new(a), None)
        });
        assert!(made.load(Ordering::SeqCst));

        let made3 = Arc::new(AtomicBool::new(false));
        let made4 = made3.clone();
        let pooled2 = acquire_channel("ns", move || {
            made4.store(true, Ordering::SeqCst);
            unreachable!("should not construct a second channel for the same key")
        });
        assert!(!made3.load(Ordering::SeqCst));
        assert!(Arc::ptr_eq(pooled1.channel(), pooled2.channel()));
        clear_channel_pool();
    }

    #[test]
    fn namespace_mismatch_is_silently_dropped() {
        let (a, b) = MemSource::pair();
        let chan_a = Channel::new(Arc::new(a), Some("secret".into()));
        let _chan_b = Channel::new(Arc::new(b), None);

        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        chan_a.add_receiver(Arc::new(move |delivery: &Delivery| {
            received2.lock().push(delivery.envelope.request_id.clone());
        }));

        // Directly exercise on_inbound via send from b, which does not set secret_key.
        let env = Envelope::new(EnvelopeType::Ping, "r1");
        // b -> a
        _chan_b.send(&env).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(received.lock().is_empty());
    }
}
