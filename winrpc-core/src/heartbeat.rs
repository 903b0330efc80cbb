//! Ping/pong liveness probe, tied to a dedicated pending-ops bucket.
//!
//! Used by the stream engine's idle timer: when a stream has been quiet too
//! long, it asks the heartbeat whether the peer is still there before
//! deciding to fail.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, EnvelopeType};
use crate::ids::generate_request_id;
use crate::pending::PendingOps;

const BUCKET: &str = "heartbeat";

pub struct Heartbeat {
    dispatcher: Arc<Dispatcher>,
    pending: Arc<PendingOps<oneshot::Sender<()>>>,
}

impl Heartbeat {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let pending = Arc::new(PendingOps::new());
        let heartbeat = Arc::new(Self {
            dispatcher: dispatcher.clone(),
            pending: pending.clone(),
        });

        dispatcher.on_type(
            EnvelopeType::Pong,
            Arc::new(move |envelope: &Envelope| {
                if let Some(sender) = pending.take(BUCKET, &envelope.request_id) {
                    let _ = sender.send(());
                }
            }),
        );

        let dispatcher_for_ping = heartbeat.dispatcher.clone();
        dispatcher.on_type(
            EnvelopeType::Ping,
            Arc::new(move |envelope: &Envelope| {
                let pong = Envelope::new(EnvelopeType::Pong, envelope.request_id.clone());
                let _ = dispatcher_for_ping.send_message(pong);
            }),
        );

        heartbeat
    }

    /// Sends a `ping` and waits up to `timeout` for a matching `pong`.
    /// Resolves `true` on pong, `false` on timeout.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let request_id = generate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(BUCKET, request_id.clone(), tx, None);

        let envelope = Envelope::new(EnvelopeType::Ping, request_id.clone());
        if !self.dispatcher.send_message(envelope).unwrap_or(false) {
            self.pending.take(BUCKET, &request_id);
            return false;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            _ => {
                self.pending.take(BUCKET, &request_id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mem::MemSource;
    use crate::channel::Channel;

    fn pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let (a, b) = MemSource::pair();
        let chan_a = Channel::new(Arc::new(a), None);
        let chan_b = Channel::new(Arc::new(b), None);
        (Dispatcher::new(chan_a), Dispatcher::new(chan_b))
    }

    #[tokio::test]
    async fn ping_resolves_true_on_pong() {
        let (a, b) = pair();
        let hb_a = Heartbeat::new(a);
        let _hb_b = Heartbeat::new(b);
        let ok = hb_a.ping(Duration::from_millis(500)).await;
        assert!(ok);
    }

    #[tokio::test]
    async fn ping_times_out_without_peer() {
        let (a, _b) = pair();
        let hb_a = Heartbeat::new(a);
        let ok = hb_a.ping(Duration::from_millis(50)).await;
        assert!(!ok);
    }
}
