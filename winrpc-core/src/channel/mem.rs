//! In-process loopback backend, used for same-process host/frame tests and
//! as the reference implementation of the `MessageSource` contract.
//!
//! Built on `std::sync::mpsc` rather than `tokio::sync::mpsc`: a real
//! `postMessage` delivery is dispatched synchronously onto the recipient's
//! event loop, not awaited, so a blocking pump thread is a closer match than
//! an async channel here (`tokio::sync::mpsc` is used elsewhere in this
//! crate, for pending-op timers and the stream engine, where awaiting is the
//! right shape).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::envelope::Envelope;
use crate::error::TransportError;

use super::MessageSource;

struct Inner {
    tx: Sender<Envelope>,
    rx: Mutex<Option<Receiver<Envelope>>>,
    closed: AtomicBool,
}

/// One end of an in-process loopback pair.
pub struct MemSource {
    inner: Arc<Inner>,
}

impl MemSource {
    /// Creates a cross-linked pair: sending on one delivers to the other.
    pub fn pair() -> (MemSource, MemSource) {
        let (tx_a, rx_a) = channel::<Envelope>();
        let (tx_b, rx_b) = channel::<Envelope>();
        let a = MemSource {
            inner: Arc::new(Inner {
                tx: tx_b,
                rx: Mutex::new(Some(rx_a)),
                closed: AtomicBool::new(false),
            }),
        };
        let b = MemSource {
            inner: Arc::new(Inner {
                tx: tx_a,
                rx: Mutex::new(Some(rx_b)),
                closed: AtomicBool::new(false),
            }),
        };
        (a, b)
    }
}

impl MessageSource for MemSource {
    fn send(&self, envelope: &Envelope) -> Result<bool, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        match self.inner.tx.send(envelope.clone()) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        *self.inner.rx.lock().unwrap() = None;
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn start_receiving(&self, on_message: Arc<dyn Fn(Envelope, Option<String>) + Send + Sync>) {
        let Some(rx) = self.inner.rx.lock().unwrap().take() else {
            return;
        };
        let inner = self.inner.clone();
        thread::Builder::new()
            .name("winrpc-mem-pump".into())
            .spawn(move || {
                while let Ok(envelope) = rx.recv() {
                    if inner.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    on_message(envelope, None);
                }
            })
            .expect("failed to spawn in-process channel pump thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeType;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[test]
    fn pair_delivers_across_ends() {
        let (a, b) = MemSource::pair();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received2 = received.clone();
        b.start_receiving(Arc::new(move |env, _origin| {
            received2.lock().unwrap().push(env.request_id.clone())
        }));

        let env = Envelope::new(EnvelopeType::Ping, "r1");
        assert!(a.send(&env).unwrap());

        thread::sleep(Duration::from_millis(50));
        assert_eq!(*received.lock().unwrap(), vec!["r1".to_string()]);
    }

    #[test]
    fn send_after_close_fails() {
        let (a, _b) = MemSource::pair();
        a.close();
        let env = Envelope::new(EnvelopeType::Ping, "r1");
        assert!(matches!(a.send(&env), Err(TransportError::Closed)));
    }
}
