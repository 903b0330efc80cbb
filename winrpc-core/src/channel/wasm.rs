//! Browser `postMessage` backend, gated behind `cfg(target_arch =
//! "wasm32")`. Wraps `web_sys::Window::post_message` and a `message` event
//! listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;
use wasm_bindgen::JsValue;
use web_sys::{MessageEvent, Window};

use crate::envelope::{decode_envelope, encode_envelope, Envelope, Encoding};
use crate::error::TransportError;

use super::MessageSource;

/// Adapts a target `Window` to the `MessageSource` contract. Inbound
/// envelopes are delivered to whatever listener the embedding page attaches
/// via the browser's `message` event.
pub struct WindowSource {
    target: Window,
    target_origin: String,
    closed: AtomicBool,
    listener: std::sync::Mutex<Option<Closure<dyn FnMut(MessageEvent)>>>,
}

impl WindowSource {
    pub fn new(target: Window, target_origin: impl Into<String>) -> Self {
        Self {
            target,
            target_origin: target_origin.into(),
            closed: AtomicBool::new(false),
            listener: std::sync::Mutex::new(None),
        }
    }
}

// `web_sys::Window` is not `Send`/`Sync` in the strict sense, but this crate
// only targets single-threaded wasm (no wasm threads feature enabled), where
// every handle lives on the one JS thread.
unsafe impl Send for WindowSource {}
unsafe impl Sync for WindowSource {}

impl MessageSource for WindowSource {
    fn send(&self, envelope: &Envelope) -> Result<bool, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let bytes = encode_envelope(envelope, Encoding::Json)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|e| TransportError::SendFailed(e.to_string()))?;
        let js_value = JsValue::from_str(&text);
        self.target
            .post_message(&js_value, &self.target_origin)
            .map(|_| true)
            .or(Ok(false))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(closure) = self.listener.lock().unwrap().take() {
            let _ = web_sys::window()
                .expect("no global window")
                .remove_event_listener_with_callback("message", closure.as_ref().unchecked_ref());
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn start_receiving(&self, on_message: Arc<dyn Fn(Envelope, Option<String>) + Send + Sync>) {
        let closure = Closure::<dyn FnMut(MessageEvent)>::new(move |event: MessageEvent| {
            let Some(text) = event.data().as_string() else {
                return;
            };
            let origin = event.origin();
            match decode_envelope(text.as_bytes(), Encoding::Json) {
                Ok(envelope) => on_message(envelope, Some(origin)),
                Err(err) => {
                    tracing::trace!(%err, "dropping inbound postMessage payload: not a valid envelope");
                }
            }
        });
        let window = web_sys::window().expect("no global window");
        window
            .add_event_listener_with_callback("message", closure.as_ref().unchecked_ref())
            .expect("failed to register message listener");
        *self.listener.lock().unwrap() = Some(closure);
    }
}
