//! Credit-based pull/push streaming engine (§4.7): the most intricate
//! subsystem in this crate. Streams discrete structured-clone chunks,
//! gated by a per-chunk pull credit rather than a fixed byte window.

pub mod reader;
pub mod state;
pub mod writer;

pub use reader::{ReaderOptions, StreamReader};
pub use state::{StreamState, StreamStateMachine};
pub use writer::{StreamWriter, WriterOptions};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, EnvelopeType, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    Pull,
    Push,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Data,
    File,
}

/// Addressing and role identity supplied when a stream is bound to a
/// request/response context (§4.7.4). A stream is constructed independently
/// of any request and only becomes addressable once bound.
#[derive(Debug, Clone)]
pub struct StreamBinding {
    pub stream_id: String,
    pub request_id: String,
    pub role: Role,
    pub creator_id: String,
    pub target_id: Option<String>,
}

pub(crate) fn stream_id_of(envelope: &Envelope) -> Option<String> {
    envelope.body.as_ref()?.get("streamId")?.as_str().map(str::to_string)
}

pub(crate) fn seq_of(envelope: &Envelope) -> Option<u64> {
    envelope.body.as_ref()?.get("seq")?.as_u64()
}

pub(crate) fn credit_of(envelope: &Envelope) -> Option<u32> {
    envelope.body.as_ref()?.get("credit")?.as_u64().map(|v| v as u32)
}

/// Demultiplexes inbound stream-type envelopes by `streamId` to whichever
/// writer or reader registered interest. A single registry is shared by
/// every stream bound to one dispatcher.
pub struct StreamRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn Fn(&Envelope) + Send + Sync>>>,
}

impl StreamRegistry {
    pub fn new(dispatcher: &Arc<Dispatcher>) -> Arc<Self> {
        let registry = Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
        });
        for kind in [
            EnvelopeType::StreamStart,
            EnvelopeType::StreamData,
            EnvelopeType::StreamEnd,
            EnvelopeType::StreamError,
            EnvelopeType::StreamCancel,
            EnvelopeType::StreamPull,
            EnvelopeType::StreamAck,
        ] {
            let target = registry.clone();
            dispatcher.on_type(
                kind,
                Arc::new(move |envelope: &Envelope| target.dispatch(envelope)),
            );
        }
        registry
    }

    fn dispatch(&self, envelope: &Envelope) {
        let Some(stream_id) = stream_id_of(envelope) else {
            return;
        };
        let handler = self.handlers.lock().get(&stream_id).cloned();
        if let Some(handler) = handler {
            handler(envelope);
        }
    }

    pub fn register(&self, stream_id: impl Into<String>, handler: Arc<dyn Fn(&Envelope) + Send + Sync>) {
        self.handlers.lock().insert(stream_id.into(), handler);
    }

    pub fn unregister(&self, stream_id: &str) {
        self.handlers.lock().remove(stream_id);
    }
}
