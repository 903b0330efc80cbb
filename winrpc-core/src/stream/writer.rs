//! Stream writer (producer side): §4.7.2.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::StreamError;
use crate::heartbeat::Heartbeat;
use crate::limits::{DEFAULT_STREAM_EXPIRE_TIMEOUT_MS, DEFAULT_STREAM_IDLE_TIMEOUT_MS};
use crate::pending::PendingOps;

use super::state::{StreamState, StreamStateMachine};
use super::{StreamBinding, StreamKind, StreamMode, StreamRegistry};

type Producer = Pin<Box<dyn Stream<Item = serde_json::Value> + Send>>;

pub struct WriterOptions {
    pub mode: StreamMode,
    pub kind: StreamKind,
    pub chunked: bool,
    pub metadata: Option<serde_json::Value>,
    pub auto_resolve: bool,
    pub expire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_pending_chunks: usize,
    pub max_pending_bytes: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            mode: StreamMode::Push,
            kind: StreamKind::Data,
            chunked: true,
            metadata: None,
            auto_resolve: false,
            expire_timeout: Duration::from_millis(DEFAULT_STREAM_EXPIRE_TIMEOUT_MS),
            idle_timeout: Duration::from_millis(DEFAULT_STREAM_IDLE_TIMEOUT_MS),
            max_pending_chunks: 1024,
            max_pending_bytes: 16 * 1024 * 1024,
        }
    }
}

fn byte_len(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::String(s) => s.len(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| if item.is_number() { 1 } else { 0 })
            .sum(),
        // Non-string/non-byte-buffer chunks count as zero bytes, matching
        // the documented (not silently "fixed") accounting behavior.
        _ => 0,
    }
}

struct Inner {
    stream_id: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<StreamRegistry>,
    options: WriterOptions,
    state: StreamStateMachine,
    binding: parking_lot::RwLock<Option<StreamBinding>>,
    seq: AtomicU64,
    credit: AtomicI64,
    pending_queue: Mutex<VecDeque<(serde_json::Value, bool)>>,
    pending_bytes: AtomicUsize,
    producer: Mutex<Option<Producer>>,
    credit_notify: Notify,
    ack_waiters: PendingOps<oneshot::Sender<bool>>,
    heartbeat: Option<Arc<Heartbeat>>,
}

/// Producer side of a stream. Constructed independently of any request;
/// `start` binds it to a request context and begins emitting frames.
pub struct StreamWriter {
    inner: Arc<Inner>,
}

impl StreamWriter {
    pub fn new(dispatcher: Arc<Dispatcher>, registry: Arc<StreamRegistry>, options: WriterOptions) -> Self {
        Self::with_stream_id(dispatcher, registry, options, crate::ids::generate_stream_id())
    }

    pub fn with_stream_id(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<StreamRegistry>,
        options: WriterOptions,
        stream_id: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_id,
                dispatcher,
                registry,
                options,
                state: StreamStateMachine::new(),
                binding: parking_lot::RwLock::new(None),
                seq: AtomicU64::new(0),
                credit: AtomicI64::new(0),
                pending_queue: Mutex::new(VecDeque::new()),
                pending_bytes: AtomicUsize::new(0),
                producer: Mutex::new(None),
                credit_notify: Notify::new(),
                ack_waiters: PendingOps::new(),
                heartbeat: None,
            }),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Arc<Heartbeat>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.heartbeat = Some(heartbeat);
        }
        self
    }

    pub fn set_producer(&self, producer: Producer) {
        *self.inner.producer.lock() = Some(producer);
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.state()
    }

    /// Binds to a request context and sends `stream_start`. Returns a
    /// future that resolves once the stream reaches a terminal state.
    pub async fn start(&self, binding: StreamBinding) -> Result<(), StreamError> {
        *self.inner.binding.write() = Some(binding.clone());
        if !self.inner.state.start_streaming() {
            return Err(StreamError::NotBound);
        }

        let inner = self.inner.clone();
        inner.registry.register(
            inner.stream_id.clone(),
            Arc::new(move |envelope: &Envelope| inner.on_control(envelope)),
        );

        let start_envelope = Envelope::new(EnvelopeType::StreamStart, binding.request_id.clone())
            .with_role(binding.role)
            .with_creator_id(binding.creator_id.clone())
            .with_body(serde_json::json!({
                "streamId": self.inner.stream_id,
                "type": match self.inner.options.kind { StreamKind::Data => "data", StreamKind::File => "file" },
                "mode": match self.inner.options.mode { StreamMode::Pull => "pull", StreamMode::Push => "push" },
                "chunked": self.inner.options.chunked,
                "metadata": self.inner.options.metadata,
                "autoResolve": self.inner.options.auto_resolve,
            }));
        let target_for_send = binding.target_id.clone();
        let mut start_envelope = start_envelope;
        if let Some(target_id) = target_for_send {
            start_envelope = start_envelope.with_target_id(target_id);
        }

        if !self.inner.dispatcher.send_message(start_envelope).unwrap_or(false) {
            self.inner.state.finish(StreamState::Cancelled);
            self.inner.registry.unregister(&self.inner.stream_id);
            return Err(StreamError::Cancelled(Some("target window closed".into())));
        }

        wire_ack_listener(&self.inner.dispatcher, self);

        let flush_inner = self.inner.clone();
        tokio::spawn(async move { flush_loop(flush_inner).await });

        let expire_inner = self.inner.clone();
        let expire_timeout = self.inner.options.expire_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(expire_timeout).await;
            if expire_inner.state.finish(StreamState::Error) {
                expire_inner.registry.unregister(&expire_inner.stream_id);
                tracing::warn!(stream_id = %expire_inner.stream_id, "stream expired before completion");
            }
        });

        let idle_inner = self.inner.clone();
        let idle_timeout = self.inner.options.idle_timeout;
        tokio::spawn(async move { idle_timer_loop(idle_inner, idle_timeout).await });

        Ok(())
    }

    /// Enqueues a chunk for sending (push mode). `done` marks it as the
    /// final chunk.
    pub fn write(&self, data: serde_json::Value, done: bool) -> Result<(), StreamError> {
        let inner = &self.inner;
        if inner.state.state().is_terminal() {
            return Err(StreamError::Cancelled(None));
        }
        let size = byte_len(&data);
        let mut queue = inner.pending_queue.lock();
        if queue.len() >= inner.options.max_pending_chunks
            || inner.pending_bytes.load(Ordering::SeqCst) + size > inner.options.max_pending_bytes
        {
            return Err(StreamError::PendingQueueOverflow);
        }
        queue.push_back((data, done));
        inner.pending_bytes.fetch_add(size, Ordering::SeqCst);
        drop(queue);
        inner.credit_notify.notify_waiters();
        Ok(())
    }

    /// Sends `data` requesting a per-frame acknowledgment. Resolves `true`
    /// if acked within `ack_timeout`, `false` otherwise.
    pub async fn write_with_ack(&self, data: serde_json::Value, ack_timeout: Duration) -> Result<bool, StreamError> {
        let seq = self.inner.seq.load(Ordering::SeqCst);
        let ack_id = format!("{}:{}", self.inner.stream_id, seq);
        let (tx, rx) = oneshot::channel();
        self.inner.ack_waiters.insert("stream-acks", ack_id, tx, None);
        self.write(data, false)?;
        match tokio::time::timeout(ack_timeout, rx).await {
            Ok(Ok(acked)) => Ok(acked),
            _ => Ok(false),
        }
    }

    pub fn end(&self) -> Result<(), StreamError> {
        self.write(serde_json::Value::Null, true)
    }

    /// Local cancellation: best-effort notifies the peer, transitions
    /// locally regardless of send success.
    pub fn cancel(&self, reason: Option<String>) {
        if !self.inner.state.finish(StreamState::Cancelled) {
            return;
        }
        self.inner.registry.unregister(&self.inner.stream_id);
        if let Some(binding) = self.inner.binding.read().clone() {
            let cancel = Envelope::new(EnvelopeType::StreamCancel, binding.request_id)
                .with_body(serde_json::json!({"streamId": self.inner.stream_id, "reason": reason}));
            let _ = self.inner.dispatcher.send_message(cancel);
        }
        for waiter in self.inner.ack_waiters.drain_bucket("stream-acks") {
            let _ = waiter.send(false);
        }
    }
}

impl Inner {
    fn on_control(self: &Arc<Self>, envelope: &Envelope) {
        match envelope.kind {
            EnvelopeType::StreamPull => {
                if let Some(credit) = super::credit_of(envelope) {
                    self.credit.fetch_add(credit as i64, Ordering::SeqCst);
                    self.credit_notify.notify_waiters();
                }
            }
            EnvelopeType::StreamCancel => {
                if self.state.finish(StreamState::Cancelled) {
                    self.registry.unregister(&self.stream_id);
                    for waiter in self.ack_waiters.drain_bucket("stream-acks") {
                        let _ = waiter.send(false);
                    }
                }
            }
            _ => {}
        }
    }
}

async fn flush_loop(inner: Arc<Inner>) {
    loop {
        if inner.state.state().is_terminal() {
            return;
        }
        inner.credit_notify.notified().await;
        loop {
            if inner.state.state().is_terminal() {
                return;
            }
            if inner.credit.load(Ordering::SeqCst) <= 0 {
                break;
            }
            let next = inner.pending_queue.lock().pop_front();
            let (data, done) = match next {
                Some(entry) => entry,
                None => {
                    let mut producer_guard = inner.producer.lock();
                    if let Some(producer) = producer_guard.as_mut() {
                        match producer.next().await {
                            Some(value) => (value, false),
                            None => {
                                drop(producer_guard);
                                finish_ended(&inner).await;
                                return;
                            }
                        }
                    } else {
                        break;
                    }
                }
            };
            send_chunk(&inner, data, done).await;
            if done {
                finish_ended(&inner).await;
                return;
            }
        }
    }
}

async fn send_chunk(inner: &Arc<Inner>, data: serde_json::Value, done: bool) {
    let Some(binding) = inner.binding.read().clone() else {
        return;
    };
    let seq = inner.seq.fetch_add(1, Ordering::SeqCst);
    inner.credit.fetch_sub(1, Ordering::SeqCst);
    let size = byte_len(&data);
    inner.pending_bytes.fetch_sub(size.min(inner.pending_bytes.load(Ordering::SeqCst)), Ordering::SeqCst);

    let ack_id = format!("{}:{}", inner.stream_id, seq);
    let require_ack = inner.ack_waiters.contains("stream-acks", &ack_id);
    let mut envelope = Envelope::new(EnvelopeType::StreamData, binding.request_id)
        .with_role(binding.role)
        .with_body(serde_json::json!({
            "streamId": inner.stream_id,
            "data": data,
            "done": done,
            "seq": seq,
        }));
    if require_ack {
        envelope = envelope.with_require_ack(true).with_ack(ack_id);
    }
    let _ = inner.dispatcher.send_message(envelope);
}

/// Attempts a heartbeat round-trip when the writer has been quiet too long.
/// A successful pong resets the wait; a failed one fails the stream.
async fn idle_timer_loop(inner: Arc<Inner>, idle_timeout: Duration) {
    loop {
        if inner.state.state().is_terminal() {
            return;
        }
        let timed_out = tokio::select! {
            _ = tokio::time::sleep(idle_timeout) => true,
            _ = inner.credit_notify.notified() => false,
        };
        if inner.state.state().is_terminal() {
            return;
        }
        if timed_out {
            let ok = match &inner.heartbeat {
                Some(heartbeat) => heartbeat.ping(Duration::from_millis(1_000)).await,
                None => false,
            };
            if !ok {
                if inner.state.finish(StreamState::Error) {
                    inner.registry.unregister(&inner.stream_id);
                    tracing::warn!(stream_id = %inner.stream_id, "stream idle timeout with no heartbeat response");
                }
                return;
            }
        }
    }
}

async fn finish_ended(inner: &Arc<Inner>) {
    if !inner.state.finish(StreamState::Ended) {
        return;
    }
    inner.registry.unregister(&inner.stream_id);
    if let Some(binding) = inner.binding.read().clone() {
        let end = Envelope::new(EnvelopeType::StreamEnd, binding.request_id)
            .with_body(serde_json::json!({"streamId": inner.stream_id}));
        let _ = inner.dispatcher.send_message(end);
    }
}

/// Wires the dispatcher's regular `ack` envelope type into per-frame stream
/// ack waiters (the per-frame ack protocol reuses the top-level `ack`
/// envelope rather than the reserved `stream_ack` type; see module docs).
pub fn wire_ack_listener(dispatcher: &Arc<Dispatcher>, writer: &StreamWriter) {
    let inner = writer.inner.clone();
    let prefix = format!("{}:", inner.stream_id);
    dispatcher.on_type(
        EnvelopeType::Ack,
        Arc::new(move |envelope: &Envelope| {
            let Some(ack) = &envelope.ack else { return };
            if !ack.id.starts_with(&prefix) {
                return;
            }
            if let Some(sender) = inner.ack_waiters.take("stream-acks", &ack.id) {
                let _ = sender.send(true);
            }
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mem::MemSource;
    use crate::channel::Channel;
    use crate::envelope::Role;

    fn pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let (a, b) = MemSource::pair();
        let chan_a = Channel::new(Arc::new(a), None);
        let chan_b = Channel::new(Arc::new(b), None);
        (Dispatcher::new(chan_a), Dispatcher::new(chan_b))
    }

    fn binding(stream_id: &str) -> StreamBinding {
        StreamBinding {
            stream_id: stream_id.to_string(),
            request_id: "req-1".to_string(),
            role: Role::Server,
            creator_id: "server-1".to_string(),
            target_id: None,
        }
    }

    #[tokio::test]
    async fn write_rejects_over_capacity() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let mut options = WriterOptions::default();
        options.max_pending_chunks = 1;
        let writer = StreamWriter::new(a, registry, options);
        writer.write(serde_json::json!("x"), false).unwrap();
        assert!(matches!(writer.write(serde_json::json!("y"), false), Err(StreamError::PendingQueueOverflow)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_terminal() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let writer = StreamWriter::new(a.clone(), registry, WriterOptions::default());
        writer.start(binding("s1")).await.unwrap();
        writer.cancel(Some("nope".into()));
        writer.cancel(Some("again".into()));
        assert_eq!(writer.state(), StreamState::Cancelled);
    }
}
