//! Stream reader (consumer side): §4.7.3.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, EnvelopeType};
use crate::error::StreamError;
use crate::heartbeat::Heartbeat;
use crate::limits::{DEFAULT_READER_HIGH_WATER_MARK, DEFAULT_STREAM_IDLE_TIMEOUT_MS, READER_COMPACT_THRESHOLD};

use super::state::{StreamState, StreamStateMachine};
use super::{StreamBinding, StreamKind, StreamRegistry};

pub struct ReaderOptions {
    pub kind: StreamKind,
    pub high_water_mark: usize,
    pub idle_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            kind: StreamKind::Data,
            high_water_mark: DEFAULT_READER_HIGH_WATER_MARK,
            idle_timeout: Duration::from_millis(DEFAULT_STREAM_IDLE_TIMEOUT_MS),
        }
    }
}

struct Inner {
    stream_id: String,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<StreamRegistry>,
    options: ReaderOptions,
    state: StreamStateMachine,
    binding: RwLock<Option<StreamBinding>>,
    buffer: Mutex<VecDeque<serde_json::Value>>,
    consumed: Mutex<usize>,
    remote_error: Mutex<Option<StreamError>>,
    data_notify: Notify,
    pull_scheduled: AtomicBool,
    heartbeat: Option<Arc<Heartbeat>>,
}

/// Consumer side of a stream, constructed by the owner (client or server
/// role code) once it has observed the peer's `stream_start` envelope and
/// learned the stream id and kind from it.
pub struct StreamReader {
    inner: Arc<Inner>,
}

impl StreamReader {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<StreamRegistry>,
        stream_id: impl Into<String>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_id: stream_id.into(),
                dispatcher,
                registry,
                options,
                state: StreamStateMachine::new(),
                binding: RwLock::new(None),
                buffer: Mutex::new(VecDeque::new()),
                consumed: Mutex::new(0),
                remote_error: Mutex::new(None),
                data_notify: Notify::new(),
                pull_scheduled: AtomicBool::new(false),
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

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.inner.state.state()
    }

    /// Binds to a request context, registers with the stream registry, and
    /// sends the initial `stream_pull` with credit 1.
    pub fn bind(&self, binding: StreamBinding) {
        *self.inner.binding.write() = Some(binding);
        self.inner.state.start_streaming();

        let inner = self.inner.clone();
        self.inner.registry.register(
            self.inner.stream_id.clone(),
            Arc::new(move |envelope: &Envelope| inner.on_control(envelope)),
        );

        send_pull(&self.inner, 1);

        let idle_inner = self.inner.clone();
        let idle_timeout = self.inner.options.idle_timeout;
        tokio::spawn(async move { idle_timer_loop(idle_inner, idle_timeout).await });
    }

    /// Local cancellation or abort: sends `stream_cancel` (ignoring send
    /// failures) and transitions locally.
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
        self.inner.data_notify.notify_waiters();
    }

    /// Waits for the stream to finish and returns every chunk received, in
    /// order.
    pub async fn read_all(&self) -> Result<Vec<serde_json::Value>, StreamError> {
        loop {
            let state = self.inner.state.state();
            if state.is_terminal() {
                break;
            }
            self.inner.data_notify.notified().await;
        }
        if let Some(err) = self.inner.remote_error.lock().clone() {
            return Err(err);
        }
        if self.inner.state.state() == StreamState::Cancelled {
            return Err(StreamError::Cancelled(None));
        }
        Ok(self.inner.buffer.lock().drain(..).collect())
    }

    /// Waits for the stream to finish and merges every chunk into a single
    /// value: file streams concatenate text chunks into one string; data
    /// streams return the sole chunk directly, or an array if there was
    /// more than one.
    pub async fn read(&self) -> Result<serde_json::Value, StreamError> {
        let chunks = self.read_all().await?;
        Ok(match self.inner.options.kind {
            StreamKind::File => {
                let mut text = String::new();
                for chunk in &chunks {
                    if let Some(s) = chunk.as_str() {
                        text.push_str(s);
                    }
                }
                serde_json::Value::String(text)
            }
            StreamKind::Data => match chunks.len() {
                0 => serde_json::Value::Null,
                1 => chunks.into_iter().next().unwrap(),
                _ => serde_json::Value::Array(chunks),
            },
        })
    }
}

fn send_pull(inner: &Arc<Inner>, credit: u32) {
    let Some(binding) = inner.binding.read().clone() else {
        return;
    };
    let pull = Envelope::new(EnvelopeType::StreamPull, binding.request_id)
        .with_body(serde_json::json!({"streamId": inner.stream_id, "credit": credit}));
    let _ = inner.dispatcher.send_message(pull);
}

/// Schedules at most one coalesced top-up pull per drain: a single
/// `yield_now` stands in for a microtask hop, giving any already-queued
/// wake-ups a chance to land before we compute how much credit is actually
/// missing.
fn schedule_topup(inner: Arc<Inner>) {
    if inner.pull_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        inner.pull_scheduled.store(false, Ordering::SeqCst);
        if inner.state.state().is_terminal() {
            return;
        }
        let missing = inner.options.high_water_mark.saturating_sub(inner.buffer.lock().len());
        if missing > 0 {
            send_pull(&inner, missing as u32);
        }
    });
}

impl Inner {
    fn on_control(self: &Arc<Self>, envelope: &Envelope) {
        match envelope.kind {
            EnvelopeType::StreamData => {
                let Some(body) = &envelope.body else { return };
                let data = body.get("data").cloned().unwrap_or(serde_json::Value::Null);
                let done = body.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
                self.state.start_streaming();
                {
                    let mut buffer = self.buffer.lock();
                    buffer.push_back(data);
                    let mut consumed = self.consumed.lock();
                    if *consumed > READER_COMPACT_THRESHOLD {
                        buffer.make_contiguous();
                        *consumed = 0;
                    }
                }
                self.data_notify.notify_waiters();
                if envelope.require_ack == Some(true) {
                    if let Some(ack) = &envelope.ack {
                        let reply = Envelope::new(EnvelopeType::Ack, envelope.request_id.clone())
                            .with_ack(ack.id.clone());
                        let _ = self.dispatcher.send_message(reply);
                    }
                }
                if done {
                    self.state.finish(StreamState::Ended);
                    self.registry.unregister(&self.stream_id);
                } else {
                    schedule_topup(self.clone_arc());
                }
            }
            EnvelopeType::StreamEnd => {
                if self.state.finish(StreamState::Ended) {
                    self.registry.unregister(&self.stream_id);
                }
                self.data_notify.notify_waiters();
            }
            EnvelopeType::StreamError => {
                let message = envelope
                    .body
                    .as_ref()
                    .and_then(|b| b.get("error"))
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("remote stream error")
                    .to_string();
                *self.remote_error.lock() = Some(StreamError::Remote(message));
                if self.state.finish(StreamState::Error) {
                    self.registry.unregister(&self.stream_id);
                }
                self.data_notify.notify_waiters();
            }
            EnvelopeType::StreamCancel => {
                if self.state.finish(StreamState::Cancelled) {
                    self.registry.unregister(&self.stream_id);
                }
                self.data_notify.notify_waiters();
            }
            _ => {}
        }
    }

    /// Helper to get an `Arc<Self>` from `&Arc<Self>` without threading one
    /// through every call site; relies on being invoked only through
    /// `Arc<Inner>`-owned methods.
    fn clone_arc(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }
}

async fn idle_timer_loop(inner: Arc<Inner>, idle_timeout: Duration) {
    loop {
        if inner.state.state().is_terminal() {
            return;
        }
        let timed_out = tokio::select! {
            _ = tokio::time::sleep(idle_timeout) => true,
            _ = inner.data_notify.notified() => false,
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
                *inner.remote_error.lock() = Some(StreamError::Remote("idle timeout".into()));
                if inner.state.finish(StreamState::Error) {
                    inner.registry.unregister(&inner.stream_id);
                }
                inner.data_notify.notify_waiters();
                return;
            }
        }
    }
}

impl Stream for StreamReader {
    type Item = serde_json::Value;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = self.inner.clone();
        if let Some(chunk) = inner.buffer.lock().pop_front() {
            *inner.consumed.lock() += 1;
            return Poll::Ready(Some(chunk));
        }
        if inner.state.state().is_terminal() {
            return Poll::Ready(None);
        }
        // Register interest and re-check to avoid a lost wake-up between the
        // buffer check above and this registration.
        let notify = inner.data_notify.notified();
        tokio::pin!(notify);
        match notify.poll(cx) {
            Poll::Ready(()) => {
                if let Some(chunk) = inner.buffer.lock().pop_front() {
                    Poll::Ready(Some(chunk))
                } else if inner.state.state().is_terminal() {
                    Poll::Ready(None)
                } else {
                    Poll::Pending
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
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

    fn binding() -> StreamBinding {
        StreamBinding {
            stream_id: "s1".to_string(),
            request_id: "req-1".to_string(),
            role: Role::Client,
            creator_id: "client-1".to_string(),
            target_id: None,
        }
    }

    #[tokio::test]
    async fn accumulates_chunks_until_end() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let reader = StreamReader::new(a.clone(), registry, "s1", ReaderOptions::default());
        reader.bind(binding());

        let data_envelope = Envelope::new(EnvelopeType::StreamData, "req-1").with_body(serde_json::json!({
            "streamId": "s1", "data": "chunk-1", "done": false, "seq": 0
        }));
        reader.inner.on_control(&data_envelope);
        let end_envelope = Envelope::new(EnvelopeType::StreamEnd, "req-1")
            .with_body(serde_json::json!({"streamId": "s1"}));
        reader.inner.on_control(&end_envelope);

        let all = reader.read_all().await.unwrap();
        assert_eq!(all, vec![serde_json::json!("chunk-1")]);
    }

    #[tokio::test]
    async fn stream_error_surfaces_on_read_all() {
        let (a, _b) = pair();
        let registry = StreamRegistry::new(&a);
        let reader = StreamReader::new(a.clone(), registry, "s1", ReaderOptions::default());
        reader.bind(binding());

        let error_envelope = Envelope::new(EnvelopeType::StreamError, "req-1").with_body(
            serde_json::json!({"streamId": "s1", "error": {"message": "boom", "code": "STREAM_ERROR"}}),
        );
        reader.inner.on_control(&error_envelope);

        let result = reader.read_all().await;
        assert!(matches!(result, Err(StreamError::Remote(msg)) if msg == "boom"));
    }
}
