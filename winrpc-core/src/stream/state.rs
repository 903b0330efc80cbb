//! Shared stream state machine: `pending -> streaming -> terminal`, with all
//! transitions idempotent (§4.7.1).

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Pending,
    Streaming,
    Ended,
    Error,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Ended | StreamState::Error | StreamState::Cancelled)
    }
}

/// Tracks the current state and wakes waiters on every transition.
pub struct StreamStateMachine {
    state: Mutex<StreamState>,
    changed: Notify,
}

impl Default for StreamStateMachine {
    fn default() -> Self {
        Self {
            state: Mutex::new(StreamState::Pending),
            changed: Notify::new(),
        }
    }
}

impl StreamStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StreamState {
        *self.state.lock()
    }

    /// `pending -> streaming`. No-op (returns false) if not currently pending.
    pub fn start_streaming(&self) -> bool {
        let mut guard = self.state.lock();
        if *guard != StreamState::Pending {
            return false;
        }
        *guard = StreamState::Streaming;
        drop(guard);
        self.changed.notify_waiters();
        true
    }

    /// Any terminal transition. Idempotent: a second call with any terminal
    /// target is a no-op and returns false, preserving the first terminal
    /// state reached.
    pub fn finish(&self, target: StreamState) -> bool {
        debug_assert!(target.is_terminal());
        let mut guard = self.state.lock();
        if guard.is_terminal() {
            return false;
        }
        *guard = target;
        drop(guard);
        self.changed.notify_waiters();
        true
    }

    pub async fn wait_for_change(&self) {
        self.changed.notified().await;
    }

    pub fn notify_waiters(&self) {
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_transition_is_idempotent() {
        let machine = StreamStateMachine::new();
        assert!(machine.start_streaming());
        assert!(machine.finish(StreamState::Ended));
        assert!(!machine.finish(StreamState::Error));
        assert_eq!(machine.state(), StreamState::Ended);
    }

    #[test]
    fn cannot_start_streaming_twice() {
        let machine = StreamStateMachine::new();
        assert!(machine.start_streaming());
        assert!(!machine.start_streaming());
    }
}
