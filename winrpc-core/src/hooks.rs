//! Synchronous pub/sub hook registry.
//!
//! Used for the dispatcher's `inbound` and `afterSend` hooks. Listeners run
//! in registration order; a listener that panics is caught and logged so it
//! cannot take down the others (mirrors the channel's receiver-isolation
//! contract).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// An ordered set of listeners for a single event type.
pub struct HookRegistry<T> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> Default for HookRegistry<T> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }
}

impl<T> HookRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Listener<T>) {
        self.listeners.write().push(listener);
    }

    /// Fires every listener with `event`. A listener that panics is isolated:
    /// the panic is caught, logged, and the remaining listeners still run.
    pub fn fire(&self, event: &T) {
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::warn!(message, "hook listener panicked; isolated from remaining listeners");
            }
        }
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for HookRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            listeners: RwLock::new(self.listeners.read().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fires_listeners_in_order() {
        let registry: HookRegistry<u32> = HookRegistry::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        registry.subscribe(Arc::new(move |v: &u32| seen1.lock().push(*v)));
        registry.fire(&1);
        registry.fire(&2);
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry: HookRegistry<u32> = HookRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.subscribe(Arc::new(|_: &u32| panic!("boom")));
        let count2 = count.clone();
        registry.subscribe(Arc::new(move |_: &u32| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        registry.fire(&1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
