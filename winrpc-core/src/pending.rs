//! Pending-ops registry: named buckets mapping an id (requestId, streamId,
//! ack id, ...) to an in-flight record plus its timeout timer.
//!
//! Generic over the record type `V` so the same bucket machinery backs
//! request-phase tracking, ack waiters, heartbeat pings, and stream pull
//! credit waiters.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// A single pending entry: the caller-defined value plus an optional
/// timeout task. Deleting the entry always aborts the timer first, so a
/// timer can never fire after its entry has been otherwise completed.
struct Entry<V> {
    value: V,
    timer: Option<JoinHandle<()>>,
}

/// A collection of named buckets of pending operations.
pub struct PendingOps<V> {
    buckets: Mutex<HashMap<String, HashMap<String, Entry<V>>>>,
}

impl<V> Default for PendingOps<V> {
    fn default() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl<V> PendingOps<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending operation. `timer`, if given, is aborted
    /// automatically when this entry is removed by any means.
    pub fn insert(&self, bucket: &str, id: impl Into<String>, value: V, timer: Option<JoinHandle<()>>) {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(id.into(), Entry { value, timer });
    }

    /// Removes and returns the entry for `id`, aborting its timer. Used both
    /// for normal completion and for timeout firing (the timer's own task
    /// must remove its entry before invoking the timeout handler, per the
    /// "fires exactly once" invariant).
    pub fn take(&self, bucket: &str, id: &str) -> Option<V> {
        let mut buckets = self.buckets.lock();
        let entry = buckets.get_mut(bucket)?.remove(id)?;
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        Some(entry.value)
    }

    /// Returns a clone of the entry for `id` without removing it. Used when
    /// multiple in-order events (e.g. ack, then async, then response) must
    /// all reach the same waiter before the entry is finally taken.
    pub fn peek(&self, bucket: &str, id: &str) -> Option<V>
    where
        V: Clone,
    {
        self.buckets.lock().get(bucket)?.get(id).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, bucket: &str, id: &str) -> bool {
        self.buckets
            .lock()
            .get(bucket)
            .map(|b| b.contains_key(id))
            .unwrap_or(false)
    }

    /// Removes and returns every entry in `bucket`, aborting their timers.
    /// Used when an endpoint is destroyed and all its pending ops must be
    /// cancelled.
    pub fn drain_bucket(&self, bucket: &str) -> Vec<V> {
        let mut buckets = self.buckets.lock();
        let Some(entries) = buckets.remove(bucket) else {
            return Vec::new();
        };
        entries
            .into_values()
            .map(|entry| {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                entry.value
            })
            .collect()
    }

    pub fn len(&self, bucket: &str) -> usize {
        self.buckets.lock().get(bucket).map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, bucket: &str) -> bool {
        self.len(bucket) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_take_round_trips() {
        let ops: PendingOps<&'static str> = PendingOps::new();
        ops.insert("acks", "r1", "hello", None);
        assert!(ops.contains("acks", "r1"));
        assert_eq!(ops.take("acks", "r1"), Some("hello"));
        assert!(!ops.contains("acks", "r1"));
        assert_eq!(ops.take("acks", "r1"), None);
    }

    #[tokio::test]
    async fn take_aborts_timer_so_it_never_fires() {
        let ops: PendingOps<u32> = PendingOps::new();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            fired2.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        ops.insert("reqs", "r1", 1, Some(timer));
        assert_eq!(ops.take("reqs", "r1"), Some(1));
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(!fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn drain_bucket_empties_it_and_aborts_timers() {
        let ops: PendingOps<u32> = PendingOps::new();
        ops.insert("reqs", "a", 1, None);
        ops.insert("reqs", "b", 2, None);
        let mut drained = ops.drain_bucket("reqs");
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(ops.len("reqs"), 0);
    }
}
