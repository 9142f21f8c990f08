//! Time-windowed coalescing of flush requests.
//!
//! Many dirty signals inside one window collapse into a single deferred
//! action. The first pending call wins: the window is measured from the
//! registration that created the timer, and repeated calls for the same key
//! within that window are no-ops.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Deferred action invoked when a coalescing window elapses. The action must
/// re-check its own state: it may fire when nothing is left to do.
pub type FlushAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Identity of the party requesting a flush. One pending timer exists per key
/// at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoalescingKey(usize);

impl CoalescingKey {
    /// Key derived from an instance's address. Stable for the lifetime of the
    /// `Arc` allocation.
    pub fn for_instance<T>(instance: &Arc<T>) -> Self {
        Self(Arc::as_ptr(instance) as usize)
    }

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

struct PendingFlush {
    handle: JoinHandle<()>,
    action: FlushAction,
}

/// Named debounce queue with a fixed interval shared by all keys.
pub struct CoalescingQueue {
    name: String,
    interval: Duration,
    pending: Arc<Mutex<HashMap<CoalescingKey, PendingFlush>>>,
}

impl CoalescingQueue {
    /// `interval` is clamped to at least one millisecond.
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval: interval.max(Duration::from_millis(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Registers `action` to run once the window for `key` elapses. A no-op if
    /// a timer for `key` is already pending. Returns immediately; the timer
    /// runs on a spawned task and must be called from within a tokio runtime.
    pub fn add(&self, key: CoalescingKey, action: FlushAction) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if pending.contains_key(&key) {
            return;
        }

        tracing::debug!(queue = %self.name, ?key, "scheduling coalesced flush");

        let pending_map = Arc::clone(&self.pending);
        let task_action = action.clone();
        let interval = self.interval;
        let handle = tokio::spawn(async move {
            sleep(interval).await;
            // Remove first: an add() arriving while the action runs opens a
            // fresh window instead of being swallowed.
            let fired = pending_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            if fired.is_some() {
                (task_action)().await;
            }
        });

        pending.insert(key, PendingFlush { handle, action });
    }

    /// Cancels every pending timer and runs its action right away. Used on
    /// teardown paths where waiting out the window is not acceptable.
    pub async fn perform_pending_now(&self) {
        let drained: Vec<PendingFlush> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            pending.drain().map(|(_, entry)| entry).collect()
        };

        for entry in drained {
            entry.handle.abort();
            (entry.action)().await;
        }
    }

    /// Number of keys with a timer currently pending.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for CoalescingQueue {
    fn drop(&mut self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in pending.drain() {
            entry.handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(counter: Arc<AtomicUsize>) -> FlushAction {
        Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[test]
    fn keys_for_distinct_instances_differ() {
        let a = Arc::new(1u8);
        let b = Arc::new(1u8);
        assert_ne!(
            CoalescingKey::for_instance(&a),
            CoalescingKey::for_instance(&b)
        );
        assert_eq!(
            CoalescingKey::for_instance(&a),
            CoalescingKey::for_instance(&a)
        );
    }

    #[tokio::test]
    async fn repeated_adds_keep_a_single_pending_timer() {
        let queue = CoalescingQueue::new("test", Duration::from_millis(200));
        let counter = Arc::new(AtomicUsize::new(0));
        let key = CoalescingKey::from_raw(1);

        queue.add(key, counting_action(counter.clone()));
        queue.add(key, counting_action(counter.clone()));
        queue.add(key, counting_action(counter.clone()));

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn perform_pending_now_fires_without_waiting() {
        let queue = CoalescingQueue::new("test", Duration::from_secs(60));
        let counter = Arc::new(AtomicUsize::new(0));

        queue.add(CoalescingKey::from_raw(1), counting_action(counter.clone()));
        queue.add(CoalescingKey::from_raw(2), counting_action(counter.clone()));

        queue.perform_pending_now().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }
}
