//! Deferred action queue.
//!
//! Client intents are queued here tagged with the tick they take effect
//! on, which is what gives inputs deterministic ordering in the face of
//! network jitter. Two containers live under one mutex: the per-tick
//! schedule and the immediate list. Draining removes first, then runs
//! the callbacks outside the lock, so a second drain for the same tick
//! is a no-op.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tracing::debug;

type StoredAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
struct Inner {
    scheduled: HashMap<i64, Vec<StoredAction>>,
    immediate: Vec<StoredAction>,
}

/// Per-tick and immediate deferred closures.
#[derive(Default)]
pub struct ActionQueue {
    inner: Mutex<Inner>,
}

impl ActionQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an action to run when `tick` fires. Actions for one tick run
    /// in insertion order.
    pub fn queue_at<F, Fut>(&self, tick: i64, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(tick, "queueing action");
        let stored: StoredAction = Box::new(move || Box::pin(action()));
        self.lock().scheduled.entry(tick).or_default().push(stored);
    }

    /// Queue an action to run on the next drain, whatever tick that is.
    pub fn queue_immediate<F, Fut>(&self, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("queueing immediate action");
        let stored: StoredAction = Box::new(move || Box::pin(action()));
        self.lock().immediate.push(stored);
    }

    /// Atomically remove and run the list for `tick` in insertion order,
    /// then the entire immediate list in insertion order. Callbacks run
    /// on the caller, outside the lock.
    pub async fn call_actions(&self, tick: i64) {
        let (scheduled, immediate) = {
            let mut inner = self.lock();
            (
                inner.scheduled.remove(&tick).unwrap_or_default(),
                std::mem::take(&mut inner.immediate),
            )
        };
        if !scheduled.is_empty() || !immediate.is_empty() {
            debug!(
                tick,
                scheduled = scheduled.len(),
                immediate = immediate.len(),
                "draining actions"
            );
        }
        for action in scheduled {
            action().await;
        }
        for action in immediate {
            action().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[tokio::test]
    async fn test_action_runs_only_at_its_tick() {
        let queue = ActionQueue::new();
        let called = Arc::new(AtomicUsize::new(0));

        let called_clone = Arc::clone(&called);
        queue.queue_at(2, move || {
            let called = called_clone;
            async move {
                called.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.call_actions(1).await;
        assert_eq!(called.load(Ordering::SeqCst), 0);
        queue.call_actions(2).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_call_actions_twice_is_a_noop() {
        let queue = ActionQueue::new();
        let called = Arc::new(AtomicUsize::new(0));

        let called_clone = Arc::clone(&called);
        queue.queue_at(5, move || {
            let called = called_clone;
            async move {
                called.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.call_actions(5).await;
        queue.call_actions(5).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scheduled_run_before_immediate_in_insertion_order() {
        let queue = ActionQueue::new();
        let order = Arc::new(StdMutex::new(Vec::new()));

        for label in ["imm-1", "imm-2"] {
            let order = Arc::clone(&order);
            queue.queue_immediate(move || async move {
                order.lock().unwrap().push(label);
            });
        }
        for label in ["tick-1", "tick-2"] {
            let order = Arc::clone(&order);
            queue.queue_at(3, move || async move {
                order.lock().unwrap().push(label);
            });
        }

        queue.call_actions(3).await;
        assert_eq!(
            *order.lock().unwrap(),
            vec!["tick-1", "tick-2", "imm-1", "imm-2"]
        );
    }

    #[tokio::test]
    async fn test_immediate_drains_on_any_tick_and_clears() {
        let queue = ActionQueue::new();
        let called = Arc::new(AtomicUsize::new(0));

        let called_clone = Arc::clone(&called);
        queue.queue_immediate(move || {
            let called = called_clone;
            async move {
                called.fetch_add(1, Ordering::SeqCst);
            }
        });

        queue.call_actions(99).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);
        queue.call_actions(100).await;
        assert_eq!(called.load(Ordering::SeqCst), 1);
    }
}
