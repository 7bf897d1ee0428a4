//! Bounded, lock-free operation queue with single-active-consumer
//! semantics.
//!
//! Storage follows `kimberlite-server::bounded_queue::BoundedQueue`'s
//! `crossbeam_queue::ArrayQueue` wrapper almost directly. On top of that,
//! this adds the handle-invalidation behavior `spec.md` §4.1 requires: at
//! most one [`Consumer`] is "live" at a time, and asking the queue for a
//! new one silently retires whichever handle was live before it, so a
//! pipeline client that lost a race to reassignment observes its next
//! `pop` return `None` rather than quietly stealing a request meant for
//! the new owner.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use tokio::sync::Notify;

struct Inner<T> {
    storage: ArrayQueue<T>,
    generation: AtomicU64,
    terminal_closed: AtomicBool,
    notify: Notify,
}

/// A bounded FIFO of `T`, shared between one producer side (`push`) and at
/// most one live [`Consumer`].
pub struct OperationQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OperationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Why a [`OperationQueue::push`] was rejected. Either way the item is
/// handed back so the caller can complete it with the right error.
pub enum PushError<T> {
    /// The queue is at capacity (`spec.md`'s "Overload").
    Full(T),
    /// [`OperationQueue::drain`] has already run; the queue is permanently
    /// closed.
    Closed(T),
}

/// A single consumer's view onto a queue, valid until either this handle
/// is explicitly [`Consumer::close`]d, or [`OperationQueue::consumer`] is
/// called again on the same queue (producing a fresher handle and
/// retiring this one).
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
    generation: u64,
    closed: Arc<AtomicBool>,
}

impl<T> Clone for Consumer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            generation: self.generation,
            closed: self.closed.clone(),
        }
    }
}

impl<T> OperationQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage: ArrayQueue::new(capacity.max(1)),
                generation: AtomicU64::new(0),
                terminal_closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Enqueues `item`. Wakes the live consumer, if any is currently
    /// waiting.
    pub fn push(&self, item: T) -> Result<(), PushError<T>> {
        if self.inner.terminal_closed.load(Ordering::Acquire) {
            return Err(PushError::Closed(item));
        }
        match self.inner.storage.push(item) {
            Ok(()) => {
                self.inner.notify.notify_waiters();
                Ok(())
            }
            Err(item) => Err(PushError::Full(item)),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.storage.capacity()
    }

    /// Returns a fresh [`Consumer`] bound to this queue, invalidating
    /// whichever consumer handle was live before it (that handle's next
    /// `pop` will return `None`).
    pub fn consumer(&self) -> Consumer<T> {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.notify.notify_waiters();
        Consumer {
            inner: self.inner.clone(),
            generation,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Permanently closes the queue: subsequent `push` calls fail with
    /// [`PushError::Closed`], and every item still queued is handed to
    /// `on_drained` (in FIFO order) so the caller can complete it (e.g.
    /// with [`crate::error::MuxError::Shutdown`]).
    pub fn drain(&self, mut on_drained: impl FnMut(T)) {
        self.inner.terminal_closed.store(true, Ordering::Release);
        // A push racing this call may land after the flag check but
        // before `terminal_closed` is observed; draining twice in a row
        // with nothing queued the second time is cheap and closes that
        // window in practice.
        loop {
            let mut drained_any = false;
            while let Some(item) = self.inner.storage.pop() {
                on_drained(item);
                drained_any = true;
            }
            self.inner.notify.notify_waiters();
            if !drained_any {
                break;
            }
        }
    }

    pub fn is_terminally_closed(&self) -> bool {
        self.inner.terminal_closed.load(Ordering::Acquire)
    }
}

impl<T> Consumer<T> {
    fn is_stale(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.inner.generation.load(Ordering::Acquire) != self.generation
    }

    /// Pops the next item, waiting if the queue is momentarily empty.
    /// Returns `None` once this handle has been retired (by `close`, by a
    /// newer [`OperationQueue::consumer`] call, or by the queue being
    /// permanently drained with nothing left in it).
    pub async fn pop(&self) -> Option<T> {
        loop {
            if self.is_stale() {
                return None;
            }
            if let Some(item) = self.inner.storage.pop() {
                return Some(item);
            }
            if self.inner.terminal_closed.load(Ordering::Acquire) {
                return None;
            }
            let notified = self.inner.notify.notified();
            // Re-check between registering interest and awaiting, so a
            // push/close that happened right before we subscribed isn't
            // missed.
            if self.is_stale() {
                return None;
            }
            if !self.inner.storage.is_empty() || self.inner.terminal_closed.load(Ordering::Acquire) {
                continue;
            }
            notified.await;
        }
    }

    /// Retires this handle: its `pop` calls return `None` from now on,
    /// and any call currently blocked in `pop` wakes immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.is_stale()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_round_trips() {
        let queue: OperationQueue<u32> = OperationQueue::new(4);
        let consumer = queue.consumer();
        queue.push(1).ok().unwrap();
        queue.push(2).ok().unwrap();
        assert_eq!(consumer.pop().await, Some(1));
        assert_eq!(consumer.pop().await, Some(2));
    }

    #[test]
    fn push_rejects_over_capacity() {
        let queue: OperationQueue<u32> = OperationQueue::new(1);
        queue.push(1).ok().unwrap();
        match queue.push(2) {
            Err(PushError::Full(item)) => assert_eq!(item, 2),
            _ => panic!("expected Full"),
        }
    }

    #[tokio::test]
    async fn new_consumer_invalidates_previous_handle() {
        let queue: OperationQueue<u32> = OperationQueue::new(4);
        let old = queue.consumer();
        let _new = queue.consumer();
        assert_eq!(old.pop().await, None);
    }

    #[tokio::test]
    async fn explicit_close_wakes_blocked_pop() {
        let queue: OperationQueue<u32> = OperationQueue::new(4);
        let consumer = queue.consumer();
        let consumer_clone = consumer.clone();
        let handle = tokio::spawn(async move { consumer_clone.pop().await });
        tokio::task::yield_now().await;
        consumer.close();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn drain_flushes_queued_items_and_closes() {
        let queue: OperationQueue<u32> = OperationQueue::new(4);
        queue.push(1).ok().unwrap();
        queue.push(2).ok().unwrap();
        let mut drained = Vec::new();
        queue.drain(|item| drained.push(item));
        assert_eq!(drained, vec![1, 2]);
        match queue.push(3) {
            Err(PushError::Closed(item)) => assert_eq!(item, 3),
            _ => panic!("expected Closed"),
        }
    }
}
