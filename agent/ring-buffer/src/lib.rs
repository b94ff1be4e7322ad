//! Bounded ring buffers for the agent's lossy handoffs.
//!
//! Purpose: every cross-task queue in the agent carries a live signal (video
//! access units, joystick samples) where the newest value is the only one that
//! matters. None of them may grow without bound, and a slow consumer must never
//! stall the producer.
//!
//! Design:
//! - Fixed capacity, set at construction
//! - When full: oldest slot is overwritten (recent data wins)
//! - `RingBuffer<T>` is the plain synchronous container (used inside maps)
//! - `channel()` wraps it into a single-producer / single-consumer async pair;
//!   `push` is O(1) and never blocks, `recv` parks on a `Notify`

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::trace;

// ──────────────────────────────────────────────────────────────────────────────
// Synchronous container
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    slots:    VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Capacity is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { slots: VecDeque::with_capacity(capacity), capacity }
    }

    /// Append `item`. If the ring is full the oldest item is evicted and returned.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.slots.len() == self.capacity {
            self.slots.pop_front()
        } else {
            None
        };
        self.slots.push_back(item);
        evicted
    }

    /// Oldest item first.
    pub fn pop(&mut self) -> Option<T> {
        self.slots.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Async SPSC pair
// ──────────────────────────────────────────────────────────────────────────────

struct Shared<T> {
    ring:    Mutex<RingBuffer<T>>,
    /// Signals the consumer that new data is available (or the producer left)
    notify:  Notify,
    closed:  AtomicBool,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, RingBuffer<T>> {
        // A poisoned ring only means a panic elsewhere mid-push; the slots are still valid.
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Producer half. Dropping it closes the channel once the ring drains.
pub struct RingSender<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer half.
pub struct RingReceiver<T> {
    shared: Arc<Shared<T>>,
}

/// Create an overwrite-oldest channel holding at most `capacity` items.
pub fn channel<T>(capacity: usize) -> (RingSender<T>, RingReceiver<T>) {
    let shared = Arc::new(Shared {
        ring:    Mutex::new(RingBuffer::new(capacity)),
        notify:  Notify::new(),
        closed:  AtomicBool::new(false),
    });
    (RingSender { shared: Arc::clone(&shared) }, RingReceiver { shared })
}

impl<T> RingSender<T> {
    /// Push an item. Never blocks; returns `true` if an older item was evicted.
    pub fn push(&self, item: T) -> bool {
        let evicted = self.shared.lock().push(item).is_some();
        if evicted {
            trace!("ring full, evicted oldest item");
        }
        self.shared.notify.notify_one();
        evicted
    }
}

impl<T> Drop for RingSender<T> {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl<T> RingReceiver<T> {
    /// Wait for the oldest buffered item. Returns `None` once the sender is
    /// dropped and the ring is empty.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(item) = self.shared.lock().pop() {
                return Some(item);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                // The sender may have pushed right before closing.
                return self.shared.lock().pop();
            }
            // notify_one stores a permit, so a push between the check above and
            // this await is not lost.
            self.shared.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn overwrites_oldest_when_full() {
        let mut ring = RingBuffer::new(4);
        for i in 0..6 {
            ring.push(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| ring.pop()).collect();
        assert_eq!(drained, vec![2, 3, 4, 5]);
    }

    #[test]
    fn zero_capacity_is_one_slot() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.push("a"), None);
        assert_eq!(ring.push("b"), Some("a"));
        assert_eq!(ring.push("c"), Some("b"));
        assert_eq!(ring.pop(), Some("c"));
        assert!(ring.is_empty());
    }

    #[tokio::test]
    async fn capacity_one_keeps_latest() {
        let (tx, mut rx) = channel(1);
        assert!(!tx.push(1));
        assert!(tx.push(2));
        assert!(tx.push(3));
        assert_eq!(rx.recv().await, Some(3));
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_push() {
        let (tx, mut rx) = channel::<u32>(1);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.push(7);
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn closes_after_drain() {
        let (tx, mut rx) = channel(2);
        tx.push("last");
        drop(tx);
        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
    }
}
