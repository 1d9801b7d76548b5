//! Bounded drop-oldest queue
//!
//! The producer side never blocks: at capacity the oldest item is discarded
//! and counted, which keeps camera workers real-time even when a sink stalls.
//! Consumers await items asynchronously.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity,
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue an item, dropping the oldest one at capacity.
    ///
    /// Returns false when an old item was discarded to make room.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock().expect("queue mutex poisoned");
        let mut clean = true;
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            clean = false;
        }
        items.push_back(item);
        self.pushed.fetch_add(1, Ordering::Relaxed);
        drop(items);

        self.notify.notify_one();
        clean
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().expect("queue mutex poisoned").pop_front()
    }

    /// Dequeue, waiting until an item is available.
    pub async fn pop(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total items ever pushed (including ones later dropped)
    pub fn pushed_total(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Total items discarded by drop-oldest overflow
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
