//! Unbounded FIFO queue with a cancellable async pop.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::sync::signal::Signal;

/// Ordered hand-off between one producer and one consumer.
///
/// `push` never blocks; `pop` suspends while the queue is empty until an
/// item arrives or the given signal fires. Flow control lives in the
/// channel layered on top, not here.
#[derive(Debug, Default)]
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    arrived: Notify,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
        }
    }

    /// Enqueue an item and wake the waiting consumer, if any.
    pub fn push(&self, item: T) {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .push_back(item);
        self.arrived.notify_one();
    }

    /// Dequeue the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .expect("queue mutex poisoned")
            .pop_front()
    }

    /// Dequeue the oldest item, waiting for one if the queue is empty.
    ///
    /// Returns `None` when `cancel` fires before an item arrives.
    pub async fn pop(&self, cancel: &Signal) -> Option<T> {
        loop {
            // Register interest before checking, so a push between the
            // check and the await is not missed.
            let arrived = self.arrived.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            tokio::select! {
                _ = arrived => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A future resolving on the next push. Used by the channel layer to
    /// wait with the same missed-wakeup discipline as [`Queue::pop`].
    pub(crate) fn arrived(&self) -> Notified<'_> {
        self.arrived.notified()
    }
}
