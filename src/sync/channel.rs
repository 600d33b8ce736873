//! Single-producer/single-consumer channel with bounded in-flight items.
//!
//! # Responsibilities
//! - Deliver values in order with at most `capacity` unconsumed at a time
//! - Propagate closure to both ends exactly once
//! - Expose a signal that other waits can link against
//!
//! # Design Decisions
//! - Capacity counts unconsumed items, not buffer slots: the first
//!   `capacity` sends return immediately, later sends wait for the
//!   receiver to catch up. Capacity 0 is a rendezvous.
//! - Close drops nothing: the receiver drains what was already sent,
//!   then sees clean termination. Blocked senders fail instead.
//! - Cancelled receives terminate normally; only send-after-close is an
//!   error the caller sees.

use std::sync::Arc;

use thiserror::Error;

use crate::sync::queue::Queue;
use crate::sync::signal::Signal;

/// The channel was closed before or during the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("channel closed")]
pub struct SendError;

struct Shared<T> {
    queue: Queue<T>,
    capacity: usize,
    /// Wakes senders blocked on the capacity gate after each pop.
    consumed: tokio::sync::Notify,
    closed: Signal,
}

/// One stream of values between a producer task and a consumer task.
///
/// Clones share the same stream; the single-producer/single-consumer
/// discipline is by convention, matching how the tunnel wires tasks
/// together.
pub struct Channel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Channel<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Queue::new(),
                capacity,
                consumed: tokio::sync::Notify::new(),
                closed: Signal::new(),
            }),
        }
    }

    /// Deliver a value to the receiver.
    ///
    /// Completes once the number of unconsumed items is back within
    /// capacity. Fails if the channel is closed before then; the value
    /// may or may not have been consumed in that case.
    pub async fn send(&self, value: T) -> Result<(), SendError> {
        if self.shared.closed.is_cancelled() {
            return Err(SendError);
        }
        self.shared.queue.push(value);
        loop {
            let consumed = self.shared.consumed.notified();
            if self.shared.queue.len() <= self.shared.capacity {
                return Ok(());
            }
            if self.shared.closed.is_cancelled() {
                return Err(SendError);
            }
            tokio::select! {
                _ = consumed => {}
                _ = self.shared.closed.cancelled() => return Err(SendError),
            }
        }
    }

    /// Receive the next value.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<T> {
        self.recv_inner(None).await
    }

    /// Receive the next value, additionally terminating when `cancel`
    /// fires. Cancellation is normal termination, not an error.
    pub async fn recv_cancel(&self, cancel: &Signal) -> Option<T> {
        self.recv_inner(Some(cancel)).await
    }

    async fn recv_inner(&self, cancel: Option<&Signal>) -> Option<T> {
        loop {
            let arrived = self.shared.queue.arrived();
            if let Some(value) = self.shared.queue.try_pop() {
                self.shared.consumed.notify_waiters();
                return Some(value);
            }
            if self.shared.closed.is_cancelled() {
                return None;
            }
            if let Some(cancel) = cancel {
                if cancel.is_cancelled() {
                    return None;
                }
                tokio::select! {
                    _ = arrived => {}
                    _ = self.shared.closed.cancelled() => {}
                    _ = cancel.cancelled() => return None,
                }
            } else {
                tokio::select! {
                    _ = arrived => {}
                    _ = self.shared.closed.cancelled() => {}
                }
            }
        }
    }

    /// Close the channel. Idempotent.
    pub fn close(&self) {
        self.shared.closed.cancel();
        self.shared.consumed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Completes when the channel is closed.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// A signal that fires on close, for linking with other waits.
    pub fn signal(&self) -> Signal {
        self.shared.closed.child_token()
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_sends_complete_without_receiver() {
        let ch = Channel::new(2);
        ch.send(1).await.unwrap();
        ch.send(2).await.unwrap();
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.recv().await, Some(1));
        assert_eq!(ch.recv().await, Some(2));
    }

    #[tokio::test]
    async fn rendezvous_send_waits_for_recv() {
        let ch = Channel::new(0);
        let tx = ch.clone();

        let sender = tokio::spawn(async move { tx.send(7).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished(), "capacity-0 send must wait for recv");

        assert_eq!(ch.recv().await, Some(7));
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ch = Channel::new(4);
        ch.close();
        assert_eq!(ch.send(1).await, Err(SendError));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains() {
        let ch = Channel::new(4);
        ch.send(1).await.unwrap();
        ch.send(2).await.unwrap();
        for _ in 0..3 {
            ch.close();
        }
        assert_eq!(ch.recv().await, Some(1));
        assert_eq!(ch.recv().await, Some(2));
        assert_eq!(ch.recv().await, None);
        assert_eq!(ch.recv().await, None);
    }

    #[tokio::test]
    async fn close_wakes_pending_recv() {
        let ch: Channel<u32> = Channel::new(1);
        let rx = ch.clone();
        let receiver = tokio::spawn(async move { rx.recv().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close();
        assert_eq!(receiver.await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_wakes_blocked_sender() {
        let ch = Channel::new(0);
        let tx = ch.clone();
        let sender = tokio::spawn(async move { tx.send(1).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.close();
        assert_eq!(sender.await.unwrap(), Err(SendError));
    }

    #[tokio::test]
    async fn recv_cancel_terminates_without_error() {
        let ch: Channel<u32> = Channel::new(1);
        let cancel = Signal::new();
        let rx = ch.clone();
        let c = cancel.clone();
        let receiver = tokio::spawn(async move { rx.recv_cancel(&c).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert_eq!(receiver.await.unwrap(), None);
        assert!(!ch.is_closed(), "cancel must not close the channel");
    }

    #[tokio::test]
    async fn signal_fires_on_close() {
        let ch: Channel<u32> = Channel::new(1);
        let signal = ch.signal();
        assert!(!signal.is_cancelled());
        ch.close();
        tokio::time::timeout(Duration::from_secs(1), signal.cancelled())
            .await
            .expect("close must fire the channel signal");
    }
}
