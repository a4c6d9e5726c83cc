//! Cancellable push subscriptions.
//!
//! A [`Publisher`] and its [`Subscription`] share a liveness flag. Once the
//! subscription is cancelled (or dropped) the publisher stops delivering and
//! `next()` never yields again, even for items already sitting in the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn channel<T>() -> (Publisher<T>, Subscription<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let live = Arc::new(AtomicBool::new(true));
    (
        Publisher {
            tx,
            live: live.clone(),
        },
        Subscription { rx, live },
    )
}

pub struct Publisher<T> {
    tx: mpsc::UnboundedSender<T>,
    live: Arc<AtomicBool>,
}

impl<T> Publisher<T> {
    /// Returns false once the subscriber is gone.
    pub fn publish(&self, item: T) -> bool {
        if !self.live.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(item).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        !self.live.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            live: self.live.clone(),
        }
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    live: Arc<AtomicBool>,
}

impl<T> Subscription<T> {
    pub async fn next(&mut self) -> Option<T> {
        if !self.is_active() {
            return None;
        }
        let item = self.rx.recv().await?;
        // cancel() may have raced with the delivery
        if self.is_active() {
            Some(item)
        } else {
            None
        }
    }

    pub fn cancel(&mut self) {
        self.live.store(false, Ordering::Release);
        self.rx.close();
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.live.store(false, Ordering::Release);
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_items_arrive_in_order() {
        let (tx, mut rx) = channel();
        for i in 0..5 {
            assert!(tx.publish(i));
        }
        for i in 0..5 {
            assert_eq!(rx.next().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_no_delivery_after_cancel() {
        let (tx, mut rx) = channel();
        assert!(tx.publish(1));
        rx.cancel();
        assert!(!tx.publish(2));
        assert!(tx.is_closed());
        // the queued item is discarded too
        assert_eq!(rx.next().await, None);
    }

    #[test]
    fn test_drop_closes_publisher() {
        let (tx, rx) = channel::<u8>();
        drop(rx);
        assert!(tx.is_closed());
        assert!(!tx.publish(7));
    }
}
