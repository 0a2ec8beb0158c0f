//! Fan-out of state changes and notifications to any number of subscribers.
//!
//! A feed keeps one unbounded channel per subscriber, so no subscriber can make
//! another one lag or miss a value. Closed subscribers are pruned on the next
//! publish. A replaying feed also remembers the latest value and hands it to
//! every new subscriber first. Closing a feed ends every subscription once it
//! has drained.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

struct FeedInner<T> {
    latest: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

pub struct EventFeed<T> {
    inner: Arc<Mutex<FeedInner<T>>>,
    replay: bool,
}

impl<T> Clone for EventFeed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            replay: self.replay,
        }
    }
}

impl<T: Clone> EventFeed<T> {
    /// A feed whose subscribers first receive the latest published value.
    pub fn replaying(initial: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                latest: Some(initial),
                subscribers: Vec::new(),
                closed: false,
            })),
            replay: true,
        }
    }

    /// A feed that only delivers values published after subscribing.
    pub fn live() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                latest: None,
                subscribers: Vec::new(),
                closed: false,
            })),
            replay: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeedInner<T>> {
        // A panic while holding the lock cannot leave the vector half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        if self.replay {
            inner.latest = Some(value);
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        if let Some(latest) = inner.latest.clone() {
            let _ = tx.send(latest);
        }
        // On a closed feed the sender is dropped here, so the subscription ends after the replay.
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        Subscription { rx }
    }

    /// Ends every current and future subscription. Values already delivered
    /// can still be received.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    /// The latest published value, for replaying feeds.
    pub fn latest(&self) -> Option<T> {
        self.lock().latest.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.lock();
        inner.subscribers.retain(|subscriber| !subscriber.is_closed());
        inner.subscribers.len()
    }
}

/// Receiving end of an [`EventFeed`]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Waits for the next value. `None` once the session has shut down.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes an already delivered value without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn replaying_feed_delivers_latest_then_every_change() {
        let feed = EventFeed::replaying(0u8);
        feed.publish(1);
        let mut sub = feed.subscribe();
        feed.publish(2);
        feed.publish(3);

        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.next().await, Some(3));
        assert_eq!(feed.latest(), Some(3));
    }

    #[tokio::test]
    async fn live_feed_skips_values_published_before_subscribing() {
        let feed = EventFeed::live();
        feed.publish("missed");
        let mut sub = feed.subscribe();
        feed.publish("seen");

        assert_eq!(sub.recv().await, Some("seen"));
        assert_eq!(sub.try_recv(), None);
        assert_eq!(feed.latest(), None);
    }

    #[tokio::test]
    async fn closing_ends_subscriptions_after_they_drain() {
        let feed = EventFeed::replaying("idle");
        let mut early = feed.subscribe();
        feed.publish("busy");
        feed.close();
        feed.publish("ignored");

        assert_eq!(early.recv().await, Some("idle"));
        assert_eq!(early.recv().await, Some("busy"));
        assert_eq!(early.recv().await, None);

        let mut late = feed.subscribe();
        assert_eq!(late.next().await, Some("busy"));
        assert_eq!(late.next().await, None);
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let feed = EventFeed::live();
        let keep = feed.subscribe();
        drop(feed.subscribe());
        feed.publish(7u32);

        assert_eq!(feed.subscriber_count(), 1);
        drop(keep);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
