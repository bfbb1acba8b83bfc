//! Multi-subscriber broadcast of values with optional replay of the latest.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Synchronous sink invoked on the publishing task.
pub type Sink<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Inner<T> {
    last: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<T>>,
    sinks: Vec<Sink<T>>,
}

/// Fans values out to any number of subscribers.
///
/// Subscribers never block the publisher: each has its own unbounded queue
/// and a slow consumer only delays itself. With `replay` enabled a new
/// subscriber immediately receives the most recent value.
pub struct Publisher<T> {
    replay: bool,
    inner: Mutex<Inner<T>>,
}

impl<T: Clone + Send + 'static> Publisher<T> {
    pub fn new() -> Self {
        Self::with_replay(false)
    }

    /// A publisher that hands its last value to every new subscriber.
    pub fn replaying() -> Self {
        Self::with_replay(true)
    }

    fn with_replay(replay: bool) -> Self {
        Self {
            replay,
            inner: Mutex::new(Inner {
                last: None,
                subscribers: Vec::new(),
                sinks: Vec::new(),
            }),
        }
    }

    /// Delivers `value` to every live subscriber, then to every sink.
    pub fn publish(&self, value: T) {
        let sinks = {
            let mut inner = self.inner.lock();
            inner.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
            if self.replay {
                inner.last = Some(value.clone());
            }
            inner.sinks.clone()
        };
        for sink in sinks {
            sink(&value);
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last.as_ref() {
            let _ = tx.send(last.clone());
        }
        inner.subscribers.push(tx);
        Subscription { rx }
    }

    /// Runs `sink` inline on every publish, before queued subscribers see it.
    pub fn connect(&self, sink: Sink<T>) {
        self.inner.lock().sinks.push(sink);
    }

    pub fn last(&self) -> Option<T> {
        self.inner.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

impl<T: Clone + Send + 'static> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a `Publisher`. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Waits for the next value; `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// The next queued value, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_replay_latest_to_late_subscriber() {
        let publisher = Publisher::replaying();
        publisher.publish(1);
        publisher.publish(2);

        let mut late = publisher.subscribe();
        assert_eq!(late.recv().await, Some(2));
        assert_eq!(late.try_recv(), None);
    }

    #[tokio::test]
    async fn test_no_replay_without_flag() {
        let publisher = Publisher::new();
        publisher.publish(1);

        let mut sub = publisher.subscribe();
        assert_eq!(sub.try_recv(), None);
        publisher.publish(2);
        assert_eq!(sub.recv().await, Some(2));
    }

    #[test]
    fn test_sink_runs_inline() {
        let publisher: Publisher<u32> = Publisher::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        publisher.connect(Arc::new(move |v: &u32| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        }));

        publisher.publish(3);
        publisher.publish(4);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let publisher: Publisher<u32> = Publisher::new();
        let sub = publisher.subscribe();
        let _kept = publisher.subscribe();
        drop(sub);
        publisher.publish(1);
        assert_eq!(publisher.subscriber_count(), 1);
    }
}
