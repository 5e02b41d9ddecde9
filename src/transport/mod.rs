//! In-process publish/subscribe transport.
//!
//! Bounded channel pairs stand in for the external transport: each topic
//! is a `(Publisher, Subscriber)` pair over a bounded crossbeam channel.
//! Frame streams are lossy by design: publishing to a full topic drops
//! the oldest queued message rather than blocking the producer.
//!
//! Advertisement is tracked through an `Arc`/`Weak` token so a subscriber
//! can tell whether any publisher for its topic is alive before blocking
//! on data.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

/// Sending half of a topic.
pub struct Publisher<T> {
    topic: String,
    tx: Sender<T>,
    /// Receiver clone used to evict the oldest message when full.
    rx: Receiver<T>,
    /// Keeps the topic advertised while any publisher clone is alive.
    _token: Arc<()>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            topic: self.topic.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            _token: Arc::clone(&self._token),
        }
    }
}

impl<T> Publisher<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish a message. If the queue is full the oldest pending
    /// message is evicted first; the producer never blocks.
    pub fn publish(&self, msg: T) {
        if let Err(TrySendError::Full(msg)) = self.tx.try_send(msg) {
            let _ = self.rx.try_recv();
            let _ = self.tx.try_send(msg);
        }
    }
}

/// Receiving half of a topic.
pub struct Subscriber<T> {
    topic: String,
    rx: Receiver<T>,
    advertised: Weak<()>,
}

impl<T> Subscriber<T> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Whether any publisher for this topic is currently alive.
    pub fn is_advertised(&self) -> bool {
        self.advertised.strong_count() > 0
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocking receive with timeout; `None` on timeout or disconnect.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(msg) = self.try_recv() {
            out.push(msg);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Create a topic with the given bounded queue depth.
pub fn topic<T>(name: &str, depth: usize) -> (Publisher<T>, Subscriber<T>) {
    let (tx, rx) = bounded(depth.max(1));
    let token = Arc::new(());
    let advertised = Arc::downgrade(&token);
    (
        Publisher {
            topic: name.to_string(),
            tx,
            rx: rx.clone(),
            _token: token,
        },
        Subscriber {
            topic: name.to_string(),
            rx,
            advertised,
        },
    )
}
