//! Fan-out channels: one lazy sequence per subscriber, one shared `push`.
//!
//! A `Channel` is the server-side pattern behind restartable subscriptions:
//! every `subscribe` builds a fresh sequence seeded with a caller-computed
//! first value, so a client that reconnects and subscribes again gets a
//! coherent snapshot-plus-updates view. Subscribers that cancel or vanish
//! are pruned on the next push.

use std::sync::Arc;

use parking_lot::Mutex;

use tether_wire::{StreamSender, Value, ValueStream, stream_channel};

const SUBSCRIBER_BUFFER: usize = 16;

/// A broadcast hub for lazy sequences. Cheap to clone.
#[derive(Clone, Default)]
pub struct Channel {
    subscribers: Arc<Mutex<Vec<StreamSender>>>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Register a subscriber. The returned sequence yields `first`
    /// immediately, then every subsequent [`push`](Self::push).
    pub fn subscribe(&self, first: Value) -> ValueStream {
        let (tx, stream) = stream_channel(SUBSCRIBER_BUFFER);
        // A fresh buffer always has room for the seed value.
        let _ = tx.try_send(first);
        self.subscribers.lock().push(tx);
        stream
    }

    /// Broadcast a value to every live subscriber and prune the dead ones.
    pub async fn push(&self, value: Value) {
        let senders: Vec<StreamSender> = self.subscribers.lock().clone();
        for tx in &senders {
            let _ = tx.send(value.clone()).await;
        }
        self.subscribers.lock().retain(|tx| !tx.is_closed());
    }
}
