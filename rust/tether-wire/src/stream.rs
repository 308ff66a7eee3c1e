//! Lazy sequences: bounded channels with a cancel capability.
//!
//! A [`ValueStream`] is the consumer end of a lazy sequence. On the wire it
//! is replaced by an integer stream id; locally it is a bounded channel, so a
//! slow consumer exerts backpressure on the producer.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::value::Value;

/// Buffer capacity used for lazy sequences unless a producer picks its own.
pub const STREAM_BUFFER: usize = 64;

/// Why a sequence stopped yielding values before its natural end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The transport carrying this sequence died.
    ConnectionClosed,
    /// The producer aborted with an error.
    Remote(String),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::ConnectionClosed => write!(f, "connection closed"),
            StreamError::Remote(msg) => write!(f, "stream error: {msg}"),
        }
    }
}

impl std::error::Error for StreamError {}

type Item = Result<Value, StreamError>;
type CancelHook = Box<dyn FnOnce(String) + Send>;

struct StreamShared {
    rx: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    on_cancel: Mutex<Option<CancelHook>>,
}

/// The consumer end of a lazy sequence.
///
/// Cloning shares the same underlying channel; sequences have a single
/// consumer, clones exist so the handle can live inside a [`Value`].
#[derive(Clone)]
pub struct ValueStream {
    shared: Arc<StreamShared>,
}

/// The producer end of a lazy sequence.
///
/// Dropping every sender ends the sequence normally; [`StreamSender::error`]
/// ends it with an error.
#[derive(Clone)]
pub struct StreamSender {
    tx: mpsc::Sender<Item>,
}

/// Create a connected producer/consumer pair with the given buffer capacity.
pub fn stream_channel(capacity: usize) -> (StreamSender, ValueStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = ValueStream {
        shared: Arc::new(StreamShared {
            rx: tokio::sync::Mutex::new(rx),
            on_cancel: Mutex::new(None),
        }),
    };
    (StreamSender { tx }, stream)
}

impl ValueStream {
    /// A finite sequence over pre-computed values.
    pub fn from_values(items: Vec<Value>) -> Self {
        let (tx, stream) = stream_channel(items.len() + 1);
        for item in items {
            // Capacity covers every item, so this cannot fail.
            let _ = tx.try_send(item);
        }
        stream
    }

    /// Next item: `Some(Ok(value))` per produced value, `Some(Err(..))` if
    /// the producer aborted, `None` at the natural end.
    pub async fn recv(&self) -> Option<Item> {
        self.shared.rx.lock().await.recv().await
    }

    /// Drain the sequence, collecting values until the natural end.
    pub async fn collect(&self) -> Result<Vec<Value>, StreamError> {
        let mut out = Vec::new();
        while let Some(item) = self.recv().await {
            out.push(item?);
        }
        Ok(out)
    }

    /// Discard the sequence. Fires the cancel hook (which, for a remote
    /// sequence, sends a cancel frame upstream) and closes the channel so a
    /// local producer observes closure.
    pub fn cancel(&self, reason: &str) {
        if let Some(hook) = self.shared.on_cancel.lock().take() {
            hook(reason.to_string());
        }
        if let Ok(mut rx) = self.shared.rx.try_lock() {
            rx.close();
        }
    }

    /// Install the hook invoked on [`cancel`](Self::cancel). At most one
    /// hook; installing again replaces the previous one.
    pub fn set_cancel_hook(&self, hook: impl FnOnce(String) + Send + 'static) {
        *self.shared.on_cancel.lock() = Some(Box::new(hook));
    }

    /// True if both handles view the same sequence.
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ValueStream")
    }
}

impl StreamSender {
    /// Push the next value, waiting for buffer space. Fails once the
    /// consumer is gone.
    pub async fn send(&self, value: Value) -> Result<(), StreamClosed> {
        self.tx.send(Ok(value)).await.map_err(|_| StreamClosed)
    }

    /// Push without waiting; fails when the buffer is full or the consumer
    /// is gone.
    pub fn try_send(&self, value: Value) -> Result<(), StreamClosed> {
        self.tx.try_send(Ok(value)).map_err(|_| StreamClosed)
    }

    /// End the sequence with an error.
    pub async fn error(self, message: impl Into<String>) {
        let _ = self.tx.send(Err(StreamError::Remote(message.into()))).await;
    }

    /// End the sequence with a specific error value.
    pub async fn fail(self, error: StreamError) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// True once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

impl fmt::Debug for StreamSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StreamSender")
    }
}

/// The consumer of a sequence has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl fmt::Display for StreamClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream closed")
    }
}

impl std::error::Error for StreamClosed {}
