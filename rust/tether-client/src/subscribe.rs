//! Restartable subscriptions.
//!
//! `subscribe` is the one place the framework re-issues a call on its own.
//! Scalar calls have ambiguous idempotence and must fail loudly; a
//! subscription is a snapshot-plus-updates sequence the server rebuilds per
//! subscriber, so when the transport dies mid-stream the loop silently
//! issues the same call again and keeps feeding the same observer.

use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tether_session::adapter::SocketAdapter;
use tether_session::error::{CallError, ErrorSink};
use tether_wire::{StreamError, Value};

use crate::client::Client;

/// Per-item callback. An error is reported to the subscription's error sink
/// but does not terminate the subscription.
pub type ObserverError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Default)]
pub struct SubscribeOptions {
    /// Aborting this token cancels the inbound sequence (sending a cancel
    /// frame upstream) and ends the subscription.
    pub signal: CancellationToken,
    /// Overrides the client's error sink for this subscription.
    pub on_error: Option<ErrorSink>,
}

/// A running subscription task.
pub struct Subscription {
    signal: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Stop the subscription: cancels the inbound sequence and exits.
    pub fn abort(&self) {
        self.signal.cancel();
    }

    /// Wait for the subscription loop to finish (natural end of the
    /// sequence, a terminal error, or an abort).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The call resolved to something that is not a lazy sequence.
#[derive(Debug)]
pub struct NotAStream;

impl fmt::Display for NotAStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscription target did not return a stream")
    }
}

impl std::error::Error for NotAStream {}

impl<A: SocketAdapter> Client<A> {
    /// Subscribe to a method returning a lazy sequence, invoking `observer`
    /// for each item. Re-issues the call and resubscribes whenever the
    /// transport dies mid-sequence.
    pub fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
        observer: impl FnMut(Value) -> Result<(), ObserverError> + Send + 'static,
        options: SubscribeOptions,
    ) -> Subscription {
        let client = self.clone();
        let method = method.to_string();
        let signal = options.signal.clone();
        let on_error = options.on_error.unwrap_or_else(|| client.on_error());
        let task_signal = signal.clone();

        let task = tokio::spawn(async move {
            let mut observer = observer;
            loop {
                let called = tokio::select! {
                    _ = task_signal.cancelled() => return,
                    result = client.call(&method, params.clone()) => result,
                };
                let stream = match called {
                    // The resubscribe trigger: the transport died while the
                    // call (or its reconnect queue slot) was outstanding.
                    Err(CallError::ConnectionClosed) => {
                        if client.is_dead() {
                            (on_error)(&CallError::ConnectionClosed);
                            return;
                        }
                        debug!(method = %method, "resubscribing after disconnect");
                        continue;
                    }
                    Err(error) => {
                        (on_error)(&error);
                        return;
                    }
                    Ok(Value::Stream(stream)) => stream,
                    Ok(_) => {
                        (on_error)(&NotAStream);
                        return;
                    }
                };

                loop {
                    let item = tokio::select! {
                        _ = task_signal.cancelled() => {
                            stream.cancel("subscription aborted");
                            return;
                        }
                        item = stream.recv() => item,
                    };
                    match item {
                        Some(Ok(value)) => {
                            if let Err(error) = observer(value) {
                                (on_error)(error.as_ref());
                            }
                        }
                        Some(Err(StreamError::ConnectionClosed)) => {
                            debug!(method = %method, "stream lost, resubscribing");
                            break;
                        }
                        Some(Err(error)) => {
                            (on_error)(&error);
                            return;
                        }
                        None => return,
                    }
                }
            }
        });

        Subscription { signal, task }
    }
}
