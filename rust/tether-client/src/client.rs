//! The client connection manager.
//!
//! A [`Client`] owns one long-lived connect loop. While a socket is up, calls
//! go straight to the attached transport; while it is down, they queue, and
//! the next successful attach flushes the queue in enqueue order before
//! anything later is sent. The request id counter and pending-query table
//! live here, outside any transport, so ids survive reconnects and never
//! repeat.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tether_session::adapter::{CLOSE_GOING_AWAY, CloseInfo, SocketAdapter};
use tether_session::error::{CallError, CloseReason, ErrorSink, default_error_sink};
use tether_session::pending::PendingQueries;
use tether_session::transport::{NoMethods, Transport, TransportConfig};
use tether_wire::{Message, Transforms, Value};

use crate::backoff::{Backoff, RetryError, retry};

/// Decides whether a failed connect attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&io::Error, u32) -> bool + Send + Sync>;

/// Invoked on every successful attach.
pub type ConnectionHook = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;

/// Handle to one live socket, passed to the connection hook.
#[derive(Clone)]
pub struct ConnectionHandle {
    transport: Transport,
}

impl ConnectionHandle {
    /// Resolves when this socket terminates.
    pub async fn closed(&self) -> CloseInfo {
        self.transport.closed().await
    }

    /// Close this socket with the given code. The client's connect loop will
    /// reconnect unless it has been aborted.
    pub async fn close(&self, code: u16) {
        self.transport
            .close_with_code(code, CloseReason::ConnectionClosed)
            .await;
    }
}

/// Client configuration, builder style.
pub struct ClientBuilder<A> {
    url: String,
    adapter: A,
    backoff: Backoff,
    retry_predicate: RetryPredicate,
    transforms: Transforms,
    ping_interval: Duration,
    pong_timeout: Duration,
    signal: CancellationToken,
    on_error: ErrorSink,
    on_connection: Option<ConnectionHook>,
}

impl<A: SocketAdapter> ClientBuilder<A> {
    pub fn new(url: impl Into<String>, adapter: A) -> Self {
        Self {
            url: url.into(),
            adapter,
            backoff: Backoff::default(),
            retry_predicate: Arc::new(|_, _| true),
            transforms: Transforms::new(),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(1),
            signal: CancellationToken::new(),
            on_error: default_error_sink(),
            on_connection: None,
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn retry_predicate(
        mut self,
        predicate: impl Fn(&io::Error, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Ambient cancellation: cancelling this token aborts the connect loop,
    /// closes any attached socket, and fails pending work.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = signal;
        self
    }

    pub fn on_error(mut self, sink: ErrorSink) -> Self {
        self.on_error = sink;
        self
    }

    pub fn on_connection(
        mut self,
        hook: impl Fn(ConnectionHandle) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(hook));
        self
    }

    /// Start the connect loop and hand back the client. Connecting happens
    /// in the background; calls issued before the first attach are queued.
    pub fn connect(self) -> Client<A> {
        let shared = Arc::new(ClientShared {
            url: self.url,
            adapter: self.adapter,
            backoff: self.backoff,
            retry_predicate: self.retry_predicate,
            config: TransportConfig {
                transforms: Arc::new(self.transforms),
                on_error: self.on_error.clone(),
            },
            ping_interval: self.ping_interval,
            pong_timeout: self.pong_timeout,
            signal: self.signal,
            on_error: self.on_error,
            on_connection: self.on_connection,
            pending: Arc::new(PendingQueries::new()),
            state: Mutex::new(ClientState {
                queue: Vec::new(),
                transport: None,
                dead: false,
            }),
        });
        tokio::spawn(run_connect_loop(shared.clone()));
        Client { shared }
    }
}

struct ClientState {
    /// Requests buffered while no transport is attached.
    queue: Vec<Message>,
    transport: Option<Transport>,
    /// Set once the connect loop has exited; nothing will flush the queue
    /// again, so new calls fail immediately.
    dead: bool,
}

struct ClientShared<A> {
    url: String,
    adapter: A,
    backoff: Backoff,
    retry_predicate: RetryPredicate,
    config: TransportConfig,
    ping_interval: Duration,
    pong_timeout: Duration,
    signal: CancellationToken,
    on_error: ErrorSink,
    on_connection: Option<ConnectionHook>,
    pending: Arc<PendingQueries>,
    state: Mutex<ClientState>,
}

/// A reconnecting RPC client. Cheap to clone; clones share the connection.
pub struct Client<A: SocketAdapter> {
    pub(crate) shared: Arc<ClientShared<A>>,
}

impl<A: SocketAdapter> Clone for Client<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: SocketAdapter> Client<A> {
    /// Invoke a remote method. Sends immediately when connected, otherwise
    /// queues until the next attach. Scalar calls are never retried: if the
    /// socket drops first, the caller sees [`CallError::ConnectionClosed`].
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, CallError> {
        let rx = self.issue(method, params).await;
        match rx.await {
            Ok(result) => result,
            // The slot was dropped without completing: local cancellation.
            Err(_) => Err(CallError::Cancelled),
        }
    }

    /// Start a call and hand back its response slot without awaiting it.
    /// Useful for holding several in-flight calls at once; [`call`](Self::call)
    /// is the common path.
    pub async fn issue(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> tokio::sync::oneshot::Receiver<Result<Value, CallError>> {
        let (id, rx) = self.shared.pending.allocate();
        let message = Message::Call {
            id,
            method: method.to_string(),
            params,
        };
        enum Route {
            Send(Transport),
            Queued,
            Dead,
        }
        let route = {
            let mut state = self.shared.state.lock();
            if state.dead {
                Route::Dead
            } else {
                match &state.transport {
                    Some(transport) => Route::Send(transport.clone()),
                    None => {
                        state.queue.push(message.clone());
                        Route::Queued
                    }
                }
            }
        };
        match route {
            Route::Send(transport) => {
                transport.send(message).await;
                // The transport may have shut down between the attachment
                // check and the send; its drain pass can miss a slot created
                // after it ran.
                if transport.is_closed() {
                    self.shared
                        .pending
                        .abandon(id, CallError::ConnectionClosed);
                }
            }
            Route::Queued => {}
            Route::Dead => {
                let error = if self.shared.signal.is_cancelled() {
                    CallError::Cancelled
                } else {
                    CallError::ConnectionClosed
                };
                self.shared.pending.reject(id, error);
            }
        }
        rx
    }

    pub(crate) fn on_error(&self) -> ErrorSink {
        self.shared.on_error.clone()
    }

    /// True once the connect loop has exited for good.
    pub fn is_dead(&self) -> bool {
        self.shared.state.lock().dead
    }

    /// The client's cancellation context.
    pub fn signal(&self) -> &CancellationToken {
        &self.shared.signal
    }

    /// Abort the client: stop reconnecting, close any attached socket with
    /// code 1000, and fail pending work.
    pub fn abort(&self) {
        self.shared.signal.cancel();
    }
}

async fn run_connect_loop<A: SocketAdapter>(shared: Arc<ClientShared<A>>) {
    loop {
        if shared.signal.is_cancelled() {
            break;
        }
        let connected = retry(
            &shared.backoff,
            &shared.signal,
            || shared.adapter.connect(&shared.url, &shared.signal),
            |error, attempt| (shared.retry_predicate)(error, attempt),
        )
        .await;
        let socket = match connected {
            Ok(socket) => socket,
            Err(RetryError::Cancelled) => break,
            Err(RetryError::Error(error)) => {
                (shared.on_error)(&error);
                break;
            }
        };

        let transport = Transport::spawn(
            socket,
            shared.pending.clone(),
            Arc::new(NoMethods),
            shared.config.clone(),
        );
        debug!(url = %shared.url, "connected");

        // Flush buffered requests in enqueue order; only once the queue is
        // empty does the transport become visible to new calls.
        loop {
            let batch = {
                let mut state = shared.state.lock();
                if state.queue.is_empty() {
                    state.transport = Some(transport.clone());
                    break;
                }
                std::mem::take(&mut state.queue)
            };
            for message in batch {
                transport.send(message).await;
            }
        }

        let pinger = tokio::spawn(run_pinger(
            transport.clone(),
            shared.ping_interval,
            shared.pong_timeout,
        ));

        if let Some(hook) = &shared.on_connection {
            hook(ConnectionHandle {
                transport: transport.clone(),
            });
        }

        tokio::select! {
            info = transport.closed() => {
                debug!(code = info.code, reason = %info.reason, "connection lost");
            }
            _ = shared.signal.cancelled() => {
                transport.close(CloseReason::ConnectionClosed).await;
                transport.closed().await;
            }
        }

        pinger.abort();
        // Idempotent: rejects anything still pending with the sentinel.
        transport.close(CloseReason::ConnectionClosed).await;
        shared.state.lock().transport = None;
    }

    // The loop is over, either aborted or out of connect attempts. Nothing will
    // ever flush the queue again, so fail what is left.
    let leftover = {
        let mut state = shared.state.lock();
        state.transport = None;
        state.dead = true;
        std::mem::take(&mut state.queue)
    };
    let error = if shared.signal.is_cancelled() {
        CallError::Cancelled
    } else {
        CallError::ConnectionClosed
    };
    if !leftover.is_empty() {
        debug!(count = leftover.len(), "dropping queued requests");
    }
    shared.pending.reject_all(error);
}

async fn run_pinger(transport: Transport, interval: Duration, pong_timeout: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if transport.is_closed() {
            break;
        }
        if !transport.ping(pong_timeout).await {
            warn!("liveness probe failed, closing socket");
            transport
                .close_with_code(CLOSE_GOING_AWAY, CloseReason::ConnectionClosed)
                .await;
            break;
        }
    }
}
