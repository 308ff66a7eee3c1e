//! The per-connection server: a method table, a middleware stack, and a
//! liveness watchdog, driven over one transport per accepted socket.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use tether_session::adapter::{CloseInfo, Socket};
use tether_session::error::{CloseReason, DispatchError, ErrorSink, default_error_sink};
use tether_session::pending::PendingQueries;
use tether_session::transport::{Dispatcher, IncomingCall, Transport, TransportConfig};
use tether_wire::{Transforms, Value};

use crate::context::{ConnectionContext, Context};
use crate::middleware::{Middleware, MiddlewareStack, Outcome};

/// How a handler failed.
#[derive(Debug)]
pub enum HandlerError {
    /// Safe to surface to the remote caller verbatim. This is the designated
    /// class handlers use for messages meant for the client.
    Client(String),
    /// Anything else: reported to the error sink, surfaced remotely as the
    /// opaque "request failed" marker. The cause never leaks to the client.
    Internal(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn client(message: impl Into<String>) -> Self {
        HandlerError::Client(message.into())
    }

    pub fn internal(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Internal(cause.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Client(message) => write!(f, "{message}"),
            HandlerError::Internal(cause) => write!(f, "{cause}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

/// A dispatched method implementation.
pub trait Handler: Send + Sync {
    fn call(&self, ctx: Context, params: Vec<Value>) -> HandlerFuture;
}

struct FnHandler<F>(F);

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Context, Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    fn call(&self, ctx: Context, params: Vec<Value>) -> HandlerFuture {
        Box::pin((self.0)(ctx, params))
    }
}

/// Connection-level hook, invoked before the first dispatch on a socket.
pub type ConnectionHook = Arc<dyn Fn(&Arc<ConnectionContext>) + Send + Sync>;

/// Server configuration, builder style.
pub struct ServerBuilder {
    methods: HashMap<String, Arc<dyn Handler>>,
    middleware: MiddlewareStack,
    transforms: Transforms,
    ping_timeout: Duration,
    pong_timeout: Duration,
    on_error: ErrorSink,
    on_connection: Option<ConnectionHook>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            middleware: MiddlewareStack::default(),
            transforms: Transforms::new(),
            ping_timeout: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(1),
            on_error: default_error_sink(),
            on_connection: None,
        }
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method.
    pub fn route<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.methods.insert(name.into(), Arc::new(FnHandler(handler)));
        self
    }

    /// Append a middleware layer. Layers run in registration order.
    pub fn middleware(mut self, layer: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(layer));
        self
    }

    pub fn transforms(mut self, transforms: Transforms) -> Self {
        self.transforms = transforms;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    pub fn on_error(mut self, sink: ErrorSink) -> Self {
        self.on_error = sink;
        self
    }

    /// Hook invoked once per accepted socket, before any dispatch; used to
    /// preset per-connection context.
    pub fn on_connection(
        mut self,
        hook: impl Fn(&Arc<ConnectionContext>) + Send + Sync + 'static,
    ) -> Self {
        self.on_connection = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                methods: self.methods,
                middleware: self.middleware,
                transforms: Arc::new(self.transforms),
                ping_timeout: self.ping_timeout,
                pong_timeout: self.pong_timeout,
                on_error: self.on_error,
                on_connection: self.on_connection,
            }),
        }
    }
}

struct ServerInner {
    methods: HashMap<String, Arc<dyn Handler>>,
    middleware: MiddlewareStack,
    transforms: Arc<Transforms>,
    ping_timeout: Duration,
    pong_timeout: Duration,
    on_error: ErrorSink,
    on_connection: Option<ConnectionHook>,
}

/// A tether server. Cheap to clone; one instance serves many sockets.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Drive one accepted socket until it closes. Each socket gets its own
    /// transport, connection context, and liveness watchdog.
    pub async fn serve<S: Socket>(&self, socket: S) -> CloseInfo {
        let conn = Arc::new(ConnectionContext::new());
        if let Some(hook) = &self.inner.on_connection {
            hook(&conn);
        }
        let dispatcher = Arc::new(ServerDispatcher {
            inner: self.inner.clone(),
            conn,
        });
        let transport = Transport::spawn(
            socket,
            Arc::new(PendingQueries::new()),
            dispatcher,
            TransportConfig {
                transforms: self.inner.transforms.clone(),
                on_error: self.inner.on_error.clone(),
            },
        );
        let watchdog = tokio::spawn(run_liveness(
            transport.clone(),
            self.inner.ping_timeout,
            self.inner.pong_timeout,
        ));
        let info = transport.closed().await;
        watchdog.abort();
        info
    }
}

struct ServerDispatcher {
    inner: Arc<ServerInner>,
    conn: Arc<ConnectionContext>,
}

impl Dispatcher for ServerDispatcher {
    fn dispatch(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>> {
        let inner = self.inner.clone();
        let conn = self.conn.clone();
        Box::pin(async move {
            let Some(handler) = inner.methods.get(&call.method).cloned() else {
                return Err(DispatchError::Client(format!(
                    "Unknown method: {}",
                    call.method
                )));
            };
            let ctx = Context::new(conn, &call.method);
            if let Err(rejection) = inner.middleware.pre(&ctx, &call.params).await {
                inner
                    .middleware
                    .post(&ctx, Outcome::Rejected(&rejection))
                    .await;
                return Err(DispatchError::Client(rejection.message));
            }
            let result = handler.call(ctx.clone(), call.params).await;
            let outcome = match &result {
                Ok(value) => Outcome::Success(value),
                Err(error) => Outcome::Error(error),
            };
            inner.middleware.post(&ctx, outcome).await;
            match result {
                Ok(value) => Ok(value),
                Err(HandlerError::Client(message)) => Err(DispatchError::Client(message)),
                Err(HandlerError::Internal(cause)) => {
                    (inner.on_error)(cause.as_ref());
                    Err(DispatchError::Failed)
                }
            }
        })
    }
}

/// Close sockets that have gone silent: wake at `ping_timeout` past the last
/// message, probe, and close if the probe goes unanswered.
async fn run_liveness(transport: Transport, ping_timeout: Duration, pong_timeout: Duration) {
    loop {
        if transport.is_closed() {
            break;
        }
        let idle = transport.time_since_last_message();
        if idle < ping_timeout {
            tokio::select! {
                _ = tokio::time::sleep(ping_timeout - idle) => {}
                _ = transport.closed() => break,
            }
            continue;
        }
        if !transport.ping(pong_timeout).await {
            debug!("peer silent past ping timeout, closing");
            transport.close(CloseReason::ConnectionClosed).await;
            break;
        }
    }
}
