//! End-to-end scenarios over in-process sockets: a full client stack talking
//! to a full server stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tether::session::mem::MemoryAdapter;
use tether::{
    Backoff, CallError, Channel, Client, ClientBuilder, ConnectionHandle, Context, HandlerError,
    Middleware, Rejection, Server, SubscribeOptions, Value, ValueStream, stream_channel,
};

const TICK: Duration = Duration::from_millis(50);

fn serve_mem(server: Server) -> MemoryAdapter {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let (adapter, mut accepts) = MemoryAdapter::new();
    tokio::spawn(async move {
        while let Some(socket) = accepts.recv().await {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(socket).await;
            });
        }
    });
    adapter
}

fn connect(server: Server) -> Client<MemoryAdapter> {
    let adapter = serve_mem(server);
    ClientBuilder::new("mem://scenarios", adapter)
        .backoff(Backoff {
            starting_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            ..Backoff::default()
        })
        .connect()
}

async fn eventually<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(10), fut)
        .await
        .expect("scenario timed out")
}

#[tokio::test]
async fn simple_call() {
    let server = Server::builder()
        .route("add", |_ctx, params: Vec<Value>| async move {
            let a = params[0]
                .as_i64()
                .ok_or_else(|| HandlerError::client("add takes integers"))?;
            let b = params[1]
                .as_i64()
                .ok_or_else(|| HandlerError::client("add takes integers"))?;
            Ok(Value::Int(a + b))
        })
        .build();
    let client = connect(server);

    let result = eventually(client.call("add", vec![123i64.into(), 456i64.into()])).await;
    assert_eq!(result, Ok(Value::Int(579)));
}

#[tokio::test]
async fn null_and_void_results_are_distinct_and_neither_hangs() {
    let server = Server::builder()
        .route("nullReturn", |_ctx, _params| async move { Ok(Value::Null) })
        .route("voidReturn", |_ctx, _params| async move { Ok(Value::Absent) })
        .build();
    let client = connect(server);

    let null = eventually(client.call("nullReturn", vec![])).await;
    let void = eventually(client.call("voidReturn", vec![])).await;
    assert_eq!(null, Ok(Value::Null));
    assert_eq!(void, Ok(Value::Absent));
    assert_ne!(null, void);
}

/// Per-connection context value preset by the connection hook.
#[derive(Clone, Copy)]
struct Preset(i64);

#[tokio::test]
async fn finite_stream_reads_connection_context() {
    let server = Server::builder()
        .on_connection(|conn| {
            conn.with(|ext| {
                ext.insert(Preset(100));
            });
        })
        .route("list", |ctx: Context, params: Vec<Value>| async move {
            let a = params[0]
                .as_i64()
                .ok_or_else(|| HandlerError::client("list takes an integer"))?;
            let preset = ctx
                .get::<Preset>()
                .map(|p| p.0)
                .ok_or_else(|| HandlerError::client("context not preset"))?;
            Ok(Value::Stream(ValueStream::from_values(vec![
                a.into(),
                (a + 1).into(),
                (a + 2).into(),
                (a + 3).into(),
                preset.into(),
            ])))
        })
        .build();
    let client = connect(server);

    let result = eventually(client.call("list", vec![10i64.into()])).await.unwrap();
    let stream = result.as_stream().expect("stream result");
    let items = eventually(stream.collect()).await.unwrap();
    assert_eq!(
        items,
        vec![
            Value::Int(10),
            Value::Int(11),
            Value::Int(12),
            Value::Int(13),
            Value::Int(100)
        ]
    );
}

#[tokio::test]
async fn channel_fan_out_sequence() {
    let server = Server::builder()
        .route("getRangeChannel", |_ctx, params: Vec<Value>| async move {
            let start = params[0]
                .as_i64()
                .ok_or_else(|| HandlerError::client("range takes integers"))?;
            let end = params[1]
                .as_i64()
                .ok_or_else(|| HandlerError::client("range takes integers"))?;

            let channel = Channel::new();
            // Subscriber count is read before this subscriber registers.
            let first = start + channel.subscriber_count() as i64;
            let stream = channel.subscribe(Value::Int(first));

            tokio::spawn(async move {
                let mut a = start;
                loop {
                    tokio::time::sleep(TICK).await;
                    a += 1;
                    let n = a + channel.subscriber_count() as i64;
                    channel.push(Value::Int(n)).await;
                    if a == end {
                        channel.push(Value::Int(0)).await;
                        break;
                    }
                }
            });

            Ok(Value::Stream(stream))
        })
        .build();
    let client = connect(server);

    let result = eventually(client.call("getRangeChannel", vec![3i64.into(), 7i64.into()]))
        .await
        .unwrap();
    let stream = result.as_stream().expect("stream result");
    let items = eventually(stream.collect()).await.unwrap();
    assert_eq!(
        items,
        vec![
            Value::Int(3),
            Value::Int(5),
            Value::Int(6),
            Value::Int(7),
            Value::Int(8),
            Value::Int(0)
        ]
    );
}

/// Per-connection counter incremented by middleware before every handler.
#[derive(Clone, Copy, Default)]
struct MwCounter(i64);

struct CountingMiddleware;

impl Middleware for CountingMiddleware {
    fn pre<'a>(
        &'a self,
        ctx: &'a Context,
        _params: &'a [Value],
    ) -> Pin<Box<dyn Future<Output = Result<(), Rejection>> + Send + 'a>> {
        Box::pin(async move {
            ctx.update::<MwCounter, _>(|c| c.0 += 1);
            Ok(())
        })
    }
}

#[tokio::test]
async fn middleware_counter_increments_per_call() {
    let server = Server::builder()
        .middleware(CountingMiddleware)
        .route("readMwCounterCtx", |ctx: Context, _params| async move {
            let count = ctx.get::<MwCounter>().map(|c| c.0).unwrap_or_default();
            Ok(Value::Int(count))
        })
        .build();
    let client = connect(server);

    for expected in 1..=3i64 {
        let result = eventually(client.call("readMwCounterCtx", vec![])).await;
        assert_eq!(result, Ok(Value::Int(expected)));
    }
}

#[tokio::test]
async fn handler_errors_split_into_safe_and_opaque() {
    let server = Server::builder()
        .route("safe", |_ctx, _params| async move {
            Err::<Value, _>(HandlerError::client("no such user"))
        })
        .route("unsafe", |_ctx, _params| async move {
            Err::<Value, _>(HandlerError::internal("db password wrong"))
        })
        .build();
    let client = connect(server);

    assert_eq!(
        eventually(client.call("safe", vec![])).await,
        Err(CallError::Remote("no such user".into()))
    );
    assert_eq!(
        eventually(client.call("unsafe", vec![])).await,
        Err(CallError::Failed)
    );
    assert_eq!(
        eventually(client.call("missing", vec![])).await,
        Err(CallError::Remote("Unknown method: missing".into()))
    );
}

#[tokio::test]
async fn subscription_survives_a_killed_connection() {
    let subscriptions = Arc::new(AtomicU32::new(0));
    let subs = subscriptions.clone();
    let server = Server::builder()
        .route("feed", move |_ctx, _params| {
            let ordinal = subs.fetch_add(1, Ordering::SeqCst);
            async move {
                let (tx, stream) = stream_channel(4);
                tokio::spawn(async move {
                    if ordinal == 0 {
                        // First subscription: two items, then hold the
                        // sequence open until the connection dies.
                        let _ = tx.send(Value::Int(1)).await;
                        let _ = tx.send(Value::Int(2)).await;
                        tx.closed().await;
                    } else {
                        let _ = tx.send(Value::Int(3)).await;
                    }
                });
                Ok(Value::Stream(stream))
            }
        })
        .build();

    let adapter = serve_mem(server);
    let connections: Arc<Mutex<Vec<ConnectionHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_connections = connections.clone();
    let client = ClientBuilder::new("mem://feed", adapter)
        .backoff(Backoff {
            starting_delay: Duration::from_millis(5),
            ..Backoff::default()
        })
        .on_connection(move |handle| {
            seen_connections.lock().push(handle);
        })
        .connect();

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let subscription = client.subscribe(
        "feed",
        vec![],
        move |value| {
            let _ = seen_tx.send(value.as_i64().unwrap_or_default());
            Ok(())
        },
        SubscribeOptions::default(),
    );

    assert_eq!(eventually(seen.recv()).await, Some(1));
    assert_eq!(eventually(seen.recv()).await, Some(2));

    // Kill the socket under the subscription; the helper re-issues the call
    // and keeps feeding the same observer.
    let first = connections.lock()[0].clone();
    first.close(1000).await;

    assert_eq!(eventually(seen.recv()).await, Some(3));
    eventually(subscription.join()).await;
    assert_eq!(subscriptions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_liveness_probe_closes_with_going_away() {
    // Accept sockets but never serve them: the client's pings go unanswered.
    let (adapter, mut accepts) = MemoryAdapter::new();
    tokio::spawn(async move {
        let mut parked = Vec::new();
        while let Some(socket) = accepts.recv().await {
            parked.push(socket);
        }
    });

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    let client = ClientBuilder::new("mem://silent", adapter)
        .ping_interval(Duration::from_millis(30))
        .pong_timeout(Duration::from_millis(30))
        .on_connection(move |handle| {
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let info = handle.closed().await;
                let _ = closed_tx.send(info);
            });
        })
        .connect();

    let info = eventually(closed_rx.recv()).await.expect("close info");
    assert_eq!(info.code, 1001);
    drop(client);
}
