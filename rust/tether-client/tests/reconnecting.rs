//! Integration tests for the reconnecting client over in-process sockets.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use tether_client::{Backoff, Client, ClientBuilder, SubscribeOptions};
use tether_session::error::{CallError, DispatchError};
use tether_session::mem::{MemoryAdapter, MemorySocket};
use tether_session::pending::PendingQueries;
use tether_session::transport::{Dispatcher, IncomingCall, Transport, TransportConfig};
use tether_wire::{Value, stream_channel};

/// Echo-style service that records the order calls arrive in.
#[derive(Clone, Default)]
struct RecordingService {
    calls: Arc<Mutex<Vec<i64>>>,
    subscriptions: Arc<AtomicU32>,
}

impl Dispatcher for RecordingService {
    fn dispatch(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>> {
        let calls = self.calls.clone();
        let subscriptions = self.subscriptions.clone();
        Box::pin(async move {
            match call.method.as_str() {
                "echo" => {
                    let n = call.params[0].as_i64().unwrap_or_default();
                    calls.lock().push(n);
                    Ok(Value::Int(n))
                }
                "ticks" => {
                    // Each subscription gets its own sequence, offset by the
                    // subscription ordinal so tests can tell them apart.
                    let ordinal = subscriptions.fetch_add(1, Ordering::SeqCst) as i64;
                    let base = ordinal * 10;
                    let (tx, stream) = stream_channel(4);
                    tokio::spawn(async move {
                        for i in 1..=2 {
                            if tx.send(Value::Int(base + i)).await.is_err() {
                                return;
                            }
                        }
                        if ordinal > 0 {
                            // Later subscriptions finish; the first one is
                            // kept open so the test can kill the socket
                            // under it.
                            return;
                        }
                        tx.closed().await;
                    });
                    Ok(Value::Stream(stream))
                }
                other => Err(DispatchError::Client(format!("Unknown method: {other}"))),
            }
        })
    }
}

/// Accept loop: one transport per accepted socket, handles collected so
/// tests can kill live connections.
fn serve(
    mut accepts: mpsc::UnboundedReceiver<MemorySocket>,
    dispatcher: impl Dispatcher + Clone,
) -> Arc<Mutex<Vec<Transport>>> {
    let transports: Arc<Mutex<Vec<Transport>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = transports.clone();
    tokio::spawn(async move {
        while let Some(socket) = accepts.recv().await {
            let transport = Transport::spawn(
                socket,
                Arc::new(PendingQueries::new()),
                Arc::new(dispatcher.clone()),
                TransportConfig::default(),
            );
            handle.lock().push(transport);
        }
    });
    transports
}

fn fast_backoff() -> Backoff {
    Backoff {
        starting_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        ..Backoff::default()
    }
}

fn build_client(adapter: MemoryAdapter) -> Client<MemoryAdapter> {
    ClientBuilder::new("mem://service", adapter)
        .backoff(fast_backoff())
        .connect()
}

#[tokio::test]
async fn call_resolves_over_a_fresh_connection() {
    let (adapter, accepts) = MemoryAdapter::new();
    let _server = serve(accepts, RecordingService::default());
    let client = build_client(adapter);

    let result = client.call("echo", vec![7i64.into()]).await;
    assert_eq!(result, Ok(Value::Int(7)));
}

#[tokio::test]
async fn requests_queued_while_down_flush_in_order() {
    let (adapter, accepts) = MemoryAdapter::new();
    let service = RecordingService::default();
    let _server = serve(accepts, service.clone());

    adapter.set_refuse(true);
    let client = build_client(adapter.clone());

    // All three are buffered: no socket exists yet.
    let first = client.issue("echo", vec![1i64.into()]).await;
    let second = client.issue("echo", vec![2i64.into()]).await;
    let third = client.issue("echo", vec![3i64.into()]).await;

    adapter.set_refuse(false);

    assert_eq!(first.await.unwrap(), Ok(Value::Int(1)));
    assert_eq!(second.await.unwrap(), Ok(Value::Int(2)));
    assert_eq!(third.await.unwrap(), Ok(Value::Int(3)));
    assert_eq!(*service.calls.lock(), vec![1, 2, 3]);
}

#[tokio::test]
async fn client_reconnects_after_the_server_drops_it() {
    let (adapter, accepts) = MemoryAdapter::new();
    let service = RecordingService::default();
    let server = serve(accepts, service.clone());
    let client = build_client(adapter.clone());

    assert_eq!(client.call("echo", vec![1i64.into()]).await, Ok(Value::Int(1)));

    // Kill the live connection from the server side.
    let transport = server.lock()[0].clone();
    transport
        .close(tether_session::error::CloseReason::ConnectionClosed)
        .await;
    transport.closed().await;

    // The next call may race the reconnect; the client either queues it or
    // fails it with the sentinel, but a later call must succeed.
    let mut recovered = false;
    for _ in 0..50 {
        match client.call("echo", vec![2i64.into()]).await {
            Ok(Value::Int(2)) => {
                recovered = true;
                break;
            }
            Err(CallError::ConnectionClosed) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
    assert!(recovered);
    assert!(adapter.connect_count() >= 2);
}

#[tokio::test]
async fn subscription_resubscribes_across_a_disconnect() {
    let (adapter, accepts) = MemoryAdapter::new();
    let service = RecordingService::default();
    let server = serve(accepts, service.clone());
    let client = build_client(adapter);

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let subscription = client.subscribe(
        "ticks",
        vec![],
        move |value| {
            let _ = seen_tx.send(value.as_i64().unwrap_or_default());
            Ok(())
        },
        SubscribeOptions::default(),
    );

    // First subscription delivers 1, 2 and then hangs open.
    assert_eq!(seen.recv().await, Some(1));
    assert_eq!(seen.recv().await, Some(2));

    // Kill the socket under it; subscribe must silently re-issue the call.
    let transport = server.lock()[0].clone();
    transport
        .close(tether_session::error::CloseReason::ConnectionClosed)
        .await;
    transport.closed().await;

    // Second subscription delivers 11, 12 and finishes the sequence.
    assert_eq!(seen.recv().await, Some(11));
    assert_eq!(seen.recv().await, Some(12));
    subscription.join().await;
    assert_eq!(service.subscriptions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abort_fails_pending_work_and_stops_reconnecting() {
    let (adapter, _accepts) = MemoryAdapter::new();
    adapter.set_refuse(true);
    let client = build_client(adapter.clone());

    let pending = client.issue("echo", vec![1i64.into()]).await;
    client.abort();

    let result = pending.await.unwrap();
    assert_eq!(result, Err(CallError::Cancelled));

    // New calls fail fast once the loop has exited.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        client.call("echo", vec![2i64.into()]).await,
        Err(CallError::Cancelled)
    );
}

#[tokio::test]
async fn backoff_exhaustion_surfaces_to_the_error_sink() {
    let (adapter, _accepts) = MemoryAdapter::new();
    adapter.set_refuse(true);

    let errors = Arc::new(AtomicU32::new(0));
    let seen = errors.clone();
    let client = ClientBuilder::new("mem://service", adapter.clone())
        .backoff(Backoff {
            starting_delay: Duration::from_millis(1),
            num_of_attempts: 3,
            ..Backoff::default()
        })
        .on_error(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }))
        .connect();

    // Wait for the loop to give up.
    for _ in 0..100 {
        if client.is_dead() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.is_dead());
    assert_eq!(adapter.connect_count(), 3);
    assert!(errors.load(Ordering::SeqCst) >= 1);
    assert_eq!(
        client.call("echo", vec![]).await,
        Err(CallError::ConnectionClosed)
    );
}

#[tokio::test]
async fn aborted_subscription_cancels_the_stream() {
    let (adapter, accepts) = MemoryAdapter::new();
    let service = RecordingService::default();
    let _server = serve(accepts, service.clone());
    let client = build_client(adapter);

    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let subscription = client.subscribe(
        "ticks",
        vec![],
        move |value| {
            let _ = seen_tx.send(value.as_i64().unwrap_or_default());
            Ok(())
        },
        SubscribeOptions::default(),
    );

    assert_eq!(seen.recv().await, Some(1));
    subscription.abort();
    subscription.join().await;
}
