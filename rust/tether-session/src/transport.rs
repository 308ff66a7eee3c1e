//! The transport: one driver task tying the codec and the stream tables to a
//! socket.
//!
//! The driver is the only task that touches the socket, in either direction.
//! Everything else (calls, stream producers, cancel hooks, liveness probes)
//! talks to it through a command channel. That single-writer discipline is
//! what makes the `chunk{type}` + raw-payload pair atomic on the wire, and it
//! keeps the stream tables free of locks.
//!
//! Incoming calls are dispatched on their own tasks so a slow handler never
//! stalls frame parsing; the reply comes back through the command channel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value as Json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use tether_wire::{
    ErrorValue, Message, PING, PONG, ParsedFrame, RawKind, STREAM_BUFFER, StreamBinder,
    StreamError, StreamFrame, Transforms, Value, ValueStream, classify, flatten, stream_channel,
};

use crate::adapter::{CLOSE_NORMAL, CloseInfo, Frame, Socket, SocketEvent};
use crate::error::{
    CallError, CloseReason, DispatchError, ErrorSink, ProtocolError, default_error_sink,
};
use crate::pending::PendingQueries;
use crate::registry::StreamRegistry;

/// A decoded request awaiting dispatch.
pub struct IncomingCall {
    pub method: String,
    pub params: Vec<Value>,
}

/// Handles requests arriving over a transport.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>>;
}

/// Dispatcher for endpoints that serve no methods: every request is answered
/// with an unknown-method error.
pub struct NoMethods;

impl Dispatcher for NoMethods {
    fn dispatch(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = Result<Value, DispatchError>> + Send>> {
        Box::pin(async move { Err(DispatchError::Client(format!("Unknown method: {}", call.method))) })
    }
}

/// Transport construction parameters.
#[derive(Clone)]
pub struct TransportConfig {
    pub transforms: Arc<Transforms>,
    pub on_error: ErrorSink,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transforms: Arc::new(Transforms::new()),
            on_error: default_error_sink(),
        }
    }
}

enum Command {
    Send(Message),
    StreamItem { id: u64, value: Value },
    StreamDone { id: u64 },
    StreamError { id: u64, error: String },
    CancelInbound { id: u64, reason: String },
    Ping,
    Close { code: u16, reason: CloseReason },
}

struct Shared {
    last_message: Mutex<Instant>,
    closed: watch::Receiver<Option<CloseInfo>>,
}

/// Handle to a running transport driver. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    cmd_tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl Transport {
    /// Build a transport over a freshly connected socket and spawn its
    /// driver.
    pub fn spawn<S: Socket>(
        socket: S,
        pending: Arc<PendingQueries>,
        dispatcher: Arc<dyn Dispatcher>,
        config: TransportConfig,
    ) -> Transport {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (closed_tx, closed_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            last_message: Mutex::new(Instant::now()),
            closed: closed_rx,
        });
        let driver = Driver {
            socket,
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            pending,
            dispatcher,
            registry: StreamRegistry::new(),
            expected_raw: None,
            transforms: config.transforms,
            on_error: config.on_error,
            shared: shared.clone(),
            closed_tx,
        };
        tokio::spawn(driver.run());
        Transport { cmd_tx, shared }
    }

    /// Queue a message for the wire. A transport that is already closing
    /// drops the message; its pending slot is rejected on close.
    pub async fn send(&self, message: Message) {
        let _ = self.cmd_tx.send(Command::Send(message)).await;
    }

    /// Close with the normal code.
    pub async fn close(&self, reason: CloseReason) {
        self.close_with_code(CLOSE_NORMAL, reason).await;
    }

    pub async fn close_with_code(&self, code: u16, reason: CloseReason) {
        let _ = self.cmd_tx.send(Command::Close { code, reason }).await;
    }

    /// Time since any frame arrived on this socket.
    pub fn time_since_last_message(&self) -> Duration {
        self.shared.last_message.lock().elapsed()
    }

    /// Send a `ping` and report whether any traffic arrived within the
    /// window.
    pub async fn ping(&self, pong_timeout: Duration) -> bool {
        let sent_at = Instant::now();
        if self.cmd_tx.send(Command::Ping).await.is_err() {
            return false;
        }
        tokio::time::sleep(pong_timeout).await;
        *self.shared.last_message.lock() > sent_at
    }

    /// Resolves when the driver has shut down.
    pub async fn closed(&self) -> CloseInfo {
        let mut rx = self.shared.closed.clone();
        loop {
            if let Some(info) = rx.borrow().clone() {
                return info;
            }
            if rx.changed().await.is_err() {
                return CloseInfo {
                    code: 1006,
                    reason: "driver gone".into(),
                };
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }
}

/// Binds the codec's stream hooks to the driver's registry.
struct RegistryBinder<'a> {
    registry: &'a mut StreamRegistry,
    cmd_tx: &'a mpsc::Sender<Command>,
}

impl StreamBinder for RegistryBinder<'_> {
    fn bind_outbound(&mut self, stream: &ValueStream) -> Result<u64, tether_wire::CodecError> {
        Ok(self.registry.alloc_outbound(stream.clone()))
    }

    fn bind_inbound(&mut self, id: u64) -> Result<ValueStream, tether_wire::CodecError> {
        let (sink, stream) = stream_channel(STREAM_BUFFER);
        if !self.registry.register_inbound(id, sink) {
            return Err(tether_wire::CodecError::InvalidFrame(format!(
                "stream id {id} already bound"
            )));
        }
        let cmd_tx = self.cmd_tx.clone();
        stream.set_cancel_hook(move |reason| {
            let _ = cmd_tx.try_send(Command::CancelInbound { id, reason });
        });
        Ok(stream)
    }
}

enum Fault {
    /// Wire invariant violated; close with the violation as reason.
    Protocol(ProtocolError),
    /// The socket itself failed; close as a plain disconnect.
    Io(std::io::Error),
}

struct Driver<S: Socket> {
    socket: S,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    pending: Arc<PendingQueries>,
    dispatcher: Arc<dyn Dispatcher>,
    registry: StreamRegistry,
    /// The one stateful coupling between adjacent frames: a pending
    /// `chunk{type}` announcement.
    expected_raw: Option<(u64, RawKind)>,
    transforms: Arc<Transforms>,
    on_error: ErrorSink,
    shared: Arc<Shared>,
    closed_tx: watch::Sender<Option<CloseInfo>>,
}

impl<S: Socket> Driver<S> {
    async fn run(mut self) {
        let outcome = loop {
            tokio::select! {
                event = self.socket.recv() => match event {
                    Ok(SocketEvent::Frame(frame)) => {
                        *self.shared.last_message.lock() = Instant::now();
                        if let Err(fault) = self.handle_frame(frame).await {
                            break self.fault_outcome(fault);
                        }
                    }
                    Ok(SocketEvent::Closed(info)) => {
                        break (CLOSE_NORMAL, CloseReason::ConnectionClosed, Some(info));
                    }
                    Err(e) => {
                        warn!("socket receive failed: {e}");
                        break (CLOSE_NORMAL, CloseReason::ConnectionClosed, None);
                    }
                },
                command = self.cmd_rx.recv() => match command {
                    Some(Command::Close { code, reason }) => break (code, reason, None),
                    Some(command) => {
                        if let Err(fault) = self.handle_command(command).await {
                            break self.fault_outcome(fault);
                        }
                    }
                    // The driver holds a sender of its own, so this only
                    // happens if the runtime is tearing down.
                    None => break (CLOSE_NORMAL, CloseReason::ConnectionClosed, None),
                },
            }
        };
        self.shutdown(outcome).await;
    }

    fn fault_outcome(&self, fault: Fault) -> (u16, CloseReason, Option<CloseInfo>) {
        match fault {
            Fault::Protocol(violation) => {
                (self.on_error)(&violation);
                (CLOSE_NORMAL, CloseReason::Protocol(violation), None)
            }
            Fault::Io(e) => {
                warn!("socket write failed: {e}");
                (CLOSE_NORMAL, CloseReason::ConnectionClosed, None)
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Result<(), Fault> {
        // A pending announcement consumes the very next physical frame.
        if let Some((id, kind)) = self.expected_raw.take() {
            let value = match (kind, frame) {
                (RawKind::Text, Frame::Text(text)) => Value::Text(text),
                (RawKind::Binary, Frame::Binary(bytes)) => Value::Binary(bytes),
                _ => return Err(Fault::Protocol(ProtocolError::ExpectedRaw { id })),
            };
            return self.deliver_item(id, value).await;
        }
        match frame {
            Frame::Binary(_) => Err(Fault::Protocol(ProtocolError::UnexpectedRaw)),
            Frame::Text(text) => {
                let parsed =
                    classify(&text).map_err(|e| Fault::Protocol(ProtocolError::Codec(e)))?;
                match parsed {
                    ParsedFrame::Ping => self.write(Frame::Text(PONG.into())).await,
                    ParsedFrame::Pong => Ok(()),
                    ParsedFrame::Message(slots) => self.handle_message(&slots).await,
                    ParsedFrame::Stream(stream_frame) => {
                        self.handle_stream_frame(stream_frame).await
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, slots: &[Json]) -> Result<(), Fault> {
        let message = {
            let mut binder = RegistryBinder {
                registry: &mut self.registry,
                cmd_tx: &self.cmd_tx,
            };
            Message::decode(slots, &self.transforms, &mut binder)
                .map_err(|e| Fault::Protocol(ProtocolError::Codec(e)))?
        };
        match message {
            Message::Call { id, method, params } => {
                trace!(id, method = %method, "incoming call");
                let dispatcher = self.dispatcher.clone();
                let cmd_tx = self.cmd_tx.clone();
                tokio::spawn(async move {
                    let reply = match dispatcher.dispatch(IncomingCall { method, params }).await {
                        Ok(result) => Message::Reply { id, result },
                        Err(DispatchError::Client(message)) => Message::Error {
                            id,
                            error: ErrorValue::Message(message),
                        },
                        Err(DispatchError::Failed) => Message::Error {
                            id,
                            error: ErrorValue::Failed,
                        },
                    };
                    let _ = cmd_tx.send(Command::Send(reply)).await;
                });
                Ok(())
            }
            Message::Reply { id, result } => {
                self.pending.resolve(id, result);
                Ok(())
            }
            Message::Error { id, error } => {
                self.pending.reject(id, error.into());
                Ok(())
            }
        }
    }

    async fn handle_stream_frame(&mut self, frame: StreamFrame) -> Result<(), Fault> {
        match frame {
            StreamFrame::Chunk { id, data, raw } => {
                if !self.registry.has_inbound(id) {
                    return Err(Fault::Protocol(ProtocolError::UnknownStream(id)));
                }
                if let Some(kind) = raw {
                    self.expected_raw = Some((id, kind));
                    return Ok(());
                }
                if self.registry.inbound_sink(id).is_none() {
                    // Locally canceled: discard without decoding.
                    return Ok(());
                }
                let slots = data.unwrap_or_default();
                let value = {
                    let mut binder = RegistryBinder {
                        registry: &mut self.registry,
                        cmd_tx: &self.cmd_tx,
                    };
                    tether_wire::unflatten(&slots, &self.transforms, &mut binder)
                        .map_err(|e| Fault::Protocol(ProtocolError::Codec(e)))?
                };
                self.deliver_item(id, value).await
            }
            StreamFrame::Done { id } => match self.registry.remove_inbound(id) {
                // Dropping the sink ends the sequence normally.
                Some(_) => Ok(()),
                None => Err(Fault::Protocol(ProtocolError::UnknownStream(id))),
            },
            StreamFrame::Error { id, error } => match self.registry.remove_inbound(id) {
                Some(entry) => {
                    if !entry.canceled {
                        let sink = entry.sink;
                        tokio::spawn(async move {
                            sink.fail(StreamError::Remote(error)).await;
                        });
                    }
                    Ok(())
                }
                None => Err(Fault::Protocol(ProtocolError::UnknownStream(id))),
            },
            StreamFrame::Cancel { id, reason } => match self.registry.remove_outbound(id) {
                Some(token) => {
                    debug!(id, reason = %reason, "remote canceled stream");
                    token.cancel();
                    Ok(())
                }
                None => Err(Fault::Protocol(ProtocolError::UnknownStream(id))),
            },
        }
    }

    /// Route one parsed item into an inbound sink, honoring cancellation.
    async fn deliver_item(&mut self, id: u64, value: Value) -> Result<(), Fault> {
        let Some(sink) = self.registry.inbound_sink(id) else {
            return Ok(());
        };
        if sink.send(value).await.is_err() {
            // The consumer dropped its end without an explicit cancel; treat
            // it the same way.
            if self.registry.mark_canceled(id) {
                self.write_stream_frame(StreamFrame::Cancel {
                    id,
                    reason: "consumer dropped".into(),
                })
                .await?;
            }
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), Fault> {
        match command {
            Command::Send(message) => {
                let encoded = {
                    let mut binder = RegistryBinder {
                        registry: &mut self.registry,
                        cmd_tx: &self.cmd_tx,
                    };
                    message.encode(&self.transforms, &mut binder)
                };
                match encoded {
                    Ok(text) => {
                        self.write(Frame::Text(text)).await?;
                        // Only now may chunks flow: the remote has to parse
                        // the ids out of the enclosing frame first.
                        self.spawn_producers();
                    }
                    Err(e) => {
                        (self.on_error)(&e);
                        self.registry.discard_pending_producers();
                        // A call that cannot be encoded must not leave its
                        // slot hanging.
                        if let Message::Call { id, .. } = &message {
                            self.pending.reject(*id, CallError::Codec(e.to_string()));
                        }
                    }
                }
                Ok(())
            }
            Command::StreamItem { id, value } => {
                if !self.registry.has_outbound(id) {
                    // Canceled while the item was in flight.
                    return Ok(());
                }
                match value {
                    Value::Text(text) => {
                        self.write_stream_frame(StreamFrame::chunk_raw(id, RawKind::Text))
                            .await?;
                        self.write(Frame::Text(text)).await
                    }
                    Value::Binary(bytes) => {
                        self.write_stream_frame(StreamFrame::chunk_raw(id, RawKind::Binary))
                            .await?;
                        self.write(Frame::Binary(bytes)).await
                    }
                    value => {
                        let encoded = {
                            let mut binder = RegistryBinder {
                                registry: &mut self.registry,
                                cmd_tx: &self.cmd_tx,
                            };
                            flatten(&value, &self.transforms, &mut binder)
                        };
                        match encoded {
                            Ok(slots) => {
                                self.write_stream_frame(StreamFrame::chunk_data(id, slots))
                                    .await?;
                                self.spawn_producers();
                                Ok(())
                            }
                            Err(e) => {
                                // The producer hit a value the codec cannot
                                // carry: the stream dies, the transport
                                // survives.
                                (self.on_error)(&e);
                                self.registry.discard_pending_producers();
                                if let Some(token) = self.registry.remove_outbound(id) {
                                    token.cancel();
                                }
                                self.write_stream_frame(StreamFrame::Error {
                                    id,
                                    error: e.to_string(),
                                })
                                .await
                            }
                        }
                    }
                }
            }
            Command::StreamDone { id } => {
                if self.registry.remove_outbound(id).is_some() {
                    self.write_stream_frame(StreamFrame::Done { id }).await?;
                }
                Ok(())
            }
            Command::StreamError { id, error } => {
                if self.registry.remove_outbound(id).is_some() {
                    self.write_stream_frame(StreamFrame::Error { id, error })
                        .await?;
                }
                Ok(())
            }
            Command::CancelInbound { id, reason } => {
                if self.registry.mark_canceled(id) {
                    self.write_stream_frame(StreamFrame::Cancel { id, reason })
                        .await?;
                }
                Ok(())
            }
            Command::Ping => self.write(Frame::Text(PING.into())).await,
            // Close is intercepted by the run loop.
            Command::Close { .. } => Ok(()),
        }
    }

    /// Start producer tasks for streams whose announcing frame is on the
    /// wire.
    fn spawn_producers(&mut self) {
        for producer in self.registry.take_pending_producers() {
            let cmd_tx = self.cmd_tx.clone();
            let id = producer.id;
            let stream = producer.stream;
            let cancel = producer.cancel;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        item = stream.recv() => match item {
                            Some(Ok(value)) => {
                                if cmd_tx.send(Command::StreamItem { id, value }).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(error)) => {
                                let _ = cmd_tx
                                    .send(Command::StreamError {
                                        id,
                                        error: error.to_string(),
                                    })
                                    .await;
                                break;
                            }
                            None => {
                                let _ = cmd_tx.send(Command::StreamDone { id }).await;
                                break;
                            }
                        },
                    }
                }
            });
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), Fault> {
        self.socket.send(frame).await.map_err(Fault::Io)
    }

    async fn write_stream_frame(&mut self, frame: StreamFrame) -> Result<(), Fault> {
        let text = frame
            .encode()
            .map_err(|e| Fault::Protocol(ProtocolError::Codec(e)))?;
        self.write(Frame::Text(text)).await
    }

    async fn shutdown(mut self, outcome: (u16, CloseReason, Option<CloseInfo>)) {
        let (code, reason, remote) = outcome;
        if remote.is_none() {
            let _ = self.socket.close(code, &reason.to_string()).await;
        }
        let info = remote.unwrap_or_else(|| CloseInfo {
            code,
            reason: reason.to_string(),
        });
        debug!(code = info.code, reason = %info.reason, "transport closed");
        // Publish the close before draining: senders observing a live
        // transport are guaranteed their slot is still in the table when
        // reject_all runs, and senders observing a closed one clean up after
        // themselves.
        let _ = self.closed_tx.send(Some(info));
        self.pending.reject_all(CallError::ConnectionClosed);
        for entry in self.registry.drain() {
            if !entry.canceled {
                let sink = entry.sink;
                tokio::spawn(async move {
                    sink.fail(StreamError::ConnectionClosed).await;
                });
            }
        }
    }
}
