//! tether - bidirectional RPC over a single reconnecting message socket.
//!
//! This crate is the unified surface for the tether protocol stack. Users
//! should depend on this crate rather than the individual component crates.
//!
//! - values and the flatten codec: [`Value`], [`Transforms`], [`ValueStream`]
//! - the transport engine: [`tether_session`]
//! - the reconnecting client: [`Client`], [`ClientBuilder`], subscriptions
//! - the server: [`Server`], middleware, per-connection [`Context`]
//! - the WebSocket adapter: [`websocket`]

#![deny(unsafe_code)]

// Wire layer: the value model and codec.
pub use tether_wire::{
    CodecError, ErrorValue, Message, OpaqueValue, RawKind, StreamError, StreamFrame, StreamSender,
    Transform, Transforms, Value, ValueCell, ValueStream, stream_channel,
};

// Session layer: adapter contract, errors, transport plumbing.
pub use tether_session::{
    CallError, CloseInfo, CloseReason, Dispatcher, ErrorSink, Extensions, Frame, IncomingCall,
    PendingQueries, ProtocolError, Socket, SocketAdapter, SocketEvent, Transport, TransportConfig,
};

// Client: reconnection, backoff, subscriptions.
pub use tether_client::{
    Backoff, Client, ClientBuilder, ConnectionHandle, SubscribeOptions, Subscription,
};

// Server: dispatch, middleware, context, channels.
pub use tether_server::{
    Channel, ConnectionContext, Context, Handler, HandlerError, Middleware, Outcome, Rejection,
    Server, ServerBuilder,
};

// Component crates, for anything not re-exported above.
pub use tether_client as client;
pub use tether_server as server;
pub use tether_session as session;
pub use tether_websocket as websocket;
pub use tether_wire as wire;
