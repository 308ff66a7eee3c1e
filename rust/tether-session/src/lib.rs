#![deny(unsafe_code)]

//! The tether session layer: everything between the codec and a socket.
//!
//! The centerpiece is [`Transport`]: a driver task that exclusively owns one
//! socket, correlates requests with responses through a shared
//! [`PendingQueries`] table, multiplexes lazy sequences by integer id, and
//! answers liveness probes. Clients and servers differ only in what they hang
//! off the transport: a reconnect loop on one side, a method table on the
//! other.

pub mod adapter;
pub mod error;
pub mod extensions;
pub mod mem;
pub mod pending;
pub mod registry;
pub mod transport;


pub use adapter::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CloseInfo, Frame, Socket, SocketAdapter, SocketEvent,
};
pub use error::{
    CallError, CloseReason, DispatchError, ErrorSink, ProtocolError, default_error_sink,
};
pub use extensions::Extensions;
pub use pending::PendingQueries;
pub use transport::{Dispatcher, IncomingCall, NoMethods, Transport, TransportConfig};
