//! Error types for the session layer.

use std::fmt;
use std::sync::Arc;

use tether_wire::{CodecError, ErrorValue};

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The transport died before the response arrived. This is the sentinel
    /// subscribers watch for to trigger resubscription.
    ConnectionClosed,
    /// The remote handler failed with a message it deemed safe to surface.
    Remote(String),
    /// The remote handler failed without detail.
    Failed,
    /// The call was cancelled locally.
    Cancelled,
    /// The request could not be encoded for the wire.
    Codec(String),
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ConnectionClosed => write!(f, "connection closed"),
            CallError::Remote(msg) => write!(f, "{msg}"),
            CallError::Failed => write!(f, "request failed"),
            CallError::Cancelled => write!(f, "cancelled"),
            CallError::Codec(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for CallError {}

impl From<ErrorValue> for CallError {
    fn from(error: ErrorValue) -> Self {
        match error {
            ErrorValue::Message(msg) => CallError::Remote(msg),
            ErrorValue::Failed => CallError::Failed,
        }
    }
}

/// An invariant violation on the wire. Always fatal for the transport.
#[derive(Debug)]
pub enum ProtocolError {
    /// Malformed frame or unknown tag.
    Codec(CodecError),
    /// A stream frame referenced an id in neither table.
    UnknownStream(u64),
    /// A raw frame arrived with no preceding `chunk{type}` announcement.
    UnexpectedRaw,
    /// A `chunk{type}` announcement was followed by the wrong kind of frame.
    ExpectedRaw { id: u64 },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Codec(e) => write!(f, "{e}"),
            ProtocolError::UnknownStream(id) => write!(f, "unknown stream id {id}"),
            ProtocolError::UnexpectedRaw => write!(f, "raw frame without announcement"),
            ProtocolError::ExpectedRaw { id } => {
                write!(f, "expected raw payload for stream {id}")
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a transport shut down.
#[derive(Debug)]
pub enum CloseReason {
    /// Orderly termination: local close, remote close, or socket loss.
    ConnectionClosed,
    /// The peer violated the protocol.
    Protocol(ProtocolError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ConnectionClosed => write!(f, "connection closed"),
            CloseReason::Protocol(e) => write!(f, "protocol violation: {e}"),
        }
    }
}

/// How a dispatched call failed.
#[derive(Debug)]
pub enum DispatchError {
    /// Safe to surface to the remote caller verbatim.
    Client(String),
    /// Reported locally, surfaced remotely as the opaque failure marker.
    Failed,
}

/// Sink for errors the core recovers from locally.
pub type ErrorSink = Arc<dyn Fn(&(dyn std::error::Error + 'static)) + Send + Sync>;

/// The default sink logs to the error level.
pub fn default_error_sink() -> ErrorSink {
    Arc::new(|error| tracing::error!("{error}"))
}
