//! The socket adapter contract.
//!
//! The transport needs exactly this much from a socket: send a frame,
//! receive the next event, close with a code. Adapters wrap a real WebSocket
//! or an in-process pair; the transport driver is the only reader and the
//! only writer of a socket for its whole life.

use std::future::Future;
use std::io;

use tokio_util::sync::CancellationToken;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Going away; used when a liveness probe fails.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// One physical frame. The transport never assumes which kind arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Why a socket terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// An inbound socket event. `Closed` is final: no more events follow it.
#[derive(Debug)]
pub enum SocketEvent {
    Frame(Frame),
    Closed(CloseInfo),
}

/// A connected full-duplex message socket.
pub trait Socket: Send + 'static {
    fn send(&mut self, frame: Frame) -> impl Future<Output = io::Result<()>> + Send;

    fn recv(&mut self) -> impl Future<Output = io::Result<SocketEvent>> + Send;

    fn close(&mut self, code: u16, reason: &str) -> impl Future<Output = io::Result<()>> + Send;
}

/// A factory producing sockets on demand; called on initial connect and
/// after every disconnect.
pub trait SocketAdapter: Send + Sync + 'static {
    type Socket: Socket;

    /// Establish a new connection. Must honor `signal` before and during the
    /// handshake.
    fn connect(
        &self,
        url: &str,
        signal: &CancellationToken,
    ) -> impl Future<Output = io::Result<Self::Socket>> + Send;
}
