//! In-process sockets: a connected pair over channels, plus an adapter that
//! hands accepted halves to a listener-style receiver.
//!
//! No serialization, no IO: frames cross as values. Used by every test that
//! needs to force disconnects or refuse connections deterministically.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::adapter::{CloseInfo, Frame, Socket, SocketAdapter, SocketEvent};

/// One half of an in-process socket pair.
#[derive(Debug)]
pub struct MemorySocket {
    tx: mpsc::Sender<SocketEvent>,
    rx: mpsc::Receiver<SocketEvent>,
    closed: bool,
}

/// Create a connected socket pair.
pub fn socket_pair() -> (MemorySocket, MemorySocket) {
    let (tx_a, rx_b) = mpsc::channel(64);
    let (tx_b, rx_a) = mpsc::channel(64);
    (
        MemorySocket {
            tx: tx_a,
            rx: rx_a,
            closed: false,
        },
        MemorySocket {
            tx: tx_b,
            rx: rx_b,
            closed: false,
        },
    )
}

impl Socket for MemorySocket {
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        self.tx
            .send(SocketEvent::Frame(frame))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }

    async fn recv(&mut self) -> io::Result<SocketEvent> {
        match self.rx.recv().await {
            Some(event) => Ok(event),
            None => Ok(SocketEvent::Closed(CloseInfo {
                code: 1006,
                reason: "peer dropped".into(),
            })),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            let _ = self
                .tx
                .send(SocketEvent::Closed(CloseInfo {
                    code,
                    reason: reason.to_string(),
                }))
                .await;
        }
        Ok(())
    }
}

/// Adapter producing in-process sockets. Each successful connect pushes the
/// accepting half onto the listener channel returned by [`MemoryAdapter::new`].
#[derive(Clone)]
pub struct MemoryAdapter {
    accept_tx: mpsc::UnboundedSender<MemorySocket>,
    refuse: Arc<AtomicBool>,
    connects: Arc<AtomicU32>,
}

impl MemoryAdapter {
    /// Build the adapter and its listener-side receiver.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemorySocket>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            Self {
                accept_tx,
                refuse: Arc::new(AtomicBool::new(false)),
                connects: Arc::new(AtomicU32::new(0)),
            },
            accept_rx,
        )
    }

    /// Make subsequent connects fail with `ConnectionRefused`.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts observed, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

impl SocketAdapter for MemoryAdapter {
    type Socket = MemorySocket;

    async fn connect(&self, _url: &str, signal: &CancellationToken) -> io::Result<MemorySocket> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if signal.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused by test switch",
            ));
        }
        let (client, server) = socket_pair();
        self.accept_tx.send(server).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "listener gone")
        })?;
        Ok(client)
    }
}
