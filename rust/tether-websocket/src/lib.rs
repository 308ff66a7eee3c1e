#![deny(unsafe_code)]

//! WebSocket adapter for tether (native, tokio-tungstenite).
//!
//! WebSocket provides native message framing, so frames map one-to-one:
//! protocol text frames travel as WS text messages, raw binary payloads as
//! WS binary messages. Transport-level liveness uses the protocol's own
//! `ping`/`pong` sentinels; WS-level pings are answered inline and never
//! surface.

use std::io;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use tether_client::ClientBuilder;
use tether_session::adapter::{CloseInfo, Frame, Socket, SocketAdapter, SocketEvent};

/// A tether socket over any WebSocket stream.
///
/// Generic over the inner IO so servers can wrap accepted upgrades the same
/// way clients wrap outgoing connections.
pub struct WsSocket<S> {
    stream: WebSocketStream<S>,
}

impl<S> WsSocket<S> {
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self { stream }
    }

    /// Consume the adapter and return the underlying WebSocket stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> Socket for WsSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, frame: Frame) -> io::Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| io::Error::other(e.to_string()))
    }

    async fn recv(&mut self) -> io::Result<SocketEvent> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(SocketEvent::Frame(Frame::Text(text.as_str().to_string())));
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    return Ok(SocketEvent::Frame(Frame::Binary(bytes.to_vec())));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let info = match frame {
                        Some(frame) => CloseInfo {
                            code: frame.code.into(),
                            reason: frame.reason.as_str().to_string(),
                        },
                        None => CloseInfo {
                            code: 1005,
                            reason: String::new(),
                        },
                    };
                    return Ok(SocketEvent::Closed(info));
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    // Answer transport-level pings inline; they are not part
                    // of the tether protocol.
                    let _ = self.stream.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(io::Error::other(e.to_string())),
                None => {
                    return Ok(SocketEvent::Closed(CloseInfo {
                        code: 1006,
                        reason: "connection reset".into(),
                    }));
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> io::Result<()> {
        let frame = CloseFrame {
            code: code.into(),
            reason: reason.to_string().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) => Ok(()),
            // Closing an already-closed stream is fine.
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(io::Error::other(e.to_string())),
        }
    }
}

/// Adapter dialing `ws://` URLs with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsAdapter;

impl SocketAdapter for WsAdapter {
    type Socket = WsSocket<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, url: &str, signal: &CancellationToken) -> io::Result<Self::Socket> {
        if signal.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"));
        }
        tokio::select! {
            _ = signal.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "cancelled"))
            }
            connected = connect_async(url) => match connected {
                Ok((stream, _response)) => Ok(WsSocket::new(stream)),
                Err(e) => Err(io::Error::other(e.to_string())),
            }
        }
    }
}

/// Client builder preconfigured for WebSocket.
pub fn client(url: impl Into<String>) -> ClientBuilder<WsAdapter> {
    ClientBuilder::new(url, WsAdapter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tether_server::{HandlerError, Server};
    use tether_wire::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn call_over_a_real_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("ws://{addr}");

        let server = Server::builder()
            .route("add", |_ctx, params: Vec<Value>| async move {
                let a = params[0].as_i64().ok_or_else(|| HandlerError::client("bad arg"))?;
                let b = params[1].as_i64().ok_or_else(|| HandlerError::client("bad arg"))?;
                Ok(Value::Int(a + b))
            })
            .build();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let ws = match accept_async(stream).await {
                        Ok(ws) => ws,
                        Err(_) => return,
                    };
                    server.serve(WsSocket::new(ws)).await;
                });
            }
        });

        let rpc = client(url).connect();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            rpc.call("add", vec![123i64.into(), 456i64.into()]),
        )
        .await
        .expect("call timed out");
        assert_eq!(result, Ok(Value::Int(579)));
    }
}
