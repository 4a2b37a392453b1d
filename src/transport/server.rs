//! Server-side transport adapter.
//!
//! Wraps a WebSocket stream that the host's HTTP/WebSocket framework has
//! already accepted and upgraded. Accepting the TCP connection and
//! performing the WebSocket handshake are out of scope for this crate —
//! by the time a [`ServerTransport`] exists, both have already happened.

use super::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Server-side [`Transport`] over an already-accepted WebSocket connection.
pub struct ServerTransport {
    inner: WebSocketStream<TcpStream>,
}

impl ServerTransport {
    pub fn new(inner: WebSocketStream<TcpStream>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Transport for ServerTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.inner
            .send(Message::Text(text))
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn receive(&mut self) -> Result<String> {
        loop {
            let msg = self
                .inner
                .next()
                .await
                .ok_or_else(|| Error::ConnectionLost)?
                .map_err(|e| Error::Transport(e.to_string()))?;

            match msg {
                Message::Text(text) => return Ok(text),
                Message::Close(_) => return Err(Error::ConnectionLost),
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("ignoring keepalive frame on server transport");
                    continue;
                }
                other => {
                    return Err(Error::UnknownPacket(format!(
                        "unsupported frame kind: {other:?}"
                    )))
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close(None)
            .await
            .or_else(|e| match e {
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Ok(()),
                e => Err(Error::Transport(e.to_string())),
            })
    }

    /// Close with a specific WebSocket close code and reason, used by the
    /// admission gate to reject a bad IDENTIFY with a diagnostic close frame
    /// (4100/4101/4102 — see `crate::server`).
    async fn close_with_code(&mut self, code: u16, reason: String) -> Result<()> {
        let frame = tokio_tungstenite::tungstenite::protocol::CloseFrame {
            code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::from(code),
            reason: reason.into(),
        };
        self.inner
            .close(Some(frame))
            .await
            .or_else(|e| match e {
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                | tokio_tungstenite::tungstenite::Error::AlreadyClosed => Ok(()),
                e => Err(Error::Transport(e.to_string())),
            })
    }
}
