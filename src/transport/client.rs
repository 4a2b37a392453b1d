//! Client-side transport adapter.
//!
//! Dials a WebSocket URL and wraps the resulting stream. TLS, if any, is
//! negotiated by `tokio-tungstenite` before this type ever sees the stream.

use super::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Client-side [`Transport`] that dials the server.
pub struct ClientTransport {
    inner: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ClientTransport {
    /// Connect to `url` and return the established transport.
    pub async fn connect(url: &str) -> Result<Self> {
        let (inner, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {url}: {e}")))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Transport for ClientTransport {
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
                    debug!("ignoring keepalive frame on client transport");
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
}
