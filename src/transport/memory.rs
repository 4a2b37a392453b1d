//! In-process [`Transport`] pair used by the integration tests.
//!
//! Exercises the Router's pipe loop without binding a real socket: two
//! `tokio::sync::mpsc` channels stand in for the wire, one per direction.

use super::Transport;
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One end of an in-process duplex pipe.
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Create a connected pair of [`MemoryTransport`]s, as if one were the
/// server side and the other the client side of a WebSocket connection.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: a_tx, rx: a_rx },
        MemoryTransport { tx: b_tx, rx: b_rx },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.tx
            .send(text)
            .map_err(|_| Error::ConnectionLost)
    }

    async fn receive(&mut self) -> Result<String> {
        self.rx.recv().await.ok_or(Error::ConnectionLost)
    }

    async fn close(&mut self) -> Result<()> {
        self.rx.close();
        Ok(())
    }
}
