//! The duck-typed transport boundary the Router is built against.
//!
//! The Router depends only on [`Transport`]; it never knows whether the
//! underlying socket is server- or client-side, plaintext or TLS. Framing,
//! ping/pong keepalive and TLS negotiation all live below this boundary,
//! inside `tokio-tungstenite`.

mod client;
mod memory;
mod server;

pub use client::ClientTransport;
pub use memory::{memory_pair, MemoryTransport};
pub use server::ServerTransport;

use crate::error::Result;
use async_trait::async_trait;

/// A single bidirectional text-frame transport.
///
/// Implementations are stateless with respect to application semantics: a
/// framing error surfaces as a [`crate::Error`] from `receive`, which the
/// Router treats as terminal for that connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one text frame down the wire.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Wait for the next text frame. Returns an error when the underlying
    /// socket is closed or a framing error occurs.
    async fn receive(&mut self) -> Result<String>;

    /// Close the underlying connection. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Close the connection with a specific close code and reason, used by
    /// the server's admission gate to reject a bad IDENTIFY (see
    /// `crate::server`'s 4100/4101/4102 close codes). Transports that don't
    /// carry a notion of close codes (e.g. the in-process test transport)
    /// fall back to a plain [`Transport::close`].
    async fn close_with_code(&mut self, _code: u16, _reason: String) -> Result<()> {
        self.close().await
    }
}
