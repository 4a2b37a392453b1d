//! Bidirectional RPC over a single persistent WebSocket connection.
//!
//! One wire, one [`Router`] per connection, many requests in flight in
//! either direction at once:
//!
//! ```text
//! A.request("foo", k=v)
//!   -> Router assigns packet_id, enqueues a `request` envelope
//!   -> B's Router reads it, dispatches to B's RouteRegistry
//!   -> B's handler returns a value, Router sends a `response` envelope
//!   -> A's Router correlates the response by packet_id and resolves it
//! ```
//!
//! [`Router`] is the core of this crate: the per-connection multiplexer
//! that keeps interleaved outbound requests, outbound responses, inbound
//! requests and inbound responses straight on one transport. [`Client`] and
//! [`Server`] are thin wrappers around it — an IDENTIFY handshake and
//! reconnect policy on one side, a `{identifier -> Router}` connection
//! table and fan-out on the other.
//!
//! Accepting TCP connections, the WebSocket upgrade/handshake, TLS and
//! ping/pong keepalive are all out of scope; this crate consumes an
//! already-established `tokio-tungstenite` stream through the [`Transport`]
//! trait.

#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod packet;
pub mod registry;
pub mod router;
pub mod server;
pub mod transport;

pub use client::Client;
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use packet::Envelope;
pub use registry::RouteRegistry;
pub use router::Router;
pub use server::Server;
pub use transport::Transport;

// Re-exported so `register_route!` can refer to `$crate::inventory` without
// every crate that uses the macro also depending on `inventory` directly.
pub use inventory;
