//! Configuration types for the Client and Server.

use crate::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The identifier a [`crate::client::Client`] uses when it hasn't been
/// given one explicitly.
pub const DEFAULT_IDENTIFIER: &str = "DEFAULT";

/// Configuration for a [`crate::client::Client`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server host, with or without a `ws://`/`wss://` scheme.
    pub url: String,

    /// Port to connect to. Appended to `url` if given and `url` has no
    /// port of its own.
    pub port: Option<u16>,

    /// The identifier this client presents during the IDENTIFY handshake.
    pub identifier: String,

    /// Shared secret validated by the server's admission gate.
    pub secret_key: String,

    /// When set, lets this connection evict an existing connection
    /// registered under the same identifier instead of being rejected.
    pub override_key: Option<String>,

    /// Number of reconnect attempts after the initial connection drops.
    /// Zero disables reconnection entirely.
    pub reconnect_attempt_count: u32,

    /// Whether the client installs a `SIGINT`/`SIGTERM` handler that closes
    /// the Router on receipt.
    pub handle_os_signals: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost".to_string(),
            port: Some(8080),
            identifier: DEFAULT_IDENTIFIER.to_string(),
            secret_key: String::new(),
            override_key: None,
            reconnect_attempt_count: 1,
            handle_os_signals: true,
        }
    }
}

impl ClientConfig {
    /// Validate configuration parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `url` is empty
    /// - `identifier` is empty
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::InvalidConfig("url must not be empty".to_string()));
        }
        if self.identifier.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "identifier must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The fully qualified `ws://host:port` URL the client actually dials,
    /// normalizing a bare host into a WebSocket URL and appending `port` if
    /// one is configured and `url` doesn't already carry one.
    pub fn connect_url(&self) -> String {
        let mut url = self.url.clone();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            url = format!("ws://{url}");
        }
        if let Some(port) = self.port {
            let scheme_end = url.find("://").map(|i| i + 3).unwrap_or(0);
            let host_part = &url[scheme_end..];
            if !host_part.contains(':') {
                url.push(':');
                url.push_str(&port.to_string());
            }
        }
        url
    }
}

/// Configuration for a [`crate::server::Server`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Shared secret every connecting client's IDENTIFY must match.
    pub secret_key: String,

    /// Override key clients may present to evict an existing connection
    /// registered under the same identifier. Randomly generated by default
    /// so that override eviction is opt-in per deployment.
    pub override_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            override_key: Some(generate_override_key()),
        }
    }
}

impl ServerConfig {
    /// Validate configuration parameters. Currently always succeeds; kept
    /// for symmetry with [`ClientConfig::validate`] and so future fields
    /// gain validation without changing the call site.
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

fn generate_override_key() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
