//! Error types shared by every component of the router.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing requests across the duplex pipe.
///
/// `Error` is the root category: every failure surfaced by this crate,
/// from a malformed frame up to a remote route throwing, funnels through
/// one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A route name collides with one already present in a registry.
    #[error("a route named '{0}' is already registered")]
    DuplicateRoute(String),

    /// A client identifier is already connected and no valid override key was presented.
    #[error("identifier '{0}' is already connected")]
    DuplicateConnection(String),

    /// The remote endpoint has no handler registered for this route.
    #[error("unknown route: {0}")]
    UnknownRoute(String),

    /// The server has no connection for the requested client identifier.
    #[error("unknown client: {0}")]
    UnknownClient(String),

    /// A frame failed to decode, or a response arrived for an id with no pending slot.
    #[error("unknown or malformed packet: {0}")]
    UnknownPacket(String),

    /// An inbound request arrived but no receiver has been registered.
    #[error("no receive handler registered for inbound requests")]
    MissingReceiveHandler,

    /// An envelope carried a value type this endpoint does not expect here.
    #[error("unhandled websocket type: {0}")]
    UnhandledWebsocketType(String),

    /// The remote end returned a failure payload for a request.
    #[error("request failed: {0}")]
    RequestFailed(String),

    /// The connection was lost while a request was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// A configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The underlying WebSocket transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The router has already transitioned to `Closed`.
    #[error("router is closed")]
    RouterClosed,

    /// I/O error bubbled up from the transport layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for anything not covered above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether a caller could reasonably retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionLost | Error::Transport(_) | Error::Io(_)
        )
    }

    /// A short, stable code suitable for logging and metrics.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::DuplicateRoute(_) => "DUPLICATE_ROUTE",
            Error::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            Error::UnknownRoute(_) => "UNKNOWN_ROUTE",
            Error::UnknownClient(_) => "UNKNOWN_CLIENT",
            Error::UnknownPacket(_) => "UNKNOWN_PACKET",
            Error::MissingReceiveHandler => "MISSING_RECEIVE_HANDLER",
            Error::UnhandledWebsocketType(_) => "UNHANDLED_WEBSOCKET_TYPE",
            Error::RequestFailed(_) => "REQUEST_FAILED",
            Error::ConnectionLost => "CONNECTION_LOST",
            Error::InvalidConfig(_) => "INVALID_CONFIG",
            Error::Transport(_) => "TRANSPORT_ERROR",
            Error::RouterClosed => "ROUTER_CLOSED",
            Error::Io(_) => "IO_ERROR",
            Error::Other(_) => "OTHER_ERROR",
        }
    }
}
