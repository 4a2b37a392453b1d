//! The IPC server: a `{identifier → Router}` connection table, IDENTIFY
//! admission, and fan-out request helpers.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::packet::{Envelope, EnvelopeType, RequestPacket, RouteBody, RoutePacket};
use crate::registry::{dispatch_request, RouteFn, RouteRegistry};
use crate::router::Router;
use crate::transport::Transport;
use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{info, warn};

/// Close code sent when IDENTIFY carries the wrong secret key.
pub const CLOSE_CODE_INVALID_SECRET: u16 = 4100;
/// Close code sent when the first frame on a connection isn't IDENTIFY.
pub const CLOSE_CODE_EXPECTED_IDENTIFY: u16 = 4101;
/// Close code sent when an identifier is already connected and no valid
/// override key was presented.
pub const CLOSE_CODE_DUPLICATE_IDENTIFIER: u16 = 4102;

/// Owns every connected client's [`Router`], keyed by the identifier each
/// one presented at IDENTIFY.
pub struct Server {
    connections: RwLock<HashMap<String, Router>>,
    registry: RouteRegistry,
    config: ServerConfig,
}

impl Server {
    /// Construct a server with an empty connection table.
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let registry = RouteRegistry::new();
        registry.load_deferred()?;
        Ok(Self {
            connections: RwLock::new(HashMap::new()),
            registry,
            config,
        })
    }

    /// The route registry backing this server's inbound requests. Register
    /// application routes here before accepting connections.
    pub fn route_registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Register a single route, shorthand for `route_registry().add(..)`.
    pub fn add_route(&self, name: impl Into<String>, handler: RouteFn) -> Result<()> {
        self.registry.add(name, handler)
    }

    /// Remove a previously registered route.
    pub fn remove_route(&self, name: &str) -> Option<RouteFn> {
        self.registry.remove(name)
    }

    /// Look up a registered route by name.
    pub fn route(&self, name: &str) -> Option<RouteFn> {
        self.registry.lookup(name)
    }

    /// How many clients are currently connected.
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// The admission gate: validate an IDENTIFY envelope against this
    /// server's `secret_key`/`override_key`, reject with the appropriate
    /// close code on failure, otherwise stand up a [`Router`] over
    /// `transport`, register it under the presented identifier, and
    /// acknowledge the handshake.
    ///
    /// Never inserts into the connection table unless it also sends an
    /// IDENTIFY acknowledgment — the two happen as one unbroken sequence
    /// below.
    pub async fn parse_identify(
        &self,
        envelope: Envelope,
        mut transport: Box<dyn Transport>,
    ) -> Result<String> {
        if envelope.r#type != EnvelopeType::Request {
            let _ = transport
                .close_with_code(
                    CLOSE_CODE_EXPECTED_IDENTIFY,
                    "Expected a request envelope carrying IDENTIFY".to_string(),
                )
                .await;
            return Err(Error::UnhandledWebsocketType(format!(
                "{:?}",
                envelope.r#type
            )));
        }

        let route_packet: RoutePacket = serde_json::from_value(envelope.data)
            .map_err(|e| Error::UnknownPacket(format!("malformed IDENTIFY packet: {e}")))?;
        let identifier = route_packet.identifier.clone();

        let identify = match route_packet.body {
            RouteBody::Identify { data } => data,
            other => {
                let _ = transport
                    .close_with_code(
                        CLOSE_CODE_EXPECTED_IDENTIFY,
                        format!("Expected IDENTIFY, received {other:?}"),
                    )
                    .await;
                return Err(Error::UnhandledWebsocketType(format!(
                    "expected IDENTIFY, received {other:?}"
                )));
            }
        };

        if identify.secret_key != self.config.secret_key {
            let _ = transport
                .close_with_code(CLOSE_CODE_INVALID_SECRET, "Invalid secret key.".to_string())
                .await;
            return Err(Error::UnhandledWebsocketType(
                "client attempted to connect with an incorrect secret key".to_string(),
            ));
        }

        let override_ok = identify
            .override_key
            .as_deref()
            .zip(self.config.override_key.as_deref())
            .is_some_and(|(given, expected)| given == expected);

        {
            let connections = self.connections.read().unwrap();
            if connections.contains_key(&identifier) && !override_ok {
                drop(connections);
                let _ = transport
                    .close_with_code(
                        CLOSE_CODE_DUPLICATE_IDENTIFIER,
                        "Duplicate identifier on IDENTIFY".to_string(),
                    )
                    .await;
                return Err(Error::DuplicateConnection(identifier));
            }
        }

        let router = Router::new();
        {
            let registry = self.registry.clone();
            let self_identifier = "SERVER".to_string();
            router.register_receiver(move |data, reply| {
                let registry = registry.clone();
                let self_identifier = self_identifier.clone();
                async move {
                    dispatch_request(&registry, &self_identifier, data, reply).await;
                }
            });
        }
        router.connect_server(transport)?;

        let evicted = {
            let mut connections = self.connections.write().unwrap();
            connections.insert(identifier.clone(), router.clone())
        };
        if let Some(previous) = evicted {
            info!(%identifier, "override eviction of existing connection");
            previous.close();
        }

        // The Client only checks that a response arrived at all for the
        // identify packet_id, so this isn't routed through RouteBody (whose
        // IDENTIFY variant carries the request-side IdentifyData, not an
        // acknowledgment).
        let ack_value = serde_json::json!({"identifier": identifier, "type": "IDENTIFY", "data": Value::Null});
        router.send_response(envelope.packet_id, ack_value)?;

        info!(%identifier, "client connected");
        Ok(identifier)
    }

    /// Make a request to one connected client and await the response.
    pub async fn request(
        &self,
        route: impl Into<String>,
        client_identifier: &str,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<Value> {
        let router = {
            let connections = self.connections.read().unwrap();
            connections
                .get(client_identifier)
                .cloned()
                .ok_or_else(|| Error::UnknownClient(client_identifier.to_string()))?
        };
        send_route_request(&router, client_identifier, route, arguments).await
    }

    /// Issue the same request to every connected client concurrently.
    /// Transport failures for individual clients become a [`Error::RequestFailed`]
    /// entry in the result map rather than aborting the whole fan-out.
    pub async fn request_all(
        &self,
        route: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
    ) -> HashMap<String, std::result::Result<Value, Error>> {
        let route = route.into();
        let snapshot: Vec<(String, Router)> = {
            let connections = self.connections.read().unwrap();
            connections
                .iter()
                .map(|(id, router)| (id.clone(), router.clone()))
                .collect()
        };

        let futures = snapshot.into_iter().map(|(identifier, router)| {
            let route = route.clone();
            let arguments = arguments.clone();
            async move {
                let result = send_route_request(&router, &identifier, route, arguments).await;
                (identifier, result)
            }
        });

        join_all(futures).await.into_iter().collect()
    }

    /// Remove a client connection and close its Router. Does not notify the
    /// client gracefully beforehand.
    pub fn disconnect(&self, identifier: &str) -> Result<()> {
        let router = self
            .connections
            .write()
            .unwrap()
            .remove(identifier)
            .ok_or_else(|| Error::UnknownClient(identifier.to_string()))?;
        router.close();
        Ok(())
    }
}

async fn send_route_request(
    router: &Router,
    client_identifier: &str,
    route: impl Into<String>,
    arguments: serde_json::Map<String, Value>,
) -> Result<Value> {
    let route_packet = RoutePacket {
        identifier: client_identifier.to_string(),
        body: RouteBody::Request {
            data: RequestPacket {
                route: route.into(),
                arguments,
            },
        },
    };
    let payload = serde_json::to_value(&route_packet).map_err(|e| Error::UnknownPacket(e.to_string()))?;
    let handle = router.send(payload)?;
    let response = handle.await?;
    let route_response: RoutePacket =
        serde_json::from_value(response).map_err(|e| Error::UnknownPacket(e.to_string()))?;
    match route_response.body {
        RouteBody::Success { data } => Ok(data),
        RouteBody::Failure { data } => Err(Error::RequestFailed(data)),
        other => {
            warn!(?other, "unexpected response shape for a route request");
            Err(Error::UnhandledWebsocketType(format!("{other:?}")))
        }
    }
}
