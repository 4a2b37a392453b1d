//! The IPC client: one [`Router`] wrapped with the IDENTIFY handshake,
//! reconnect-with-limit, and a route-name-keyed request API.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::packet::{IdentifyData, RequestPacket, RouteBody, RoutePacket};
use crate::registry::{dispatch_request, RouteRegistry};
use crate::router::Router;
use crate::transport::ClientTransport;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tracing::{info, warn};

struct Inner {
    router: RwLock<Router>,
    registry: RouteRegistry,
    config: ClientConfig,
    /// Monotonically increasing count of reconnect attempts made over the
    /// whole lifetime of this client, including retries of the very first
    /// connection. Capped at `config.reconnect_attempt_count`.
    attempts_used: AtomicU32,
    /// Set once `start()` has produced a live connection and handed it to
    /// the reconnect supervisor task.
    started: AtomicBool,
    /// Set by `Client::close()` to tell the supervisor task a disconnect
    /// was requested, not suffered, so it should not try to reconnect.
    closing: AtomicBool,
    terminal_tx: watch::Sender<bool>,
    terminal_rx: watch::Receiver<bool>,
}

/// A connected IPC client. Owns exactly one [`Router`] at a time; a
/// reconnect replaces it with a fresh one rather than restarting the old
/// pipe loop, which can't be resumed once its transport has failed. Cheaply
/// cloneable; every clone shares the same underlying connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Construct a client. Does not connect; call [`Client::start`] for that.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let registry = RouteRegistry::new();
        registry.load_deferred()?;
        let (terminal_tx, terminal_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                router: RwLock::new(Router::new()),
                registry,
                config,
                attempts_used: AtomicU32::new(0),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                terminal_tx,
                terminal_rx,
            }),
        })
    }

    /// The route registry backing this client's inbound requests. Register
    /// application routes here before calling [`Client::start`].
    pub fn route_registry(&self) -> &RouteRegistry {
        &self.inner.registry
    }

    /// Register a single route, shorthand for `route_registry().add(..)`.
    pub fn add_route(&self, name: impl Into<String>, handler: crate::registry::RouteFn) -> Result<()> {
        self.inner.registry.add(name, handler)
    }

    /// Remove a previously registered route.
    pub fn remove_route(&self, name: &str) -> Option<crate::registry::RouteFn> {
        self.inner.registry.remove(name)
    }

    /// Look up a registered route by name.
    pub fn route(&self, name: &str) -> Option<crate::registry::RouteFn> {
        self.inner.registry.lookup(name)
    }

    fn install_receiver(&self, router: &Router) {
        let registry = self.inner.registry.clone();
        let identifier = self.inner.config.identifier.clone();
        router.register_receiver(move |data, reply| {
            let registry = registry.clone();
            let identifier = identifier.clone();
            async move {
                dispatch_request(&registry, &identifier, data, reply).await;
            }
        });
    }

    fn identify_payload(&self) -> Result<Value> {
        let packet = RoutePacket {
            identifier: self.inner.config.identifier.clone(),
            body: RouteBody::Identify {
                data: IdentifyData {
                    secret_key: self.inner.config.secret_key.clone(),
                    override_key: self.inner.config.override_key.clone(),
                },
            },
        };
        serde_json::to_value(&packet).map_err(|e| Error::UnknownPacket(e.to_string()))
    }

    /// Dial the server once and run the IDENTIFY handshake over a fresh
    /// [`Router`]. One unit of work shared by the initial connect in
    /// [`Client::start`] and every later reconnect the supervisor task
    /// performs after a live disconnect.
    async fn connect_once(&self) -> Result<Router> {
        let url = self.inner.config.connect_url();
        let identify_payload = self.identify_payload()?;
        let router = Router::new();
        self.install_receiver(&router);
        let transport = ClientTransport::connect(&url).await?;
        router.connect_client(Box::new(transport), identify_payload).await?;
        Ok(router)
    }

    /// Connect to the server, performing the IDENTIFY handshake. Retries up
    /// to `reconnect_attempt_count` times (see [`ClientConfig`]) before
    /// giving up. Once connected, a background task supervises the
    /// connection and transparently reconnects (re-running IDENTIFY each
    /// time, against the same shared attempt budget) if it later drops.
    pub async fn start(&self) -> Result<()> {
        loop {
            match self.connect_once().await {
                Ok(router) => {
                    *self.inner.router.write().unwrap() = router.clone();
                    info!(identifier = %self.inner.config.identifier, "connected to server");
                    self.inner.started.store(true, Ordering::SeqCst);
                    if self.inner.config.handle_os_signals {
                        self.spawn_signal_handler();
                    }
                    self.spawn_supervisor(router);
                    return Ok(());
                }
                Err(e) => {
                    let used = self.inner.attempts_used.fetch_add(1, Ordering::SeqCst) + 1;
                    if used > self.inner.config.reconnect_attempt_count {
                        let _ = self.inner.terminal_tx.send(true);
                        return Err(e);
                    }
                    warn!(attempt = used, %e, "connect attempt failed, retrying");
                }
            }
        }
    }

    /// Watch a live connection for its terminal shutdown, then reconnect
    /// (re-running IDENTIFY) unless the shutdown was requested via
    /// [`Client::close`]. Gives up once the shared reconnect budget is
    /// exhausted, resolving [`Client::block_until_closed`].
    fn spawn_supervisor(&self, mut router: Router) {
        let client = self.clone();
        tokio::spawn(async move {
            loop {
                router.block_until_closed().await;

                if client.inner.closing.load(Ordering::SeqCst) {
                    let _ = client.inner.terminal_tx.send(true);
                    return;
                }

                warn!(identifier = %client.inner.config.identifier, "connection lost, attempting reconnect");
                loop {
                    match client.connect_once().await {
                        Ok(new_router) => {
                            *client.inner.router.write().unwrap() = new_router.clone();
                            router = new_router;
                            info!(identifier = %client.inner.config.identifier, "reconnected to server");
                            break;
                        }
                        Err(e) => {
                            let used = client.inner.attempts_used.fetch_add(1, Ordering::SeqCst) + 1;
                            if used > client.inner.config.reconnect_attempt_count {
                                warn!(%e, "exhausted reconnect attempts, giving up");
                                let _ = client.inner.terminal_tx.send(true);
                                return;
                            }
                            warn!(attempt = used, %e, "reconnect attempt failed, retrying");
                        }
                    }
                }
            }
        });
    }

    fn spawn_signal_handler(&self) {
        let client = self.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            client.close();
        });
    }

    /// Make a request to the server and await the response.
    pub async fn request(
        &self,
        route: impl Into<String>,
        arguments: serde_json::Map<String, Value>,
    ) -> Result<Value> {
        let router = self.inner.router.read().unwrap().clone();
        let route_packet = RoutePacket {
            identifier: self.inner.config.identifier.clone(),
            body: RouteBody::ClientRequest {
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
            other => Err(Error::UnhandledWebsocketType(format!(
                "Client.request expected SUCCESS_RESPONSE or FAILURE_RESPONSE, received {other:?}"
            ))),
        }
    }

    /// Close the client's connection. Idempotent. Tells the reconnect
    /// supervisor (if one is running) that this shutdown was requested, so
    /// it resolves [`Client::block_until_closed`] instead of reconnecting.
    pub fn close(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.router.read().unwrap().close();
        if !self.inner.started.load(Ordering::SeqCst) {
            // start() never produced a live connection, so no supervisor
            // task exists to notice `closing` and resolve the terminal
            // signal itself.
            let _ = self.inner.terminal_tx.send(true);
        }
    }

    /// Await terminal shutdown: either an explicit [`Client::close`], or the
    /// reconnect supervisor exhausting `reconnect_attempt_count` after a
    /// live disconnect.
    pub async fn block_until_closed(&self) {
        let mut rx = self.inner.terminal_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RouteFuture;
    use crate::server::Server;
    use crate::transport::memory_pair;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn request_round_trips_through_registered_route() {
        // Exercise the dispatch path directly rather than Client::start,
        // since start() dials a real socket; a memory-backed Router pair
        // stands in for the two ends of one IDENTIFY'd connection.
        let (client_side, server_side) = memory_pair();

        let client_registry = RouteRegistry::new();
        let server_registry = RouteRegistry::new();
        server_registry
            .add(
                "add_one",
                Arc::new(|args: Value| {
                    Box::pin(async move {
                        let n = args.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                        Ok(json!(n + 1))
                    }) as RouteFuture
                }),
            )
            .unwrap();

        let client_router = Router::new();
        let server_router = Router::new();

        client_router.register_receiver({
            let registry = client_registry.clone();
            move |data, reply| {
                let registry = registry.clone();
                async move { dispatch_request(&registry, "DEFAULT", data, reply).await }
            }
        });
        server_router.register_receiver({
            let registry = server_registry.clone();
            move |data, reply| {
                let registry = registry.clone();
                async move { dispatch_request(&registry, "SERVER", data, reply).await }
            }
        });

        client_router.connect_server(Box::new(client_side)).unwrap();
        server_router.connect_server(Box::new(server_side)).unwrap();

        let mut args = serde_json::Map::new();
        args.insert("n".to_string(), json!(41));
        let route_packet = RoutePacket {
            identifier: "DEFAULT".to_string(),
            body: RouteBody::ClientRequest {
                data: RequestPacket {
                    route: "add_one".to_string(),
                    arguments: args,
                },
            },
        };
        let payload = serde_json::to_value(&route_packet).unwrap();
        let handle = client_router.send(payload).unwrap();
        let response = handle.await.unwrap();
        let route_response: RoutePacket = serde_json::from_value(response).unwrap();
        match route_response.body {
            RouteBody::Success { data } => assert_eq!(data, json!(42)),
            other => panic!("unexpected response: {other:?}"),
        }

        let _ = Server::new(crate::config::ServerConfig::default());
    }

    #[tokio::test]
    async fn unknown_route_yields_failure_response() {
        let (client_side, server_side) = memory_pair();
        let server_registry = RouteRegistry::new();
        let client_router = Router::new();
        let server_router = Router::new();
        server_router.register_receiver({
            let registry = server_registry.clone();
            move |data, reply| {
                let registry = registry.clone();
                async move { dispatch_request(&registry, "SERVER", data, reply).await }
            }
        });
        client_router.connect_server(Box::new(client_side)).unwrap();
        server_router.connect_server(Box::new(server_side)).unwrap();

        let route_packet = RoutePacket {
            identifier: "DEFAULT".to_string(),
            body: RouteBody::ClientRequest {
                data: RequestPacket {
                    route: "nope".to_string(),
                    arguments: serde_json::Map::new(),
                },
            },
        };
        let payload = serde_json::to_value(&route_packet).unwrap();
        let handle = client_router.send(payload).unwrap();
        let response = handle.await.unwrap();
        let route_response: RoutePacket = serde_json::from_value(response).unwrap();
        match route_response.body {
            RouteBody::Failure { data } => assert!(data.contains("nope")),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_before_start_resolves_block_until_closed() {
        let client = Client::new(ClientConfig {
            handle_os_signals: false,
            ..ClientConfig::default()
        })
        .unwrap();
        client.close();
        tokio::time::timeout(std::time::Duration::from_millis(200), client.block_until_closed())
            .await
            .expect("block_until_closed hung on a never-started client");
    }
}
