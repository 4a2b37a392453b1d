//! Route registration.
//!
//! Two ways to expose a function as an IPC route:
//!
//! - [`RouteRegistry::add`] at runtime, against a specific registry instance.
//! - [`register_route!`] at load time, which files the route into a
//!   process-wide deferred list via `inventory`; each [`RouteRegistry`]
//!   pulls the deferred list in once via [`RouteRegistry::load_deferred`].
//!
//! Binding a route to a particular receiver instance needs no separate
//! API here: a Rust closure already owns whatever state it needs to call
//! a method on, so there's nothing left to bind after the fact.

use crate::error::{Error, Result};
use crate::packet::{RouteBody, RoutePacket};
use crate::router::ReplyFn;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::error;

/// A registered IPC route: takes the call's `arguments` and resolves to the
/// value that becomes the response payload.
pub type RouteFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One entry in the process-wide deferred route list, filed by
/// [`register_route!`] and collected here at link time.
pub struct DeferredRoute {
    pub name: &'static str,
    pub factory: fn() -> RouteFn,
}

inventory::collect!(DeferredRoute);

/// File a route into the process-wide deferred list. Every [`RouteRegistry`]
/// that calls [`RouteRegistry::load_deferred`] picks it up under its own
/// name the first time it does so.
///
/// ```ignore
/// duplex_router::register_route!("ping", |_args: serde_json::Value| async move {
///     Ok(serde_json::json!("pong"))
/// });
/// ```
#[macro_export]
macro_rules! register_route {
    ($name:expr, $body:expr) => {
        $crate::inventory::submit! {
            $crate::registry::DeferredRoute {
                name: $name,
                factory: || ::std::sync::Arc::new(move |args: ::serde_json::Value| {
                    ::std::boxed::Box::pin(($body)(args)) as $crate::registry::RouteFuture
                }),
            }
        }
    };
}

/// Type alias so [`register_route!`] doesn't need to spell out the boxed
/// future type at every call site.
pub type RouteFuture = BoxFuture<'static, Result<Value>>;

struct Inner {
    routes: RwLock<HashMap<String, RouteFn>>,
    deferred_loaded: AtomicBool,
}

/// A name-to-handler map for IPC routes. Cheaply cloneable; every clone
/// shares the same underlying map.
#[derive(Clone)]
pub struct RouteRegistry {
    inner: Arc<Inner>,
}

impl RouteRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                routes: RwLock::new(HashMap::new()),
                deferred_loaded: AtomicBool::new(false),
            }),
        }
    }

    /// Register a route against this instance. Errors if the name is
    /// already taken, by either an instance-local or a loaded deferred
    /// route.
    pub fn add(&self, name: impl Into<String>, handler: RouteFn) -> Result<()> {
        let name = name.into();
        let mut routes = self.inner.routes.write().unwrap();
        if routes.contains_key(&name) {
            return Err(Error::DuplicateRoute(name));
        }
        routes.insert(name, handler);
        Ok(())
    }

    /// Remove a previously registered route, returning it if one existed.
    pub fn remove(&self, name: &str) -> Option<RouteFn> {
        self.inner.routes.write().unwrap().remove(name)
    }

    /// Look up a route by name.
    pub fn lookup(&self, name: &str) -> Option<RouteFn> {
        self.inner.routes.read().unwrap().get(name).cloned()
    }

    /// How many routes are currently registered (instance-local plus any
    /// deferred routes already merged in).
    pub fn len(&self) -> usize {
        self.inner.routes.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge the process-wide deferred route list into this instance. A
    /// no-op on every call after the first.
    pub fn load_deferred(&self) -> Result<()> {
        if self.inner.deferred_loaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut routes = self.inner.routes.write().unwrap();
        for deferred in inventory::iter::<DeferredRoute> {
            if routes.contains_key(deferred.name) {
                // Leave deferred_loaded false: a half-merged registry is in
                // no worse a state than before this call, and a caller that
                // retries after logging the error gets the same error again
                // instead of a silent, incomplete success.
                self.inner.deferred_loaded.store(false, Ordering::SeqCst);
                return Err(Error::DuplicateRoute(deferred.name.to_string()));
            }
            routes.insert(deferred.name.to_string(), (deferred.factory)());
        }
        Ok(())
    }
}

impl Default for RouteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared inbound-request dispatch used by both [`crate::client::Client`]
/// and [`crate::server::Server`]: decode the route packet riding inside an
/// inbound request [`crate::packet::Envelope`], look the route up, invoke
/// it, and reply with a SUCCESS_RESPONSE/FAILURE_RESPONSE packet.
///
/// Accepts either `RouteBody::Request` or `RouteBody::ClientRequest` — the
/// distinction only matters for which side originated the call, not for how
/// it's served.
pub async fn dispatch_request(registry: &RouteRegistry, self_identifier: &str, data: Value, reply: ReplyFn) {
    let route_packet: RoutePacket = match serde_json::from_value(data) {
        Ok(packet) => packet,
        Err(e) => {
            error!(%e, "failed to parse inbound route packet");
            return;
        }
    };

    let request = match route_packet.body {
        RouteBody::Request { data } => data,
        RouteBody::ClientRequest { data } => data,
        other => {
            error!(?other, "inbound envelope was not a request");
            return;
        }
    };

    let route_name = request.route.clone();
    let outcome = match registry.lookup(&route_name) {
        None => RouteBody::Failure {
            data: format!("{route_name} is not a valid route name."),
        },
        Some(route) => {
            let arguments = Value::Object(request.arguments);
            match route(arguments).await {
                Ok(value) => RouteBody::Success { data: value },
                Err(e) => RouteBody::Failure { data: e.to_string() },
            }
        }
    };

    let response_packet = RoutePacket {
        identifier: self_identifier.to_string(),
        body: outcome,
    };
    match serde_json::to_value(&response_packet) {
        Ok(value) => {
            let _ = reply(value).await;
        }
        Err(e) => error!(%e, "failed to encode response packet"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_route(value: Value) -> RouteFn {
        Arc::new(move |_args: Value| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let registry = RouteRegistry::new();
        registry.add("ping", make_route(json!("pong"))).unwrap();
        assert!(registry.lookup("ping").is_some());
        assert!(registry.lookup("missing").is_none());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let registry = RouteRegistry::new();
        registry.add("ping", make_route(json!("pong"))).unwrap();
        let err = registry.add("ping", make_route(json!("again"))).unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute(name) if name == "ping"));
    }

    #[test]
    fn remove_drops_the_route() {
        let registry = RouteRegistry::new();
        registry.add("ping", make_route(json!("pong"))).unwrap();
        assert!(registry.remove("ping").is_some());
        assert!(registry.lookup("ping").is_none());
    }

    #[test]
    fn load_deferred_is_idempotent() {
        let registry = RouteRegistry::new();
        registry.load_deferred().unwrap();
        let before = registry.len();
        registry.load_deferred().unwrap();
        assert_eq!(before, registry.len());
    }

    #[tokio::test]
    async fn registered_route_invokes_handler() {
        let registry = RouteRegistry::new();
        registry
            .add(
                "echo",
                Arc::new(|args: Value| Box::pin(async move { Ok(args) })),
            )
            .unwrap();
        let route = registry.lookup("echo").unwrap();
        let result = route(json!({"x": 1})).await.unwrap();
        assert_eq!(result, json!({"x": 1}));
    }
}
