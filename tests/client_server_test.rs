//! Client/Server integration tests over the in-process duplex transport,
//! covering simple round trips, fan-out, unknown routes, duplicate and
//! overridden identifiers, and bidirectional in-flight requests.
//!
//! `Client::start` dials a real `tokio-tungstenite` socket, so these tests
//! drive the same machinery `Client`/`Server` use internally — a `Router`
//! plus `dispatch_request` on the "client" side, `Server::parse_identify`
//! on the other — without needing a bound TCP port.

use duplex_router::config::ServerConfig;
use duplex_router::error::Error;
use duplex_router::packet::{Envelope, IdentifyData, RouteBody, RoutePacket};
use duplex_router::registry::{dispatch_request, RouteFuture, RouteRegistry};
use duplex_router::router::Router;
use duplex_router::server::Server;
use duplex_router::transport::memory_pair;
use serde_json::{json, Value};
use std::sync::Arc;

fn identify_envelope(identifier: &str, secret_key: &str, override_key: Option<&str>) -> Envelope {
    let packet = RoutePacket {
        identifier: identifier.to_string(),
        body: RouteBody::Identify {
            data: IdentifyData {
                secret_key: secret_key.to_string(),
                override_key: override_key.map(str::to_string),
            },
        },
    };
    Envelope::request(
        format!("identify-{identifier}"),
        serde_json::to_value(&packet).unwrap(),
    )
}

/// Stand up a connected client side: a bare `Router` with its own
/// `RouteRegistry`, returning both halves of the in-process transport pair
/// so the caller can hand the server half to `Server::parse_identify`.
fn spawn_client(identifier: &str) -> (Router, RouteRegistry, duplex_router::transport::MemoryTransport) {
    let (server_side, client_side) = memory_pair();
    let router = Router::new();
    let registry = RouteRegistry::new();
    router.register_receiver({
        let registry = registry.clone();
        let identifier = identifier.to_string();
        move |data, reply| {
            let registry = registry.clone();
            let identifier = identifier.clone();
            async move { dispatch_request(&registry, &identifier, data, reply).await }
        }
    });
    router.connect_server(Box::new(client_side)).unwrap();
    (router, registry, server_side)
}

fn add_returning(registry: &RouteRegistry, name: &str, value: Value) {
    registry
        .add(name, Arc::new(move |_args: Value| {
            let value = value.clone();
            Box::pin(async move { Ok(value) }) as RouteFuture
        }))
        .unwrap();
}

async fn admit(server: &Server, identifier: &str, transport: duplex_router::transport::MemoryTransport) {
    server
        .parse_identify(identify_envelope(identifier, "", None), Box::new(transport))
        .await
        .unwrap();
}

#[tokio::test]
async fn scenario_1_simple_round_trip() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (_client_router, client_registry, server_side) = spawn_client("one");
    add_returning(&client_registry, "ping", json!("pong"));
    admit(&server, "one", server_side).await;

    let result = server.request("ping", "one", serde_json::Map::new()).await.unwrap();
    assert_eq!(result, json!("pong"));
}

#[tokio::test]
async fn scenario_2_fan_out_to_every_client() {
    let server = Server::new(ServerConfig::default()).unwrap();

    let (_one_router, one_registry, one_side) = spawn_client("one");
    add_returning(&one_registry, "ping", json!("from-one"));
    admit(&server, "one", one_side).await;

    let (_two_router, two_registry, two_side) = spawn_client("two");
    add_returning(&two_registry, "ping", json!("from-two"));
    admit(&server, "two", two_side).await;

    let results = server.request_all("ping", serde_json::Map::new()).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results["one"].as_ref().unwrap(), &json!("from-one"));
    assert_eq!(results["two"].as_ref().unwrap(), &json!("from-two"));
}

#[tokio::test]
async fn scenario_3_unknown_route_fails_with_route_name_in_message() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (_client_router, _client_registry, server_side) = spawn_client("one");
    admit(&server, "one", server_side).await;

    let err = server
        .request("nope", "one", serde_json::Map::new())
        .await
        .unwrap_err();
    match err {
        Error::RequestFailed(message) => assert!(message.contains("nope")),
        other => panic!("expected RequestFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_4_duplicate_identifier_without_override_is_rejected() {
    let server = Server::new(ServerConfig::default()).unwrap();
    let (_first_router, _first_registry, first_side) = spawn_client("one");
    admit(&server, "one", first_side).await;

    let (_second_router, _second_registry, second_side) = spawn_client("one");
    let err = server
        .parse_identify(identify_envelope("one", "", None), Box::new(second_side))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DuplicateConnection(id) if id == "one"));
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn scenario_5_override_key_evicts_prior_connection() {
    let config = ServerConfig {
        secret_key: String::new(),
        override_key: Some("swordfish".to_string()),
    };
    let server = Server::new(config).unwrap();

    let (first_router, first_registry, first_side) = spawn_client("one");
    add_returning(&first_registry, "ping", json!("from-first"));
    admit(&server, "one", first_side).await;

    let (_second_router, second_registry, second_side) = spawn_client("one");
    add_returning(&second_registry, "ping", json!("from-second"));
    server
        .parse_identify(
            identify_envelope("one", "", Some("swordfish")),
            Box::new(second_side),
        )
        .await
        .unwrap();

    assert_eq!(server.connection_count(), 1);
    first_router.block_until_closed().await;

    let result = server.request("ping", "one", serde_json::Map::new()).await.unwrap();
    assert_eq!(result, json!("from-second"));
}

#[tokio::test]
async fn scenario_6_bidirectional_requests_in_flight_together() {
    let server = Server::new(ServerConfig::default()).unwrap();
    server
        .add_route(
            "echo",
            Arc::new(|args: Value| Box::pin(async move { Ok(args) }) as RouteFuture),
        )
        .unwrap();

    let (client_router, client_registry, server_side) = spawn_client("one");
    client_registry
        .add(
            "slow",
            Arc::new(|_args: Value| {
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok(json!("slow-done"))
                }) as RouteFuture
            }),
        )
        .unwrap();
    admit(&server, "one", server_side).await;

    let server_call = server.request("slow", "one", serde_json::Map::new());

    let mut args = serde_json::Map::new();
    args.insert("x".to_string(), json!(1));
    let client_packet = RoutePacket {
        identifier: "one".to_string(),
        body: RouteBody::ClientRequest {
            data: duplex_router::packet::RequestPacket {
                route: "echo".to_string(),
                arguments: args,
            },
        },
    };
    let client_payload = serde_json::to_value(&client_packet).unwrap();
    let client_handle = client_router.send(client_payload).unwrap();

    let (server_result, client_response) = tokio::join!(server_call, client_handle);
    assert_eq!(server_result.unwrap(), json!("slow-done"));

    let client_packet: RoutePacket = serde_json::from_value(client_response.unwrap()).unwrap();
    match client_packet.body {
        RouteBody::Success { data } => assert_eq!(data, json!({"x": 1})),
        other => panic!("unexpected response: {other:?}"),
    }
}
