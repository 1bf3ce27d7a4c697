//! Unresponsive Server Tests
//!
//! A PostgreSQL connection pointed at a listener that accepts sockets and never speaks must
//! fail within the query timeout on every gateway surface instead of hanging the caller.

#![cfg(feature = "postgres")]

use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use querygate::{BackendKind, ConnectionSpec, Gateway, GatewayConfig};

/// Accept connections forever and hold the sockets open without replying
async fn silent_listener() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind listener");
    let port = listener.local_addr().expect("Listener has no address").port();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (port, handle)
}

fn gateway_for(port: u16) -> Gateway {
    let mut config = GatewayConfig { query_timeout_ms: 200, ..GatewayConfig::default() };
    config.connections.insert(
        "silent".to_string(),
        ConnectionSpec::new(BackendKind::Postgres, format!("postgres://u:p@127.0.0.1:{port}/db")),
    );
    Gateway::new(config)
}

const OUTER_LIMIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_query_against_silent_server_fails_in_time() {
    let (port, server) = silent_listener().await;
    let gateway = gateway_for(port);

    for _ in 0..2 {
        let text = tokio::time::timeout(OUTER_LIMIT, gateway.execute_query(None, "SELECT 1", None, None))
            .await
            .expect("query should not hang");
        assert!(text.starts_with("Error [CONNECTION_FAILED]"), "{text}");
    }

    assert!(!gateway.list_connections()[0].live);
    server.abort();
}

#[tokio::test]
async fn test_schema_against_silent_server_fails_in_time() {
    let (port, server) = silent_listener().await;
    let gateway = gateway_for(port);

    let tables = tokio::time::timeout(OUTER_LIMIT, gateway.describe_schema(None, None))
        .await
        .expect("schema listing should not hang");
    assert!(tables.starts_with("Error [CONNECTION_FAILED]"), "{tables}");

    let columns = tokio::time::timeout(OUTER_LIMIT, gateway.describe_schema(None, Some("users")))
        .await
        .expect("table description should not hang");
    assert!(columns.starts_with("Error [CONNECTION_FAILED]"), "{columns}");
    server.abort();
}

#[tokio::test]
async fn test_check_against_silent_server_fails_in_time() {
    let (port, server) = silent_listener().await;
    let gateway = gateway_for(port);

    let checked = tokio::time::timeout(OUTER_LIMIT, gateway.check_connection(None))
        .await
        .expect("connection check should not hang");
    let err = checked.expect_err("a silent server is not reachable");
    assert_eq!(err.error_code(), "CONNECTION_FAILED");
    server.abort();
}
