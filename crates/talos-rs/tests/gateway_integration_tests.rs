//! End-to-end tests driving a running gateway over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use talos_rs::config::store::ConfigStore;
use talos_rs::gateway::factory::GatewayDeps;
use talos_rs::models::http::Response;
use talos_rs::protocol::http1::{ParseStatus, ResponseParser};
use talos_rs::server::GatewayServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Spawns a keep-alive HTTP/1.1 backend that answers every request with
/// the given body.
async fn spawn_backend(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut chunk = [0u8; 8192];
                let mut pending: Vec<u8> = Vec::new();
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&chunk[..n]);
                    // One request per header block; test requests carry
                    // no body.
                    while let Some(end) = pending
                        .windows(4)
                        .position(|window| window == b"\r\n\r\n")
                    {
                        pending.drain(..end + 4);
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    addr
}

fn gateway_config(routes: serde_json::Value, upstreams: serde_json::Value) -> String {
    json!({
        "server": {
            "listen_address": "127.0.0.1",
            "listen_port": 0,
            "worker_threads": 1,
            "shutdown_timeout": 200,
            "read_timeout": 5000,
            "idle_timeout": 5000
        },
        "logging": {"log_requests": false},
        "routes": routes,
        "upstreams": upstreams
    })
    .to_string()
}

fn start_gateway(config_json: &str) -> (GatewayServer, Arc<ConfigStore>) {
    let config = talos_rs::config::settings::parse_config(config_json).unwrap();
    let store = Arc::new(ConfigStore::from_config(config).unwrap());
    let server = GatewayServer::start(store.clone(), GatewayDeps::default()).unwrap();
    (server, store)
}

/// Reads exactly one HTTP/1.1 response off the stream.
async fn read_response(stream: &mut TcpStream) -> Response {
    let mut parser = ResponseParser::new();
    let mut response = Response::default();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert_ne!(n, 0, "connection closed before a full response");
        pending.extend_from_slice(&chunk[..n]);
        let (status, consumed) = parser.feed(&pending, &mut response);
        pending.drain(..consumed);
        match status {
            ParseStatus::Complete => return response,
            ParseStatus::Incomplete => continue,
            ParseStatus::Error => panic!("malformed response from gateway"),
        }
    }
}

#[tokio::test]
async fn simple_get_proxies_to_backend() {
    let backend = spawn_backend("OK").await;
    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/hello", "method": "GET", "upstream": "u" }]),
        json!([{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let response = read_response(&mut client).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"OK");
    assert_eq!(response.header("content-length"), Some("2"));

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn keep_alive_serves_pipelined_requests() {
    let backend = spawn_backend("PONG").await;
    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/ping", "upstream": "u" }]),
        json!([{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    // Two requests back to back on one connection.
    client
        .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\nGET /ping HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();

    let first = read_response(&mut client).await;
    let second = read_response(&mut client).await;
    assert_eq!(first.status, 200);
    assert_eq!(second.status, 200);
    assert_eq!(second.body, b"PONG");

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn unknown_path_gets_404() {
    let backend = spawn_backend("OK").await;
    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/known", "upstream": "u" }]),
        json!([{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /unknown HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 404);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn method_mismatch_gets_404() {
    let backend = spawn_backend("OK").await;
    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/only-get", "method": "GET", "upstream": "u" }]),
        json!([{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"POST /only-get HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 404);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn dead_backend_surfaces_502() {
    // Reserve a port and close it so nothing listens there.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = unused.local_addr().unwrap();
    drop(unused);

    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/x", "upstream": "u" }]),
        json!([{
            "name": "u",
            "max_retries": 0,
            "backends": [{"host": dead.ip().to_string(), "port": dead.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /x HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 502);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn slow_backend_surfaces_504() {
    // A backend that accepts and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let slow = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            // Hold the socket open without responding.
            tokio::spawn(async move {
                let mut socket = socket;
                let mut sink = [0u8; 1024];
                while matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });

    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/slow", "upstream": "u", "timeout": 200 }]),
        json!([{
            "name": "u",
            "max_retries": 0,
            "backends": [{"host": slow.ip().to_string(), "port": slow.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /slow HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 504);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn malformed_request_gets_400_and_close() {
    let backend = spawn_backend("OK").await;
    let (server, _store) = start_gateway(&gateway_config(
        json!([{ "path": "/x", "upstream": "u" }]),
        json!([{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]),
    ));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"BREW /pot HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status, 400);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn hot_reload_retargets_new_requests() {
    let backend_one = spawn_backend("one").await;
    let backend_two = spawn_backend("two").await;

    let first_config = gateway_config(
        json!([{ "path": "/a", "upstream": "u1" }]),
        json!([{
            "name": "u1",
            "backends": [{"host": backend_one.ip().to_string(), "port": backend_one.port()}]
        }]),
    );
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, first_config.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let store = Arc::new(ConfigStore::new());
    store.load(&path).unwrap();
    let server = GatewayServer::start(store.clone(), GatewayDeps::default()).unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_response(&mut client).await.body, b"one");

    // Publish a new snapshot that sends /a to the second upstream.
    let second_config = gateway_config(
        json!([{ "path": "/a", "upstream": "u2" }]),
        json!([{
            "name": "u2",
            "backends": [{"host": backend_two.ip().to_string(), "port": backend_two.port()}]
        }]),
    );
    std::fs::write(&path, second_config).unwrap();
    store.reload().unwrap();

    // The same connection's next request is a new exchange and sees the
    // new snapshot.
    client
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    assert_eq!(read_response(&mut client).await.body, b"two");

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn global_rate_limit_returns_429() {
    let backend = spawn_backend("OK").await;
    let config = json!({
        "server": {
            "listen_address": "127.0.0.1",
            "listen_port": 0,
            "worker_threads": 1,
            "shutdown_timeout": 200
        },
        "logging": {"log_requests": false},
        "rate_limit": {"enabled": true, "requests_per_second": 1, "burst_size": 2},
        "routes": [{"path": "/limited", "upstream": "u"}],
        "upstreams": [{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }]
    })
    .to_string();
    let (server, _store) = start_gateway(&config);

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut statuses = Vec::new();
    for _ in 0..3 {
        client
            .write_all(b"GET /limited HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        statuses.push(read_response(&mut client).await.status);
    }
    assert_eq!(&statuses[..2], &[200, 200]);
    assert_eq!(statuses[2], 429);

    drop(client);
    tokio::task::spawn_blocking(move || server.shutdown())
        .await
        .unwrap();
}
