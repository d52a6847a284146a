//! Dispatcher-level tests: router + pipeline + terminal proxy wiring,
//! without a listening gateway in front.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use talos_rs::config::settings::parse_config;
use talos_rs::config::store::ConfigSnapshot;
use talos_rs::gateway::factory::{build_gateway, GatewayDeps, GatewaySnapshot};
use talos_rs::models::http::{Method, Request};
use talos_rs::server::conn::dispatch;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Backend that answers every request with its own request path as the
/// body, so tests can observe what the proxy actually sent.
async fn spawn_path_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                let mut pending: Vec<u8> = Vec::new();
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(end) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&pending[..end]).to_string();
                        pending.drain(..end + 4);
                        let target = head
                            .lines()
                            .next()
                            .and_then(|line| line.split_whitespace().nth(1))
                            .unwrap_or("?")
                            .to_string();
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{}",
                            target.len(),
                            target
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

fn gateway_from(json_config: serde_json::Value) -> GatewaySnapshot {
    let config = parse_config(&json_config.to_string()).unwrap();
    let snapshot = Arc::new(ConfigSnapshot {
        config,
        generation: 1,
    });
    build_gateway(snapshot, &GatewayDeps::default()).unwrap()
}

fn get(path: &str) -> Request {
    Request {
        method: Some(Method::Get),
        path: path.to_string(),
        ..Request::default()
    }
}

#[tokio::test]
async fn unmatched_path_dispatches_404_without_pipeline() {
    let gateway = gateway_from(json!({
        "upstreams": [{"name": "u", "backends": [{"host": "127.0.0.1", "port": 1}]}],
        "routes": [{"path": "/known", "upstream": "u"}]
    }));

    let ctx = dispatch(&gateway, get("/missing"), "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 404);
}

#[tokio::test]
async fn proxy_applies_route_rewrite() {
    let backend = spawn_path_echo_backend().await;
    let gateway = gateway_from(json!({
        "upstreams": [{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }],
        "routes": [{
            "path": "/public/api",
            "upstream": "u",
            "rewrite_path": "/internal/api"
        }]
    }));

    let ctx = dispatch(&gateway, get("/public/api"), "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 200);
    assert_eq!(ctx.response.body, b"/internal/api");
}

#[tokio::test]
async fn transform_middleware_rewrites_before_proxy() {
    let backend = spawn_path_echo_backend().await;
    let gateway = gateway_from(json!({
        "upstreams": [{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }],
        "routes": [{
            "path": "/api/*",
            "upstream": "u",
            "middleware": ["strip"]
        }],
        "middlewares": {
            "transform": {
                "strip": {"path_rewrites": [{"strip_prefix": "/api"}]}
            }
        }
    }));

    let ctx = dispatch(&gateway, get("/api/orders"), "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 200);
    assert_eq!(ctx.response.body, b"/orders");
}

#[tokio::test]
async fn cors_preflight_short_circuits_without_backend() {
    // The upstream points nowhere; a preflight must not need it.
    let gateway = gateway_from(json!({
        "cors": {"enabled": true},
        "upstreams": [{"name": "u", "backends": [{"host": "127.0.0.1", "port": 1}]}],
        "routes": [{"path": "/anything", "upstream": "u"}]
    }));

    let mut request = Request {
        method: Some(Method::Options),
        path: "/anything".to_string(),
        ..Request::default()
    };
    request.add_header("Origin", "https://app.example");

    let ctx = dispatch(&gateway, request, "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 204);
    assert_eq!(
        ctx.response.header("access-control-allow-origin"),
        Some("*")
    );
}

#[tokio::test]
async fn jwt_enabled_rejects_anonymous_requests() {
    let gateway = gateway_from(json!({
        "jwt": {
            "enabled": true,
            "keys": [{"algorithm": "HS256", "secret": "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LTMyIQ=="}]
        },
        "upstreams": [{"name": "u", "backends": [{"host": "127.0.0.1", "port": 1}]}],
        "routes": [{"path": "/locked", "upstream": "u"}]
    }));

    let ctx = dispatch(&gateway, get("/locked"), "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 401);
    assert_eq!(ctx.response.header("www-authenticate"), Some("Bearer"));
}

#[tokio::test]
async fn static_token_without_scopes_fails_authz() {
    let gateway = gateway_from(json!({
        "auth": {"enabled": true, "valid_tokens": ["deploy-token"]},
        "jwt": {
            "enabled": true,
            "keys": [{"algorithm": "HS256", "secret": "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LTMyIQ=="}]
        },
        "upstreams": [{"name": "u", "backends": [{"host": "127.0.0.1", "port": 1}]}],
        "routes": [{
            "path": "/admin",
            "upstream": "u",
            "required_scopes": ["admin"]
        }]
    }));

    let mut request = get("/admin");
    request.add_header("Authorization", "Bearer deploy-token");
    let ctx = dispatch(&gateway, request, "10.0.0.1".into(), 1).await;
    // Authenticated (static token) but not authorized for the scope.
    assert_eq!(ctx.response.status, 403);
}

#[tokio::test]
async fn upstream_with_no_selectable_backend_is_503() {
    let backend = spawn_path_echo_backend().await;
    let gateway = gateway_from(json!({
        "upstreams": [{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }],
        "routes": [{"path": "/x", "upstream": "u"}]
    }));

    // Drain the only backend so selection rejects it.
    let upstream = gateway.upstreams.get("u").unwrap();
    upstream.backends()[0].set_status(talos_rs::gateway::upstream::BackendStatus::Draining);

    let ctx = dispatch(&gateway, get("/x"), "10.0.0.1".into(), 1).await;
    assert_eq!(ctx.response.status, 503);
}

#[tokio::test]
async fn backend_connection_is_pooled_between_requests() {
    let backend = spawn_path_echo_backend().await;
    let gateway = gateway_from(json!({
        "upstreams": [{
            "name": "u",
            "backends": [{"host": backend.ip().to_string(), "port": backend.port()}]
        }],
        "routes": [{"path": "/p", "upstream": "u"}]
    }));

    let first = dispatch(&gateway, get("/p"), "10.0.0.1".into(), 1).await;
    assert_eq!(first.response.status, 200);

    let upstream = gateway.upstreams.get("u").unwrap();
    assert_eq!(upstream.pool().borrow().idle_count(), 1);

    let second = dispatch(&gateway, get("/p"), "10.0.0.1".into(), 1).await;
    assert_eq!(second.response.status, 200);
    let stats = upstream.pool().borrow().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(upstream.pool().borrow().idle_count(), 1);
}
