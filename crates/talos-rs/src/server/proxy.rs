//! Terminal proxy dispatch: the stage between the two pipeline phases
//! that actually talks to a backend.
//!
//! Selects a backend from the route's upstream, acquires a pooled
//! connection or dials a new one, writes the serialized request, parses
//! the reply, and fills the response context. Failures map onto the
//! error taxonomy: no selectable backend is a 503, transport failures
//! after retries a 502, and an elapsed deadline a 504.

use crate::gateway::factory::GatewaySnapshot;
use crate::gateway::pipeline::ExchangeContext;
use crate::gateway::pool::PooledConnection;
use crate::gateway::upstream::Upstream;
use crate::models::error::GatewayError;
use crate::models::http::{is_hop_by_hop, Method, Request, Response};
use crate::protocol::http1::{build_backend_request, ParseStatus, ResponseParser};
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound for a buffered backend response body.
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;
/// Read chunk size for backend responses.
const READ_CHUNK: usize = 8192;
/// How long a resolved address stays cached on this worker.
const DNS_CACHE_TTL: Duration = Duration::from_secs(30);

thread_local! {
    /// Worker-local DNS cache: resolution happens at connect time, not
    /// on the per-byte hot path, and never blocks another worker.
    static DNS_CACHE: RefCell<HashMap<String, (SocketAddr, Instant)>> =
        RefCell::new(HashMap::new());
}

/// Resolves `host:port`, consulting the worker-local cache first.
pub async fn resolve_backend(host: &str, port: u16) -> Result<SocketAddr, GatewayError> {
    // Fast path: a literal address needs no resolver.
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let key = format!("{host}:{port}");
    let cached = DNS_CACHE.with(|cache| {
        cache.borrow().get(&key).and_then(|(addr, at)| {
            (at.elapsed() < DNS_CACHE_TTL).then_some(*addr)
        })
    });
    if let Some(addr) = cached {
        return Ok(addr);
    }

    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| GatewayError::UpstreamTransport(format!("resolve {host}: {e}")))?;
    let addr = addrs
        .next()
        .ok_or_else(|| GatewayError::UpstreamTransport(format!("resolve {host}: no address")))?;

    DNS_CACHE.with(|cache| {
        cache.borrow_mut().insert(key, (addr, Instant::now()));
    });
    Ok(addr)
}

/// Dials a backend with TCP_NODELAY set.
pub async fn connect_backend(host: &str, port: u16) -> Result<TcpStream, GatewayError> {
    let addr = resolve_backend(host, port).await?;
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| GatewayError::UpstreamTransport(format!("connect {host}:{port}: {e}")))?;
    // Small request/response exchanges dominate gateway traffic.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Reads and parses one HTTP/1.1 response from the backend.
async fn read_backend_response(
    stream: &mut TcpStream,
    head_request: bool,
) -> Result<(Response, bool), GatewayError> {
    let mut parser = ResponseParser::new();
    if head_request {
        parser = parser.for_head_request();
    }
    let mut response = Response::default();
    let mut buffer = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    let mut total = 0usize;

    loop {
        let n = stream
            .read(&mut buffer)
            .await
            .map_err(|e| GatewayError::UpstreamTransport(format!("read: {e}")))?;
        if n == 0 {
            return match parser.finish() {
                ParseStatus::Complete => Ok((response, false)),
                _ => Err(GatewayError::UpstreamTransport(
                    "backend closed mid-response".to_string(),
                )),
            };
        }
        total += n;
        if total > MAX_RESPONSE_SIZE {
            return Err(GatewayError::UpstreamTransport(
                "backend response exceeds size limit".to_string(),
            ));
        }

        pending.extend_from_slice(&buffer[..n]);
        let (status, consumed) = parser.feed(&pending, &mut response);
        pending.drain(..consumed);
        match status {
            ParseStatus::Complete => {
                // Whatever keep-alive the backend offers, a response
                // with unread pipelined bytes is not reusable.
                let reusable = pending.is_empty() && !parser.reads_until_eof();
                return Ok((response, reusable));
            }
            ParseStatus::Incomplete => continue,
            ParseStatus::Error => {
                return Err(GatewayError::UpstreamTransport(
                    "malformed backend response".to_string(),
                ))
            }
        }
    }
}

/// One request/response exchange against a concrete backend.
///
/// On a send failure over a pooled connection the socket is closed and
/// the dial happens once more; a second failure within the same request
/// is reported as a transport error.
async fn exchange_once(
    upstream: &Upstream,
    host: &str,
    port: u16,
    wire_request: &[u8],
    head_request: bool,
) -> Result<(Response, bool), GatewayError> {
    let pooled = upstream.pool().borrow_mut().acquire(host, port);
    let (mut stream, mut served, from_pool) = match pooled {
        Some(conn) => (conn.stream, conn.requests_served, true),
        None => (connect_backend(host, port).await?, 0, false),
    };

    let send_result = stream.write_all(wire_request).await;
    if send_result.is_err() && from_pool {
        // The pooled socket died between the liveness probe and the
        // write. Re-dial once.
        debug!("pooled connection to {host}:{port} failed on send, re-dialing");
        stream = connect_backend(host, port).await?;
        served = 0;
        stream
            .write_all(wire_request)
            .await
            .map_err(|e| GatewayError::UpstreamTransport(format!("send after reconnect: {e}")))?;
    } else {
        send_result.map_err(|e| GatewayError::UpstreamTransport(format!("send: {e}")))?;
    }

    let (response, reusable) = read_backend_response(&mut stream, head_request).await?;

    let backend_keeps_alive = response
        .header("connection")
        .map(|v| !v.to_ascii_lowercase().contains("close"))
        .unwrap_or(true);
    if reusable && backend_keeps_alive {
        let mut conn = PooledConnection::new(stream, host, port);
        conn.requests_served = served + 1;
        upstream.pool().borrow_mut().release(conn);
    }
    Ok((response, reusable))
}

/// Serializes the request for the backend, applying the route rewrite.
fn wire_request_for(ctx: &ExchangeContext, rewrite: Option<&str>) -> Vec<u8> {
    build_backend_request(&ctx.request, rewrite)
}

/// Forwards the context's request to its route's upstream and fills the
/// response, translating failures into synthesized error responses.
pub async fn forward(gateway: &GatewaySnapshot, ctx: &mut ExchangeContext) {
    let deadline = gateway
        .route_timeout(ctx.route.route_index)
        .unwrap_or_else(|| gateway.config.config.server.read_timeout());

    match tokio::time::timeout(deadline, forward_inner(gateway, ctx)).await {
        Ok(Ok(response)) => {
            let mut response = response;
            // Hop-by-hop headers die at the proxy hop.
            let hop: Vec<String> = response
                .headers
                .iter()
                .filter(|h| is_hop_by_hop(&h.name))
                .map(|h| h.name.clone())
                .collect();
            for name in hop {
                response.remove_header(&name);
            }
            ctx.response = response;
        }
        Ok(Err(error)) => {
            warn!(
                "proxy error for {} {}: {error}",
                ctx.request.method.map(|m| m.as_str()).unwrap_or("-"),
                ctx.request.path
            );
            ctx.response = error.to_response();
        }
        Err(_) => {
            let error = GatewayError::UpstreamTimeout(deadline.as_millis() as u64);
            warn!("proxy timeout for {}: {error}", ctx.request.path);
            ctx.response = error.to_response();
        }
    }
}

async fn forward_inner(
    gateway: &GatewaySnapshot,
    ctx: &ExchangeContext,
) -> Result<Response, GatewayError> {
    let upstream_name = &ctx.route.upstream_name;
    let upstream = gateway
        .upstreams
        .get(upstream_name)
        .ok_or_else(|| GatewayError::UpstreamTransport(format!("unknown upstream {upstream_name}")))?;

    let rewrite = gateway.route_rewrite(ctx.route.route_index);
    let wire = wire_request_for(ctx, rewrite);
    let head_request = ctx.request.method == Some(Method::Head);

    let attempts = upstream.max_retries + 1;
    let mut last_error =
        GatewayError::UpstreamUnavailable(upstream_name.clone());

    for attempt in 0..attempts {
        let backend_index = match upstream.select_backend(Some(&ctx.client_ip)) {
            Some(index) => index,
            None => return Err(GatewayError::UpstreamUnavailable(upstream_name.clone())),
        };
        let (host, port) = {
            let backend = upstream
                .backend(backend_index)
                .ok_or_else(|| GatewayError::Internal("backend index out of range".to_string()))?;
            (backend.host.clone(), backend.port)
        };

        match exchange_once(upstream, &host, port, &wire, head_request).await {
            Ok((response, _)) => {
                upstream.record_success(backend_index);
                return Ok(response);
            }
            Err(error) => {
                upstream.record_failure(backend_index);
                debug!(
                    "attempt {}/{} against {host}:{port} failed: {error}",
                    attempt + 1,
                    attempts
                );
                last_error = error;
                if upstream.retry_timeout > Duration::ZERO && attempt + 1 < attempts {
                    tokio::time::sleep(upstream.retry_timeout).await;
                }
            }
        }
    }
    Err(last_error)
}

/// Builds a [`Request`] suitable for tests and embedding callers.
pub fn request_for(method: Method, path: &str) -> Request {
    Request {
        method: Some(method),
        path: path.to_string(),
        ..Request::default()
    }
}
