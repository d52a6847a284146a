//! Client connection driver.
//!
//! One task per accepted socket, spawned on the owning worker's
//! `LocalSet`. The driver performs the TLS handshake (protocol via
//! ALPN) or sniffs the cleartext preface, then runs the matching
//! protocol loop: pipelined HTTP/1.1, the HTTP/2 session, or the
//! WebSocket tunnel after an upgrade. Every exit path funnels through
//! the end of `handle_connection`, which releases the socket, the TLS
//! session, and any backend connections the exchange owned.

use crate::gateway::factory::GatewaySnapshot;
use crate::gateway::pipeline::{ExchangeContext, MiddlewareResult};
use crate::models::error::GatewayError;
use crate::models::http::{Method, Request, Response};
use crate::protocol::http1::{serialize_response, ParseStatus, RequestParser, ResponseParser};
use crate::protocol::http2::{detect_preface, H2Session};
use crate::protocol::websocket::{
    self, close_code, FrameParser, Opcode, ParseResult as WsParseResult,
};
use crate::server::proxy;
use crate::server::worker::WorkerContext;
use log::{debug, trace, warn};
use serde_json::json;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

const READ_CHUNK: usize = 8192;
/// Interval between keep-alive pings on an idle WebSocket tunnel.
const WS_PING_INTERVAL: Duration = Duration::from_secs(30);

/// A client socket, optionally wrapped in TLS.
pub enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ClientStream {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            ClientStream::Plain(s) => s.read(buf).await,
            ClientStream::Tls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            ClientStream::Plain(s) => s.write_all(data).await,
            ClientStream::Tls(s) => s.write_all(data).await,
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            ClientStream::Plain(s) => s.shutdown().await,
            ClientStream::Tls(s) => s.shutdown().await,
        };
    }

    fn negotiated_h2(&self) -> bool {
        match self {
            ClientStream::Plain(_) => false,
            ClientStream::Tls(s) => s.get_ref().1.alpn_protocol() == Some(b"h2"),
        }
    }
}

/// Entry point for one accepted connection.
pub async fn handle_connection(stream: TcpStream, peer: SocketAddr, worker: Rc<WorkerContext>) {
    let _ = stream.set_nodelay(true);
    let _guard = worker.connection_guard();

    let mut stream = match worker.tls_acceptor() {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => ClientStream::Tls(Box::new(tls)),
            Err(error) => {
                debug!("TLS handshake failed for {peer}: {error}");
                return;
            }
        },
        None => ClientStream::Plain(stream),
    };

    if stream.negotiated_h2() {
        drive_http2(stream, Vec::new(), peer, worker).await;
        return;
    }

    // Cleartext (or TLS with http/1.1): sniff the first bytes for the
    // HTTP/2 prior-knowledge preface.
    let mut buffer = Vec::with_capacity(READ_CHUNK);
    let read_timeout = worker.gateway().config.config.server.read_timeout();
    loop {
        match detect_preface(&buffer) {
            Some(true) => {
                drive_http2(stream, buffer, peer, worker).await;
                return;
            }
            Some(false) => {
                drive_http1(stream, buffer, peer, worker).await;
                return;
            }
            None => {
                let mut chunk = [0u8; READ_CHUNK];
                let n = match tokio::time::timeout(read_timeout, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) | Err(_) => return,
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => return,
                };
                buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }
}

/// Routes the request, runs both pipeline phases, and performs the
/// terminal proxy dispatch between them.
pub async fn dispatch(
    gateway: &GatewaySnapshot,
    request: Request,
    client_ip: String,
    client_port: u16,
) -> ExchangeContext {
    let method = request.method.unwrap_or(Method::Get);
    let matched = gateway.router.find(method, &request.path);
    let mut ctx = ExchangeContext::new(request, matched, client_ip, client_port);

    if !ctx.route.matched() {
        ctx.response = Response::with_status(404);
        ctx.response.set_json_body(json!({
            "error": "no route matched the request path",
            "type": "not_found",
        }));
        return ctx;
    }

    let pipeline = gateway.pipeline(ctx.route.route_index);
    let request_phase = match pipeline {
        Some(pipeline) => pipeline.execute_request(&mut ctx),
        None => MiddlewareResult::Continue,
    };

    match request_phase {
        MiddlewareResult::Continue => {
            if ctx.route.upstream_name.is_empty() {
                // No upstream configured: terminal stub.
                ctx.response = Response::with_status(200);
            } else {
                proxy::forward(gateway, &mut ctx).await;
            }
        }
        MiddlewareResult::Stop => {
            // The stopping middleware filled the response.
        }
        MiddlewareResult::Error => {
            let message = if ctx.error_message.is_empty() {
                "middleware failure".to_string()
            } else {
                ctx.error_message.clone()
            };
            ctx.response = GatewayError::Internal(message).to_response();
        }
    }

    if let Some(pipeline) = pipeline {
        pipeline.execute_response(&mut ctx);
    }
    ctx
}

/// Pipelined HTTP/1.1 connection loop.
async fn drive_http1(
    mut stream: ClientStream,
    initial: Vec<u8>,
    peer: SocketAddr,
    worker: Rc<WorkerContext>,
) {
    let server = worker.gateway().config.config.server.clone();
    let mut buffer = initial;
    let mut cursor = 0usize;
    let mut parser = RequestParser::new();
    let mut request = Request::default();

    loop {
        let (status, amount) = parser.feed(&buffer[cursor..], &mut request);
        match status {
            ParseStatus::Complete => {
                cursor += amount;

                // One snapshot per request: a reload mid-flight does not
                // retarget this exchange.
                let gateway = worker.gateway();

                // Any upgrade attempt leaves the HTTP/1.1 loop; a
                // handshake that fails validation gets its 400 there.
                let wants_upgrade = request
                    .header("upgrade")
                    .map(|v| v.eq_ignore_ascii_case("websocket"))
                    .unwrap_or(false);
                if wants_upgrade {
                    // Frames a client sent ahead of the 101 stay queued
                    // for the tunnel.
                    let leftover = buffer[cursor..].to_vec();
                    handle_websocket_upgrade(
                        stream,
                        std::mem::take(&mut request),
                        leftover,
                        gateway,
                        peer,
                    )
                    .await;
                    return;
                }

                let keep_alive = request.keep_alive() && !worker.is_shutting_down();
                let ctx = dispatch(
                    &gateway,
                    std::mem::take(&mut request),
                    peer.ip().to_string(),
                    peer.port(),
                )
                .await;

                let wire = serialize_response(&ctx.response, keep_alive);
                let write = tokio::time::timeout(server.write_timeout(), stream.write_all(&wire));
                if write.await.map(|r| r.is_err()).unwrap_or(true) {
                    stream.shutdown().await;
                    return;
                }

                if !keep_alive {
                    stream.shutdown().await;
                    return;
                }

                // Compact once the cursor passed half the buffer.
                if cursor > 4096 && cursor > buffer.len() / 2 {
                    buffer.drain(..cursor);
                    cursor = 0;
                }
                parser.reset();
                request = Request::default();
            }
            ParseStatus::Incomplete => {
                cursor += amount;

                if buffer.len() - cursor > server.max_request_size as usize {
                    let error =
                        GatewayError::ClientProtocol("request exceeds size limit".to_string());
                    let mut response = error.to_response();
                    response.status = 413;
                    let _ = stream.write_all(&serialize_response(&response, false)).await;
                    stream.shutdown().await;
                    return;
                }

                // Quiet between requests counts against the idle
                // timeout, a partial message against the read timeout.
                let timeout = if cursor == buffer.len() {
                    server.idle_timeout()
                } else {
                    server.read_timeout()
                };
                let mut chunk = [0u8; READ_CHUNK];
                let n = match tokio::time::timeout(timeout, stream.read(&mut chunk)).await {
                    Ok(Ok(0)) | Err(_) => {
                        stream.shutdown().await;
                        return;
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(_)) => return,
                };
                buffer.extend_from_slice(&chunk[..n]);
            }
            ParseStatus::Error => {
                debug!("malformed request from {peer} at byte {amount}");
                let response =
                    GatewayError::ClientProtocol("malformed request".to_string()).to_response();
                let _ = stream.write_all(&serialize_response(&response, false)).await;
                stream.shutdown().await;
                return;
            }
        }
    }
}

/// HTTP/2 session drive loop.
async fn drive_http2(
    mut stream: ClientStream,
    initial: Vec<u8>,
    peer: SocketAddr,
    worker: Rc<WorkerContext>,
) {
    let server = worker.gateway().config.config.server.clone();
    let mut session =
        H2Session::new_server().with_max_request_body(server.max_request_size as usize);
    let mut buffer = initial;

    loop {
        if !buffer.is_empty() {
            match session.recv(&buffer) {
                Ok(consumed) => {
                    buffer.drain(..consumed);
                }
                Err(error) => {
                    debug!("h2 connection error from {peer}: {error}");
                    // Flush the GOAWAY the session queued, then close.
                    let pending = session.send_data().to_vec();
                    let _ = stream.write_all(&pending).await;
                    stream.shutdown().await;
                    return;
                }
            }
        }

        for stream_id in session.ready_streams() {
            if let Some(request) = session.take_request(stream_id) {
                let gateway = worker.gateway();
                trace!("h2 stream {stream_id}: {} {}",
                    request.method.map(|m| m.as_str()).unwrap_or("-"), request.path);
                let ctx = dispatch(
                    &gateway,
                    request,
                    peer.ip().to_string(),
                    peer.port(),
                )
                .await;
                if let Err(error) = session.submit_response(stream_id, ctx.response) {
                    warn!("h2 submit_response failed on stream {stream_id}: {error}");
                }
            }
        }

        while session.want_write() {
            let pending = session.send_data().to_vec();
            let write = tokio::time::timeout(server.write_timeout(), stream.write_all(&pending));
            if write.await.map(|r| r.is_err()).unwrap_or(true) {
                stream.shutdown().await;
                return;
            }
            session.consume_send_buffer(pending.len());
        }

        if session.should_close() {
            stream.shutdown().await;
            return;
        }

        let mut chunk = [0u8; READ_CHUNK];
        let n = match tokio::time::timeout(server.idle_timeout(), stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => {
                stream.shutdown().await;
                return;
            }
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return,
        };
        buffer.extend_from_slice(&chunk[..n]);
    }
}

/// Validates the upgrade, runs the request phase, establishes the
/// backend half, and hands both sockets to the tunnel.
async fn handle_websocket_upgrade(
    mut stream: ClientStream,
    request: Request,
    leftover: Vec<u8>,
    gateway: Rc<GatewaySnapshot>,
    peer: SocketAddr,
) {
    let method = request.method.unwrap_or(Method::Get);
    let matched = gateway.router.find(method, &request.path);
    let mut ctx = ExchangeContext::new(request, matched, peer.ip().to_string(), peer.port());

    if !ctx.route.matched() {
        let response = Response::with_status(404);
        let _ = stream.write_all(&serialize_response(&response, false)).await;
        stream.shutdown().await;
        return;
    }

    // Request phase runs before the upgrade: auth (query token), rate
    // limiting and friends can still veto the tunnel.
    if let Some(pipeline) = gateway.pipeline(ctx.route.route_index) {
        let phase = pipeline.execute_request(&mut ctx);
        if phase != MiddlewareResult::Continue {
            if phase == MiddlewareResult::Error {
                ctx.response =
                    GatewayError::Internal("middleware failure".to_string()).to_response();
            }
            pipeline.execute_response(&mut ctx);
            let _ = stream
                .write_all(&serialize_response(&ctx.response, false))
                .await;
            stream.shutdown().await;
            return;
        }
    }

    let upgrade = match websocket::upgrade_response(&ctx.request) {
        Some(upgrade) => upgrade,
        None => {
            let response =
                GatewayError::ClientProtocol("invalid websocket handshake".to_string())
                    .to_response();
            let _ = stream.write_all(&serialize_response(&response, false)).await;
            stream.shutdown().await;
            return;
        }
    };

    // Establish the backend half of the tunnel.
    let upstream = match gateway.upstreams.get(&ctx.route.upstream_name) {
        Some(upstream) => upstream,
        None => {
            let response = GatewayError::UpstreamTransport("unknown upstream".to_string())
                .to_response();
            let _ = stream.write_all(&serialize_response(&response, false)).await;
            stream.shutdown().await;
            return;
        }
    };
    let backend_index = match upstream.select_backend(Some(&ctx.client_ip)) {
        Some(index) => index,
        None => {
            let response =
                GatewayError::UpstreamUnavailable(ctx.route.upstream_name.clone()).to_response();
            let _ = stream.write_all(&serialize_response(&response, false)).await;
            stream.shutdown().await;
            return;
        }
    };
    let (host, port) = {
        let backend = upstream.backend(backend_index).expect("selected index");
        (backend.host.clone(), backend.port)
    };

    let backend_stream = match open_backend_tunnel(&ctx.request, &host, port).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!("websocket backend handshake with {host}:{port} failed: {error}");
            upstream.record_failure(backend_index);
            let _ = stream
                .write_all(&serialize_response(&error.to_response(), false))
                .await;
            stream.shutdown().await;
            return;
        }
    };

    // Complete the client handshake.
    if stream
        .write_all(&serialize_response(&upgrade, true))
        .await
        .is_err()
    {
        upstream.record_failure(backend_index);
        stream.shutdown().await;
        return;
    }

    debug!(
        "websocket tunnel open: {} -> {host}:{port} ({})",
        ctx.client_ip, ctx.correlation_id
    );
    tunnel(stream, backend_stream, leftover).await;
    upstream.record_success(backend_index);
}

/// Dials the backend and performs the server-side WebSocket handshake.
async fn open_backend_tunnel(
    request: &Request,
    host: &str,
    port: u16,
) -> Result<TcpStream, GatewayError> {
    let mut stream = proxy::connect_backend(host, port).await?;

    let key = websocket::generate_key();
    let upgrade = websocket::build_backend_upgrade_request(request, &key);
    stream
        .write_all(&upgrade)
        .await
        .map_err(|e| GatewayError::UpstreamTransport(format!("send upgrade: {e}")))?;

    // Read the 101; anything else means the backend refused the tunnel.
    let mut parser = ResponseParser::new().for_head_request();
    let mut response = Response::default();
    let mut pending = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| GatewayError::UpstreamTransport(format!("read upgrade: {e}")))?;
        if n == 0 {
            return Err(GatewayError::UpstreamTransport(
                "backend closed during upgrade".to_string(),
            ));
        }
        pending.extend_from_slice(&chunk[..n]);
        let (status, consumed) = parser.feed(&pending, &mut response);
        pending.drain(..consumed);
        match status {
            ParseStatus::Complete => break,
            ParseStatus::Incomplete => continue,
            ParseStatus::Error => {
                return Err(GatewayError::UpstreamTransport(
                    "malformed upgrade response".to_string(),
                ))
            }
        }
    }

    if response.status != 101 {
        return Err(GatewayError::UpstreamTransport(format!(
            "backend refused upgrade with status {}",
            response.status
        )));
    }
    let expected = websocket::compute_accept_key(&key);
    if response.header("sec-websocket-accept") != Some(expected.as_str()) {
        return Err(GatewayError::UpstreamTransport(
            "backend accept key mismatch".to_string(),
        ));
    }
    Ok(stream)
}

enum TunnelVerdict {
    Continue,
    Closed,
}

/// Bidirectional frame tunnel between client and backend.
///
/// Client frames are unmasked on arrival and re-masked toward the
/// backend (the gateway is a WebSocket client on that leg); backend
/// frames are forwarded unmasked. Pings are answered locally with the
/// same payload, Close frames propagate the same code and reason in
/// both directions, and an unanswered gateway ping tears the tunnel
/// down with 1011.
async fn tunnel(mut client: ClientStream, mut backend: TcpStream, initial_client: Vec<u8>) {
    let mut client_buf: Vec<u8> = initial_client;
    let mut backend_buf: Vec<u8> = Vec::new();
    let mut client_parser = FrameParser::client_to_server();
    let mut backend_parser = FrameParser::server_to_client();
    let mut ping_timer = tokio::time::interval(WS_PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // first tick fires immediately
    let mut pong_pending = false;

    // Drain any frames that raced ahead of the handshake.
    if !client_buf.is_empty() {
        match pump_client_frames(
            &mut client_buf,
            &mut client_parser,
            &mut client,
            &mut backend,
            &mut pong_pending,
        )
        .await
        {
            Ok(TunnelVerdict::Continue) => {}
            _ => {
                client.shutdown().await;
                let _ = backend.shutdown().await;
                return;
            }
        }
    }

    loop {
        let mut client_chunk = [0u8; READ_CHUNK];
        let mut backend_chunk = [0u8; READ_CHUNK];

        tokio::select! {
            read = client.read(&mut client_chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                client_buf.extend_from_slice(&client_chunk[..n]);
                match pump_client_frames(
                    &mut client_buf,
                    &mut client_parser,
                    &mut client,
                    &mut backend,
                    &mut pong_pending,
                )
                .await
                {
                    Ok(TunnelVerdict::Continue) => {}
                    _ => break,
                }
            }
            read = backend.read(&mut backend_chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        // Backend vanished: tell the client.
                        let _ = client
                            .write_all(&websocket::close_frame(
                                close_code::INTERNAL_ERROR,
                                "backend closed",
                                None,
                            ))
                            .await;
                        break;
                    }
                    Ok(n) => n,
                };
                backend_buf.extend_from_slice(&backend_chunk[..n]);
                match pump_backend_frames(
                    &mut backend_buf,
                    &mut backend_parser,
                    &mut client,
                    &mut backend,
                )
                .await
                {
                    Ok(TunnelVerdict::Continue) => {}
                    _ => break,
                }
            }
            _ = ping_timer.tick() => {
                if pong_pending {
                    debug!("websocket pong timeout, closing tunnel");
                    let _ = client
                        .write_all(&websocket::close_frame(
                            close_code::INTERNAL_ERROR,
                            "ping timeout",
                            None,
                        ))
                        .await;
                    break;
                }
                if client.write_all(&websocket::ping_frame(None)).await.is_err() {
                    break;
                }
                pong_pending = true;
            }
        }
    }

    client.shutdown().await;
    let _ = backend.shutdown().await;
}

/// Drains complete frames arriving from the client.
async fn pump_client_frames(
    buf: &mut Vec<u8>,
    parser: &mut FrameParser,
    client: &mut ClientStream,
    backend: &mut TcpStream,
    pong_pending: &mut bool,
) -> Result<TunnelVerdict, ()> {
    loop {
        match parser.parse(buf) {
            WsParseResult::Complete(frame, consumed) => {
                buf.drain(..consumed);
                match frame.opcode {
                    Opcode::Ping => {
                        client
                            .write_all(&websocket::pong_frame(&frame.payload, None))
                            .await
                            .map_err(|_| ())?;
                    }
                    Opcode::Pong => {
                        *pong_pending = false;
                    }
                    Opcode::Close => {
                        // Propagate the same code and reason both ways.
                        let _ = client
                            .write_all(&websocket::encode_frame(
                                true,
                                Opcode::Close,
                                &frame.payload,
                                None,
                            ))
                            .await;
                        let _ = backend
                            .write_all(&websocket::encode_frame(
                                true,
                                Opcode::Close,
                                &frame.payload,
                                Some(rand::random()),
                            ))
                            .await;
                        return Ok(TunnelVerdict::Closed);
                    }
                    Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                        backend
                            .write_all(&websocket::encode_frame(
                                frame.fin,
                                frame.opcode,
                                &frame.payload,
                                Some(rand::random()),
                            ))
                            .await
                            .map_err(|_| ())?;
                    }
                }
            }
            WsParseResult::Incomplete => return Ok(TunnelVerdict::Continue),
            WsParseResult::Error(reason) => {
                debug!("client framing violation: {reason}");
                let _ = client
                    .write_all(&websocket::close_frame(
                        close_code::PROTOCOL_ERROR,
                        reason,
                        None,
                    ))
                    .await;
                return Err(());
            }
        }
    }
}

/// Drains complete frames arriving from the backend.
async fn pump_backend_frames(
    buf: &mut Vec<u8>,
    parser: &mut FrameParser,
    client: &mut ClientStream,
    backend: &mut TcpStream,
) -> Result<TunnelVerdict, ()> {
    loop {
        match parser.parse(buf) {
            WsParseResult::Complete(frame, consumed) => {
                buf.drain(..consumed);
                match frame.opcode {
                    Opcode::Ping => {
                        backend
                            .write_all(&websocket::pong_frame(
                                &frame.payload,
                                Some(rand::random()),
                            ))
                            .await
                            .map_err(|_| ())?;
                    }
                    Opcode::Pong => {}
                    Opcode::Close => {
                        let _ = backend
                            .write_all(&websocket::encode_frame(
                                true,
                                Opcode::Close,
                                &frame.payload,
                                Some(rand::random()),
                            ))
                            .await;
                        let _ = client
                            .write_all(&websocket::encode_frame(
                                true,
                                Opcode::Close,
                                &frame.payload,
                                None,
                            ))
                            .await;
                        return Ok(TunnelVerdict::Closed);
                    }
                    Opcode::Text | Opcode::Binary | Opcode::Continuation => {
                        client
                            .write_all(&websocket::encode_frame(
                                frame.fin,
                                frame.opcode,
                                &frame.payload,
                                None,
                            ))
                            .await
                            .map_err(|_| ())?;
                    }
                }
            }
            WsParseResult::Incomplete => return Ok(TunnelVerdict::Continue),
            WsParseResult::Error(reason) => {
                debug!("backend framing violation: {reason}");
                let _ = client
                    .write_all(&websocket::close_frame(
                        close_code::PROTOCOL_ERROR,
                        reason,
                        None,
                    ))
                    .await;
                return Err(());
            }
        }
    }
}
