//! HTTP/2 server session: stream multiplexing over one connection.
//!
//! The session is a pure state machine. The connection driver feeds it
//! bytes with [`H2Session::recv`], drains outgoing frames through
//! [`H2Session::send_data`] / [`H2Session::consume_send_buffer`], and
//! dispatches completed requests it discovers via
//! [`H2Session::ready_streams`]. Protocol violations terminate the
//! connection with a GOAWAY carrying the appropriate code; stream-scoped
//! errors terminate only that stream with RST_STREAM.

use super::frame::{self, error_code, flags, FrameHeader, FrameType, Settings};
use super::hpack;
use crate::models::http::{Method, Request, Response, Version};
use ahash::HashMap as AHashMap;
use ahash::HashMapExt;
use log::{debug, trace, warn};

/// Stream states (RFC 7540 §5.1), reduced to the server-side transitions
/// the gateway performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// One multiplexed request/response exchange.
#[derive(Debug)]
pub struct H2Stream {
    pub id: u32,
    pub state: StreamState,
    pub request: Request,
    pub response: Response,
    pub request_complete: bool,
    pub response_complete: bool,
    dispatched: bool,
    recv_window: i64,
    send_window: i64,
    /// Response body bytes blocked on flow control.
    pending_send: Vec<u8>,
    pending_offset: usize,
}

impl H2Stream {
    fn new(id: u32, initial_send_window: i64, initial_recv_window: i64) -> Self {
        H2Stream {
            id,
            state: StreamState::Idle,
            request: Request::default(),
            response: Response::default(),
            request_complete: false,
            response_complete: false,
            dispatched: false,
            recv_window: initial_recv_window,
            send_window: initial_send_window,
            pending_send: Vec::new(),
            pending_offset: 0,
        }
    }

    fn pending_len(&self) -> usize {
        self.pending_send.len() - self.pending_offset
    }
}

/// Connection-fatal HTTP/2 errors.
#[derive(Debug, thiserror::Error)]
pub enum H2Error {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("compression error: {0}")]
    Compression(&'static str),
    #[error("frame size error: {0}")]
    FrameSize(&'static str),
    #[error("flow control error")]
    FlowControl,
}

impl H2Error {
    fn code(&self) -> u32 {
        match self {
            H2Error::Protocol(_) => error_code::PROTOCOL_ERROR,
            H2Error::Compression(_) => error_code::COMPRESSION_ERROR,
            H2Error::FrameSize(_) => error_code::FRAME_SIZE_ERROR,
            H2Error::FlowControl => error_code::FLOW_CONTROL_ERROR,
        }
    }
}

#[derive(Debug)]
struct ContinuationState {
    stream_id: u32,
    end_stream: bool,
    fragment: Vec<u8>,
}

/// Server-side HTTP/2 session.
#[derive(Debug)]
pub struct H2Session {
    local_settings: Settings,
    peer_settings: Settings,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    streams: AHashMap<u32, H2Stream>,
    send_buffer: Vec<u8>,
    preface_seen: bool,
    conn_recv_window: i64,
    conn_send_window: i64,
    highest_stream_id: u32,
    goaway_sent: bool,
    goaway_received: bool,
    continuation: Option<ContinuationState>,
    max_request_body: usize,
}

impl H2Session {
    /// Creates a server session. The gateway's SETTINGS frame is queued
    /// immediately so it goes out right after the client preface.
    pub fn new_server() -> Self {
        let local_settings = Settings {
            enable_push: false,
            max_concurrent_streams: 128,
            ..Settings::default()
        };
        let mut session = H2Session {
            local_settings,
            peer_settings: Settings::default(),
            decoder: hpack::Decoder::new(local_settings.header_table_size as usize),
            encoder: hpack::Encoder::new(),
            streams: AHashMap::new(),
            send_buffer: Vec::with_capacity(1024),
            preface_seen: false,
            conn_recv_window: 65_535,
            conn_send_window: 65_535,
            highest_stream_id: 0,
            goaway_sent: false,
            goaway_received: false,
            continuation: None,
            max_request_body: 1024 * 1024,
        };
        let payload = session.local_settings.encode();
        frame::write_frame(
            &mut session.send_buffer,
            FrameType::Settings,
            0,
            0,
            &payload,
        );
        session
    }

    /// Caps the accumulated request body per stream.
    pub fn with_max_request_body(mut self, max: usize) -> Self {
        self.max_request_body = max;
        self
    }

    /// Feeds connection bytes into the session.
    ///
    /// Returns the number of bytes consumed; trailing partial frames
    /// stay with the caller. On error a GOAWAY frame has been queued and
    /// the connection must be torn down once it is flushed.
    pub fn recv(&mut self, data: &[u8]) -> Result<usize, H2Error> {
        match self.recv_inner(data) {
            Ok(consumed) => Ok(consumed),
            Err(error) => {
                self.send_goaway(error.code());
                Err(error)
            }
        }
    }

    fn recv_inner(&mut self, data: &[u8]) -> Result<usize, H2Error> {
        let mut pos = 0usize;

        if !self.preface_seen {
            if data.len() < frame::PREFACE.len() {
                return Ok(0);
            }
            if &data[..frame::PREFACE.len()] != frame::PREFACE {
                return Err(H2Error::Protocol("bad connection preface"));
            }
            self.preface_seen = true;
            pos = frame::PREFACE.len();
        }

        loop {
            let remaining = &data[pos..];
            if remaining.len() < frame::FRAME_HEADER_LEN {
                break;
            }
            let header = FrameHeader::parse(remaining);
            if header.length > self.local_settings.max_frame_size as usize {
                return Err(H2Error::FrameSize("frame exceeds advertised maximum"));
            }
            if remaining.len() < frame::FRAME_HEADER_LEN + header.length {
                break;
            }
            let payload =
                &remaining[frame::FRAME_HEADER_LEN..frame::FRAME_HEADER_LEN + header.length];
            self.handle_frame(header, payload)?;
            pos += frame::FRAME_HEADER_LEN + header.length;
        }

        self.prune_closed();
        Ok(pos)
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        trace!(
            "h2 frame {:?} stream={} len={} flags={:#x}",
            header.frame_type,
            header.stream_id,
            header.length,
            header.flags
        );

        // While a header block is split across frames nothing else may
        // interleave (RFC 7540 §6.10).
        if let Some(expected) = &self.continuation {
            let matches = header.frame_type == FrameType::Continuation
                && header.stream_id == expected.stream_id;
            if !matches {
                return Err(H2Error::Protocol("expected CONTINUATION"));
            }
        }

        match header.frame_type {
            FrameType::Settings => self.on_settings(header, payload),
            FrameType::Ping => self.on_ping(header, payload),
            FrameType::Headers => self.on_headers(header, payload),
            FrameType::Continuation => self.on_continuation(header, payload),
            FrameType::Data => self.on_data(header, payload),
            FrameType::RstStream => self.on_rst_stream(header, payload),
            FrameType::WindowUpdate => self.on_window_update(header, payload),
            FrameType::Goaway => {
                self.goaway_received = true;
                Ok(())
            }
            FrameType::Priority => {
                if payload.len() != 5 {
                    return Err(H2Error::FrameSize("PRIORITY payload must be 5 bytes"));
                }
                Ok(())
            }
            FrameType::PushPromise => Err(H2Error::Protocol("client sent PUSH_PROMISE")),
            FrameType::Unknown(_) => Ok(()),
        }
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::Protocol("SETTINGS on non-zero stream"));
        }
        if header.has_flag(flags::ACK) {
            if !payload.is_empty() {
                return Err(H2Error::FrameSize("SETTINGS ACK with payload"));
            }
            return Ok(());
        }
        let old_initial_window = self.peer_settings.initial_window_size as i64;
        self.peer_settings.apply(payload).map_err(H2Error::Protocol)?;
        let delta = self.peer_settings.initial_window_size as i64 - old_initial_window;
        if delta != 0 {
            for stream in self.streams.values_mut() {
                stream.send_window += delta;
                if stream.send_window > 0x7FFF_FFFF {
                    return Err(H2Error::FlowControl);
                }
            }
        }
        frame::write_frame(&mut self.send_buffer, FrameType::Settings, flags::ACK, 0, &[]);
        self.flush_all_pending();
        Ok(())
    }

    fn on_ping(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if header.stream_id != 0 {
            return Err(H2Error::Protocol("PING on non-zero stream"));
        }
        if payload.len() != 8 {
            return Err(H2Error::FrameSize("PING payload must be 8 bytes"));
        }
        if !header.has_flag(flags::ACK) {
            frame::write_frame(&mut self.send_buffer, FrameType::Ping, flags::ACK, 0, payload);
        }
        Ok(())
    }

    fn on_headers(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if header.stream_id == 0 || header.stream_id % 2 == 0 {
            return Err(H2Error::Protocol("HEADERS on invalid stream id"));
        }
        if header.stream_id <= self.highest_stream_id {
            return Err(H2Error::Protocol("stream id not monotonically increasing"));
        }

        let mut body = payload;
        if header.has_flag(flags::PADDED) {
            if body.is_empty() {
                return Err(H2Error::Protocol("PADDED frame without pad length"));
            }
            let pad = body[0] as usize;
            body = &body[1..];
            if pad >= body.len() + 1 {
                return Err(H2Error::Protocol("padding exceeds payload"));
            }
            body = &body[..body.len() - pad];
        }
        if header.has_flag(flags::PRIORITY) {
            if body.len() < 5 {
                return Err(H2Error::FrameSize("HEADERS priority fields truncated"));
            }
            body = &body[5..];
        }

        let end_stream = header.has_flag(flags::END_STREAM);
        if header.has_flag(flags::END_HEADERS) {
            self.open_stream(header.stream_id, end_stream, body.to_vec())
        } else {
            self.continuation = Some(ContinuationState {
                stream_id: header.stream_id,
                end_stream,
                fragment: body.to_vec(),
            });
            Ok(())
        }
    }

    fn on_continuation(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        let mut state = self
            .continuation
            .take()
            .ok_or(H2Error::Protocol("CONTINUATION without open header block"))?;
        state.fragment.extend_from_slice(payload);

        if header.has_flag(flags::END_HEADERS) {
            self.open_stream(state.stream_id, state.end_stream, state.fragment)
        } else {
            self.continuation = Some(state);
            Ok(())
        }
    }

    /// Decodes a finished header block and creates the stream.
    fn open_stream(
        &mut self,
        stream_id: u32,
        end_stream: bool,
        fragment: Vec<u8>,
    ) -> Result<(), H2Error> {
        let headers = self
            .decoder
            .decode(&fragment)
            .map_err(H2Error::Compression)?;

        self.highest_stream_id = stream_id;
        let mut stream = H2Stream::new(
            stream_id,
            self.peer_settings.initial_window_size as i64,
            self.local_settings.initial_window_size as i64,
        );

        match build_request(&headers) {
            Ok(request) => {
                stream.request = request;
                stream.state = if end_stream {
                    StreamState::HalfClosedRemote
                } else {
                    StreamState::Open
                };
                stream.request_complete = end_stream;
                self.streams.insert(stream_id, stream);
                Ok(())
            }
            Err(reason) => {
                // Malformed request: stream error, not connection error.
                debug!("h2 stream {stream_id} malformed: {reason}");
                self.send_rst_stream(stream_id, error_code::PROTOCOL_ERROR);
                stream.state = StreamState::Closed;
                self.streams.insert(stream_id, stream);
                Ok(())
            }
        }
    }

    fn on_data(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if header.stream_id == 0 {
            return Err(H2Error::Protocol("DATA on stream 0"));
        }

        let mut body = payload;
        if header.has_flag(flags::PADDED) {
            if body.is_empty() {
                return Err(H2Error::Protocol("PADDED frame without pad length"));
            }
            let pad = body[0] as usize;
            body = &body[1..];
            if pad > body.len() {
                return Err(H2Error::Protocol("padding exceeds payload"));
            }
            body = &body[..body.len() - pad];
        }

        // Flow control charges the whole frame, padding included.
        self.conn_recv_window -= payload.len() as i64;
        if self.conn_recv_window < 0 {
            return Err(H2Error::FlowControl);
        }

        let max_body = self.max_request_body;
        let stream = match self.streams.get_mut(&header.stream_id) {
            Some(s) => s,
            None => return Err(H2Error::Protocol("DATA on idle stream")),
        };
        if stream.state == StreamState::Closed {
            // Late DATA after RST: ignore, but keep windows accounted.
            self.replenish_recv_window(header.stream_id, payload.len(), false);
            return Ok(());
        }
        if !matches!(stream.state, StreamState::Open | StreamState::HalfClosedLocal) {
            return Err(H2Error::Protocol("DATA on half-closed stream"));
        }

        stream.recv_window -= payload.len() as i64;
        if stream.recv_window < 0 {
            return Err(H2Error::FlowControl);
        }

        if stream.request.body.len() + body.len() > max_body {
            warn!("h2 stream {} request body exceeds cap", header.stream_id);
            stream.state = StreamState::Closed;
            let id = stream.id;
            self.send_rst_stream(id, error_code::ENHANCE_YOUR_CALM);
            self.replenish_recv_window(header.stream_id, payload.len(), false);
            return Ok(());
        }

        stream.request.body.extend_from_slice(body);
        stream.recv_window += payload.len() as i64;

        if header.has_flag(flags::END_STREAM) {
            stream.request_complete = true;
            stream.state = match stream.state {
                StreamState::HalfClosedLocal => StreamState::Closed,
                _ => StreamState::HalfClosedRemote,
            };
        }
        self.replenish_recv_window(header.stream_id, payload.len(), true);
        Ok(())
    }

    /// Returns consumed flow-control credit to the peer.
    fn replenish_recv_window(&mut self, stream_id: u32, len: usize, stream_too: bool) {
        if len == 0 {
            return;
        }
        self.conn_recv_window += len as i64;
        let increment = (len as u32).to_be_bytes();
        frame::write_frame(&mut self.send_buffer, FrameType::WindowUpdate, 0, 0, &increment);
        if stream_too {
            frame::write_frame(
                &mut self.send_buffer,
                FrameType::WindowUpdate,
                0,
                stream_id,
                &increment,
            );
        }
    }

    fn on_rst_stream(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if header.stream_id == 0 {
            return Err(H2Error::Protocol("RST_STREAM on stream 0"));
        }
        if payload.len() != 4 {
            return Err(H2Error::FrameSize("RST_STREAM payload must be 4 bytes"));
        }
        if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.state = StreamState::Closed;
            stream.pending_send.clear();
            stream.pending_offset = 0;
        }
        Ok(())
    }

    fn on_window_update(&mut self, header: FrameHeader, payload: &[u8]) -> Result<(), H2Error> {
        if payload.len() != 4 {
            return Err(H2Error::FrameSize("WINDOW_UPDATE payload must be 4 bytes"));
        }
        let increment =
            (u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF)
                as i64;
        if increment == 0 {
            return Err(H2Error::Protocol("WINDOW_UPDATE with zero increment"));
        }
        if header.stream_id == 0 {
            self.conn_send_window += increment;
            if self.conn_send_window > 0x7FFF_FFFF {
                return Err(H2Error::FlowControl);
            }
        } else if let Some(stream) = self.streams.get_mut(&header.stream_id) {
            stream.send_window += increment;
            if stream.send_window > 0x7FFF_FFFF {
                return Err(H2Error::FlowControl);
            }
        }
        self.flush_all_pending();
        Ok(())
    }

    /// Streams whose requests are complete and not yet handed out.
    pub fn ready_streams(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .streams
            .values()
            .filter(|s| s.request_complete && !s.dispatched && s.state != StreamState::Closed)
            .map(|s| s.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Moves a completed request out of the stream for dispatch.
    pub fn take_request(&mut self, stream_id: u32) -> Option<Request> {
        let stream = self.streams.get_mut(&stream_id)?;
        if !stream.request_complete || stream.dispatched {
            return None;
        }
        stream.dispatched = true;
        Some(std::mem::take(&mut stream.request))
    }

    /// Borrows a stream, mainly for tests and observability.
    pub fn stream(&self, stream_id: u32) -> Option<&H2Stream> {
        self.streams.get(&stream_id)
    }

    /// Number of streams the session is still tracking.
    pub fn active_stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Queues a response for a stream: HEADERS now, DATA as flow control
    /// permits.
    pub fn submit_response(&mut self, stream_id: u32, response: Response) -> Result<(), H2Error> {
        let max_frame = self.peer_settings.max_frame_size as usize;
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(H2Error::Protocol("response for unknown stream"))?;
        if stream.response_complete || stream.state == StreamState::Closed {
            return Err(H2Error::Protocol("response already submitted"));
        }

        let mut header_list: Vec<(String, String)> =
            vec![(":status".to_string(), response.status.to_string())];
        for header in &response.headers {
            let name = header.name.to_ascii_lowercase();
            // Connection-specific headers do not exist in HTTP/2.
            if matches!(
                name.as_str(),
                "connection" | "keep-alive" | "transfer-encoding" | "upgrade" | "proxy-connection"
            ) {
                continue;
            }
            header_list.push((name, header.value.clone()));
        }

        let block = self.encoder.encode(&header_list);
        let end_stream = response.body.is_empty();
        let mut header_flags = if end_stream { flags::END_STREAM } else { 0 };

        if block.len() <= max_frame {
            header_flags |= flags::END_HEADERS;
            frame::write_frame(
                &mut self.send_buffer,
                FrameType::Headers,
                header_flags,
                stream_id,
                &block,
            );
        } else {
            frame::write_frame(
                &mut self.send_buffer,
                FrameType::Headers,
                header_flags,
                stream_id,
                &block[..max_frame],
            );
            let mut offset = max_frame;
            while offset < block.len() {
                let end = (offset + max_frame).min(block.len());
                let cont_flags = if end == block.len() { flags::END_HEADERS } else { 0 };
                frame::write_frame(
                    &mut self.send_buffer,
                    FrameType::Continuation,
                    cont_flags,
                    stream_id,
                    &block[offset..end],
                );
                offset = end;
            }
        }

        stream.response = response;
        stream.response_complete = true;

        if end_stream {
            stream.state = match stream.state {
                StreamState::HalfClosedRemote => StreamState::Closed,
                _ => StreamState::HalfClosedLocal,
            };
        } else {
            stream.pending_send = std::mem::take(&mut stream.response.body);
            stream.pending_offset = 0;
            self.flush_stream(stream_id);
        }
        Ok(())
    }

    /// Pushes as much pending DATA as the windows allow.
    fn flush_stream(&mut self, stream_id: u32) {
        let max_frame = self.peer_settings.max_frame_size as usize;
        let mut conn_window = self.conn_send_window;
        let stream = match self.streams.get_mut(&stream_id) {
            Some(s) => s,
            None => return,
        };

        while stream.pending_len() > 0 && conn_window > 0 && stream.send_window > 0 {
            let budget = (stream.pending_len())
                .min(conn_window as usize)
                .min(stream.send_window as usize)
                .min(max_frame);
            let start = stream.pending_offset;
            let chunk = &stream.pending_send[start..start + budget];
            let last = budget == stream.pending_len();
            let data_flags = if last { flags::END_STREAM } else { 0 };
            frame::write_frame(
                &mut self.send_buffer,
                FrameType::Data,
                data_flags,
                stream_id,
                chunk,
            );
            stream.pending_offset += budget;
            stream.send_window -= budget as i64;
            conn_window -= budget as i64;

            if last {
                stream.pending_send.clear();
                stream.pending_offset = 0;
                stream.state = match stream.state {
                    StreamState::HalfClosedRemote => StreamState::Closed,
                    _ => StreamState::HalfClosedLocal,
                };
                break;
            }
        }
        self.conn_send_window = conn_window;
    }

    fn flush_all_pending(&mut self) {
        let ids: Vec<u32> = self
            .streams
            .values()
            .filter(|s| s.pending_len() > 0)
            .map(|s| s.id)
            .collect();
        for id in ids {
            self.flush_stream(id);
        }
    }

    fn send_rst_stream(&mut self, stream_id: u32, code: u32) {
        frame::write_frame(
            &mut self.send_buffer,
            FrameType::RstStream,
            0,
            stream_id,
            &code.to_be_bytes(),
        );
    }

    fn send_goaway(&mut self, code: u32) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(self.highest_stream_id & 0x7FFF_FFFF).to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        frame::write_frame(&mut self.send_buffer, FrameType::Goaway, 0, 0, &payload);
    }

    fn prune_closed(&mut self) {
        self.streams
            .retain(|_, s| !(s.state == StreamState::Closed && s.pending_len() == 0));
    }

    /// True when the session has bytes queued for the peer.
    pub fn want_write(&self) -> bool {
        !self.send_buffer.is_empty()
    }

    /// The queued outgoing bytes.
    pub fn send_data(&self) -> &[u8] {
        &self.send_buffer
    }

    /// Marks `n` bytes of the send buffer as written to the socket.
    pub fn consume_send_buffer(&mut self, n: usize) {
        self.send_buffer.drain(..n);
    }

    /// True when the connection should be torn down after the send
    /// buffer drains.
    pub fn should_close(&self) -> bool {
        self.goaway_sent || self.goaway_received
    }
}

/// Builds a [`Request`] from a decoded header list, enforcing the
/// pseudo-header rules of RFC 7540 §8.1.2.
fn build_request(headers: &[(String, String)]) -> Result<Request, &'static str> {
    let mut request = Request {
        version: Version::Http2,
        ..Request::default()
    };
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut seen_regular = false;

    for (name, value) in headers {
        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err("pseudo-header after regular header");
            }
            match pseudo {
                "method" => {
                    if method.is_some() {
                        return Err("duplicate :method");
                    }
                    method = Some(Method::parse(value).ok_or("unknown method")?);
                }
                "path" => {
                    if path.is_some() {
                        return Err("duplicate :path");
                    }
                    if value.is_empty() {
                        return Err("empty :path");
                    }
                    path = Some(value.clone());
                }
                "scheme" => scheme = Some(value.clone()),
                "authority" => {
                    request.add_header("Host", value.clone());
                }
                _ => return Err("unknown pseudo-header"),
            }
        } else {
            seen_regular = true;
            if name.chars().any(|c| c.is_ascii_uppercase()) {
                return Err("uppercase header name");
            }
            if matches!(name.as_str(), "connection" | "keep-alive" | "transfer-encoding") {
                return Err("connection-specific header");
            }
            request.add_header(name.clone(), value.clone());
        }
    }

    request.method = Some(method.ok_or("missing :method")?);
    scheme.ok_or("missing :scheme")?;
    let target = path.ok_or("missing :path")?;
    match target.find('?') {
        Some(q) => {
            request.path = target[..q].to_string();
            request.query = target[q + 1..].to_string();
        }
        None => request.path = target,
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http2::frame::PREFACE;

    /// Minimal client-side helper used by the session tests.
    struct TestClient {
        encoder: hpack::Encoder,
    }

    impl TestClient {
        fn new() -> Self {
            TestClient {
                encoder: hpack::Encoder::new(),
            }
        }

        fn connection_prelude(&self) -> Vec<u8> {
            let mut out = PREFACE.to_vec();
            frame::write_frame(&mut out, FrameType::Settings, 0, 0, &[]);
            out
        }

        fn request_frames(
            &self,
            stream_id: u32,
            method: &str,
            path: &str,
            body: &[u8],
        ) -> Vec<u8> {
            let headers = vec![
                (":method".to_string(), method.to_string()),
                (":scheme".to_string(), "http".to_string()),
                (":path".to_string(), path.to_string()),
                (":authority".to_string(), "example.test".to_string()),
            ];
            let block = self.encoder.encode(&headers);
            let mut out = Vec::new();
            let mut header_flags = flags::END_HEADERS;
            if body.is_empty() {
                header_flags |= flags::END_STREAM;
            }
            frame::write_frame(&mut out, FrameType::Headers, header_flags, stream_id, &block);
            if !body.is_empty() {
                frame::write_frame(&mut out, FrameType::Data, flags::END_STREAM, stream_id, body);
            }
            out
        }
    }

    #[test]
    fn session_accepts_preface_and_settings() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let bytes = client.connection_prelude();
        let consumed = session.recv(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        // The session queued its own SETTINGS plus an ACK.
        assert!(session.want_write());
        assert!(!session.should_close());
    }

    #[test]
    fn rejects_bad_preface() {
        let mut session = H2Session::new_server();
        let result = session.recv(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(result.is_err());
        // GOAWAY queued for the peer.
        assert!(session.want_write());
        assert!(session.should_close());
    }

    #[test]
    fn headers_with_end_stream_completes_request() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/users/42?full=1", b""));

        let consumed = session.recv(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(session.ready_streams(), vec![1]);

        let request = session.take_request(1).unwrap();
        assert_eq!(request.method, Some(Method::Get));
        assert_eq!(request.path, "/users/42");
        assert_eq!(request.query, "full=1");
        assert_eq!(request.header("host"), Some("example.test"));
        assert_eq!(request.version, Version::Http2);
        // A request is only handed out once.
        assert!(session.take_request(1).is_none());
    }

    #[test]
    fn data_frames_accumulate_into_body() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "POST", "/ingest", b"hello world"));

        session.recv(&bytes).unwrap();
        let request = session.take_request(1).unwrap();
        assert_eq!(request.body, b"hello world");
        // Flow-control credit was returned for the body bytes.
        let stream = session.stream(1).unwrap();
        assert_eq!(stream.state, StreamState::HalfClosedRemote);
    }

    #[test]
    fn response_round_trips_through_session() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/hello", b""));
        session.recv(&bytes).unwrap();
        session.take_request(1).unwrap();

        let mut response = Response::with_status(200);
        response.add_header("Content-Type", "text/plain");
        response.body = b"OK".to_vec();
        session.submit_response(1, response).unwrap();

        // Stream completed both directions.
        assert_eq!(session.stream(1).unwrap().state, StreamState::Closed);
        assert!(session.want_write());

        // The queued bytes contain a HEADERS and a DATA frame for stream 1.
        let sent = session.send_data().to_vec();
        let mut offset = 0;
        let mut saw_headers = false;
        let mut saw_data = false;
        while offset + frame::FRAME_HEADER_LEN <= sent.len() {
            let header = FrameHeader::parse(&sent[offset..]);
            if header.stream_id == 1 {
                match header.frame_type {
                    FrameType::Headers => saw_headers = true,
                    FrameType::Data => {
                        saw_data = true;
                        assert!(header.has_flag(flags::END_STREAM));
                        let start = offset + frame::FRAME_HEADER_LEN;
                        assert_eq!(&sent[start..start + header.length], b"OK");
                    }
                    _ => {}
                }
            }
            offset += frame::FRAME_HEADER_LEN + header.length;
        }
        assert!(saw_headers && saw_data);

        let len = session.send_data().len();
        session.consume_send_buffer(len);
        assert!(!session.want_write());
    }

    #[test]
    fn multiple_streams_multiplex_independently() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/a", b""));
        bytes.extend(client.request_frames(3, "GET", "/b", b""));
        session.recv(&bytes).unwrap();

        assert_eq!(session.ready_streams(), vec![1, 3]);
        let first = session.take_request(1).unwrap();
        let second = session.take_request(3).unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");

        // Responding to stream 3 first is legal; no cross-stream ordering.
        session.submit_response(3, Response::with_status(204)).unwrap();
        session.submit_response(1, Response::with_status(200)).unwrap();
    }

    #[test]
    fn stream_ids_must_increase() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(5, "GET", "/a", b""));
        bytes.extend(client.request_frames(3, "GET", "/b", b""));
        assert!(session.recv(&bytes).is_err());
        assert!(session.should_close());
    }

    #[test]
    fn rst_stream_closes_only_that_stream() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/a", b""));
        bytes.extend(client.request_frames(3, "GET", "/b", b""));
        frame::write_frame(
            &mut bytes,
            FrameType::RstStream,
            0,
            1,
            &error_code::CANCEL.to_be_bytes(),
        );
        session.recv(&bytes).unwrap();

        assert_eq!(session.ready_streams(), vec![3]);
        assert!(!session.should_close());
    }

    #[test]
    fn flow_control_defers_large_bodies() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/big", b""));
        session.recv(&bytes).unwrap();
        session.take_request(1).unwrap();

        // 100 KiB exceeds the default 64 KiB - 1 connection window.
        let mut response = Response::with_status(200);
        response.body = vec![0xAB; 100 * 1024];
        session.submit_response(1, response).unwrap();

        let stream = session.stream(1).unwrap();
        assert!(stream.pending_len() > 0);
        assert_ne!(stream.state, StreamState::Closed);

        // Peer grants more connection + stream window; the rest flushes.
        let mut update = Vec::new();
        frame::write_frame(
            &mut update,
            FrameType::WindowUpdate,
            0,
            0,
            &(200_000u32).to_be_bytes(),
        );
        frame::write_frame(
            &mut update,
            FrameType::WindowUpdate,
            0,
            1,
            &(200_000u32).to_be_bytes(),
        );
        session.recv(&update).unwrap();
        // The remainder flushed, the stream closed, and it was pruned.
        assert!(session.stream(1).is_none());
    }

    #[test]
    fn ping_is_answered_with_ack() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        frame::write_frame(&mut bytes, FrameType::Ping, 0, 0, &[1, 2, 3, 4, 5, 6, 7, 8]);
        session.recv(&bytes).unwrap();

        let sent = session.send_data().to_vec();
        let mut offset = 0;
        let mut saw_ping_ack = false;
        while offset + frame::FRAME_HEADER_LEN <= sent.len() {
            let header = FrameHeader::parse(&sent[offset..]);
            if header.frame_type == FrameType::Ping && header.has_flag(flags::ACK) {
                let start = offset + frame::FRAME_HEADER_LEN;
                assert_eq!(&sent[start..start + 8], &[1, 2, 3, 4, 5, 6, 7, 8]);
                saw_ping_ack = true;
            }
            offset += frame::FRAME_HEADER_LEN + header.length;
        }
        assert!(saw_ping_ack);
    }

    #[test]
    fn partial_frames_are_left_unconsumed() {
        let mut session = H2Session::new_server();
        let client = TestClient::new();
        let mut bytes = client.connection_prelude();
        bytes.extend(client.request_frames(1, "GET", "/a", b""));

        let cut = bytes.len() - 4;
        let consumed = session.recv(&bytes[..cut]).unwrap();
        assert!(consumed < cut);
        // Feeding the tail starting at the unconsumed boundary completes it.
        session.recv(&bytes[consumed..]).unwrap();
        assert_eq!(session.ready_streams(), vec![1]);
    }
}
