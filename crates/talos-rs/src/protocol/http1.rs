//! Incremental HTTP/1.1 parsing and serialization.
//!
//! The parsers here are streaming: bytes arrive in arbitrary chunks and
//! `feed` consumes what it can recognize. After an `Incomplete` result
//! the next feed continues where parsing stopped without re-seeing
//! previously-consumed bytes - complete header lines and body spans are
//! consumed as they are recognized, while a partial line stays
//! unconsumed until its terminator arrives. Error offsets are absolute
//! across feeds, so chunked feeding reports a malformed byte at the same
//! offset as a whole-buffer parse.
//!
//! After a `Complete` result the parser is `reset` and may be reused for
//! the next pipelined message on the same connection.

use crate::models::http::{
    is_hop_by_hop, reason_phrase, Header, Method, Request, Response, Version,
};

/// Maximum length of the request/status line.
const MAX_START_LINE: usize = 8192;
/// Maximum length of a single header line.
const MAX_HEADER_LINE: usize = 8192;
/// Maximum number of headers per message.
const MAX_HEADERS: usize = 100;

/// Outcome of a single `feed` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// The message is complete. The second tuple element is the number of
    /// bytes consumed by this feed.
    Complete,
    /// More data is needed. The second tuple element is the number of
    /// bytes consumed by this feed; the caller must not re-feed them.
    Incomplete,
    /// Protocol violation. The second tuple element is the absolute byte
    /// offset of the failure counted from the start of the message.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    StartLine,
    Headers,
    /// Fixed-size body with this many bytes still outstanding.
    Body(usize),
    /// Reading a chunk-size line.
    ChunkSize,
    /// Reading chunk payload with this many bytes still outstanding.
    ChunkData(usize),
    /// Expecting the CRLF that terminates a chunk payload.
    ChunkDataEnd,
    /// Reading trailer lines after the final zero-size chunk.
    ChunkTrailer,
    /// Response without a declared length: body runs until EOF.
    BodyUntilEof,
    Complete,
}

/// Scans for a `\r\n` terminated line starting at `pos`.
///
/// Returns `Ok(Some((line, next_pos)))` when a full line is available,
/// `Ok(None)` when the terminator has not arrived yet, and `Err(offset)`
/// when the line exceeds `max_len` (offset is relative to `data`).
fn take_line<'a>(
    data: &'a [u8],
    pos: usize,
    max_len: usize,
) -> Result<Option<(&'a [u8], usize)>, usize> {
    let rest = &data[pos..];
    match rest.iter().position(|&b| b == b'\n') {
        Some(nl) => {
            if nl == 0 || rest[nl - 1] != b'\r' {
                // Bare LF is a framing violation.
                return Err(pos + nl);
            }
            if nl - 1 > max_len {
                return Err(pos + max_len);
            }
            Ok(Some((&rest[..nl - 1], pos + nl + 1)))
        }
        None => {
            if rest.len() > max_len {
                Err(pos + max_len)
            } else {
                Ok(None)
            }
        }
    }
}

fn parse_header_line(line: &[u8]) -> Result<Header, ()> {
    let colon = line.iter().position(|&b| b == b':').ok_or(())?;
    if colon == 0 {
        return Err(());
    }
    let name = std::str::from_utf8(&line[..colon]).map_err(|_| ())?;
    if name.bytes().any(|b| b == b' ' || b == b'\t' || b.is_ascii_control()) {
        return Err(());
    }
    let value = std::str::from_utf8(&line[colon + 1..]).map_err(|_| ())?;
    Ok(Header::new(name.to_string(), value.trim().to_string()))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ()> {
    // Chunk extensions after ';' are ignored.
    let end = line.iter().position(|&b| b == b';').unwrap_or(line.len());
    let digits = std::str::from_utf8(&line[..end]).map_err(|_| ())?.trim();
    if digits.is_empty() {
        return Err(());
    }
    usize::from_str_radix(digits, 16).map_err(|_| ())
}

/// Shared header-section bookkeeping for request and response parsing.
#[derive(Debug)]
struct MessageFraming {
    content_length: Option<usize>,
    chunked: bool,
    header_count: usize,
}

impl MessageFraming {
    fn new() -> Self {
        MessageFraming {
            content_length: None,
            chunked: false,
            header_count: 0,
        }
    }

    fn observe(&mut self, header: &Header) -> Result<(), ()> {
        self.header_count += 1;
        if self.header_count > MAX_HEADERS {
            return Err(());
        }
        if crate::models::http::header_name_eq(&header.name, "content-length") {
            let length: usize = header.value.trim().parse().map_err(|_| ())?;
            // Conflicting Content-Length headers are a smuggling vector.
            if matches!(self.content_length, Some(existing) if existing != length) {
                return Err(());
            }
            self.content_length = Some(length);
        } else if crate::models::http::header_name_eq(&header.name, "transfer-encoding") {
            if header.value.to_ascii_lowercase().contains("chunked") {
                self.chunked = true;
            }
        }
        Ok(())
    }
}

/// Incremental HTTP/1.1 request parser.
///
/// Reusable across pipelined requests on one connection: after a
/// `Complete` result call [`RequestParser::reset`] before the next feed.
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    framing: MessageFraming,
    /// Bytes consumed across feeds, used for absolute error offsets.
    total_consumed: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: State::StartLine,
            framing: MessageFraming::new(),
            total_consumed: 0,
        }
    }

    /// Resets the parser for the next pipelined request.
    pub fn reset(&mut self) {
        self.state = State::StartLine;
        self.framing = MessageFraming::new();
        self.total_consumed = 0;
    }

    /// Feeds bytes into the parser, filling `request` as parts complete.
    pub fn feed(&mut self, data: &[u8], request: &mut Request) -> (ParseStatus, usize) {
        let mut pos = 0usize;

        loop {
            match self.state {
                State::StartLine => match take_line(data, pos, MAX_START_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        match self.parse_request_line(line, request) {
                            Ok(()) => {
                                pos = next;
                                self.state = State::Headers;
                            }
                            Err(rel) => return self.fail(pos + rel),
                        }
                    }
                },
                State::Headers => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        if line.is_empty() {
                            pos = next;
                            self.state = self.body_state();
                            if self.state == State::Complete {
                                return self.done(pos);
                            }
                        } else {
                            let header = match parse_header_line(line) {
                                Ok(h) => h,
                                Err(()) => return self.fail(pos),
                            };
                            if self.framing.observe(&header).is_err() {
                                return self.fail(pos);
                            }
                            request.headers.push(header);
                            pos = next;
                        }
                    }
                },
                State::Body(remaining) => {
                    let take = remaining.min(data.len() - pos);
                    request.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        return self.done(pos);
                    }
                    self.state = State::Body(remaining - take);
                    return self.pending(pos);
                }
                State::ChunkSize => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => match parse_chunk_size(line) {
                        Ok(0) => {
                            pos = next;
                            self.state = State::ChunkTrailer;
                        }
                        Ok(size) => {
                            pos = next;
                            self.state = State::ChunkData(size);
                        }
                        Err(()) => return self.fail(pos),
                    },
                },
                State::ChunkData(remaining) => {
                    let take = remaining.min(data.len() - pos);
                    request.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData(remaining - take);
                        return self.pending(pos);
                    }
                }
                State::ChunkDataEnd => match take_line(data, pos, 2) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        if !line.is_empty() {
                            return self.fail(pos);
                        }
                        pos = next;
                        self.state = State::ChunkSize;
                    }
                },
                State::ChunkTrailer => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        pos = next;
                        if line.is_empty() {
                            return self.done(pos);
                        }
                    }
                },
                State::BodyUntilEof | State::Complete => {
                    // Requests always carry explicit framing.
                    return self.done(pos);
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8], request: &mut Request) -> Result<(), usize> {
        let text = std::str::from_utf8(line).map_err(|e| e.valid_up_to())?;
        let mut parts = text.splitn(3, ' ');
        let method_token = parts.next().unwrap_or("");
        let target = parts.next().ok_or(method_token.len())?;
        let version_token = parts.next().ok_or(method_token.len() + 1 + target.len())?;

        request.method = match Method::parse(method_token) {
            Some(m) => Some(m),
            None => return Err(0),
        };

        if target.is_empty() || (!target.starts_with('/') && target != "*") {
            return Err(method_token.len() + 1);
        }
        match target.find('?') {
            Some(q) => {
                request.path = target[..q].to_string();
                request.query = target[q + 1..].to_string();
            }
            None => {
                request.path = target.to_string();
                request.query.clear();
            }
        }

        request.version = match version_token {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            _ => return Err(method_token.len() + 1 + target.len() + 1),
        };
        Ok(())
    }

    fn body_state(&self) -> State {
        if self.framing.chunked {
            State::ChunkSize
        } else {
            match self.framing.content_length {
                Some(0) | None => State::Complete,
                Some(n) => State::Body(n),
            }
        }
    }

    fn pending(&mut self, consumed: usize) -> (ParseStatus, usize) {
        self.total_consumed += consumed;
        (ParseStatus::Incomplete, consumed)
    }

    fn done(&mut self, consumed: usize) -> (ParseStatus, usize) {
        self.total_consumed += consumed;
        self.state = State::Complete;
        (ParseStatus::Complete, consumed)
    }

    fn fail(&self, offset_in_feed: usize) -> (ParseStatus, usize) {
        (ParseStatus::Error, self.total_consumed + offset_in_feed)
    }
}

/// Incremental HTTP/1.1 response parser for backend replies.
///
/// Responses without `Content-Length` or chunked framing run until the
/// peer closes the connection; the caller signals that with
/// [`ResponseParser::finish`].
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    framing: MessageFraming,
    head_request: bool,
    total_consumed: usize,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            state: State::StartLine,
            framing: MessageFraming::new(),
            head_request: false,
            total_consumed: 0,
        }
    }

    /// Marks the response as a reply to a HEAD request, which never
    /// carries a body regardless of its headers.
    pub fn for_head_request(mut self) -> Self {
        self.head_request = true;
        self
    }

    pub fn reset(&mut self) {
        self.state = State::StartLine;
        self.framing = MessageFraming::new();
        self.total_consumed = 0;
    }

    /// True when the body length is unknown and runs until EOF.
    pub fn reads_until_eof(&self) -> bool {
        self.state == State::BodyUntilEof
    }

    /// Completes an until-EOF body. Returns `Error` if the message was
    /// still inside framed sections when the peer closed.
    pub fn finish(&mut self) -> ParseStatus {
        match self.state {
            State::BodyUntilEof => {
                self.state = State::Complete;
                ParseStatus::Complete
            }
            State::Complete => ParseStatus::Complete,
            _ => ParseStatus::Error,
        }
    }

    pub fn feed(&mut self, data: &[u8], response: &mut Response) -> (ParseStatus, usize) {
        let mut pos = 0usize;

        loop {
            match self.state {
                State::StartLine => match take_line(data, pos, MAX_START_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => match self.parse_status_line(line, response) {
                        Ok(()) => {
                            pos = next;
                            self.state = State::Headers;
                        }
                        Err(rel) => return self.fail(pos + rel),
                    },
                },
                State::Headers => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        if line.is_empty() {
                            pos = next;
                            self.state = self.body_state(response.status);
                            if self.state == State::Complete {
                                return self.done(pos);
                            }
                        } else {
                            let header = match parse_header_line(line) {
                                Ok(h) => h,
                                Err(()) => return self.fail(pos),
                            };
                            if self.framing.observe(&header).is_err() {
                                return self.fail(pos);
                            }
                            response.headers.push(header);
                            pos = next;
                        }
                    }
                },
                State::Body(remaining) => {
                    let take = remaining.min(data.len() - pos);
                    response.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        return self.done(pos);
                    }
                    self.state = State::Body(remaining - take);
                    return self.pending(pos);
                }
                State::ChunkSize => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => match parse_chunk_size(line) {
                        Ok(0) => {
                            pos = next;
                            self.state = State::ChunkTrailer;
                        }
                        Ok(size) => {
                            pos = next;
                            self.state = State::ChunkData(size);
                        }
                        Err(()) => return self.fail(pos),
                    },
                },
                State::ChunkData(remaining) => {
                    let take = remaining.min(data.len() - pos);
                    response.body.extend_from_slice(&data[pos..pos + take]);
                    pos += take;
                    if take == remaining {
                        self.state = State::ChunkDataEnd;
                    } else {
                        self.state = State::ChunkData(remaining - take);
                        return self.pending(pos);
                    }
                }
                State::ChunkDataEnd => match take_line(data, pos, 2) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        if !line.is_empty() {
                            return self.fail(pos);
                        }
                        pos = next;
                        self.state = State::ChunkSize;
                    }
                },
                State::ChunkTrailer => match take_line(data, pos, MAX_HEADER_LINE) {
                    Err(off) => return self.fail(off),
                    Ok(None) => return self.pending(pos),
                    Ok(Some((line, next))) => {
                        pos = next;
                        if line.is_empty() {
                            return self.done(pos);
                        }
                    }
                },
                State::BodyUntilEof => {
                    response.body.extend_from_slice(&data[pos..]);
                    pos = data.len();
                    return self.pending(pos);
                }
                State::Complete => return self.done(pos),
            }
        }
    }

    fn parse_status_line(&mut self, line: &[u8], response: &mut Response) -> Result<(), usize> {
        let text = std::str::from_utf8(line).map_err(|e| e.valid_up_to())?;
        let mut parts = text.splitn(3, ' ');
        let version_token = parts.next().unwrap_or("");
        let status_token = parts.next().ok_or(version_token.len())?;

        response.version = match version_token {
            "HTTP/1.1" => Version::Http11,
            "HTTP/1.0" => Version::Http10,
            _ => return Err(0),
        };
        response.status = status_token
            .parse::<u16>()
            .ok()
            .filter(|s| (100..600).contains(s))
            .ok_or(version_token.len() + 1)?;
        // The reason phrase is informational and intentionally ignored.
        Ok(())
    }

    fn body_state(&self, status: u16) -> State {
        if self.head_request || status == 204 || status == 304 || (100..200).contains(&status) {
            return State::Complete;
        }
        if self.framing.chunked {
            return State::ChunkSize;
        }
        match self.framing.content_length {
            Some(0) => State::Complete,
            Some(n) => State::Body(n),
            None => State::BodyUntilEof,
        }
    }

    fn pending(&mut self, consumed: usize) -> (ParseStatus, usize) {
        self.total_consumed += consumed;
        (ParseStatus::Incomplete, consumed)
    }

    fn done(&mut self, consumed: usize) -> (ParseStatus, usize) {
        self.total_consumed += consumed;
        self.state = State::Complete;
        (ParseStatus::Complete, consumed)
    }

    fn fail(&self, offset_in_feed: usize) -> (ParseStatus, usize) {
        (ParseStatus::Error, self.total_consumed + offset_in_feed)
    }
}

/// Serializes a response for the client side of the connection.
///
/// `Content-Length` and `Connection` are owned by the gateway and always
/// rewritten; everything else is forwarded as-is.
pub fn serialize_response(response: &Response, keep_alive: bool) -> Vec<u8> {
    let mut estimated = 200 + response.body.len();
    for header in &response.headers {
        estimated += header.name.len() + header.value.len() + 4;
    }
    let mut out = Vec::with_capacity(estimated);

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(response.status.to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(reason_phrase(response.status).as_bytes());
    out.extend_from_slice(b"\r\n");

    // Informational responses (the 101 upgrade in particular) carry
    // their headers verbatim and no body framing.
    if (100..200).contains(&response.status) {
        for header in &response.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        return out;
    }

    for header in &response.headers {
        if crate::models::http::header_name_eq(&header.name, "content-length")
            || crate::models::http::header_name_eq(&header.name, "connection")
            || crate::models::http::header_name_eq(&header.name, "transfer-encoding")
        {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"Content-Length: ");
    out.extend_from_slice(response.body.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    if keep_alive {
        out.extend_from_slice(b"Connection: keep-alive\r\n");
    } else {
        out.extend_from_slice(b"Connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&response.body);
    out
}

/// Builds the HTTP/1.1 request sent to a backend.
///
/// Hop-by-hop headers are stripped, a `Host` header is synthesized when
/// the client did not send one, and `Connection: keep-alive` is always
/// set so the backend connection can return to the pool.
pub fn build_backend_request(request: &Request, rewritten_path: Option<&str>) -> Vec<u8> {
    let path = rewritten_path.unwrap_or(&request.path);

    let mut estimated = 50 + path.len() + request.query.len() + request.body.len() + 50;
    for header in &request.headers {
        estimated += header.name.len() + header.value.len() + 4;
    }
    let mut out = Vec::with_capacity(estimated);

    let method = request.method.map(|m| m.as_str()).unwrap_or("GET");
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(path.as_bytes());
    if !request.query.is_empty() {
        out.push(b'?');
        out.extend_from_slice(request.query.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let mut has_host = false;
    for header in &request.headers {
        if is_hop_by_hop(&header.name) {
            continue;
        }
        if crate::models::http::header_name_eq(&header.name, "host") {
            has_host = true;
        }
        // Content-Length is recomputed from the actual body below.
        if crate::models::http::header_name_eq(&header.name, "content-length") {
            continue;
        }
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    if !has_host {
        out.extend_from_slice(b"Host: backend\r\n");
    }
    if !request.body.is_empty() || matches!(request.method, Some(Method::Post | Method::Put | Method::Patch)) {
        out.extend_from_slice(b"Content-Length: ");
        out.extend_from_slice(request.body.len().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"Connection: keep-alive\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(&request.body);
    out
}
