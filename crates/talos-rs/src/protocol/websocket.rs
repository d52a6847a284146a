//! WebSocket protocol support (RFC 6455).
//!
//! Covers the upgrade handshake, the frame parser state machine, frame
//! encoding, and the control-frame rules the tunnel relies on: control
//! frames never fragment, carry at most 125 payload bytes, and may be
//! interleaved with a fragmented data message without disturbing
//! reassembly.

use crate::models::http::{Request, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

/// GUID appended to the client key when computing the accept value
/// (RFC 6455 §4.2.2).
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Frame opcodes (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_bits(bits: u8) -> Option<Opcode> {
        match bits {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    /// Control frames occupy the 0x8-0xF opcode range.
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }
}

/// Close status codes used by the gateway (RFC 6455 §7.4).
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;

    /// True when the code is legal on the wire in a Close frame.
    pub fn is_valid(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

/// One parsed WebSocket frame. The payload is owned and already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Result of one parser step.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseResult {
    /// A full frame was parsed; the given number of input bytes were consumed.
    Complete(Frame, usize),
    /// More bytes are needed; nothing was consumed.
    Incomplete,
    /// Protocol violation; the connection must close with 1002.
    Error(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    ReadHeader,
    ReadExtendedLen16,
    ReadExtendedLen64,
    ReadMaskingKey,
    ReadPayload,
}

/// Incremental WebSocket frame parser.
///
/// `require_masked` enforces the direction rule: client-to-server frames
/// must be masked, server-to-client frames must not be.
#[derive(Debug)]
pub struct FrameParser {
    state: ParserState,
    require_masked: bool,
    fin: bool,
    opcode: Opcode,
    masked: bool,
    payload_len: u64,
    masking_key: [u8; 4],
    max_payload: u64,
}

impl FrameParser {
    /// Parser for the client side of the tunnel (frames must be masked).
    pub fn client_to_server() -> Self {
        Self::new(true)
    }

    /// Parser for the backend side of the tunnel (frames must be unmasked).
    pub fn server_to_client() -> Self {
        Self::new(false)
    }

    fn new(require_masked: bool) -> Self {
        FrameParser {
            state: ParserState::ReadHeader,
            require_masked,
            fin: false,
            opcode: Opcode::Continuation,
            masked: false,
            payload_len: 0,
            masking_key: [0; 4],
            max_payload: 16 * 1024 * 1024,
        }
    }

    /// Overrides the maximum accepted payload size.
    pub fn with_max_payload(mut self, max: u64) -> Self {
        self.max_payload = max;
        self
    }

    /// Resets the state machine; used after errors and between frames.
    pub fn reset(&mut self) {
        self.state = ParserState::ReadHeader;
    }

    /// Attempts to parse one frame from the start of `data`.
    ///
    /// The parser buffers nothing itself: on `Incomplete` the caller
    /// keeps accumulating and calls again with the longer prefix.
    pub fn parse(&mut self, data: &[u8]) -> ParseResult {
        let mut pos = 0usize;

        loop {
            match self.state {
                ParserState::ReadHeader => {
                    if data.len() < pos + 2 {
                        self.reset();
                        return ParseResult::Incomplete;
                    }
                    let b0 = data[pos];
                    let b1 = data[pos + 1];
                    pos += 2;

                    if b0 & 0x70 != 0 {
                        return ParseResult::Error("reserved bits set");
                    }
                    self.fin = b0 & 0x80 != 0;
                    self.opcode = match Opcode::from_bits(b0 & 0x0F) {
                        Some(op) => op,
                        None => return ParseResult::Error("unknown opcode"),
                    };
                    self.masked = b1 & 0x80 != 0;
                    let len = (b1 & 0x7F) as u64;

                    if self.opcode.is_control() {
                        if !self.fin {
                            return ParseResult::Error("fragmented control frame");
                        }
                        if len > 125 {
                            return ParseResult::Error("control payload too large");
                        }
                    }
                    if self.masked != self.require_masked {
                        return ParseResult::Error(if self.require_masked {
                            "unmasked client frame"
                        } else {
                            "masked server frame"
                        });
                    }

                    match len {
                        126 => self.state = ParserState::ReadExtendedLen16,
                        127 => self.state = ParserState::ReadExtendedLen64,
                        n => {
                            self.payload_len = n;
                            self.state = if self.masked {
                                ParserState::ReadMaskingKey
                            } else {
                                ParserState::ReadPayload
                            };
                        }
                    }
                }
                ParserState::ReadExtendedLen16 => {
                    if data.len() < pos + 2 {
                        self.reset();
                        return ParseResult::Incomplete;
                    }
                    self.payload_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as u64;
                    pos += 2;
                    self.state = if self.masked {
                        ParserState::ReadMaskingKey
                    } else {
                        ParserState::ReadPayload
                    };
                }
                ParserState::ReadExtendedLen64 => {
                    if data.len() < pos + 8 {
                        self.reset();
                        return ParseResult::Incomplete;
                    }
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&data[pos..pos + 8]);
                    self.payload_len = u64::from_be_bytes(buf);
                    pos += 8;
                    if self.payload_len & (1 << 63) != 0 {
                        return ParseResult::Error("payload length high bit set");
                    }
                    self.state = if self.masked {
                        ParserState::ReadMaskingKey
                    } else {
                        ParserState::ReadPayload
                    };
                }
                ParserState::ReadMaskingKey => {
                    if data.len() < pos + 4 {
                        self.reset();
                        return ParseResult::Incomplete;
                    }
                    self.masking_key.copy_from_slice(&data[pos..pos + 4]);
                    pos += 4;
                    self.state = ParserState::ReadPayload;
                }
                ParserState::ReadPayload => {
                    if self.payload_len > self.max_payload {
                        return ParseResult::Error("payload exceeds limit");
                    }
                    let len = self.payload_len as usize;
                    if data.len() < pos + len {
                        self.reset();
                        return ParseResult::Incomplete;
                    }
                    let mut payload = data[pos..pos + len].to_vec();
                    pos += len;
                    if self.masked {
                        unmask(&mut payload, self.masking_key);
                    }

                    if self.opcode == Opcode::Close {
                        if payload.len() == 1 {
                            return ParseResult::Error("close payload of one byte");
                        }
                        if payload.len() >= 2 {
                            let code = u16::from_be_bytes([payload[0], payload[1]]);
                            if !close_code::is_valid(code) {
                                return ParseResult::Error("invalid close code");
                            }
                        }
                    }

                    let frame = Frame {
                        fin: self.fin,
                        opcode: self.opcode,
                        masked: self.masked,
                        payload,
                    };
                    self.reset();
                    return ParseResult::Complete(frame, pos);
                }
            }
        }
    }
}

/// XOR-unmasks a payload in place with the 4-byte masking key.
pub fn unmask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Computes the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validates the upgrade request headers (RFC 6455 §4.2.1).
///
/// Requires `Upgrade: websocket`, `Connection: Upgrade`, a base64 16-byte
/// `Sec-WebSocket-Key`, and `Sec-WebSocket-Version: 13`.
pub fn is_upgrade_request(request: &Request) -> bool {
    let upgrade = request
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection = request
        .header("connection")
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    let version = request
        .header("sec-websocket-version")
        .map(|v| v.trim() == "13")
        .unwrap_or(false);
    let key_ok = request
        .header("sec-websocket-key")
        .and_then(|k| BASE64.decode(k.trim()).ok())
        .map(|decoded| decoded.len() == 16)
        .unwrap_or(false);

    upgrade && connection && version && key_ok
}

/// Builds the `101 Switching Protocols` upgrade response.
pub fn upgrade_response(request: &Request) -> Option<Response> {
    if !is_upgrade_request(request) {
        return None;
    }
    let key = request.header("sec-websocket-key")?.trim();
    let mut response = Response::with_status(101);
    response.add_header("Upgrade", "websocket");
    response.add_header("Connection", "Upgrade");
    response.add_header("Sec-WebSocket-Accept", compute_accept_key(key));
    Some(response)
}

/// Encodes a frame header followed by the payload.
///
/// Server-sent frames are never masked; client-bound encoding with
/// `masking_key` is used only when the gateway dials the backend as a
/// WebSocket client.
pub fn encode_frame(
    fin: bool,
    opcode: Opcode,
    payload: &[u8],
    masking_key: Option<[u8; 4]>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let b0 = if fin { 0x80 } else { 0x00 } | opcode as u8;
    out.push(b0);

    let mask_bit = if masking_key.is_some() { 0x80 } else { 0x00 };
    match payload.len() {
        len if len <= 125 => out.push(mask_bit | len as u8),
        len if len <= u16::MAX as usize => {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    match masking_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            unmask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Builds a Close frame with the given status code and reason.
pub fn close_frame(code: u16, reason: &str, masking_key: Option<[u8; 4]>) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(true, Opcode::Close, &payload, masking_key)
}

/// Builds a Pong frame echoing the Ping payload.
pub fn pong_frame(ping_payload: &[u8], masking_key: Option<[u8; 4]>) -> Vec<u8> {
    encode_frame(true, Opcode::Pong, ping_payload, masking_key)
}

/// Builds an empty Ping frame.
pub fn ping_frame(masking_key: Option<[u8; 4]>) -> Vec<u8> {
    encode_frame(true, Opcode::Ping, &[], masking_key)
}

/// Serializes the HTTP/1.1 upgrade request the gateway sends to the
/// backend when establishing the other half of the tunnel.
///
/// The client's headers are forwarded minus hop-by-hop ones; the
/// upgrade triplet uses a fresh key because the client's key belongs to
/// the client-side handshake.
pub fn build_backend_upgrade_request(request: &Request, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(b"GET ");
    out.extend_from_slice(request.path.as_bytes());
    if !request.query.is_empty() {
        out.push(b'?');
        out.extend_from_slice(request.query.as_bytes());
    }
    out.extend_from_slice(b" HTTP/1.1\r\n");

    let mut has_host = false;
    for header in &request.headers {
        let name = header.name.as_str();
        if crate::models::http::is_hop_by_hop(name)
            || crate::models::http::header_name_eq(name, "sec-websocket-key")
            || crate::models::http::header_name_eq(name, "sec-websocket-version")
            || crate::models::http::header_name_eq(name, "sec-websocket-accept")
        {
            continue;
        }
        if crate::models::http::header_name_eq(name, "host") {
            has_host = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if !has_host {
        out.extend_from_slice(b"Host: backend\r\n");
    }
    out.extend_from_slice(b"Upgrade: websocket\r\n");
    out.extend_from_slice(b"Connection: Upgrade\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Key: ");
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n\r\n");
    out
}

/// Generates a fresh base64 16-byte nonce for a backend handshake.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::http::Request;

    fn upgrade_request() -> Request {
        let mut request = Request::default();
        request.add_header("Upgrade", "websocket");
        request.add_header("Connection", "Upgrade");
        request.add_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        request.add_header("Sec-WebSocket-Version", "13");
        request
    }

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_response_is_101_with_accept() {
        let response = upgrade_response(&upgrade_request()).expect("valid handshake");
        assert_eq!(response.status, 101);
        assert_eq!(
            response.header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn handshake_rejects_missing_pieces() {
        let mut request = upgrade_request();
        request.remove_header("sec-websocket-version");
        assert!(!is_upgrade_request(&request));

        let mut request = upgrade_request();
        request.set_header("sec-websocket-key", "not-base64!!");
        assert!(!is_upgrade_request(&request));

        let mut request = upgrade_request();
        request.set_header("connection", "close");
        assert!(!is_upgrade_request(&request));
    }

    #[test]
    fn parses_masked_text_frame() {
        // "Hello" masked with 0x37 0xfa 0x21 0x3d (RFC 6455 §5.7 example).
        let raw = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut parser = FrameParser::client_to_server();
        match parser.parse(&raw) {
            ParseResult::Complete(frame, consumed) => {
                assert_eq!(consumed, raw.len());
                assert!(frame.fin);
                assert_eq!(frame.opcode, Opcode::Text);
                assert_eq!(frame.payload, b"Hello");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn incomplete_frame_resumes_cleanly() {
        let raw = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut parser = FrameParser::client_to_server();
        for cut in 1..raw.len() {
            assert_eq!(parser.parse(&raw[..cut]), ParseResult::Incomplete, "cut {cut}");
        }
        assert!(matches!(parser.parse(&raw), ParseResult::Complete(_, _)));
    }

    #[test]
    fn extended_16bit_length_round_trips() {
        let payload = vec![0xAB; 300];
        let wire = encode_frame(true, Opcode::Binary, &payload, None);
        assert_eq!(wire[1] & 0x7F, 126);
        let mut parser = FrameParser::server_to_client();
        match parser.parse(&wire) {
            ParseResult::Complete(frame, consumed) => {
                assert_eq!(consumed, wire.len());
                assert_eq!(frame.payload, payload);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn extended_64bit_length_round_trips() {
        let payload = vec![0x01; 70_000];
        let wire = encode_frame(true, Opcode::Binary, &payload, None);
        assert_eq!(wire[1] & 0x7F, 127);
        let mut parser = FrameParser::server_to_client();
        match parser.parse(&wire) {
            ParseResult::Complete(frame, _) => assert_eq!(frame.payload.len(), 70_000),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn rejects_reserved_bits() {
        let mut parser = FrameParser::server_to_client();
        assert!(matches!(parser.parse(&[0xC1, 0x00]), ParseResult::Error(_)));
    }

    #[test]
    fn rejects_fragmented_control_frame() {
        // Ping with FIN=0.
        let mut parser = FrameParser::server_to_client();
        assert!(matches!(parser.parse(&[0x09, 0x00]), ParseResult::Error(_)));
    }

    #[test]
    fn rejects_oversized_control_payload() {
        // Ping advertising a 126-byte payload.
        let mut parser = FrameParser::server_to_client();
        assert!(matches!(
            parser.parse(&[0x89, 126, 0x00, 0x80]),
            ParseResult::Error(_)
        ));
    }

    #[test]
    fn rejects_unmasked_client_frame() {
        let wire = encode_frame(true, Opcode::Text, b"hi", None);
        let mut parser = FrameParser::client_to_server();
        assert!(matches!(parser.parse(&wire), ParseResult::Error(_)));
    }

    #[test]
    fn rejects_invalid_close_code() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1004u16.to_be_bytes());
        let wire = encode_frame(true, Opcode::Close, &payload, None);
        let mut parser = FrameParser::server_to_client();
        assert!(matches!(parser.parse(&wire), ParseResult::Error(_)));
    }

    #[test]
    fn close_frame_carries_code_and_reason() {
        let wire = close_frame(close_code::INTERNAL_ERROR, "backend gone", None);
        let mut parser = FrameParser::server_to_client();
        match parser.parse(&wire) {
            ParseResult::Complete(frame, _) => {
                assert_eq!(frame.opcode, Opcode::Close);
                assert_eq!(
                    u16::from_be_bytes([frame.payload[0], frame.payload[1]]),
                    close_code::INTERNAL_ERROR
                );
                assert_eq!(&frame.payload[2..], b"backend gone");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn masked_encoding_round_trips() {
        let wire = encode_frame(true, Opcode::Text, b"payload", Some([1, 2, 3, 4]));
        let mut parser = FrameParser::client_to_server();
        match parser.parse(&wire) {
            ParseResult::Complete(frame, _) => assert_eq!(frame.payload, b"payload"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
