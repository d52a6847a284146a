//! HTTP value types shared by every protocol front-end.
//!
//! These types are the common currency between the HTTP/1.1 parser, the
//! HTTP/2 session, the router, and the middleware pipeline. A request
//! parsed from an HTTP/2 stream and one parsed from an HTTP/1.1
//! connection look identical from the dispatcher's point of view.

/// HTTP request methods supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Patch,
    Connect,
    Trace,
}

impl Method {
    /// Parses a method token, returning `None` for anything that is not
    /// a recognized HTTP method.
    pub fn parse(token: &str) -> Option<Method> {
        match token {
            "GET" => Some(Method::Get),
            "POST" => Some(Method::Post),
            "PUT" => Some(Method::Put),
            "DELETE" => Some(Method::Delete),
            "HEAD" => Some(Method::Head),
            "OPTIONS" => Some(Method::Options),
            "PATCH" => Some(Method::Patch),
            "CONNECT" => Some(Method::Connect),
            "TRACE" => Some(Method::Trace),
            _ => None,
        }
    }

    /// Returns the canonical uppercase token for this method.
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Connect => "CONNECT",
            Method::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version of a parsed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
    Http2,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
            Version::Http2 => "HTTP/2.0",
        }
    }
}

/// Maps a status code to its canonical reason phrase.
///
/// Unknown codes fall back to the generic phrase for their class so a
/// synthesized status line is always well-formed.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => match status / 100 {
            1 => "Informational",
            2 => "Success",
            3 => "Redirection",
            4 => "Client Error",
            _ => "Server Error",
        },
    }
}

// ASCII lowercase mapping table. Header name comparison happens on every
// header of every request, so the per-byte mapping avoids allocating
// lowercase copies.
const LOWER: [u8; 256] = build_lower_table();

const fn build_lower_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let b = i as u8;
        table[i] = if b.is_ascii_uppercase() { b + 32 } else { b };
        i += 1;
    }
    table
}

/// Case-insensitive header name comparison without allocation.
pub fn header_name_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| LOWER[*x as usize] == LOWER[*y as usize])
}

/// A single HTTP header as an owned name/value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A complete HTTP request, independent of the wire protocol it arrived on.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Option<Method>,
    pub version: Version,
    /// Request path without the query string.
    pub path: String,
    /// Raw query string, empty when absent.
    pub query: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Request {
    /// Looks up a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| header_name_eq(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Removes every header with the given case-insensitive name.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !header_name_eq(&h.name, name));
    }

    /// Replaces a header, appending it when absent.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for h in &mut self.headers {
            if header_name_eq(&h.name, name) {
                h.value = value;
                return;
            }
        }
        self.headers.push(Header::new(name.to_string(), value));
    }

    /// Declared Content-Length, or 0 when the header is absent or invalid.
    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Keep-alive inference per the HTTP/1.x defaults.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 defaults to close unless `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("connection").unwrap_or("");
        match self.version {
            Version::Http10 => connection.to_ascii_lowercase().contains("keep-alive"),
            _ => !connection.to_ascii_lowercase().contains("close"),
        }
    }
}

/// A complete HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    pub version: Version,
    pub status: u16,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            version: Version::Http11,
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

impl Response {
    /// Creates a response with the given status and an empty body.
    pub fn with_status(status: u16) -> Response {
        Response {
            status,
            ..Response::default()
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| header_name_eq(&h.name, name))
            .map(|h| h.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|h| !header_name_eq(&h.name, name));
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for h in &mut self.headers {
            if header_name_eq(&h.name, name) {
                h.value = value;
                return;
            }
        }
        self.headers.push(Header::new(name.to_string(), value));
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// Sets a JSON error body and content type in one step.
    pub fn set_json_body(&mut self, body: serde_json::Value) {
        self.body = body.to_string().into_bytes();
        self.set_header("Content-Type", "application/json");
    }
}

/// Hop-by-hop headers that must not be forwarded by a proxy (RFC 7230 §6.1).
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Returns true when the header must be stripped before forwarding.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| header_name_eq(h, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = Request::default();
        req.add_header("Content-Type", "application/json");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert_eq!(req.header("CONTENT-TYPE"), Some("application/json"));
        assert_eq!(req.header("content-length"), None);
    }

    #[test]
    fn keep_alive_defaults_by_version() {
        let mut req = Request {
            version: Version::Http11,
            ..Request::default()
        };
        assert!(req.keep_alive());

        req.add_header("Connection", "close");
        assert!(!req.keep_alive());

        let mut old = Request {
            version: Version::Http10,
            ..Request::default()
        };
        assert!(!old.keep_alive());
        old.add_header("Connection", "Keep-Alive");
        assert!(old.keep_alive());
    }

    #[test]
    fn set_header_replaces_existing_value() {
        let mut resp = Response::default();
        resp.add_header("X-Test", "one");
        resp.set_header("x-test", "two");
        assert_eq!(resp.header("X-Test"), Some("two"));
        assert_eq!(resp.headers.len(), 1);
    }

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(!is_hop_by_hop("Content-Type"));
    }

    #[test]
    fn reason_phrases_cover_gateway_statuses() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(101), "Switching Protocols");
        assert_eq!(reason_phrase(502), "Bad Gateway");
        assert_eq!(reason_phrase(504), "Gateway Timeout");
        assert_eq!(reason_phrase(599), "Server Error");
    }
}
