//! Wire protocol state machines.
//!
//! Each submodule is a pure parser/serializer with no I/O of its own;
//! the connection driver in [`crate::server`] owns the sockets and feeds
//! bytes through these state machines.
//!
//! - [`http1`] - incremental HTTP/1.1 request/response parsing
//! - [`http2`] - HTTP/2 framing, HPACK, and the stream session
//! - [`websocket`] - RFC 6455 handshake and frame machine

pub mod http1;
pub mod http2;
pub mod websocket;
