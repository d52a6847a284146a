//! HTTP/2 protocol support (RFC 7540) with HPACK header compression
//! (RFC 7541).
//!
//! - [`frame`] - frame header codec, flags, SETTINGS
//! - [`hpack`] - header block encoding and decoding
//! - [`huffman`] - the HPACK Huffman decode table
//! - [`session`] - the server session and per-stream state machine

pub mod frame;
pub mod hpack;
pub mod huffman;
pub mod session;

pub use frame::detect_preface;
pub use session::{H2Error, H2Session, H2Stream, StreamState};
