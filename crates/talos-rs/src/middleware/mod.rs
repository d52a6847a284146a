//! Standard middleware for the two-phase pipeline.
//!
//! Each stage implements [`crate::gateway::pipeline::Middleware`] and is
//! wired into per-route chains by [`crate::gateway::factory`]. Terminal
//! proxying is not a stage here: the dispatcher in [`crate::server`]
//! runs it between the two phases, where the I/O lives.
//!
//! - [`logging`] - request log line on the response phase
//! - [`cors`] - CORS headers and OPTIONS preflight short-circuit
//! - [`rate_limit`] - thread-local token buckets per client key
//! - [`auth`] - JWT / static bearer token authentication
//! - [`authz`] - scope/role checks against route requirements
//! - [`transform`] - path rewrites, header and query mutations
//! - [`compression`] - encoding negotiation over injected codecs

pub mod auth;
pub mod authz;
pub mod compression;
pub mod cors;
pub mod logging;
pub mod rate_limit;
pub mod transform;
