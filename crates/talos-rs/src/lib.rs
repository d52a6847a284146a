//! # Talos
//!
//! A high-performance L7 reverse proxy and API gateway built with Rust
//! and Tokio. Talos terminates HTTP/1.1, HTTP/2 and WebSocket traffic
//! (optionally over TLS with ALPN), routes each request through a
//! radix-tree router and a two-phase middleware pipeline, and forwards
//! it to pooled backend connections selected by configurable load
//! balancing with per-backend circuit breaking.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐   ┌───────────────────┐   ┌──────────────────┐
//! │   Client    │──▶│      Talos        │──▶│    Upstreams     │
//! │ (h1/h2/ws)  │   │                   │   │  (origin pools)  │
//! └─────────────┘   │  ┌────────────────┤   └──────────────────┘
//!                   │  │ Router (radix) ││
//!                   │  ├────────────────┤│
//!                   │  │ Pipeline (2ph) ││
//!                   │  ├────────────────┤│
//!                   │  │ Load balancer  ││
//!                   │  ├────────────────┤│
//!                   │  │ Circuit breaker││
//!                   │  └────────────────┘│
//!                   └───────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`config`] - configuration schema, validation, hot-reload store
//! - [`models`] - HTTP value types and the error taxonomy
//! - [`protocol`] - HTTP/1.1, HTTP/2 and WebSocket state machines
//! - [`gateway`] - router, upstreams, pools, breakers, pipeline
//! - [`middleware`] - the standard pipeline stages
//! - [`server`] - workers, connection drivers, TLS glue
//! - [`logs`] - logging configuration
//!
//! ## Concurrency Model
//!
//! Thread-per-core: each worker runs a current-thread runtime with its
//! own listener (SO_REUSEPORT), connections, connection pools, and
//! pipeline instances. Configuration is shared through an atomically
//! swapped immutable snapshot; a request started against snapshot N
//! completes against snapshot N. Rate-limit buckets, DNS entries and
//! JWT caches are thread-local. No mutex sits on the per-request path.

pub mod config;
pub mod gateway;
pub mod logs;
pub mod middleware;
pub mod models;
pub mod protocol;
pub mod server;
