//! Response compression middleware.
//!
//! This stage owns the negotiation and safety rules; the codecs
//! themselves are injected through [`ResponseEncoder`], so gzip/zstd/
//! brotli integrations live outside the core and the middleware works
//! (as a no-op) without any of them registered.
//!
//! A response is skipped when the body is below the minimum size, the
//! content type is not in the compressible list, a `Content-Encoding`
//! is already set, the path or a `Set-Cookie` header makes compression
//! BREACH-sensitive, or the client offers no supported encoding.

use crate::config::settings::CompressionSettings;
use crate::gateway::pipeline::{Middleware, MiddlewareKind, MiddlewareResult, ResponseContext};
use log::{debug, warn};
use std::cell::Cell;

/// A pluggable compression codec.
pub trait ResponseEncoder: std::fmt::Debug {
    /// The content-coding token this encoder produces ("gzip", "br", ...).
    fn encoding(&self) -> &'static str;
    fn compress(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Worker-local skip/compress counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompressionCounters {
    pub compressed: u64,
    pub skipped_too_small: u64,
    pub skipped_wrong_type: u64,
    pub skipped_already_encoded: u64,
    pub skipped_breach_sensitive: u64,
    pub skipped_client_unsupported: u64,
}

#[derive(Debug)]
pub struct CompressionMiddleware {
    settings: CompressionSettings,
    encoders: Vec<Box<dyn ResponseEncoder>>,
    compressed: Cell<u64>,
    skipped_too_small: Cell<u64>,
    skipped_wrong_type: Cell<u64>,
    skipped_already_encoded: Cell<u64>,
    skipped_breach_sensitive: Cell<u64>,
    skipped_client_unsupported: Cell<u64>,
}

impl CompressionMiddleware {
    pub fn new(settings: CompressionSettings, encoders: Vec<Box<dyn ResponseEncoder>>) -> Self {
        CompressionMiddleware {
            settings,
            encoders,
            compressed: Cell::new(0),
            skipped_too_small: Cell::new(0),
            skipped_wrong_type: Cell::new(0),
            skipped_already_encoded: Cell::new(0),
            skipped_breach_sensitive: Cell::new(0),
            skipped_client_unsupported: Cell::new(0),
        }
    }

    pub fn counters(&self) -> CompressionCounters {
        CompressionCounters {
            compressed: self.compressed.get(),
            skipped_too_small: self.skipped_too_small.get(),
            skipped_wrong_type: self.skipped_wrong_type.get(),
            skipped_already_encoded: self.skipped_already_encoded.get(),
            skipped_breach_sensitive: self.skipped_breach_sensitive.get(),
            skipped_client_unsupported: self.skipped_client_unsupported.get(),
        }
    }

    /// Picks the best mutually supported encoding from Accept-Encoding,
    /// honoring q-values.
    fn negotiate(&self, accept_encoding: &str) -> Option<&dyn ResponseEncoder> {
        let mut best: Option<(&dyn ResponseEncoder, f32)> = None;
        for part in accept_encoding.split(',') {
            let mut pieces = part.trim().split(';');
            let token = pieces.next().unwrap_or("").trim();
            let mut quality = 1.0f32;
            for param in pieces {
                if let Some(value) = param.trim().strip_prefix("q=") {
                    quality = value.parse().unwrap_or(0.0);
                }
            }
            if quality <= 0.0 {
                continue;
            }
            let candidate = if token == "*" {
                self.encoders.first().map(|e| e.as_ref())
            } else {
                self.encoders
                    .iter()
                    .find(|e| e.encoding() == token)
                    .map(|e| e.as_ref())
            };
            if let Some(encoder) = candidate {
                let better = match best {
                    Some((_, best_quality)) => quality > best_quality,
                    None => true,
                };
                if better {
                    best = Some((encoder, quality));
                }
            }
        }
        best.map(|(encoder, _)| encoder)
    }

    fn is_compressible_type(&self, content_type: &str) -> bool {
        self.settings
            .compressible_types
            .iter()
            .any(|t| content_type.starts_with(t.as_str()))
    }

    fn is_breach_sensitive(&self, path: &str) -> bool {
        self.settings
            .breach_sensitive_paths
            .iter()
            .any(|p| path.starts_with(p.as_str()))
    }

    fn bump(counter: &Cell<u64>) {
        counter.set(counter.get() + 1);
    }
}

impl Middleware for CompressionMiddleware {
    fn name(&self) -> &str {
        "compression"
    }

    fn kind(&self) -> MiddlewareKind {
        MiddlewareKind::Compression
    }

    fn process_response(&self, ctx: &mut ResponseContext) -> MiddlewareResult {
        if !self.settings.enabled || self.encoders.is_empty() {
            return MiddlewareResult::Continue;
        }
        if ctx.response.body.len() < self.settings.min_size {
            Self::bump(&self.skipped_too_small);
            return MiddlewareResult::Continue;
        }
        if ctx.response.has_header("content-encoding") {
            Self::bump(&self.skipped_already_encoded);
            return MiddlewareResult::Continue;
        }
        let content_type = ctx.response.header("content-type").unwrap_or("").to_string();
        if !self.is_compressible_type(&content_type) {
            Self::bump(&self.skipped_wrong_type);
            return MiddlewareResult::Continue;
        }
        if self.is_breach_sensitive(&ctx.request.path) || ctx.response.has_header("set-cookie") {
            Self::bump(&self.skipped_breach_sensitive);
            return MiddlewareResult::Continue;
        }

        let accept = ctx.request.header("accept-encoding").unwrap_or("").to_string();
        let encoder = match self.negotiate(&accept) {
            Some(encoder) => encoder,
            None => {
                Self::bump(&self.skipped_client_unsupported);
                return MiddlewareResult::Continue;
            }
        };

        match encoder.compress(&ctx.response.body) {
            Ok(compressed) => {
                debug!(
                    "compressed {} -> {} bytes with {}",
                    ctx.response.body.len(),
                    compressed.len(),
                    encoder.encoding()
                );
                ctx.response.body = compressed;
                ctx.response
                    .set_header("Content-Encoding", encoder.encoding());
                ctx.response.set_header("Vary", "Accept-Encoding");
                // A strong ETag no longer matches the representation.
                if let Some(etag) = ctx.response.header("etag").map(|e| e.to_string()) {
                    if !etag.starts_with("W/") {
                        ctx.response.set_header("ETag", format!("W/{etag}"));
                    }
                }
                Self::bump(&self.compressed);
            }
            Err(error) => {
                // Serve uncompressed rather than failing the exchange.
                warn!("compression failed, serving identity: {error}");
            }
        }
        MiddlewareResult::Continue
    }
}
