//! TLS acceptor construction.
//!
//! Certificates and keys are loaded with `rustls-pemfile` when a
//! snapshot is built (startup or reload), never on the accept path. The
//! ALPN list comes from the configuration in server preference order;
//! after the handshake the connection driver reads the negotiated
//! protocol to pick HTTP/2 or HTTP/1.1.

use crate::config::settings::ServerSettings;
use crate::models::error::GatewayError;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::ConfigInvalid(format!("cannot open certificate {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs
        .map_err(|e| GatewayError::ConfigInvalid(format!("invalid certificate {path}: {e}")))?;
    if certs.is_empty() {
        return Err(GatewayError::ConfigInvalid(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, GatewayError> {
    let file = File::open(path)
        .map_err(|e| GatewayError::ConfigInvalid(format!("cannot open key {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| GatewayError::ConfigInvalid(format!("invalid private key {path}: {e}")))?
        .ok_or_else(|| GatewayError::ConfigInvalid(format!("no private key found in {path}")))
}

/// Builds the acceptor from the server settings, or `None` when TLS is
/// disabled.
pub fn build_acceptor(server: &ServerSettings) -> Result<Option<TlsAcceptor>, GatewayError> {
    if !server.tls_enabled {
        return Ok(None);
    }

    let certs = load_certs(&server.tls_certificate_path)?;
    let key = load_key(&server.tls_private_key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| GatewayError::ConfigInvalid(format!("TLS configuration rejected: {e}")))?;

    config.alpn_protocols = server
        .tls_alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tls_builds_nothing() {
        let settings = ServerSettings::default();
        assert!(build_acceptor(&settings).unwrap().is_none());
    }

    #[test]
    fn missing_certificate_is_a_config_error() {
        let settings = ServerSettings {
            tls_enabled: true,
            tls_certificate_path: "/nonexistent/cert.pem".to_string(),
            tls_private_key_path: "/nonexistent/key.pem".to_string(),
            ..ServerSettings::default()
        };
        assert!(matches!(
            build_acceptor(&settings),
            Err(GatewayError::ConfigInvalid(_))
        ));
    }
}
