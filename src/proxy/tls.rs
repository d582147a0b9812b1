use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::OriginConfig;
use crate::error::Error;

/// Builds the frontend TLS acceptor when an origin is configured with a
/// certificate pair. `Ok(None)` means plain HTTP. A configured pair that
/// cannot be read or parsed is a configuration error, not a silent
/// fallback to cleartext.
pub fn load_tls_acceptor(
    origins: &HashMap<String, OriginConfig>,
) -> Result<Option<TlsAcceptor>, Error> {
    let Some((name, cert_path, key_path)) = origins.iter().find_map(|(name, o)| {
        match (&o.tls_cert_path, &o.tls_key_path) {
            (Some(cert), Some(key)) => Some((name.as_str(), cert.as_str(), key.as_str())),
            _ => None,
        }
    }) else {
        return Ok(None);
    };

    info!(
        origin = name,
        cert = cert_path,
        key = key_path,
        "enabling TLS on the frontend listener"
    );

    let certs = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("origin {}: tls setup: {}", name, e)))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(server_config))))
}

fn read_cert_chain(path: &str) -> Result<Vec<CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("tls certificate {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("tls certificate {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "tls certificate {}: no certificates in file",
            path
        )));
    }
    Ok(certs)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("tls key {}: {}", path, e)))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| Error::Config(format!("tls key {}: {}", path, e)))?
        .ok_or_else(|| Error::Config(format!("tls key {}: no private key in file", path)))
}
