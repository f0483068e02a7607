//! TLS configuration for the reverse proxy.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use edgetainer_core::{TunnelError, TunnelResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use tracing::info;

/// Load a rustls server config from PEM certificate and key files.
pub fn load_tls_config(cert_path: &str, key_path: &str) -> TunnelResult<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Config(format!("invalid TLS material: {e}")))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    info!(cert_path, "TLS configuration loaded");
    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> TunnelResult<Vec<CertificateDer<'static>>> {
    let file = File::open(Path::new(path))
        .map_err(|e| TunnelError::Config(format!("cannot open certificate {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader).filter_map(|c| c.ok()).collect();
    if certs.is_empty() {
        return Err(TunnelError::Config(format!(
            "no certificates found in {path}"
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> TunnelResult<PrivateKeyDer<'static>> {
    let file = File::open(Path::new(path))
        .map_err(|e| TunnelError::Config(format!("cannot open private key {path}: {e}")))?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TunnelError::Config(format!("cannot parse private key {path}: {e}")))?
        .ok_or_else(|| TunnelError::Config(format!("no private key found in {path}")))
}
