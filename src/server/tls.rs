use crate::config::TlsConfig;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from the configured PEM certificate chain and
/// private key. ALPN offers h2 and http/1.1 so downstream clients can
/// negotiate either. Missing or unreadable files refuse startup; the proxy
/// never generates certificates itself.
pub fn build_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_path = cfg
        .cert_file
        .as_ref()
        .context("tls.cert_file is required when tls.enabled")?;
    let key_path = cfg
        .key_file
        .as_ref()
        .context("tls.key_file is required when tls.enabled")?;

    let cert_file = File::open(cert_path)
        .with_context(|| format!("cannot open tls.cert_file {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse certificates in {}", cert_path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("cannot open tls.key_file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("cannot parse private key in {}", key_path.display()))?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid tls certificate/key pair")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
