//! Client TLS for probes that speak their protocol over a raw socket

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::ProbeError;
use crate::error::ErrorCode;

/// Byte stream a probe talks to, plain or encrypted
pub trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// Load trusted roots from a PEM bundle
pub fn load_roots(path: &Path) -> anyhow::Result<RootCertStore> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open CA bundle {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse CA bundle {}: {}", path.display(), e))?;

    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        anyhow::bail!("No usable certificates found in {}", path.display());
    }
    Ok(roots)
}

/// Connector trusting `roots`, using the ring provider
pub fn connector(roots: RootCertStore) -> anyhow::Result<TlsConnector> {
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Wrap `tcp` in TLS when a connector is supplied
pub async fn upgrade(
    tcp: TcpStream,
    host: &str,
    connector: Option<&TlsConnector>,
) -> Result<Box<dyn ProbeStream>, ProbeError> {
    let Some(connector) = connector else {
        return Ok(Box::new(tcp));
    };

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ProbeError::new(ErrorCode::InvalidFormat, format!("'{}' is not a valid TLS server name", host)))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProbeError::handshake(format!("TLS handshake with {} failed: {}", host, e)))?;
    Ok(Box::new(stream))
}
