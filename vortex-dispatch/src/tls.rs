//! TLS client configuration for origin connections.
//!
//! Loads the certificate authorities of a backend service into a
//! `rustls::ClientConfig` and provides the connector origin pools dial through.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

use vortex_routing::{ProxyError, Result, TlsSettings};

/// Loads a TLS `ClientConfig` trusting the PEM certificates at `ca_path`.
pub fn load_client_config<P: AsRef<Path>>(ca_path: P) -> Result<Arc<ClientConfig>> {
    let ca_path = ca_path.as_ref();
    let file = File::open(ca_path).map_err(|e| {
        ProxyError::Configuration(format!("cannot open {}: {e}", ca_path.display()))
    })?;
    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            ProxyError::Configuration(format!("cannot read {}: {e}", ca_path.display()))
        })?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if added == 0 {
        return Err(ProxyError::Configuration(format!(
            "no usable CA certificate in {} ({ignored} ignored)",
            ca_path.display()
        )));
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// A TLS connector plus the server name to present, ready to wrap TCP streams.
#[derive(Clone)]
pub struct OriginTls {
    connector: TlsConnector,
    sni_host: Option<String>,
}

impl OriginTls {
    /// Build from a backend service's TLS settings.
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        let config = load_client_config(&settings.trusted_certificates)?;
        Ok(Self {
            connector: TlsConnector::from(config),
            sni_host: settings.sni_host.clone(),
        })
    }

    /// The connector.
    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }

    /// Server name for a connection to `host`.
    pub fn server_name(&self, host: &str) -> Result<ServerName<'static>> {
        let name = self.sni_host.as_deref().unwrap_or(host);
        ServerName::try_from(name.to_string())
            .map_err(|e| ProxyError::Configuration(format!("invalid TLS server name '{name}': {e}")))
    }
}

impl std::fmt::Debug for OriginTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginTls")
            .field("sni_host", &self.sni_host)
            .finish()
    }
}
