//! Mutual-TLS material for runner ↔ lb traffic.
//!
//! Nodes are configured with PEM files (`node-cert`, `node-cert-key`,
//! `node-cert-authority`); both sides present the node certificate and
//! verify the peer against the shared authority.

use std::path::Path;

use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};
use tracing::info;

use kiln_core::{ApiError, ApiResult};

/// Loaded PEM material for one node.
#[derive(Debug, Clone)]
pub struct TlsMaterial {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    ca_pem: Vec<u8>,
}

impl TlsMaterial {
    /// Load the three PEM files. All or nothing: mTLS with a missing
    /// piece is a configuration error, not a downgrade.
    pub fn load(cert: &Path, key: &Path, ca: &Path) -> ApiResult<Self> {
        let read = |path: &Path, what: &str| -> ApiResult<Vec<u8>> {
            std::fs::read(path).map_err(|e| {
                ApiError::Validation(format!(
                    "cannot read {what} file {}: {e}",
                    path.display()
                ))
            })
        };
        let material = Self {
            cert_pem: read(cert, "node certificate")?,
            key_pem: read(key, "node certificate key")?,
            ca_pem: read(ca, "certificate authority")?,
        };
        info!("node tls material loaded");
        Ok(material)
    }

    pub fn client_config(&self) -> ClientTlsConfig {
        ClientTlsConfig::new()
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
            .ca_certificate(Certificate::from_pem(&self.ca_pem))
    }

    pub fn server_config(&self) -> ServerTlsConfig {
        ServerTlsConfig::new()
            .identity(Identity::from_pem(&self.cert_pem, &self.key_pem))
            .client_ca_root(Certificate::from_pem(&self.ca_pem))
    }
}
