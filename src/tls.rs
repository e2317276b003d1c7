//! Server-side mTLS setup.
//!
//! There is exactly one TLS posture: the server presents its certificate
//! and every client must present one chaining to the configured CA, so the
//! whole module is a single fallible constructor for the tonic config.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tonic::transport::{Certificate, Identity, ServerTlsConfig};

use crate::config::TlsConfig;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {role} ({path}): {source}")]
    Unreadable {
        role: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Load the PEM material and build the server TLS config. A missing or
/// unreadable file is reported with the role it was supposed to fill.
pub async fn server_tls(config: &TlsConfig) -> Result<ServerTlsConfig, TlsError> {
    let ca = read_pem("CA certificate", &config.ca_cert).await?;
    let cert = read_pem("server certificate", &config.cert).await?;
    let key = read_pem("private key", &config.key).await?;

    Ok(ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca))
        .client_auth_optional(false))
}

async fn read_pem(role: &'static str, path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).await.map_err(|source| TlsError::Unreadable {
        role,
        path: path.to_path_buf(),
        source,
    })
}
