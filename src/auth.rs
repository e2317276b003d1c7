//! Caller roles and the principals map.
//!
//! The transport verifies the client certificate against the CA; this module
//! only maps the verified certificate to `{identity, role}` and answers the
//! pure role-allows-operation question. Certificates are identified by the
//! SHA-256 fingerprint of their DER encoding, so no X.509 parsing happens
//! here.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Writer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Writer => write!(f, "writer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Start,
    Stop,
    Query,
    Stream,
    List,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Start => write!(f, "start"),
            Operation::Stop => write!(f, "stop"),
            Operation::Query => write!(f, "query"),
            Operation::Stream => write!(f, "stream"),
            Operation::List => write!(f, "list"),
        }
    }
}

impl Role {
    /// Readers observe; writers additionally control the lifecycle.
    pub fn allows(self, op: Operation) -> bool {
        match self {
            Role::Writer => true,
            Role::Reader => matches!(op, Operation::Query | Operation::Stream | Operation::List),
        }
    }
}

/// The authenticated caller, resolved before any supervisor operation runs.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    pub identity: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum PrincipalsError {
    #[error("failed to read principals file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid principals file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Map from client-certificate fingerprint (lowercase hex SHA-256 of the
/// DER) to principal.
#[derive(Debug, Clone, Default)]
pub struct Principals {
    by_fingerprint: HashMap<String, Principal>,
}

impl Principals {
    /// Load a JSON object of `{"<fingerprint>": {"identity": ..., "role": ...}}`.
    pub fn load(path: &Path) -> Result<Self, PrincipalsError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PrincipalsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let by_fingerprint: HashMap<String, Principal> =
            serde_json::from_str(&raw).map_err(|source| PrincipalsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { by_fingerprint })
    }

    pub fn fingerprint(cert_der: &[u8]) -> String {
        hex::encode(Sha256::digest(cert_der))
    }

    /// Resolve a verified client certificate to its principal.
    pub fn resolve(&self, cert_der: &[u8]) -> Option<AuthContext> {
        self.by_fingerprint
            .get(&Self::fingerprint(cert_der))
            .map(|p| AuthContext {
                identity: p.identity.clone(),
                role: p.role,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}
