//! Certificate authority and TLS endpoint configuration for both sides of an
//! intercepted tunnel.

mod authority;
mod upstream;

pub use authority::{CertificateAuthority, LeafCertificate, CA_CERT_FILE, CA_KEY_FILE};
pub use upstream::{load_pem_certificates, upstream_client_config};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("Only one CA artifact present (cert: {cert:?}, key: {key:?}); remove it or restore the other")]
    PartialArtifacts { cert: PathBuf, key: PathBuf },

    #[error("Failed to decode CA artifact: {0}")]
    Decode(String),

    #[error("CA private key does not match certificate: {0}")]
    KeyMismatch(String),

    #[error("Failed to generate certificate: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("Invalid host: {0}")]
    InvalidHost(String),

    #[error("Secure random source unavailable")]
    Random,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
