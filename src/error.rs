use std::io;
use thiserror::Error;

pub use crate::audit::AuditError;
pub use crate::intercept::InterceptError;
pub use crate::query::QueryError;
pub use crate::tls::CaError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate authority error: {0}")]
    CertificateAuthority(#[from] CaError),

    #[error("Audit log error: {0}")]
    Audit(#[from] AuditError),

    #[error("Interception error: {0}")]
    Intercept(#[from] InterceptError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl warp::reject::Reject for ProxyError {}
