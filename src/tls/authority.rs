//! Root certificate authority and per-host leaf minting.
//!
//! The root is generated once, persisted next to the audit journal and reloaded
//! on every start. Leaf certificates are minted on demand for whatever host a
//! client tunnels to, and the resulting `ServerConfig` is cached per host for
//! the lifetime of the process.

use super::CaError;
use dashmap::DashMap;
use prometheus::IntCounter;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{RootCertStore, ServerConfig};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};

pub const CA_CERT_FILE: &str = "ca.crt";
pub const CA_KEY_FILE: &str = "ca.key";

const ROOT_COMMON_NAME: &str = "Agent Network Logger CA";
const ROOT_ORGANIZATION: &str = "Agent Network Logger";
const ROOT_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 90;

/// A certificate signed by the root for one destination host.
#[derive(Debug)]
pub struct LeafCertificate {
    pub host: String,
    pub certificate_der: CertificateDer<'static>,
    pub certificate_pem: String,
    pub private_key: PrivatePkcs8KeyDer<'static>,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// Process-wide root identity. Read-only after construction, so it is shared
/// across sessions behind an `Arc` without further locking.
pub struct CertificateAuthority {
    /// Signer rebuilt from the persisted parameters; its DER is never served
    signer: Certificate,
    key: KeyPair,
    /// Root exactly as persisted, served in every leaf chain
    root_der: CertificateDer<'static>,
    cert_pem: String,
    key_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    cert_path: PathBuf,
    key_path: PathBuf,
    server_configs: DashMap<String, Arc<ServerConfig>>,
    issued: Option<IntCounter>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_path", &self.cert_path)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("cached_hosts", &self.server_configs.len())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Load `ca.crt` / `ca.key` from `dir`, or generate and persist a fresh root
    /// when neither exists. Corrupt or mismatched artifacts are an error and
    /// are never overwritten.
    pub fn load_or_create(dir: impl AsRef<Path>) -> Result<Self, CaError> {
        let dir = dir.as_ref();
        let cert_path = dir.join(CA_CERT_FILE);
        let key_path = dir.join(CA_KEY_FILE);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                tracing::info!(path = ?cert_path, "Loading existing CA certificate");
                let cert_pem = fs::read_to_string(&cert_path)?;
                let key_pem = fs::read_to_string(&key_path)?;
                Self::from_pem(cert_pem, key_pem, cert_path, key_path)
            }
            (false, false) => {
                tracing::info!(dir = ?dir, "Generating new CA certificate");
                fs::create_dir_all(dir)?;
                let (cert_pem, key_pem) = generate_root()?;
                write_artifact(&cert_path, cert_pem.as_bytes(), 0o644)?;
                write_artifact(&key_path, key_pem.as_bytes(), 0o600)?;
                tracing::info!(
                    ca_cert_path = ?cert_path,
                    ca_key_path = ?key_path,
                    "Saved CA certificate to disk"
                );
                Self::from_pem(cert_pem, key_pem, cert_path, key_path)
            }
            _ => Err(CaError::PartialArtifacts {
                cert: cert_path,
                key: key_path,
            }),
        }
    }

    fn from_pem(
        cert_pem: String,
        key_pem: String,
        cert_path: PathBuf,
        key_path: PathBuf,
    ) -> Result<Self, CaError> {
        let root_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| CaError::Decode(format!("no certificate in {}", cert_path.display())))?
            .map_err(|e| CaError::Decode(e.to_string()))?;

        let key = KeyPair::from_pem(&key_pem).map_err(|e| CaError::Decode(e.to_string()))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| CaError::Decode(e.to_string()))?;
        if !matches!(params.is_ca, IsCa::Ca(_)) {
            return Err(CaError::Decode(format!(
                "{} is not a CA certificate",
                cert_path.display()
            )));
        }

        let not_before = params.not_before;
        let not_after = params.not_after;
        let signer = params.self_signed(&key)?;

        let authority = Self {
            signer,
            key,
            root_der,
            cert_pem,
            key_pem,
            not_before,
            not_after,
            cert_path,
            key_path,
            server_configs: DashMap::new(),
            issued: None,
        };

        // A key that does not belong to the certificate still signs leaves,
        // they just fail to chain. Catch that at startup.
        let check = authority.sign_leaf_certificate("ca-self-check.invalid")?;
        authority
            .verify_leaf(&check)
            .map_err(|e| CaError::KeyMismatch(e.to_string()))?;

        Ok(authority)
    }

    /// Count freshly minted leaves on `counter`.
    pub fn with_issue_counter(mut self, counter: IntCounter) -> Self {
        self.issued = Some(counter);
        self
    }

    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn certificate_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Mint a leaf for `host` with a fresh key pair. IP literals (bracketed or
    /// not) get an IP SAN, everything else a DNS SAN. The host is not resolved.
    pub fn sign_leaf_certificate(&self, host: &str) -> Result<LeafCertificate, CaError> {
        let host = normalize_host(host)?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host.as_str());
        params.distinguished_name = dn;

        let san = match host.parse::<IpAddr>() {
            Ok(ip) => SanType::IpAddress(ip),
            Err(_) => SanType::DnsName(
                Ia5String::try_from(host.clone())
                    .map_err(|e| CaError::InvalidHost(format!("{host}: {e}")))?,
            ),
        };
        params.subject_alt_names = vec![san];
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(random_serial()?);

        let now = OffsetDateTime::now_utc();
        params.not_before = (now - Duration::hours(1)).max(self.not_before);
        params.not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(self.not_after);
        let (not_before, not_after) = (params.not_before, params.not_after);

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .or_else(|_| KeyPair::generate())?;
        let cert = params.signed_by(&leaf_key, &self.signer, &self.key)?;

        Ok(LeafCertificate {
            host,
            certificate_der: cert.der().clone(),
            certificate_pem: cert.pem(),
            private_key: PrivatePkcs8KeyDer::from(leaf_key.serialize_der()),
            not_before,
            not_after,
        })
    }

    /// Check that `leaf` chains to this root for its own host name.
    pub fn verify_leaf(&self, leaf: &LeafCertificate) -> Result<(), CaError> {
        let mut roots = RootCertStore::empty();
        roots.add(self.root_der.clone())?;
        let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| CaError::Decode(e.to_string()))?;

        let server_name = ServerName::try_from(leaf.host.clone())
            .map_err(|e| CaError::InvalidHost(e.to_string()))?;
        verifier.verify_server_cert(
            &leaf.certificate_der,
            &[],
            &server_name,
            &[],
            UnixTime::now(),
        )?;
        Ok(())
    }

    /// Cached TLS server configuration presenting a leaf for `host`.
    pub fn server_config_for_host(&self, host: &str) -> Result<Arc<ServerConfig>, CaError> {
        let key = normalize_host(host)?.to_ascii_lowercase();
        if let Some(config) = self.server_configs.get(&key) {
            tracing::debug!(host = %key, "Using cached ServerConfig");
            return Ok(config.clone());
        }

        tracing::debug!(host = %key, "Minting leaf certificate");
        let leaf = self.sign_leaf_certificate(&key)?;
        let chain = vec![leaf.certificate_der, self.root_der.clone()];

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, PrivateKeyDer::Pkcs8(leaf.private_key))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);

        // Concurrent mints for the same host keep whichever landed first.
        let cached = self
            .server_configs
            .entry(key.clone())
            .or_insert_with(|| config.clone())
            .clone();

        if let Some(counter) = &self.issued {
            counter.inc();
        }
        tracing::info!(host = %key, "Generated and cached ServerConfig for host");

        Ok(cached)
    }

    pub fn cached_hosts(&self) -> usize {
        self.server_configs.len()
    }
}

fn generate_root() -> Result<(String, String), CaError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, ROOT_COMMON_NAME);
    dn.push(DnType::OrganizationName, ROOT_ORGANIZATION);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(random_serial()?);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let key = KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256)
        .or_else(|_| KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256))
        .or_else(|_| KeyPair::generate())?;
    let cert = params.self_signed(&key)?;

    Ok((cert.pem(), key.serialize_pem()))
}

/// 128 random bits with the sign bit cleared so the DER integer stays positive.
fn random_serial() -> Result<SerialNumber, CaError> {
    let mut bytes = [0u8; 16];
    rustls::crypto::aws_lc_rs::default_provider()
        .secure_random
        .fill(&mut bytes)
        .map_err(|_| CaError::Random)?;
    bytes[0] &= 0x7f;
    Ok(SerialNumber::from_slice(&bytes))
}

fn normalize_host(host: &str) -> Result<String, CaError> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(CaError::InvalidHost("empty host".to_string()));
    }
    Ok(host.to_string())
}

fn write_artifact(path: &Path, contents: &[u8], mode: u32) -> Result<(), CaError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(())
}
