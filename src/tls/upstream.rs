use super::CaError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;

/// Client configuration used toward the real destination host.
///
/// Trusts the webpki roots plus `extra_roots`, or nothing at all when
/// `insecure_skip_verify` is set.
pub fn upstream_client_config(
    insecure_skip_verify: bool,
    extra_roots: &[CertificateDer<'static>],
) -> Result<Arc<ClientConfig>, CaError> {
    let mut config = if insecure_skip_verify {
        tracing::warn!("Upstream certificate verification is disabled");
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in extra_roots {
            roots.add(cert.clone())?;
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Read every certificate in a PEM bundle.
pub fn load_pem_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, CaError> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CaError::Decode(e.to_string()))?;
    if certs.is_empty() {
        return Err(CaError::Decode(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::CertificateAuthority;
    use tempfile::TempDir;

    #[test]
    fn test_client_config_advertises_http1() {
        let config = upstream_client_config(false, &[]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);

        let insecure = upstream_client_config(true, &[]).unwrap();
        assert_eq!(insecure.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_load_pem_certificates() {
        let temp_dir = TempDir::new().unwrap();
        let ca = CertificateAuthority::load_or_create(temp_dir.path()).unwrap();

        let certs = load_pem_certificates(ca.cert_path()).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(&certs[0], ca.certificate_der());
        assert!(upstream_client_config(false, &certs).is_ok());
    }

    #[test]
    fn test_load_pem_certificates_rejects_empty_bundle() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("empty.pem");
        std::fs::write(&path, "nothing here").unwrap();

        assert!(matches!(
            load_pem_certificates(&path),
            Err(CaError::Decode(_))
        ));
    }
}
