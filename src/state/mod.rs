use crate::audit::{AuditLog, AuditOptions, TimestampCaptureHint};
use crate::config::Config;
use crate::error::Result;
use crate::intercept::{InterceptionEngine, SessionTimeouts};
use crate::query::QueryService;
use crate::tls::{load_pem_certificates, upstream_client_config, CertificateAuthority};
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod metrics;

pub use metrics::Metrics;

/// Everything the proxy and the query server share. Built once at startup;
/// any failure here is a bootstrap failure and keeps the process from serving.
pub struct AppState {
    pub config: Arc<Config>,
    pub authority: Arc<CertificateAuthority>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    pub fn bootstrap(config: Config) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);

        let metrics = Arc::new(Metrics::new()?);

        let authority = CertificateAuthority::load_or_create(config.ca_dir())?
            .with_issue_counter(metrics.leaf_certificates_issued.clone());
        tracing::info!(
            path = ?authority.cert_path(),
            "Root CA ready; install this certificate in the monitored client's trust store"
        );

        let audit = AuditLog::open(
            config.journal_path(),
            AuditOptions {
                working_set_size: config.audit.working_set_size,
                body_limit: config.audit.body_limit_bytes,
            },
        )?
        .with_capture_hint(TimestampCaptureHint::new(
            config.storage.capture_suffix.clone(),
        ));

        let state = Arc::new(Self {
            config: Arc::new(config),
            authority: Arc::new(authority),
            audit: Arc::new(audit),
            metrics,
            shutdown_tx,
        });

        Ok((state, shutdown_rx))
    }

    pub fn query_service(&self) -> QueryService {
        QueryService::new(
            self.audit.clone(),
            self.config.storage.logs_dir.clone(),
            self.config.storage.capture_suffix.clone(),
        )
    }

    pub fn engine(&self) -> Result<InterceptionEngine> {
        let extra_roots = match &self.config.proxy.upstream_ca_file {
            Some(path) => load_pem_certificates(path)?,
            None => Vec::new(),
        };
        let upstream_tls =
            upstream_client_config(self.config.proxy.upstream_insecure_skip_verify, &extra_roots)?;

        Ok(InterceptionEngine::new(
            self.authority.clone(),
            self.audit.clone(),
            self.metrics.clone(),
            upstream_tls,
            SessionTimeouts {
                handshake: self.config.upstream_connect_timeout(),
                upstream_response: self.config.upstream_response_timeout(),
                body_idle: self.config.upstream_body_idle_timeout(),
                client_idle: self.config.client_idle_timeout(),
            },
        ))
    }

    pub fn shutdown(&self) {
        // No receivers left just means every task already stopped
        let _ = self.shutdown_tx.send(());
    }
}
