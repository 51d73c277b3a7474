//! Forward proxy that terminates TLS on both sides of every CONNECT tunnel.
//!
//! The listener speaks HTTP/1.1. A CONNECT request is answered with `200`,
//! the connection is upgraded, and the engine performs a TLS handshake toward
//! the client with a leaf minted for the requested host while connecting to
//! the real host over TLS. Decrypted requests then flow through [`Exchange`],
//! which records them, forwards them and completes the record with the
//! response. Absolute-form `http://` requests are recorded and forwarded the
//! same way without the TLS layers.

mod body;
mod exchange;
mod session;
mod target;
mod upstream;

pub use body::{BodyError, ProxyBody, TeeBody};
pub use exchange::{Exchange, ExchangeLedger};
pub use session::{InterceptionSession, SessionEvent, SessionPhase};
pub use target::TunnelTarget;

use crate::audit::AuditLog;
use crate::state::metrics::Metrics;
use crate::tls::{CaError, CertificateAuthority};
use bytes::Bytes;
use exchange::error_response;
use http::uri::Scheme;
use http::{Method, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::{TokioIo, TokioTimer};
use rustls::ClientConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Invalid tunnel target: {0}")]
    InvalidTarget(String),

    #[error("Invalid session transition from {from} on {event:?}")]
    InvalidTransition {
        from: SessionPhase,
        event: SessionEvent,
    },

    #[error("Upstream connection failed: {0}")]
    UpstreamConnect(String),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Upstream TCP connect plus TLS handshake, and the client TLS handshake
    pub handshake: Duration,
    /// Upstream response headers
    pub upstream_response: Duration,
    /// Longest gap between two frames of an upstream response body
    pub body_idle: Duration,
    /// Waiting for the next request head from the client
    pub client_idle: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(10),
            upstream_response: Duration::from_secs(60),
            body_idle: Duration::from_secs(60),
            client_idle: Duration::from_secs(30),
        }
    }
}

pub struct InterceptionEngine {
    authority: Arc<CertificateAuthority>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    upstream_tls: TlsConnector,
    timeouts: SessionTimeouts,
}

impl InterceptionEngine {
    pub fn new(
        authority: Arc<CertificateAuthority>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        upstream_tls: Arc<ClientConfig>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            authority,
            audit,
            metrics,
            upstream_tls: TlsConnector::from(upstream_tls),
            timeouts,
        }
    }

    /// Accept connections until `shutdown` fires. Sessions already running
    /// are left to finish on their own.
    pub async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), InterceptError> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "Interception proxy listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = self.clone();
                        tokio::spawn(async move { engine.serve_client(stream, peer).await });
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.recv() => {
                    tracing::info!("Interception proxy shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn serve_client(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let engine = self.clone();
        let service = service_fn(move |req| {
            let engine = engine.clone();
            async move { Ok::<_, Infallible>(engine.handle(req, peer).await) }
        });

        if let Err(e) = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.timeouts.client_idle)
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            tracing::debug!(%peer, error = %e, "Client connection ended with error");
        }
    }

    async fn handle(self: Arc<Self>, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        if req.method() == Method::CONNECT {
            self.accept_tunnel(req, peer)
        } else {
            self.forward_plain(req, peer).await
        }
    }

    fn accept_tunnel(self: Arc<Self>, mut req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let mut session = InterceptionSession::new(peer);
        self.metrics.session_opened();

        let accepted = session
            .advance(SessionEvent::ConnectReceived)
            .and_then(|_| {
                let authority = req
                    .uri()
                    .authority()
                    .map(|a| a.as_str().to_string())
                    .ok_or_else(|| InterceptError::InvalidTarget(req.uri().to_string()))?;
                TunnelTarget::parse(&authority, 443)
            })
            .and_then(|target| session.accept_target(target));

        if let Err(e) = accepted {
            tracing::warn!(%peer, uri = %req.uri(), error = %e, "Rejecting tunnel request");
            self.close_session(&mut session, true);
            return error_response(StatusCode::BAD_REQUEST, "Malformed tunnel request");
        }

        let on_upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move { self.run_tunnel(on_upgrade, session).await });

        Response::new(body::full(Bytes::new()))
    }

    async fn run_tunnel(self: Arc<Self>, on_upgrade: OnUpgrade, mut session: InterceptionSession) {
        let outcome = self.intercept(on_upgrade, &mut session).await;
        let host = session
            .target()
            .map(ToString::to_string)
            .unwrap_or_default();

        match outcome {
            Ok(()) => {
                tracing::debug!(peer = %session.peer(), %host, "Tunnel closed");
                self.close_session(&mut session, false);
            }
            Err(e) => {
                tracing::warn!(
                    peer = %session.peer(),
                    %host,
                    phase = %session.phase(),
                    error = %e,
                    "Tunnel failed"
                );
                self.close_session(&mut session, true);
            }
        }
    }

    fn close_session(&self, session: &mut InterceptionSession, failed: bool) {
        let event = if failed {
            SessionEvent::Failed
        } else {
            SessionEvent::StreamEnded
        };
        if let Err(e) = session.advance(event) {
            tracing::warn!(peer = %session.peer(), error = %e, "Unexpected session state on close");
        }
        self.metrics.session_closed(failed);
    }

    async fn intercept(
        &self,
        on_upgrade: OnUpgrade,
        session: &mut InterceptionSession,
    ) -> Result<(), InterceptError> {
        let target = session
            .target()
            .cloned()
            .ok_or_else(|| InterceptError::InvalidTarget("no target accepted".to_string()))?;

        let upgraded = on_upgrade.await?;
        // Minting a leaf runs an RSA keygen on a cache miss.
        let authority = self.authority.clone();
        let host = target.host.clone();
        let server_config =
            tokio::task::spawn_blocking(move || authority.server_config_for_host(&host)).await??;

        let (client_tls, upstream_tls) = tokio::try_join!(
            self.accept_client(upgraded, server_config),
            upstream::connect_tls(&self.upstream_tls, &target, self.timeouts.handshake),
        )?;
        session.advance(SessionEvent::HandshakesCompleted)?;
        tracing::debug!(peer = %session.peer(), host = %target, "Tunnel established");

        let (sender, upstream_conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(upstream_tls)).await?;
        let mut upstream_task = tokio::spawn(upstream_conn);

        let exchange = Arc::new(Exchange::new(
            sender,
            target,
            self.audit.clone(),
            self.metrics.clone(),
            self.timeouts.upstream_response,
            self.timeouts.body_idle,
        ));
        let service = service_fn(move |req| {
            let exchange = exchange.clone();
            async move { Ok::<_, Infallible>(exchange.forward(req).await) }
        });

        let client_conn = http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.timeouts.client_idle)
            .serve_connection(TokioIo::new(client_tls), service);
        tokio::pin!(client_conn);

        // Upstream going away tears the client side down too, after any
        // response already in flight has been written.
        let served = tokio::select! {
            served = client_conn.as_mut() => served,
            _ = &mut upstream_task => {
                client_conn.as_mut().graceful_shutdown();
                client_conn.await
            }
        };
        upstream_task.abort();

        served?;
        Ok(())
    }

    async fn accept_client(
        &self,
        upgraded: Upgraded,
        server_config: Arc<rustls::ServerConfig>,
    ) -> Result<TlsStream<TokioIo<Upgraded>>, InterceptError> {
        let acceptor = TlsAcceptor::from(server_config);
        tokio::time::timeout(self.timeouts.handshake, acceptor.accept(TokioIo::new(upgraded)))
            .await
            .map_err(|_| InterceptError::Timeout("client TLS handshake"))?
            .map_err(|e| InterceptError::Handshake(format!("client: {e}")))
    }

    /// Absolute-form `http://` requests, forwarded over a fresh TCP connection.
    async fn forward_plain(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<ProxyBody> {
        let uri = req.uri();
        let authority = match (uri.scheme(), uri.authority()) {
            (Some(scheme), Some(authority)) if *scheme == Scheme::HTTP => authority.as_str().to_string(),
            _ => {
                tracing::debug!(%peer, uri = %uri, "Rejecting non-proxy request");
                return error_response(StatusCode::BAD_REQUEST, "Expected CONNECT or an absolute http:// URI");
            }
        };

        let target = match TunnelTarget::parse(&authority, 80) {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Rejecting malformed proxy request");
                return error_response(StatusCode::BAD_REQUEST, "Malformed request target");
            }
        };

        let stream = match upstream::connect_tcp(&target, self.timeouts.handshake).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(%peer, upstream = %target, error = %e, "Upstream unreachable");
                return error_response(StatusCode::BAD_GATEWAY, "Upstream unreachable");
            }
        };

        let (sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(%peer, upstream = %target, error = %e, "Upstream handshake failed");
                return error_response(StatusCode::BAD_GATEWAY, "Upstream unreachable");
            }
        };
        // The connection outlives this call while the response body streams;
        // it ends once the body is done and the sender below is dropped.
        let upstream = target.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(%upstream, error = %e, "Upstream connection ended with error");
            }
        });

        let exchange = Exchange::new(
            sender,
            target,
            self.audit.clone(),
            self.metrics.clone(),
            self.timeouts.upstream_response,
            self.timeouts.body_idle,
        );
        exchange.forward(req).await
    }
}
