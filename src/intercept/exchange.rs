//! Decode, record and forward one HTTP exchange at a time over an upstream
//! connection, then complete the matching record with the response.

use super::body::{self, Completion, ProxyBody, TeeBody};
use super::TunnelTarget;
use crate::audit::{AuditLog, RequestView};
use crate::state::metrics::{Metrics, UpstreamTimer};
use bytes::Bytes;
use http::header::{CONNECTION, HOST, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const HOP_BY_HOP: &[&str] = &["proxy-connection", "keep-alive"];

/// Correlation ids of requests forwarded on one connection whose responses
/// have not been seen yet, oldest first. HTTP/1.1 answers in request order,
/// so the front entry always belongs to the next response.
#[derive(Debug, Default)]
pub struct ExchangeLedger {
    outstanding: Mutex<VecDeque<Option<String>>>,
}

impl ExchangeLedger {
    pub fn open(&self, id: Option<String>) {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
    }

    /// Pop the oldest outstanding exchange. The outer `None` means nothing was
    /// outstanding; the inner one means the request could not be recorded.
    pub fn settle(&self) -> Option<Option<String>> {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub struct Exchange {
    upstream: tokio::sync::Mutex<SendRequest<Full<Bytes>>>,
    ledger: ExchangeLedger,
    target: TunnelTarget,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    response_timeout: Duration,
    body_idle_timeout: Duration,
}

impl Exchange {
    pub fn new(
        upstream: SendRequest<Full<Bytes>>,
        target: TunnelTarget,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        response_timeout: Duration,
        body_idle_timeout: Duration,
    ) -> Self {
        Self {
            upstream: tokio::sync::Mutex::new(upstream),
            ledger: ExchangeLedger::default(),
            target,
            audit,
            metrics,
            response_timeout,
            body_idle_timeout,
        }
    }

    pub fn ledger(&self) -> &ExchangeLedger {
        &self.ledger
    }

    /// Forward `req` upstream and stream the upstream response back.
    ///
    /// The request body is buffered so it can be recorded and still forwarded
    /// unchanged. The response body is streamed through [`TeeBody`], which
    /// completes the record once it has been read to the end.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let (mut parts, body) = req.into_parts();

        let body = match body.collect().await {
            Ok(collected) => Some(collected.to_bytes()),
            Err(e) => {
                tracing::warn!(upstream = %self.target, error = %e, "Failed to read request body");
                None
            }
        };

        let host = parts
            .headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| self.target.to_string());

        let view = RequestView {
            method: parts.method.to_string(),
            host: host.clone(),
            path: parts.uri.path().to_string(),
            headers: header_pairs(&parts.headers),
            body: body.clone(),
        };
        let id = self.record(view).await;

        let Some(body) = body else {
            // The client stream broke mid-request. Nothing is forwarded, the
            // record stays pending and the connection is closed.
            return error_response(StatusCode::BAD_REQUEST, "Unreadable request body");
        };

        strip_hop_by_hop(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                parts.headers.insert(HOST, value);
            }
        }
        parts.uri = origin_form(&parts.uri);
        let upstream_req = Request::from_parts(parts, Full::new(body));

        let mut upstream = self.upstream.lock().await;
        self.ledger.open(id);
        let _timer = UpstreamTimer::new(self.metrics.clone());

        let sent = tokio::time::timeout(self.response_timeout, async {
            upstream.ready().await?;
            upstream.send_request(upstream_req).await
        })
        .await;
        drop(upstream);

        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(upstream = %self.target, error = %e, "Upstream request failed");
                self.ledger.settle();
                return error_response(StatusCode::BAD_GATEWAY, "Upstream request failed");
            }
            Err(_) => {
                tracing::warn!(upstream = %self.target, "Upstream response timed out");
                self.ledger.settle();
                return error_response(StatusCode::GATEWAY_TIMEOUT, "Upstream response timed out");
            }
        };

        let (parts, body) = response.into_parts();
        let completion = self.ledger.settle().flatten().map(|id| Completion {
            id,
            status: parts.status.as_u16(),
            headers: header_pairs(&parts.headers),
            audit: self.audit.clone(),
            metrics: self.metrics.clone(),
        });

        // One byte past the cap so the stored body still carries the marker.
        let capture_limit = self.audit.options().body_limit.saturating_add(1);
        let body = TeeBody::new(body, completion, capture_limit, self.body_idle_timeout);
        Response::from_parts(parts, body.boxed_unsync())
    }

    async fn record(&self, view: RequestView) -> Option<String> {
        let audit = self.audit.clone();
        match tokio::task::spawn_blocking(move || audit.record(view)).await {
            Ok(Ok(id)) => {
                self.metrics.requests_recorded.inc();
                Some(id)
            }
            Ok(Err(e)) => {
                self.metrics.audit_write_errors.inc();
                tracing::error!(upstream = %self.target, error = %e, "Failed to record request");
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Audit task panicked");
                None
            }
        }
    }
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    headers.remove(PROXY_AUTHORIZATION);
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Absolute-form request targets become origin-form for the upstream hop.
fn origin_form(uri: &Uri) -> Uri {
    if uri.scheme().is_none() && uri.authority().is_none() {
        return uri.clone();
    }
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .unwrap_or_else(|_| Uri::from_static("/"))
}

pub(crate) fn error_response(status: StatusCode, message: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(body::full(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
