//! Response bodies handed back to the client.
//!
//! Upstream bodies are streamed through [`TeeBody`], which keeps a capped copy
//! for the audit record. The record is completed once the stream ends, fails or
//! is abandoned; the client always gets the upstream bytes as they arrive.

use crate::audit::{AuditLog, ResponseView};
use crate::state::metrics::Metrics;
use bytes::{Bytes, BytesMut};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, Incoming, SizeHint};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};

pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the proxy writes.
pub type ProxyBody = UnsyncBoxBody<Bytes, BodyError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Everything needed to complete one record once its response body settles.
pub(crate) struct Completion {
    pub id: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
}

impl Completion {
    fn run(self, body: Option<Bytes>) {
        let view = ResponseView {
            status: self.status,
            headers: self.headers,
            body,
        };
        match self.audit.complete(&self.id, view) {
            Ok(correlated) => self.metrics.record_completion(correlated),
            Err(e) => {
                self.metrics.audit_write_errors.inc();
                tracing::error!(id = %self.id, error = %e, "Failed to complete record");
            }
        }
    }

    fn spawn(self, body: Option<Bytes>) -> Option<JoinHandle<()>> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn_blocking(move || self.run(body))),
            Err(_) => {
                self.run(body);
                None
            }
        }
    }
}

/// Item held back until the completion lands.
enum Held {
    Frame(Frame<Bytes>),
    End,
    Failed(BodyError),
}

impl Held {
    fn into_poll(self) -> Option<Result<Frame<Bytes>, BodyError>> {
        match self {
            Held::Frame(frame) => Some(Ok(frame)),
            Held::End => None,
            Held::Failed(e) => Some(Err(e)),
        }
    }
}

/// Streams an upstream body to the client while capturing up to
/// `capture_limit` bytes of it.
///
/// A gap longer than `idle` between frames aborts the stream. The final item
/// is only released after the record has been completed, so a client that has
/// read the whole body can rely on the record being durable.
pub struct TeeBody {
    inner: Incoming,
    captured: BytesMut,
    capture_limit: usize,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    completion: Option<Completion>,
    finishing: Option<(Option<JoinHandle<()>>, Held)>,
    done: bool,
}

impl TeeBody {
    pub(crate) fn new(
        inner: Incoming,
        completion: Option<Completion>,
        capture_limit: usize,
        idle: Duration,
    ) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
            capture_limit,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            completion,
            finishing: None,
            done: false,
        }
    }

    fn capture(&mut self, data: &Bytes) {
        let room = self.capture_limit.saturating_sub(self.captured.len());
        let take = room.min(data.len());
        self.captured.extend_from_slice(&data[..take]);
    }

    /// Start completing the record, holding `held` back until it is done.
    fn settle(&mut self, body: Option<Bytes>, held: Held) {
        let handle = self.completion.take().and_then(|c| c.spawn(body));
        self.finishing = Some((handle, held));
    }

    fn captured_body(&mut self) -> Option<Bytes> {
        Some(std::mem::take(&mut self.captured).freeze())
    }
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, BodyError>>> {
        let this = self.get_mut();
        loop {
            if let Some((handle, _)) = this.finishing.as_mut() {
                if let Some(handle) = handle {
                    match Pin::new(handle).poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => tracing::error!(error = %e, "Audit task panicked"),
                        Poll::Ready(Ok(())) => {}
                    }
                }
                this.done = true;
                return match this.finishing.take() {
                    Some((_, held)) => Poll::Ready(held.into_poll()),
                    None => Poll::Ready(None),
                };
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let deadline = Instant::now() + this.idle;
                    this.deadline.as_mut().reset(deadline);
                    if let Some(data) = frame.data_ref() {
                        this.capture(data);
                    }
                    if this.inner.is_end_stream() {
                        let body = this.captured_body();
                        this.settle(body, Held::Frame(frame));
                        continue;
                    }
                    return Poll::Ready(Some(Ok(frame)));
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::warn!(error = %e, "Upstream response body failed");
                    this.settle(None, Held::Failed(Box::new(e)));
                    continue;
                }
                Poll::Ready(None) => {
                    let body = this.captured_body();
                    this.settle(body, Held::End);
                    continue;
                }
                Poll::Pending => {}
            }

            if this.deadline.as_mut().poll(cx).is_ready() {
                tracing::warn!(idle = ?this.idle, "Upstream response body stalled");
                this.settle(None, Held::Failed("upstream response body stalled".into()));
                continue;
            }
            return Poll::Pending;
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        if self.done {
            SizeHint::with_exact(0)
        } else {
            self.inner.size_hint()
        }
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // Abandoned before the end: the client went away or never read it.
        if let Some(completion) = self.completion.take() {
            completion.spawn(None);
        }
    }
}
