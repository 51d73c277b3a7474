use agent_netlog::audit::{AuditLog, AuditOptions, REDACTED};
use agent_netlog::intercept::{InterceptionEngine, SessionTimeouts};
use agent_netlog::state::Metrics;
use agent_netlog::tls::{upstream_client_config, CertificateAuthority};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Harness {
    _dir: TempDir,
    proxy_addr: SocketAddr,
    proxy_ca: Arc<CertificateAuthority>,
    audit: Arc<AuditLog>,
    _shutdown: broadcast::Sender<()>,
}

async fn upstream_service(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();
    let reply = format!("{path} got {} bytes", body.len());
    Ok(Response::builder()
        .header("content-type", "text/plain")
        .header("set-cookie", "session=abc")
        .body(Full::new(Bytes::from(reply)))
        .unwrap())
}

/// HTTPS origin presenting a leaf for `localhost` from its own root.
async fn start_tls_upstream(ca: &CertificateAuthority) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(ca.server_config_for_host("localhost").unwrap());

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service_fn(upstream_service))
                    .await;
            });
        }
    });
    addr
}

async fn start_plain_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(upstream_service))
                    .await;
            });
        }
    });
    addr
}

async fn start_proxy(upstream_roots: Vec<rustls::pki_types::CertificateDer<'static>>) -> Harness {
    start_proxy_with(upstream_roots, SessionTimeouts::default()).await
}

async fn start_proxy_with(
    upstream_roots: Vec<rustls::pki_types::CertificateDer<'static>>,
    timeouts: SessionTimeouts,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let proxy_ca = Arc::new(CertificateAuthority::load_or_create(dir.path()).unwrap());
    let audit = Arc::new(
        AuditLog::open(dir.path().join("requests.jsonl"), AuditOptions::default()).unwrap(),
    );
    let metrics = Arc::new(Metrics::new().unwrap());

    let engine = Arc::new(InterceptionEngine::new(
        proxy_ca.clone(),
        audit.clone(),
        metrics,
        upstream_client_config(false, &upstream_roots).unwrap(),
        timeouts,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    tokio::spawn(engine.run(listener, rx));

    Harness {
        _dir: dir,
        proxy_addr,
        proxy_ca,
        audit,
        _shutdown: shutdown,
    }
}

/// Send a raw request line and read the response head byte by byte so no
/// tunnel bytes are consumed.
async fn raw_head(stream: &mut TcpStream, request: &str) -> String {
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

/// CONNECT to `localhost:{port}` and finish TLS against the proxy's leaf.
async fn open_tunnel(harness: &Harness, port: u16) -> TlsStream<TcpStream> {
    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let authority = format!("localhost:{port}");
    let head = raw_head(
        &mut stream,
        &format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    let mut roots = RootCertStore::empty();
    roots.add(harness.proxy_ca.certificate_der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap()
}

/// Raw HTTP/1.1 origin: reads one request head, then runs `respond`.
async fn start_raw_upstream<F, Fut>(respond: F) -> SocketAddr
where
    F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let respond = respond.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    match stream.read(&mut byte).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => head.push(byte[0]),
                    }
                }
                respond(stream).await;
            });
        }
    });
    addr
}

async fn plain_client(harness: &Harness) -> hyper::client::conn::http1::SendRequest<Full<Bytes>> {
    let stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    sender
}

fn plain_get(upstream: SocketAddr, path: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .uri(format!("http://{upstream}{path}"))
        .header("host", upstream.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_https_exchange_is_intercepted_and_recorded() {
    let upstream_dir = TempDir::new().unwrap();
    let upstream_ca = CertificateAuthority::load_or_create(upstream_dir.path()).unwrap();
    let upstream_addr = start_tls_upstream(&upstream_ca).await;
    let harness = start_proxy(vec![upstream_ca.certificate_der().clone()]).await;

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let authority = format!("localhost:{}", upstream_addr.port());
    let head = raw_head(
        &mut stream,
        &format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected head: {head}");

    // Trust only the proxy root, as a monitored client would
    let mut roots = RootCertStore::empty();
    roots.add(harness.proxy_ca.certificate_der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let tls = TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await
        .unwrap();

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("POST")
        .uri("/a?q=1")
        .header("host", "localhost")
        .header("authorization", "Bearer secret123")
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"/a got 7 bytes");

    let snapshot = harness.audit.snapshot();
    assert_eq!(snapshot.len(), 1);
    let record = &snapshot[0];
    assert_eq!(record.method, "POST");
    assert_eq!(record.host, "localhost");
    assert_eq!(record.path, "/a");
    assert_eq!(record.headers["authorization"], REDACTED);
    assert_eq!(record.body.as_deref(), Some("payload"));

    let response = record.response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some("/a got 7 bytes"));
    assert_eq!(response.headers["content-type"], "text/plain");

    let journal = std::fs::read_to_string(harness.audit.path()).unwrap();
    assert!(!journal.contains("secret123"));
    assert_eq!(journal.lines().count(), 2);

    // A second request on the same tunnel reuses the session
    let req = Request::builder()
        .method("GET")
        .uri("/b")
        .header("host", "localhost")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    resp.into_body().collect().await.unwrap();
    assert_eq!(harness.audit.len(), 2);
    assert!(harness.audit.snapshot().iter().all(|r| r.is_completed()));
}

#[tokio::test]
async fn test_plain_http_is_forwarded_and_recorded() {
    let upstream_addr = start_plain_upstream().await;
    let harness = start_proxy(Vec::new()).await;

    let stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method("GET")
        .uri(format!("http://{upstream_addr}/plain"))
        .header("host", upstream_addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"/plain got 0 bytes");

    let snapshot = harness.audit.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].path, "/plain");
    assert_eq!(snapshot[0].response().map(|r| r.status), Some(200));
}

#[tokio::test]
async fn test_malformed_connect_is_rejected() {
    let harness = start_proxy(Vec::new()).await;

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let head = raw_head(
        &mut stream,
        "CONNECT example.com:0 HTTP/1.1\r\nHost: example.com:0\r\n\r\n",
    )
    .await;

    assert!(head.starts_with("HTTP/1.1 400"), "unexpected head: {head}");
    assert!(harness.audit.is_empty());
}

#[tokio::test]
async fn test_unreachable_plain_upstream_is_bad_gateway() {
    // Bind then drop to get a port with nothing listening
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
    let harness = start_proxy(Vec::new()).await;

    let stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .uri(format!("http://{closed}/"))
        .header("host", closed.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_untrusted_upstream_closes_tunnel() {
    // Upstream root is not trusted by the proxy
    let upstream_dir = TempDir::new().unwrap();
    let upstream_ca = CertificateAuthority::load_or_create(upstream_dir.path()).unwrap();
    let upstream_addr = start_tls_upstream(&upstream_ca).await;
    let harness = start_proxy(Vec::new()).await;

    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let authority = format!("localhost:{}", upstream_addr.port());
    let head = raw_head(
        &mut stream,
        &format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"),
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200"));

    let mut roots = RootCertStore::empty();
    roots.add(harness.proxy_ca.certificate_der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let result = TlsConnector::from(Arc::new(client_config))
        .connect(ServerName::try_from("localhost").unwrap(), stream)
        .await;

    // The client handshake may finish before the upstream one fails; either
    // way the tunnel is torn down without serving anything.
    if let Ok(mut tls) = result {
        let mut buf = [0u8; 1];
        let n = tls.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
    assert!(harness.audit.is_empty());
}

#[tokio::test]
async fn test_upstream_close_ends_tunnel() {
    let upstream_dir = TempDir::new().unwrap();
    let upstream_ca = CertificateAuthority::load_or_create(upstream_dir.path()).unwrap();
    let acceptor = TlsAcceptor::from(upstream_ca.server_config_for_host("localhost").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let tls = acceptor.accept(stream).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(tls);
    });

    // Client idle timeout far beyond the read deadline below
    let harness = start_proxy_with(
        vec![upstream_ca.certificate_der().clone()],
        SessionTimeouts {
            client_idle: Duration::from_secs(60),
            ..SessionTimeouts::default()
        },
    )
    .await;
    let mut tls = open_tunnel(&harness, upstream_addr.port()).await;

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), tls.read(&mut buf)).await;
    assert!(read.is_ok(), "client was left hanging after upstream closed");
    assert_eq!(read.unwrap().unwrap_or(0), 0);
}

#[tokio::test]
async fn test_client_close_releases_upstream() {
    let upstream_dir = TempDir::new().unwrap();
    let upstream_ca = CertificateAuthority::load_or_create(upstream_dir.path()).unwrap();
    let acceptor = TlsAcceptor::from(upstream_ca.server_config_for_host("localhost").unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(stream).await.unwrap();
        let mut sink = Vec::new();
        let _ = tls.read_to_end(&mut sink).await;
        let _ = closed_tx.send(());
    });

    let harness = start_proxy(vec![upstream_ca.certificate_der().clone()]).await;
    let tls = open_tunnel(&harness, upstream_addr.port()).await;
    drop(tls);

    let closed = tokio::time::timeout(Duration::from_secs(5), closed_rx).await;
    assert!(closed.is_ok(), "upstream connection outlived the client");
}

#[tokio::test]
async fn test_stalled_upstream_is_gateway_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<Incoming>| async {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::new())))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let harness = start_proxy_with(
        Vec::new(),
        SessionTimeouts {
            upstream_response: Duration::from_millis(500),
            ..SessionTimeouts::default()
        },
    )
    .await;
    let mut sender = plain_client(&harness).await;

    let resp = sender.send_request(plain_get(upstream_addr, "/slow")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(resp.headers()["connection"], "close");

    let snapshot = harness.audit.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert!(!snapshot[0].is_completed());
}

#[tokio::test]
async fn test_slow_response_body_streams_through() {
    // Headers arrive at once; the body pauses longer than the header deadline
    let upstream_addr = start_raw_upstream(|mut stream| async move {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let _ = stream.write_all(b"world").await;
    })
    .await;

    let harness = start_proxy_with(
        Vec::new(),
        SessionTimeouts {
            upstream_response: Duration::from_secs(1),
            ..SessionTimeouts::default()
        },
    )
    .await;
    let mut sender = plain_client(&harness).await;

    let resp = sender.send_request(plain_get(upstream_addr, "/stream")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"helloworld");

    let snapshot = harness.audit.snapshot();
    assert_eq!(snapshot.len(), 1);
    let response = snapshot[0].response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some("helloworld"));
}

#[tokio::test]
async fn test_stalled_response_body_is_cut_and_completed_without_body() {
    let upstream_addr = start_raw_upstream(|mut stream| async move {
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let harness = start_proxy_with(
        Vec::new(),
        SessionTimeouts {
            body_idle: Duration::from_millis(300),
            ..SessionTimeouts::default()
        },
    )
    .await;
    let mut sender = plain_client(&harness).await;

    let resp = sender.send_request(plain_get(upstream_addr, "/stall")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let collected = tokio::time::timeout(Duration::from_secs(3), resp.into_body().collect()).await;
    assert!(matches!(collected, Ok(Err(_))), "stalled body was not aborted");

    assert!(wait_for(|| harness.audit.snapshot().iter().all(|r| r.is_completed())).await);
    let snapshot = harness.audit.snapshot();
    assert_eq!(snapshot.len(), 1);
    let response = snapshot[0].response().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, None);
}

#[tokio::test]
async fn test_truncated_request_body_tears_down_session() {
    let forwarded = Arc::new(AtomicUsize::new(0));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = listener.local_addr().unwrap();
    let counter = forwarded.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    upstream_service(req)
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let harness = start_proxy(Vec::new()).await;
    let mut stream = TcpStream::connect(harness.proxy_addr).await.unwrap();
    let request = format!(
        "POST http://{upstream_addr}/upload HTTP/1.1\r\nHost: {upstream_addr}\r\nContent-Length: 100\r\n\r\nshort"
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut reply = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply)).await;
    assert!(read.is_ok(), "session was not torn down");
    if !reply.is_empty() {
        assert!(reply.starts_with(b"HTTP/1.1 400"));
    }

    assert!(wait_for(|| harness.audit.len() == 1).await);
    let snapshot = harness.audit.snapshot();
    let record = &snapshot[0];
    assert_eq!(record.method, "POST");
    assert_eq!(record.path, "/upload");
    assert_eq!(record.body, None);
    assert!(!record.is_completed());
    assert_eq!(forwarded.load(Ordering::SeqCst), 0);
}
