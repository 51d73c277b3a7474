use super::{InterceptError, TunnelTarget};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// TCP connect to `target` within `deadline`.
pub async fn connect_tcp(
    target: &TunnelTarget,
    deadline: Duration,
) -> Result<TcpStream, InterceptError> {
    let stream = tokio::time::timeout(
        deadline,
        TcpStream::connect((target.host.as_str(), target.port)),
    )
    .await
    .map_err(|_| InterceptError::Timeout("upstream connect"))?
    .map_err(|e| InterceptError::UpstreamConnect(format!("{target}: {e}")))?;

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(upstream = %target, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// TCP connect plus TLS client handshake, both within `deadline`.
pub async fn connect_tls(
    connector: &TlsConnector,
    target: &TunnelTarget,
    deadline: Duration,
) -> Result<TlsStream<TcpStream>, InterceptError> {
    let server_name = ServerName::try_from(target.host.clone())
        .map_err(|e| InterceptError::InvalidTarget(format!("{target}: {e}")))?;

    tokio::time::timeout(deadline, async {
        let tcp = connect_tcp(target, deadline).await?;
        connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| InterceptError::Handshake(format!("upstream {target}: {e}")))
    })
    .await
    .map_err(|_| InterceptError::Timeout("upstream TLS handshake"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused_is_upstream_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = TunnelTarget::parse(&format!("127.0.0.1:{port}"), 443).unwrap();
        let err = connect_tcp(&target, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, InterceptError::UpstreamConnect(_)));
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_is_reported() {
        // A listener that accepts and immediately hangs up
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                drop(stream);
            }
        });

        let config = crate::tls::upstream_client_config(false, &[]).unwrap();
        let connector = TlsConnector::from(config);
        let target = TunnelTarget::parse(&format!("localhost:{port}"), 443).unwrap();
        let err = connect_tls(&connector, &target, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InterceptError::Handshake(_) | InterceptError::UpstreamConnect(_)
        ));
    }
}
