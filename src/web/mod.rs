use crate::error::{ConfigError, ProxyError, Result};
use crate::state::AppState;
use std::sync::Arc;
use warp::Filter;

pub mod api;


pub async fn start_server(state: Arc<AppState>) -> Result<()> {
    let addr = state.config.web_ui_addr();
    tracing::info!("Starting query API server on {}", addr);

    let routes = create_routes(state.clone());

    let addr: std::net::SocketAddr = addr.parse().map_err(|e| {
        ProxyError::Config(ConfigError::Parse(format!(
            "Invalid web UI address: {}",
            e
        )))
    })?;

    let mut shutdown_rx = state.shutdown_tx.subscribe();
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_rx.recv().await;
        })
        .map_err(|e| {
            ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Failed to bind query API on {addr}: {e}"),
            ))
        })?;

    tracing::info!(addr = %bound, "Query API listening");
    server.await;

    tracing::info!("Query API server stopped");
    Ok(())
}

pub fn create_routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let api_routes = api::routes(state.clone()).with(
        warp::cors()
            .allow_any_origin()
            .allow_methods(vec!["GET"])
            .allow_headers(vec!["Content-Type"]),
    );

    let metrics = api::metrics_route(state);

    let health = warp::path("health").and(warp::get()).map(|| {
        warp::reply::json(&serde_json::json!({
            "status": "healthy",
            "service": "agent-netlog"
        }))
    });

    api_routes.or(metrics).or(health)
}
