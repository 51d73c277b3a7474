use crate::query::{QueryError, QueryService};
use crate::state::AppState;
use std::sync::Arc;
use warp::http::{header, StatusCode};
use warp::{Filter, Rejection, Reply};

pub const CAPTURE_CONTENT_TYPE: &str = "application/vnd.tcpdump.pcap";

pub fn routes(state: Arc<AppState>) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let query = state.query_service();

    let requests = warp::path!("requests")
        .and(warp::get())
        .and(with_query(query.clone()))
        .and_then(list_requests);

    let capture_list = warp::path!("pcap-list")
        .and(warp::get())
        .and(with_query(query.clone()))
        .and_then(list_captures);

    let capture = warp::path!("pcap" / String)
        .and(warp::get())
        .and(with_query(query))
        .and_then(fetch_capture);

    let ca_cert = warp::path!("ca.crt")
        .and(warp::get())
        .and(with_state(state))
        .map(|state: Arc<AppState>| {
            warp::reply::with_header(
                state.authority.certificate_pem().to_string(),
                header::CONTENT_TYPE,
                "application/x-pem-file",
            )
        });

    warp::path("api").and(requests.or(capture_list).or(capture).or(ca_cert))
}

pub fn metrics_route(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("metrics")
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_metrics)
}

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn with_query(
    query: QueryService,
) -> impl Filter<Extract = (QueryService,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || query.clone())
}

async fn list_requests(query: QueryService) -> Result<warp::reply::Response, Rejection> {
    // Snapshotting takes the journal lock; keep it off the reactor
    match tokio::task::spawn_blocking(move || query.list_records()).await {
        Ok(records) => Ok(warp::reply::json(&records).into_response()),
        Err(e) => {
            tracing::error!(error = %e, "Snapshot task failed");
            Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

async fn list_captures(query: QueryService) -> Result<warp::reply::Response, Rejection> {
    match query.list_capture_files().await {
        Ok(names) => Ok(warp::reply::json(&names).into_response()),
        Err(e) => Ok(query_error_reply(e)),
    }
}

async fn fetch_capture(
    name: String,
    query: QueryService,
) -> Result<warp::reply::Response, Rejection> {
    match query.fetch_capture_file(&name).await {
        Ok(bytes) => {
            let reply = warp::reply::with_header(bytes, header::CONTENT_TYPE, CAPTURE_CONTENT_TYPE);
            let reply = warp::reply::with_header(
                reply,
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", name),
            );
            Ok(reply.into_response())
        }
        Err(e) => Ok(query_error_reply(e)),
    }
}

async fn get_metrics(state: Arc<AppState>) -> Result<warp::reply::Response, Rejection> {
    match state.metrics.render() {
        Ok(text) => Ok(warp::reply::with_header(
            text,
            header::CONTENT_TYPE,
            prometheus::TEXT_FORMAT,
        )
        .into_response()),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            Ok(error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

/// Storage paths and IO details stay in the operator log.
fn query_error_reply(err: QueryError) -> warp::reply::Response {
    match err {
        QueryError::NotFound => error_reply(StatusCode::NOT_FOUND, "Not found"),
        QueryError::BadRequest(reason) => error_reply(StatusCode::BAD_REQUEST, reason),
        QueryError::Io(e) => {
            tracing::error!(error = %e, "Capture query failed");
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn error_reply(status: StatusCode, message: &str) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    )
    .into_response()
}
