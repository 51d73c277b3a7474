use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use agent_netlog::config::{self, Config};
use agent_netlog::error::{ConfigError, ProxyError, Result};
use agent_netlog::state::AppState;
use agent_netlog::web;

#[derive(Parser, Debug)]
#[command(name = "agent-netlog")]
#[command(about = "Intercepting HTTPS proxy that keeps an audit log of agent traffic", long_about = None)]
struct Args {
    /// Path to configuration file (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Proxy listen address, overriding the configuration (HOST:PORT)
    #[arg(long, value_name = "ADDR")]
    proxy: Option<String>,

    /// Query API listen address, overriding the configuration (HOST:PORT)
    #[arg(long, value_name = "ADDR")]
    web: Option<String>,

    /// Directory for the journal, captures and the root CA
    #[arg(long, value_name = "DIR")]
    logs: Option<PathBuf>,

    /// Disable the query API
    #[arg(long)]
    no_web: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => config::load_from_path(path)?,
        None => config::load_from_env_or_file()?,
    };
    apply_args(&mut config, &args)?;
    config::validate(&config)?;

    std::fs::create_dir_all(&config.storage.logs_dir)?;
    let _log_guard = init_tracing(&config, args.debug)?;

    match &args.config {
        Some(path) => info!("Configuration loaded from {}", path.display()),
        None => info!("Configuration loaded from default locations"),
    }
    info!("Starting agent network logger");
    info!("Logs directory: {}", config.storage.logs_dir.display());

    let (state, shutdown_rx) = AppState::bootstrap(config)?;

    let proxy_addr = state.config.proxy_addr();
    let listener = TcpListener::bind(&proxy_addr).await.map_err(|e| {
        error!("Failed to bind proxy on {}: {}", proxy_addr, e);
        ProxyError::Io(e)
    })?;

    let engine = Arc::new(state.engine()?);
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = engine.run(listener, shutdown_rx).await {
            error!("Interception proxy error: {}", e);
        }
    });

    let web_handle = if state.config.web_ui.enabled {
        let web_state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = web::start_server(web_state).await {
                error!("Query API server error: {}", e);
            }
        }))
    } else {
        None
    };

    shutdown_signal().await;

    info!("Shutting down agent network logger");

    let shutdown_timeout = tokio::time::timeout(tokio::time::Duration::from_secs(30), async {
        state.shutdown();

        if let Some(web_handle) = web_handle {
            let _ = tokio::join!(proxy_handle, web_handle);
        } else {
            let _ = proxy_handle.await;
        }
    })
    .await;

    match shutdown_timeout {
        Ok(_) => info!("Graceful shutdown completed"),
        Err(_) => {
            error!("Shutdown timeout exceeded, forcing exit");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn apply_args(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(addr) = &args.proxy {
        let (host, port) = split_listen_addr(addr)?;
        config.proxy.host = host;
        config.proxy.port = port;
    }
    if let Some(addr) = &args.web {
        let (host, port) = split_listen_addr(addr)?;
        config.web_ui.host = host;
        config.web_ui.port = port;
    }
    if let Some(dir) = &args.logs {
        config.storage.logs_dir = dir.clone();
    }
    if args.no_web {
        config.web_ui.enabled = false;
    }
    Ok(())
}

fn split_listen_addr(addr: &str) -> Result<(String, u16)> {
    let invalid = || ProxyError::Config(ConfigError::Parse(format!("Invalid listen address: {addr}")));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

/// The returned guard flushes the file writer on drop; keep it alive for the
/// life of the process.
fn init_tracing(
    config: &Config,
    debug: bool,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let log_level = if debug { "debug" } else { "info" };
    let directive: tracing_subscriber::filter::Directive = format!("agent_netlog={log_level}")
        .parse()
        .map_err(|e| ConfigError::Parse(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let stdout_layer = if config.logging.json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().boxed()
    };

    let (file_layer, guard) = if config.logging.file {
        let appender = tracing_appender::rolling::never(&config.storage.logs_dir, "proxy.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
