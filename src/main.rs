use anyhow::Result;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

mod config;
mod embedder;
mod engine;
mod error;
mod fsadapter;
mod graph;
mod hydrator;
mod keyword;
mod model;
mod parser;
mod persist;
mod routes;
mod scorer;
mod server;
mod state;
mod storage;
mod sync;
mod vector;
mod worker;

#[tokio::main]
async fn main() -> Result<()> {
    // Resolve log directory (sibling of the hot cache or from env)
    let log_dir = std::env::var("NOTEGRAPH_LOG_DIR").unwrap_or_else(|_| {
        dirs::data_local_dir()
            .map(|d| d.join("notegraph-backend").join("logs").to_string_lossy().to_string())
            .unwrap_or_else(|| ".notegraph-logs".to_string())
    });
    std::fs::create_dir_all(&log_dir).ok();

    // File appender: daily rotated log files
    let file_appender = tracing_appender::rolling::daily(&log_dir, "notegraph-backend.log");
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "notegraph_backend=info,tower_http=info".into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    // Log panics before aborting
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "notegraph_backend::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    routes::health::init_start_time();

    let config = config::AppConfig::from_env();
    let addr: SocketAddr = config.listen_addr.parse()?;

    info!(
        listen_addr = %config.listen_addr,
        vault_dir = %config.vault_dir,
        data_dir = %config.data_dir,
        model = %config.engine.embedding_model_id,
        dim = config.engine.embedding_dimension,
        idle_debounce_ms = config.global_idle_debounce_ms,
        active_debounce_ms = config.active_file_debounce_ms,
        log_dir = %log_dir,
        "notegraph backend starting"
    );

    let app_state = state::AppState::new(config).await?;

    routes::health::init_shutdown_notify();
    let app = server::create_app(app_state.clone());

    // Bind and serve before the initial scan so /health answers while the
    // (potentially slow) first index pass runs.
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("notegraph backend listening on {}", addr);

    let enable_watcher = app_state.config.enable_file_watcher;
    let scan_state = app_state.clone();
    tokio::spawn(async move {
        if enable_watcher {
            if let Err(e) = scan_state.sync.start() {
                error!("Failed to start vault watcher: {e}");
            }
        } else {
            info!("File watching disabled via settings");
        }
        if let Err(e) = scan_state.sync.scan().await {
            error!("Initial vault scan failed: {e}");
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop feeding the worker, then flush its state.
    app_state.sync.stop();
    if let Err(e) = app_state.engine.shutdown().await {
        error!("Engine shutdown failed: {e}");
    }

    info!("notegraph backend shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install secondary Ctrl+C handler");
    };

    let http_shutdown = routes::health::wait_for_shutdown();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, initiating shutdown"); },
        _ = terminate => { info!("Received terminate signal, initiating shutdown"); },
        _ = http_shutdown => { info!("Received HTTP shutdown request, initiating shutdown"); },
    }

    info!("Shutdown signal received");
}
