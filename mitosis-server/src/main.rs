//! Mitosis HTTP server: agent API, WebSocket/SSE events, and an optional
//! static web UI.

mod routes;
mod sse;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::get;
use clap::Parser;
use mitosis::engine::TaskEngine;
use mitosis::io::config::{DEFAULT_CONFIG_FILE, load_config};
use mitosis::logging;
use mitosis::services::Services;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "mitosis-server")]
#[command(about = "HTTP and WebSocket surface for the mitosis task engine")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Overrides `server.bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Overrides `server.port`.
    #[arg(long)]
    port: Option<u16>,

    /// Overrides `server.static_dir`.
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    logging::init(logging::SERVER_FILTER, config.debug);

    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(ui_dir) = args.ui_dir {
        config.server.static_dir = Some(ui_dir);
    }

    let services = Services::build(config.clone()).await?;
    let state = AppState::new(services);

    resume_interrupted(&state).await;
    spawn_cleanup(
        Arc::clone(state.engine()),
        config.retention.days,
        Duration::from_secs(config.retention.cleanup_interval_secs),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", routes::api_router())
        .route("/ws", get(ws::ws_handler))
        .route("/socket.io/", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    match config.server.static_dir.as_ref() {
        Some(dir) if dir.exists() => {
            info!(ui_dir = %dir.display(), "serving static UI files");
            app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
        }
        Some(dir) => info!(ui_dir = %dir.display(), "UI directory not found, API-only mode"),
        None => {}
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("parse bind address")?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;

    Ok(())
}

/// Fail steps stranded in `executing` and hand their tasks to the worker.
async fn resume_interrupted(state: &AppState) {
    match state.engine().recover_incomplete_tasks().await {
        Ok(report) => {
            for task_id in &report.requeue {
                state.worker().enqueue(task_id);
            }
        }
        Err(err) => warn!(err = %err, "startup recovery failed"),
    }
}

fn spawn_cleanup(engine: Arc<TaskEngine>, retention_days: u32, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if let Err(err) = engine.cleanup_expired(retention_days).await {
                warn!(err = %err, "retention cleanup failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
