//! PitchDesk Backend Service
//!
//! Main entry point. Runs:
//! - HTTP API for price views, drafts and pitch submission
//! - WebSocket server for live price updates
//! - Price engine and draft autosave flusher in the background

use anyhow::Context;
use pitchdesk_backend::clock::{Clock, SystemClock};
use pitchdesk_backend::config::{AppConfig, StorageBackend};
use pitchdesk_backend::database::{create_pool, run_migrations};
use pitchdesk_backend::repositories::{MemoryStore, Repositories};
use pitchdesk_backend::websocket::WebSocketServer;
use pitchdesk_backend::{api, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "pitchdesk_backend={},sqlx=warn,tower_http=info",
            config.log_level
        )
        .into()
    });

    if config.json_logs() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_repositories(config: &AppConfig) -> anyhow::Result<Repositories> {
    match config.storage {
        StorageBackend::Postgres => {
            info!("Connecting to database...");
            let pool = create_pool(&config.database)
                .await
                .context("failed to create database pool")?;
            info!(
                "Database pool ready (max connections: {})",
                config.database.max_connections
            );

            info!("Running database migrations...");
            run_migrations(&pool)
                .await
                .context("database migration failed")?;
            info!("Database migrations completed");

            Ok(Repositories::postgres(pool))
        }
        StorageBackend::Memory => {
            warn!("STORAGE_BACKEND=memory: state is lost on restart");
            Ok(Repositories::memory(Arc::new(MemoryStore::new())))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()
        .map_err(|e| anyhow::anyhow!(e))
        .context("configuration error")?;

    init_tracing(&config);

    info!("PitchDesk backend starting");
    info!("Environment: {}", config.environment);
    info!("Log level: {}", config.log_level);
    info!(
        "Engine tick: {}ms, concurrency {}",
        config.engine.tick_interval_ms, config.engine.max_concurrency
    );

    let repos = build_repositories(&config).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (state, tasks) =
        AppState::start(&config, repos, clock).context("failed to start services")?;
    info!("✓ Price engine and autosave flusher started");

    // HTTP API
    let http_addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP server on {}", http_addr))?;
    let app = api::router(state.clone());
    let http_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(http_listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });
    info!("✓ HTTP API listening on {}", http_addr);

    // WebSocket price feed
    let ws_handle = if let Some(ws_port) = config.ws_port {
        let ws_addr = SocketAddr::from(([0, 0, 0, 0], ws_port));
        let listener = TcpListener::bind(ws_addr)
            .await
            .with_context(|| format!("failed to bind WebSocket server on {}", ws_addr))?;
        let ws_server = WebSocketServer::new(state.broadcaster.clone());

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("New WebSocket connection from {}", addr);
                        let ws = ws_server.clone();
                        tokio::spawn(async move {
                            if let Err(e) = ws.handle_connection(stream).await {
                                error!("WebSocket connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("WebSocket accept error: {}", e);
                    }
                }
            }
        });

        info!("✓ WebSocket server listening on {}", ws_addr);
        Some(handle)
    } else {
        warn!("WS_PORT not configured - live price feed disabled");
        None
    };

    info!("PitchDesk backend ready. Press Ctrl+C to shut down");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, shutting down gracefully...");
        }
        _ = http_handle => {
            error!("HTTP server exited unexpectedly");
        }
        _ = async {
            if let Some(handle) = ws_handle {
                handle.await.ok();
            } else {
                futures::future::pending::<()>().await;
            }
        } => {
            error!("WebSocket server exited unexpectedly");
        }
    }

    // Drain queued autosaves before the engine stops
    let flushed = state.autosave.flush().await;
    if flushed > 0 {
        info!("Flushed {} pending draft autosaves", flushed);
    }
    state.engine.shutdown();
    if tokio::time::timeout(std::time::Duration::from_secs(5), tasks.engine)
        .await
        .is_err()
    {
        warn!("Price engine did not stop within 5s");
    }
    tasks.autosave.abort();

    info!("PitchDesk backend shutdown complete");
    Ok(())
}
