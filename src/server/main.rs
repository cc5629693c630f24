// src/server/main.rs
// Entry point for the bidhub API and socket server
use bidhub::server::websocket::{self, ChatWebSocketManager};
use bidhub::server::{auth, config, config::ServerConfig, database::Database, routes, state::AppState};
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;

const SESSION_SWEEP_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(15 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_logging();
    let config = ServerConfig::from_env();

    let database = Database::connect(&config.database_url).await?;
    info!("[DB] Running migrations...");
    database.migrate().await.map_err(|e| {
        error!("[DB] Migration failed: {}", e);
        e
    })?;
    info!("[DB] Migrations completed");

    let hub = match &config.redis_url {
        Some(url) => match ChatWebSocketManager::with_redis(url).await {
            Ok(hub) => Arc::new(hub),
            Err(e) => {
                error!("[WS:REDIS] Could not connect to {}: {}; running without fan-out", url, e);
                Arc::new(ChatWebSocketManager::new())
            }
        },
        None => Arc::new(ChatWebSocketManager::new()),
    };
    hub.start_redis_subscriber();

    let state = AppState::new(database, config.clone(), hub);

    let ws_listener = TcpListener::bind(config.ws_addr()).await?;
    let ws_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = websocket::serve(ws_listener, ws_state).await {
            error!("[WS] Socket server error: {}", e);
        }
    });

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = auth::cleanup_expired_sessions(&sweep_state.db).await {
                error!("[AUTH] Session sweep failed: {}", e);
            }
        }
    });

    let app = routes::build_router(state);
    let listener = TcpListener::bind(config.http_addr()).await?;
    info!("[SERVER] HTTP API listening on {}", config.http_addr());
    info!("[SERVER] WebSocket server listening on {}", config.ws_addr());

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("[SERVER] Shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("[SERVER] Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("[SERVER] Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("[SERVER] Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("[SERVER] Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
