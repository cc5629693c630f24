use std::sync::Arc;

use super::{config::ServerConfig, database::Database, websocket::ChatWebSocketManager};

pub struct AppState {
    pub db: Database,
    pub config: ServerConfig,
    pub hub: Arc<ChatWebSocketManager>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(db: Database, config: ServerConfig, hub: Arc<ChatWebSocketManager>) -> SharedState {
        Arc::new(Self { db, config, hub })
    }

    /// In-memory database, default config and a local-only socket hub.
    pub async fn in_memory() -> anyhow::Result<SharedState> {
        let db = Database::in_memory().await?;
        Ok(Self::new(db, ServerConfig::default(), Arc::new(ChatWebSocketManager::new())))
    }
}
