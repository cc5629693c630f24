use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        log::info!("[DB] Connecting to database: {}", database_url);

        let file_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        if !file_path.is_empty() && !file_path.starts_with(":memory:") {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        log::error!("[DB] Failed to create directory {:?}: {}", parent, e);
                        sqlx::Error::Configuration(Box::new(e))
                    })?;
                    log::info!("[DB] Created directory {:?}", parent);
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                log::error!("[DB] SQLite connection failed: {}", e);
                e
            })?;

        log::info!("[DB] Database connection successful");
        Ok(Self { pool })
    }

    /// Single-connection in-memory database, migrated and ready to use.
    pub async fn in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // every pooled connection to :memory: is a separate database, so keep exactly one alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                email TEXT UNIQUE NOT NULL,
                role TEXT NOT NULL,
                avatar TEXT,
                bio TEXT,
                created_at INTEGER NOT NULL,
                is_online INTEGER NOT NULL DEFAULT 0
            );
        "#).execute(&self.pool).await?;

        // Auth
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS auth (
                user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
                password_hash TEXT NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Sessions
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Session events (register, login_success, logout)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS session_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Projects; version is bumped on every state transition
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                client_id TEXT NOT NULL REFERENCES users(id),
                freelancer_id TEXT REFERENCES users(id),
                budget REAL NOT NULL,
                deadline INTEGER NOT NULL,
                category TEXT NOT NULL,
                skills TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'open',
                version INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Bids, one per (project, freelancer)
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS bids (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                freelancer_id TEXT NOT NULL REFERENCES users(id),
                amount REAL NOT NULL,
                proposal TEXT NOT NULL,
                timeframe INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                submitted_at INTEGER NOT NULL,
                UNIQUE (project_id, freelancer_id)
            );
        "#).execute(&self.pool).await?;

        // Milestones
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS milestones (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                description TEXT,
                amount REAL NOT NULL,
                due_date INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                completed_at INTEGER,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Project attachments
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                url TEXT NOT NULL,
                uploaded_by TEXT,
                uploaded_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // Conversations, unique per (participant set, project); '' means no project
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_key TEXT NOT NULL,
                project_id TEXT NOT NULL DEFAULT '',
                last_message_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (participant_key, project_id)
            );
        "#).execute(&self.pool).await?;

        // Conversation participants with their unread counters
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS conversation_participants (
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id),
                unread_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, user_id)
            );
        "#).execute(&self.pool).await?;

        // Messages
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL REFERENCES users(id),
                content TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages (conversation_id, created_at);")
            .execute(&self.pool).await?;

        // Simulated escrow payments
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                bid_id TEXT NOT NULL,
                payer_id TEXT NOT NULL,
                payee_id TEXT NOT NULL,
                amount REAL NOT NULL,
                fee REAL NOT NULL,
                total REAL NOT NULL,
                status TEXT NOT NULL,
                card_brand TEXT,
                card_last4 TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        // at most one live payment per project; failed attempts don't count
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_active ON payments (project_id) WHERE status != 'failed';")
            .execute(&self.pool).await?;

        // Notifications
        sqlx::query(r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );
        "#).execute(&self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let row = sqlx::query("SELECT COUNT(1) AS c FROM sqlite_master WHERE type = 'table' AND name = 'conversations'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("c"), 1);
    }
}
