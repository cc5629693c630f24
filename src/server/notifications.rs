use crate::common::models::{from_millis, now_millis, Notification, NotificationKind};
use crate::common::protocol::ServerEvent;
use crate::server::database::Database;
use crate::server::error::{AppError, AppResult};
use crate::server::state::AppState;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

fn row_to_notification(row: &SqliteRow) -> Notification {
    let kind: String = row.get("kind");
    Notification {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: NotificationKind::parse(&kind).unwrap_or(NotificationKind::BidReceived),
        message: row.get("message"),
        read: row.get::<i64, _>("is_read") != 0,
        created_at: from_millis(row.get("created_at")),
    }
}

async fn insert(db: &Database, user_id: &str, kind: NotificationKind, message: &str) -> Result<Notification, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    sqlx::query("INSERT INTO notifications (id, user_id, kind, message, is_read, created_at) VALUES (?, ?, ?, ?, 0, ?)")
        .bind(&id)
        .bind(user_id)
        .bind(kind.as_str())
        .bind(message)
        .bind(now)
        .execute(&db.pool)
        .await?;
    Ok(Notification {
        id,
        user_id: user_id.to_string(),
        kind,
        message: message.to_string(),
        read: false,
        created_at: from_millis(now),
    })
}

/// Stores a notification and pushes it to the user's open sockets.
///
/// A failure here never fails the operation that triggered it; it is logged and `None` is returned.
pub async fn notify(state: &AppState, user_id: &str, kind: NotificationKind, message: &str) -> Option<Notification> {
    match insert(&state.db, user_id, kind, message).await {
        Ok(notification) => {
            state
                .hub
                .emit_to_user(user_id, ServerEvent::Notification { notification: notification.clone() })
                .await;
            Some(notification)
        }
        Err(e) => {
            log::warn!("[NOTIFY] Failed to store {} notification for {}: {}", kind.as_str(), user_id, e);
            None
        }
    }
}

pub async fn list(db: &Database, user_id: &str) -> AppResult<Vec<Notification>> {
    let rows = sqlx::query("SELECT * FROM notifications WHERE user_id = ? ORDER BY created_at DESC, rowid DESC")
        .bind(user_id)
        .fetch_all(&db.pool)
        .await?;
    Ok(rows.iter().map(row_to_notification).collect())
}

pub async fn mark_read(db: &Database, user_id: &str, notification_id: &str) -> AppResult<Notification> {
    let res = sqlx::query("UPDATE notifications SET is_read = 1 WHERE id = ? AND user_id = ?")
        .bind(notification_id)
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Notification not found"));
    }
    let row = sqlx::query("SELECT * FROM notifications WHERE id = ?")
        .bind(notification_id)
        .fetch_one(&db.pool)
        .await?;
    Ok(row_to_notification(&row))
}

pub async fn clear(db: &Database, user_id: &str) -> AppResult<u64> {
    let res = sqlx::query("DELETE FROM notifications WHERE user_id = ?")
        .bind(user_id)
        .execute(&db.pool)
        .await?;
    Ok(res.rows_affected())
}
