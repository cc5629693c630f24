use crate::common::models::{
    from_millis, now_millis, Conversation, Message, MessageAttachment, ProjectRef, UnreadCount,
};
use crate::common::protocol::ServerEvent;
use crate::server::auth::AuthUser;
use crate::server::database::Database;
use crate::server::error::{AppError, AppResult};
use crate::server::state::AppState;
use crate::server::users;
use crate::server::validation::{require_id, rule, Check, Rule, Validate};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRequest {
    pub participant_id: String,
    pub project_id: Option<String>,
}

impl Validate for ConversationRequest {
    const RULES: &'static [Rule] = &[rule("participantId", Check::Required, "Participant ID is required")];
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<MessageAttachment>,
}

impl Validate for SendMessageRequest {
    const RULES: &'static [Rule] = &[
        rule("conversationId", Check::Required, "Conversation ID is required"),
        rule("content", Check::Required, "Message content is required"),
    ];
}

/// Storage key of a participant set: sorted ids joined by commas.
fn participant_key(a: &str, b: &str) -> String {
    let mut ids = [a, b];
    ids.sort_unstable();
    ids.join(",")
}

fn row_to_message(row: &SqliteRow) -> Message {
    let attachments: String = row.get("attachments");
    Message {
        id: row.get("id"),
        conversation: row.get("conversation_id"),
        sender: None,
        sender_id: row.get("sender_id"),
        content: row.get("content"),
        attachments: serde_json::from_str(&attachments).unwrap_or_default(),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

async fn populate_senders(db: &Database, messages: &mut [Message]) -> AppResult<()> {
    let people = users::summaries(db, messages.iter().map(|m| m.sender_id.as_str())).await?;
    for m in messages.iter_mut() {
        m.sender = people.get(&m.sender_id).cloned();
    }
    Ok(())
}

/// Loads a conversation with participants, unread counters, project title and last message.
pub async fn find_conversation(db: &Database, conversation_id: &str) -> AppResult<Option<Conversation>> {
    let Some(row) = sqlx::query("SELECT * FROM conversations WHERE id = ?")
        .bind(conversation_id)
        .fetch_optional(&db.pool)
        .await?
    else {
        return Ok(None);
    };
    let project_id: String = row.get("project_id");
    let last_message_id: Option<String> = row.get("last_message_id");

    let members = sqlx::query("SELECT user_id, unread_count FROM conversation_participants WHERE conversation_id = ? ORDER BY rowid")
        .bind(conversation_id)
        .fetch_all(&db.pool)
        .await?;
    let unread_counts: Vec<UnreadCount> = members
        .iter()
        .map(|r| UnreadCount { user: r.get("user_id"), count: r.get("unread_count") })
        .collect();
    let people = users::summaries(db, unread_counts.iter().map(|u| u.user.as_str())).await?;
    let participants = unread_counts.iter().filter_map(|u| people.get(&u.user).cloned()).collect();

    let project = if project_id.is_empty() {
        None
    } else {
        sqlx::query("SELECT id, title FROM projects WHERE id = ?")
            .bind(&project_id)
            .fetch_optional(&db.pool)
            .await?
            .map(|r| ProjectRef { id: r.get("id"), title: r.get("title") })
    };

    let last_message = match last_message_id {
        Some(id) => {
            let mut found: Vec<Message> = sqlx::query("SELECT * FROM messages WHERE id = ?")
                .bind(&id)
                .fetch_all(&db.pool)
                .await?
                .iter()
                .map(row_to_message)
                .collect();
            populate_senders(db, &mut found).await?;
            found.pop()
        }
        None => None,
    };

    Ok(Some(Conversation {
        id: row.get("id"),
        participants,
        project,
        last_message,
        unread_counts,
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }))
}

/// 404 for an unknown conversation, 403 when `user_id` is not in it.
pub async fn ensure_participant(db: &Database, conversation_id: &str, user_id: &str) -> AppResult<()> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM conversation_participants WHERE conversation_id = c.id AND user_id = ?) AS member \
         FROM conversations c WHERE c.id = ?",
    )
    .bind(user_id)
    .bind(conversation_id)
    .fetch_optional(&db.pool)
    .await?;
    match row {
        None => Err(AppError::not_found("Conversation not found")),
        Some(r) if r.get::<i64, _>("member") == 0 => Err(AppError::forbidden("Not authorized")),
        Some(_) => Ok(()),
    }
}

pub async fn get_or_create_conversation(
    state: &AppState,
    caller: &AuthUser,
    req: ConversationRequest,
) -> AppResult<Conversation> {
    let db = &state.db;
    let participant_id = require_id(&req.participant_id, "participant")?;
    if participant_id == caller.user_id {
        return Err(AppError::bad_request("Cannot start a conversation with yourself"));
    }
    if !users::exists(db, &participant_id).await? {
        return Err(AppError::not_found("User not found"));
    }
    let project_id = match req.project_id.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
        Some(raw) => {
            let id = require_id(raw, "project")?;
            let known = sqlx::query("SELECT 1 FROM projects WHERE id = ?")
                .bind(&id)
                .fetch_optional(&db.pool)
                .await?
                .is_some();
            if !known {
                return Err(AppError::not_found("Project not found"));
            }
            id
        }
        None => String::new(),
    };

    let key = participant_key(&caller.user_id, &participant_id);
    let now = now_millis();
    let mut tx = db.pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO conversations (id, participant_key, project_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (participant_key, project_id) DO NOTHING",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&key)
    .bind(&project_id)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let created = inserted.rows_affected() == 1;
    let conversation_id: String = sqlx::query("SELECT id FROM conversations WHERE participant_key = ? AND project_id = ?")
        .bind(&key)
        .bind(&project_id)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
    if created {
        for user_id in [&caller.user_id, &participant_id] {
            sqlx::query("INSERT OR IGNORE INTO conversation_participants (conversation_id, user_id, unread_count) VALUES (?, ?, 0)")
                .bind(&conversation_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
        }
    }
    tx.commit().await?;

    if created {
        log::info!("[CHAT] Conversation {} created between {}", conversation_id, key);
    }
    find_conversation(db, &conversation_id)
        .await?
        .ok_or_else(|| AppError::not_found("Conversation not found"))
}

pub async fn list_conversations(db: &Database, user_id: &str) -> AppResult<Vec<Conversation>> {
    let ids: Vec<String> = sqlx::query(
        "SELECT c.id FROM conversations c JOIN conversation_participants p ON p.conversation_id = c.id \
         WHERE p.user_id = ? ORDER BY c.updated_at DESC, c.rowid DESC",
    )
    .bind(user_id)
    .fetch_all(&db.pool)
    .await?
    .iter()
    .map(|r| r.get("id"))
    .collect();

    let mut conversations = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(c) = find_conversation(db, &id).await? {
            conversations.push(c);
        }
    }
    Ok(conversations)
}

/// The most recent page of messages, oldest first.
pub async fn conversation_messages(state: &AppState, caller: &AuthUser, conversation_id: &str) -> AppResult<Vec<Message>> {
    ensure_participant(&state.db, conversation_id, &caller.user_id).await?;
    let rows = sqlx::query(
        "SELECT * FROM (SELECT messages.*, messages.rowid AS seq FROM messages WHERE conversation_id = ? \
         ORDER BY created_at DESC, seq DESC LIMIT ?) ORDER BY created_at ASC, seq ASC",
    )
    .bind(conversation_id)
    .bind(state.config.message_page_size as i64)
    .fetch_all(&state.db.pool)
    .await?;
    let mut messages: Vec<Message> = rows.iter().map(row_to_message).collect();
    populate_senders(&state.db, &mut messages).await?;
    Ok(messages)
}

/// Appends a message, bumps every other participant's unread counter and
/// broadcasts it to the conversation room. Shared by HTTP and socket senders.
pub async fn send_message(
    state: &AppState,
    sender_id: &str,
    conversation_id: &str,
    content: &str,
    attachments: Vec<MessageAttachment>,
) -> AppResult<Message> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::bad_request("Message content is required"));
    }
    if content.chars().count() > state.config.max_message_length {
        return Err(AppError::bad_request(format!(
            "Message too long (max {} chars)",
            state.config.max_message_length
        )));
    }
    ensure_participant(&state.db, conversation_id, sender_id).await?;

    let message_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    let attachments_json = serde_json::to_string(&attachments).map_err(anyhow::Error::from)?;

    let mut tx = state.db.pool.begin().await?;
    sqlx::query("INSERT INTO messages (id, conversation_id, sender_id, content, attachments, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
        .bind(&message_id)
        .bind(conversation_id)
        .bind(sender_id)
        .bind(content)
        .bind(&attachments_json)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE conversations SET last_message_id = ?, updated_at = ? WHERE id = ?")
        .bind(&message_id)
        .bind(now)
        .bind(conversation_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE conversation_participants SET unread_count = unread_count + 1 WHERE conversation_id = ? AND user_id != ?")
        .bind(conversation_id)
        .bind(sender_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let mut message = Message {
        id: message_id,
        conversation: conversation_id.to_string(),
        sender: None,
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        attachments,
        created_at: from_millis(now),
        updated_at: from_millis(now),
    };
    message.sender = users::find_user(&state.db, sender_id).await?.map(Into::into);

    log::info!("[CHAT] {} -> conversation {} ({} chars)", sender_id, conversation_id, message.content.len());
    state
        .hub
        .emit_to_room(conversation_id, ServerEvent::NewMessage { message: message.clone() })
        .await;
    Ok(message)
}

pub async fn mark_as_read(db: &Database, caller: &AuthUser, conversation_id: &str) -> AppResult<()> {
    let res = sqlx::query("UPDATE conversation_participants SET unread_count = 0 WHERE conversation_id = ? AND user_id = ?")
        .bind(conversation_id)
        .bind(&caller.user_id)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() == 0 {
        // tells apart an unknown conversation from one the caller is not in
        ensure_participant(db, conversation_id, &caller.user_id).await?;
    }
    Ok(())
}
