use crate::common::models::{Message, MessageAttachment, Notification};
use serde::{Deserialize, Serialize};

/// Frames a socket client may send. The first frame on a connection must be `Auth`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(default)]
        attachments: Vec<MessageAttachment>,
    },
}

/// Events pushed from the server to socket clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthResponse {
        success: bool,
        user_id: Option<String>,
        error: Option<String>,
    },
    Joined {
        conversation_id: String,
    },
    Left {
        conversation_id: String,
    },
    NewMessage {
        message: Message,
    },
    Notification {
        notification: Notification,
    },
    Error {
        message: String,
    },
}

/// Where an event published on the fan-out channel should be delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Target {
    Room(String),
    User(String),
}

/// Envelope used when relaying events between server instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub origin: String,
    pub target: Target,
    pub event: ServerEvent,
}
