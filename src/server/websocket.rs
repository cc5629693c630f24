use crate::common::protocol::{ClientFrame, Envelope, ServerEvent, Target};
use crate::server::auth;
use crate::server::chat;
use crate::server::state::SharedState;
use futures_util::{SinkExt, StreamExt};
use redis::aio::ConnectionManager;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

pub type ClientId = String;
pub type UserId = String;

const EVENTS_CHANNEL: &str = "bidhub:events";
const AUTH_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(30);

pub struct WebSocketConnection {
    pub user_id: UserId,
    pub sender: mpsc::UnboundedSender<Message>,
    pub rooms: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ClientId, WebSocketConnection>,
    // room (conversation id) -> joined clients
    rooms: HashMap<String, HashSet<ClientId>>,
}

impl Registry {
    fn drop_client(&mut self, client_id: &str) -> Option<WebSocketConnection> {
        let conn = self.connections.remove(client_id)?;
        for room in &conn.rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(client_id);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        Some(conn)
    }
}

/// Tracks open sockets and the conversation rooms they joined.
///
/// Events are delivered to local sockets first and, when Redis is configured,
/// published so other server instances can deliver them to their own sockets.
pub struct ChatWebSocketManager {
    registry: Arc<Mutex<Registry>>,
    instance_id: String,
    redis_url: Option<String>,
    redis_manager: Option<ConnectionManager>,
}

impl Default for ChatWebSocketManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatWebSocketManager {
    /// Local-only hub.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            instance_id: Uuid::new_v4().to_string(),
            redis_url: None,
            redis_manager: None,
        }
    }

    pub async fn with_redis(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis_manager = ConnectionManager::new(client).await?;
        log::info!("[WS:REDIS] Connected to {}", redis_url);
        Ok(Self {
            redis_url: Some(redis_url.to_string()),
            redis_manager: Some(redis_manager),
            ..Self::new()
        })
    }

    pub async fn register(&self, user_id: &str, sender: mpsc::UnboundedSender<Message>) -> ClientId {
        let client_id = Uuid::new_v4().to_string();
        let mut registry = self.registry.lock().await;
        registry.connections.insert(
            client_id.clone(),
            WebSocketConnection { user_id: user_id.to_string(), sender, rooms: HashSet::new() },
        );
        log::debug!("[WS] Client {} registered for user {} ({} open)", client_id, user_id, registry.connections.len());
        client_id
    }

    /// Removes a client. Returns its user and whether that user still has other sockets open.
    pub async fn unregister(&self, client_id: &str) -> Option<(UserId, bool)> {
        let mut registry = self.registry.lock().await;
        let conn = registry.drop_client(client_id)?;
        let still_online = registry.connections.values().any(|c| c.user_id == conn.user_id);
        Some((conn.user_id, still_online))
    }

    pub async fn join(&self, client_id: &str, room: &str) -> bool {
        let mut registry = self.registry.lock().await;
        let Some(conn) = registry.connections.get_mut(client_id) else {
            return false;
        };
        conn.rooms.insert(room.to_string());
        registry.rooms.entry(room.to_string()).or_default().insert(client_id.to_string());
        true
    }

    pub async fn leave(&self, client_id: &str, room: &str) {
        let mut registry = self.registry.lock().await;
        if let Some(conn) = registry.connections.get_mut(client_id) {
            conn.rooms.remove(room);
        }
        if let Some(members) = registry.rooms.get_mut(room) {
            members.remove(client_id);
            if members.is_empty() {
                registry.rooms.remove(room);
            }
        }
    }

    pub async fn emit_to_room(&self, room: &str, event: ServerEvent) {
        let target = Target::Room(room.to_string());
        self.deliver_local(&target, &event).await;
        self.publish(target, event).await;
    }

    pub async fn emit_to_user(&self, user_id: &str, event: ServerEvent) {
        let target = Target::User(user_id.to_string());
        self.deliver_local(&target, &event).await;
        self.publish(target, event).await;
    }

    /// Replies to a single socket; never relayed.
    pub async fn send_to_client(&self, client_id: &str, event: &ServerEvent) {
        let Ok(json) = serde_json::to_string(event) else {
            return;
        };
        if let Some(conn) = self.registry.lock().await.connections.get(client_id) {
            let _ = conn.sender.send(Message::Text(json));
        }
    }

    /// Pushes `event` to matching sockets on this instance. Returns how many were reached.
    pub async fn deliver_local(&self, target: &Target, event: &ServerEvent) -> usize {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                log::error!("[WS] Failed to serialize event: {}", e);
                return 0;
            }
        };
        let registry = self.registry.lock().await;
        let recipients: Vec<&WebSocketConnection> = match target {
            Target::Room(room) => registry
                .rooms
                .get(room)
                .into_iter()
                .flatten()
                .filter_map(|cid| registry.connections.get(cid))
                .collect(),
            Target::User(user_id) => registry.connections.values().filter(|c| &c.user_id == user_id).collect(),
        };
        let mut delivered = 0;
        for conn in recipients {
            if conn.sender.send(Message::Text(json.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    async fn publish(&self, target: Target, event: ServerEvent) {
        let Some(manager) = &self.redis_manager else {
            return;
        };
        let envelope = Envelope { origin: self.instance_id.clone(), target, event };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                log::error!("[WS:REDIS] Failed to serialize envelope: {}", e);
                return;
            }
        };
        let mut conn = manager.clone();
        let published: redis::RedisResult<()> = redis::cmd("PUBLISH")
            .arg(EVENTS_CHANNEL)
            .arg(&payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = published {
            log::warn!("[WS:REDIS] Publish failed: {}", e);
        }
    }

    /// Closes every socket of `user_id`. Returns how many were closed.
    pub async fn disconnect_user(&self, user_id: &str) -> usize {
        let mut registry = self.registry.lock().await;
        let clients: Vec<ClientId> = registry
            .connections
            .iter()
            .filter(|(_, c)| c.user_id == user_id)
            .map(|(id, _)| id.clone())
            .collect();
        for client_id in &clients {
            if let Some(conn) = registry.drop_client(client_id) {
                let _ = conn.sender.send(Message::Close(None));
            }
        }
        if !clients.is_empty() {
            log::info!("[WS] Disconnected {} sockets of user {}", clients.len(), user_id);
        }
        clients.len()
    }

    /// Relays events published by other instances to local sockets. Reconnects on failure.
    pub fn start_redis_subscriber(self: &Arc<Self>) {
        let Some(redis_url) = self.redis_url.clone() else {
            return;
        };
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if let Err(e) = hub.run_subscriber(&redis_url).await {
                    log::warn!("[WS:REDIS] Subscriber stopped: {}", e);
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    async fn run_subscriber(&self, redis_url: &str) -> anyhow::Result<()> {
        let client = redis::Client::open(redis_url)?;
        let mut pubsub = client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(EVENTS_CHANNEL).await?;
        log::info!("[WS:REDIS] Subscribed to {}", EVENTS_CHANNEL);

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(_) => continue,
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) if envelope.origin != self.instance_id => {
                    self.deliver_local(&envelope.target, &envelope.event).await;
                }
                Ok(_) => {}
                Err(e) => log::warn!("[WS:REDIS] Dropping malformed envelope: {}", e),
            }
        }
        Ok(())
    }
}

/// Accepts socket connections until the listener fails.
pub async fn serve(listener: TcpListener, state: SharedState) -> anyhow::Result<()> {
    log::info!("[WS] Listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => {
                    if let Err(e) = handle_connection(ws, state).await {
                        log::info!("[WS] Connection {} ended: {}", addr, e);
                    }
                }
                Err(e) => log::warn!("[WS] Handshake with {} failed: {}", addr, e),
            }
        });
    }
}

fn text_frame(event: &ServerEvent) -> anyhow::Result<Message> {
    Ok(Message::Text(serde_json::to_string(event)?))
}

fn auth_failure(error: &str) -> ServerEvent {
    ServerEvent::AuthResponse { success: false, user_id: None, error: Some(error.to_string()) }
}

/// Runs one socket: authenticate with the first frame, then serve room frames
/// until either side closes.
pub async fn handle_connection<S>(ws: WebSocketStream<S>, state: SharedState) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let token = match tokio::time::timeout(AUTH_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Auth { token }) => token,
            Ok(_) => {
                let _ = ws_sender.send(text_frame(&auth_failure("Expected an auth frame first"))?).await;
                return Err(anyhow::anyhow!("first frame was not auth"));
            }
            Err(e) => {
                let _ = ws_sender.send(text_frame(&auth_failure(&format!("Invalid JSON: {}", e)))?).await;
                return Err(anyhow::anyhow!("invalid auth frame"));
            }
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
        Ok(Some(Ok(_))) => {
            let _ = ws_sender.send(text_frame(&auth_failure("Expected text message for authentication"))?).await;
            return Err(anyhow::anyhow!("unexpected frame during auth"));
        }
        Ok(Some(Err(e))) => return Err(e.into()),
        Err(_) => {
            let _ = ws_sender.send(text_frame(&auth_failure("Authentication timeout"))?).await;
            return Err(anyhow::anyhow!("authentication timeout"));
        }
    };

    let Some(user) = auth::validate_session(&state.db, &token).await? else {
        let _ = ws_sender.send(text_frame(&auth_failure("Invalid or expired session token"))?).await;
        let _ = ws_sender.send(Message::Close(None)).await;
        return Err(anyhow::anyhow!("authentication failed"));
    };
    let user_id = user.user_id;

    if let Err(e) = sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
        .bind(&user_id)
        .execute(&state.db.pool)
        .await
    {
        log::warn!("[WS] Failed to mark {} online: {}", user_id, e);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    // queued before registering so it is the first frame the client sees
    let _ = tx.send(text_frame(&ServerEvent::AuthResponse { success: true, user_id: Some(user_id.clone()), error: None })?);
    let client_id = state.hub.register(&user_id, tx).await;
    log::info!("[WS:AUTH] User {} connected as client {}", user_id, client_id);

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_client = client_id.clone();
    let recv_user = user_id.clone();
    let mut receive_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => handle_frame(&recv_state, &recv_client, &recv_user, &text).await,
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    if let Some((_, false)) = state.hub.unregister(&client_id).await {
        if let Err(e) = sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
            .bind(&user_id)
            .execute(&state.db.pool)
            .await
        {
            log::warn!("[WS] Failed to mark {} offline: {}", user_id, e);
        }
    }
    log::info!("[WS] Client {} of user {} disconnected", client_id, user_id);
    Ok(())
}

async fn handle_frame(state: &SharedState, client_id: &str, user_id: &str, text: &str) {
    let hub = &state.hub;
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            log::debug!("[WS:RECV] Bad frame from {}: {}", client_id, e);
            hub.send_to_client(client_id, &ServerEvent::Error { message: "Invalid frame".into() }).await;
            return;
        }
    };

    match frame {
        ClientFrame::Auth { .. } => {
            hub.send_to_client(client_id, &ServerEvent::Error { message: "Already authenticated".into() }).await;
        }
        ClientFrame::JoinConversation { conversation_id } => {
            match chat::ensure_participant(&state.db, &conversation_id, user_id).await {
                Ok(()) => {
                    hub.join(client_id, &conversation_id).await;
                    hub.send_to_client(client_id, &ServerEvent::Joined { conversation_id }).await;
                }
                Err(e) => hub.send_to_client(client_id, &ServerEvent::Error { message: e.to_string() }).await,
            }
        }
        ClientFrame::LeaveConversation { conversation_id } => {
            hub.leave(client_id, &conversation_id).await;
            hub.send_to_client(client_id, &ServerEvent::Left { conversation_id }).await;
        }
        ClientFrame::SendMessage { conversation_id, content, attachments } => {
            // delivery to the room (sender included when joined) happens inside send_message
            if let Err(e) = chat::send_message(state, user_id, &conversation_id, &content, attachments).await {
                hub.send_to_client(client_id, &ServerEvent::Error { message: e.to_string() }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::Role;
    use crate::server::auth::tests::signup;
    use crate::server::chat::{get_or_create_conversation, ConversationRequest};
    use crate::server::projects::tests::caller;
    use crate::server::state::AppState;
    use crate::server::users;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;

    impl ChatWebSocketManager {
        async fn room_members(&self, room: &str) -> usize {
            self.registry.lock().await.rooms.get(room).map_or(0, |m| m.len())
        }

        async fn is_online(&self, user_id: &str) -> bool {
            self.registry.lock().await.connections.values().any(|c| c.user_id == user_id)
        }
    }

    async fn connect(state: &SharedState) -> WebSocketStream<DuplexStream> {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let state = state.clone();
        tokio::spawn(async move {
            let ws = WebSocketStream::from_raw_socket(server_io, WsRole::Server, None).await;
            let _ = handle_connection(ws, state).await;
        });
        WebSocketStream::from_raw_socket(client_io, WsRole::Client, None).await
    }

    async fn send(ws: &mut WebSocketStream<DuplexStream>, frame: ClientFrame) {
        ws.send(Message::Text(serde_json::to_string(&frame).unwrap())).await.unwrap();
    }

    async fn next_event(ws: &mut WebSocketStream<DuplexStream>) -> ServerEvent {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected a text frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn rooms_track_joins_and_disconnects() {
        let hub = ChatWebSocketManager::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = hub.register("u1", tx).await;
        assert!(hub.join(&client, "room").await);
        assert!(!hub.join("ghost", "room").await);
        assert_eq!(hub.room_members("room").await, 1);

        let reached = hub.deliver_local(&Target::Room("room".into()), &ServerEvent::Error { message: "x".into() }).await;
        assert_eq!(reached, 1);
        assert!(matches!(rx.recv().await, Some(Message::Text(_))));

        assert_eq!(hub.disconnect_user("u1").await, 1);
        assert!(matches!(rx.recv().await, Some(Message::Close(None))));
        assert_eq!(hub.room_members("room").await, 0);
        assert!(!hub.is_online("u1").await);
        assert!(hub.unregister(&client).await.is_none());
    }

    #[tokio::test]
    async fn bad_token_is_refused() {
        let state = AppState::in_memory().await.unwrap();
        let mut ws = connect(&state).await;
        send(&mut ws, ClientFrame::Auth { token: "nope".into() }).await;
        match next_event(&mut ws).await {
            ServerEvent::AuthResponse { success, error, .. } => {
                assert!(!success);
                assert!(error.is_some());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_frame_must_be_auth() {
        let state = AppState::in_memory().await.unwrap();
        let mut ws = connect(&state).await;
        send(&mut ws, ClientFrame::JoinConversation { conversation_id: "c".into() }).await;
        assert!(matches!(next_event(&mut ws).await, ServerEvent::AuthResponse { success: false, .. }));
    }

    #[tokio::test]
    async fn joined_sockets_receive_room_messages() {
        let state = AppState::in_memory().await.unwrap();
        let client = signup(&state, "Client", Role::Client).await;
        let freelancer = signup(&state, "Freelancer", Role::Freelancer).await;
        let outsider = signup(&state, "Outsider", Role::Freelancer).await;
        let client_user = caller(&state, &client.token).await;
        let conv = get_or_create_conversation(
            &state,
            &client_user,
            ConversationRequest { participant_id: freelancer.user.id.clone(), project_id: None },
        )
        .await
        .unwrap();

        let mut alice = connect(&state).await;
        send(&mut alice, ClientFrame::Auth { token: client.token.clone() }).await;
        assert!(matches!(next_event(&mut alice).await, ServerEvent::AuthResponse { success: true, .. }));
        let mut bob = connect(&state).await;
        send(&mut bob, ClientFrame::Auth { token: freelancer.token.clone() }).await;
        assert!(matches!(next_event(&mut bob).await, ServerEvent::AuthResponse { success: true, .. }));
        let mut eve = connect(&state).await;
        send(&mut eve, ClientFrame::Auth { token: outsider.token.clone() }).await;
        assert!(matches!(next_event(&mut eve).await, ServerEvent::AuthResponse { success: true, .. }));

        for ws in [&mut alice, &mut bob] {
            send(ws, ClientFrame::JoinConversation { conversation_id: conv.id.clone() }).await;
            assert!(matches!(next_event(ws).await, ServerEvent::Joined { .. }));
        }
        send(&mut eve, ClientFrame::JoinConversation { conversation_id: conv.id.clone() }).await;
        assert!(matches!(next_event(&mut eve).await, ServerEvent::Error { .. }));

        send(
            &mut alice,
            ClientFrame::SendMessage { conversation_id: conv.id.clone(), content: "hello bob".into(), attachments: vec![] },
        )
        .await;
        for ws in [&mut bob, &mut alice] {
            match next_event(ws).await {
                ServerEvent::NewMessage { message } => {
                    assert_eq!(message.content, "hello bob");
                    assert_eq!(message.sender_id, client.user.id);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }

        let conv = chat::find_conversation(&state.db, &conv.id).await.unwrap().unwrap();
        assert_eq!(conv.unread_for(&freelancer.user.id), 1);
    }

    #[tokio::test]
    async fn logging_in_again_kicks_old_sockets() {
        let state = AppState::in_memory().await.unwrap();
        let reg = signup(&state, "Client", Role::Client).await;
        let mut ws = connect(&state).await;
        send(&mut ws, ClientFrame::Auth { token: reg.token.clone() }).await;
        assert!(matches!(next_event(&mut ws).await, ServerEvent::AuthResponse { success: true, .. }));

        auth::login(
            &state,
            auth::LoginRequest { email: "client@example.com".into(), password: "secret123".into() },
        )
        .await
        .unwrap();

        match ws.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => {}
            other => panic!("expected the socket to close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn presence_follows_the_socket() {
        let state = AppState::in_memory().await.unwrap();
        let reg = signup(&state, "Client", Role::Client).await;
        let other = signup(&state, "Freelancer", Role::Freelancer).await;
        assert!(!users::find_user(&state.db, &reg.user.id).await.unwrap().unwrap().is_online);

        let mut ws = connect(&state).await;
        send(&mut ws, ClientFrame::Auth { token: reg.token.clone() }).await;
        assert!(matches!(next_event(&mut ws).await, ServerEvent::AuthResponse { success: true, .. }));
        assert!(state.hub.is_online(&reg.user.id).await);
        let seen = users::summaries(&state.db, [reg.user.id.as_str(), other.user.id.as_str()]).await.unwrap();
        assert!(seen[&reg.user.id].is_online);
        assert!(!seen[&other.user.id].is_online);

        ws.close(None).await.unwrap();
        let mut offline = false;
        for _ in 0..50 {
            if !users::find_user(&state.db, &reg.user.id).await.unwrap().unwrap().is_online {
                offline = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(offline);
        assert!(!state.hub.is_online(&reg.user.id).await);
    }
}
