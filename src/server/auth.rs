use crate::common::models::{now_millis, Role, User};
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, AppError, AppResult};
use crate::server::state::{AppState, SharedState};
use crate::server::users;
use crate::server::validation::{rule, Check, Validate};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts, http::HeaderMap};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sqlx::Row;

pub const TOKEN_HEADER: &str = "x-auth-token";

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub role: Role,
}

impl Validate for RegisterRequest {
    const RULES: &'static [crate::server::validation::Rule] = &[
        rule("username", Check::Required, "Username is required"),
        rule("username", Check::MinLength(3), "Username must be at least 3 characters long"),
        rule("email", Check::Email, "Invalid email address"),
        rule("password", Check::Required, "Password is required"),
        rule("password", Check::MinLength(6), "Password must be at least 6 characters long"),
        rule("role", Check::OneOf(&["client", "freelancer"]), "Invalid role"),
    ];
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

impl Validate for LoginRequest {
    const RULES: &'static [crate::server::validation::Rule] = &[
        rule("email", Check::Email, "Invalid email address"),
        rule("password", Check::Required, "Password is required"),
    ];
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

/// The caller behind a valid session token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub role: Role,
    pub token: String,
}

fn hash_password(password: &str, salt_length: u32) -> AppResult<String> {
    let mut salt_bytes = vec![0u8; salt_length as usize];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| anyhow::anyhow!("failed to encode salt: {}", e))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("failed to hash password: {}", e))?;
    Ok(hash.to_string())
}

fn verify_password(hash: &str, password: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(e) => {
            log::warn!("[AUTH] Stored password hash is unreadable: {}", e);
            false
        }
    }
}

fn generate_session_token() -> String {
    let uuid = uuid::Uuid::new_v4().to_string();
    let mut random = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut random);
    format!("{}-{:x}", uuid, md5::compute(random))
}

/// Reads the session token from `x-auth-token`, falling back to `Authorization: Bearer`.
pub fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

async fn create_session(
    tx: &mut sqlx::SqliteConnection,
    user_id: &str,
    ttl_secs: i64,
    event: &str,
) -> Result<String, sqlx::Error> {
    let token = generate_session_token();
    let now = chrono::Utc::now().timestamp();
    sqlx::query("INSERT INTO sessions (user_id, session_token, created_at, expires_at) VALUES (?, ?, ?, ?)")
        .bind(user_id)
        .bind(&token)
        .bind(now)
        .bind(now + ttl_secs)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO session_events (user_id, event_type, created_at) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(event)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    Ok(token)
}

pub async fn register(state: &AppState, req: RegisterRequest) -> AppResult<AuthResponse> {
    log::info!("[AUTH] Register attempt: {}", req.email);
    let db = &state.db;

    if users::find_id_by_email(db, &req.email).await?.is_some() {
        return Err(AppError::bad_request("User already exists"));
    }

    let user_id = uuid::Uuid::new_v4().to_string();
    let password_hash = hash_password(&req.password, state.config.argon2_salt_length)?;

    let mut tx = db.pool.begin().await?;
    let inserted = sqlx::query("INSERT INTO users (id, username, email, role, created_at) VALUES (?, ?, ?, ?, ?)")
        .bind(&user_id)
        .bind(&req.username)
        .bind(&req.email)
        .bind(req.role.as_str())
        .bind(now_millis())
        .execute(&mut *tx)
        .await;
    if let Err(e) = inserted {
        if is_unique_violation(&e) {
            log::info!("[AUTH] Registration failed for {}: email already used", req.email);
            return Err(AppError::bad_request("User already exists"));
        }
        return Err(e.into());
    }
    sqlx::query("INSERT INTO auth (user_id, password_hash) VALUES (?, ?)")
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;
    let token = create_session(&mut *tx, &user_id, state.config.session_ttl_secs(), "register").await?;
    tx.commit().await?;

    let user = current_user(db, &user_id).await?;
    log::info!("[AUTH] Registered {} (id={})", user.username, user_id);
    Ok(AuthResponse { token, user })
}

pub async fn login(state: &AppState, req: LoginRequest) -> AppResult<AuthResponse> {
    log::info!("[AUTH] Login attempt: {}", req.email);
    let db = &state.db;

    let row = sqlx::query("SELECT users.id, auth.password_hash FROM users JOIN auth ON users.id = auth.user_id WHERE users.email = ?")
        .bind(&req.email)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        log::info!("[AUTH] Login failed for {}: user not found", req.email);
        return Err(AppError::bad_request("Invalid credentials"));
    };
    let user_id: String = row.get("id");
    let password_hash: String = row.get("password_hash");
    if !verify_password(&password_hash, &req.password) {
        log::info!("[AUTH] Login failed for {}: wrong password", req.email);
        return Err(AppError::bad_request("Invalid credentials"));
    }

    // single-session: a fresh login replaces every older session of this user
    let mut tx = db.pool.begin().await?;
    let removed = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
    let token = create_session(&mut *tx, &user_id, state.config.session_ttl_secs(), "login_success").await?;
    tx.commit().await?;

    if removed > 0 {
        let kicked = state.hub.disconnect_user(&user_id).await;
        log::info!("[AUTH] Replaced {} old sessions for {} (closed {} sockets)", removed, user_id, kicked);
    }

    let user = current_user(db, &user_id).await?;
    log::info!("[AUTH] Login success for {} (id={})", req.email, user_id);
    Ok(AuthResponse { token, user })
}

/// Invalidates every session of the token's owner and closes their sockets.
pub async fn logout(state: &AppState, token: &str) -> AppResult<()> {
    let db = &state.db;
    let row = sqlx::query("SELECT user_id FROM sessions WHERE session_token = ?")
        .bind(token)
        .fetch_optional(&db.pool)
        .await?;
    let Some(row) = row else {
        return Err(AppError::Unauthorized("Token is not valid".into()));
    };
    let user_id: String = row.get("user_id");

    let mut tx = db.pool.begin().await?;
    let removed = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
        .bind(&user_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO session_events (user_id, event_type, created_at) VALUES (?, 'logout', ?)")
        .bind(&user_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    let kicked = state.hub.disconnect_user(&user_id).await;
    log::info!("[AUTH] Logout for {}: {} sessions removed, {} sockets closed", user_id, removed, kicked);
    Ok(())
}

pub async fn validate_session(db: &Database, token: &str) -> AppResult<Option<AuthUser>> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query(
        "SELECT sessions.user_id, users.role FROM sessions JOIN users ON users.id = sessions.user_id \
         WHERE sessions.session_token = ? AND sessions.expires_at > ?",
    )
    .bind(token)
    .bind(now)
    .fetch_optional(&db.pool)
    .await?;

    Ok(row.and_then(|row| {
        let user_id: String = row.get("user_id");
        let role: String = row.get("role");
        Role::parse(&role).map(|role| AuthUser {
            user_id,
            role,
            token: token.to_string(),
        })
    }))
}

pub async fn current_user(db: &Database, user_id: &str) -> AppResult<User> {
    users::find_user(db, user_id)
        .await?
        .ok_or_else(|| AppError::not_found("User not found"))
}

/// Removes expired sessions. Safe to run periodically.
pub async fn cleanup_expired_sessions(db: &Database) -> AppResult<u64> {
    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
        .bind(now)
        .execute(&db.pool)
        .await?;
    if res.rows_affected() > 0 {
        log::info!("[AUTH] Cleaned up {} expired sessions", res.rows_affected());
    }
    Ok(res.rows_affected())
}

#[async_trait]
impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let token = token_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("No token, authorization denied".into()))?;
        validate_session(&state.db, &token)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Token is not valid".into()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::HeaderValue;

    pub(crate) async fn signup(state: &AppState, name: &str, role: Role) -> AuthResponse {
        register(
            state,
            RegisterRequest {
                username: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase()),
                password: "secret123".to_string(),
                role,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn register_then_login_issues_valid_tokens() {
        let state = AppState::in_memory().await.unwrap();
        let reg = signup(&state, "alice", Role::Client).await;
        assert_eq!(reg.user.role, Role::Client);
        assert!(validate_session(&state.db, &reg.token).await.unwrap().is_some());

        let login = login(
            &state,
            LoginRequest { email: "alice@example.com".into(), password: "secret123".into() },
        )
        .await
        .unwrap();
        assert_eq!(login.user.id, reg.user.id);
        // the registration session was replaced
        assert!(validate_session(&state.db, &reg.token).await.unwrap().is_none());
        assert!(validate_session(&state.db, &login.token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let state = AppState::in_memory().await.unwrap();
        signup(&state, "bob", Role::Freelancer).await;
        let err = register(
            &state,
            RegisterRequest {
                username: "bobby".into(),
                email: "bob@example.com".into(),
                password: "another1".into(),
                role: Role::Client,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(ref m) if m == "User already exists"));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let state = AppState::in_memory().await.unwrap();
        signup(&state, "carol", Role::Client).await;
        let err = login(
            &state,
            LoginRequest { email: "carol@example.com".into(), password: "nope-nope".into() },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn logout_invalidates_the_session() {
        let state = AppState::in_memory().await.unwrap();
        let reg = signup(&state, "dave", Role::Client).await;
        logout(&state, &reg.token).await.unwrap();
        assert!(validate_session(&state.db, &reg.token).await.unwrap().is_none());
        assert!(matches!(logout(&state, &reg.token).await, Err(AppError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let state = AppState::in_memory().await.unwrap();
        let reg = signup(&state, "erin", Role::Client).await;
        sqlx::query("UPDATE sessions SET expires_at = 0")
            .execute(&state.db.pool)
            .await
            .unwrap();
        assert!(validate_session(&state.db, &reg.token).await.unwrap().is_none());
        assert_eq!(cleanup_expired_sessions(&state.db).await.unwrap(), 1);
    }

    #[test]
    fn token_header_takes_precedence_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("abc"));
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(token_from_headers(&headers).as_deref(), Some("xyz"));
    }
}
