use crate::common::models::{Conversation, Message, Notification, Payment, Project, User};
use crate::server::auth::{self, AuthResponse, AuthUser, LoginRequest, RegisterRequest, TOKEN_HEADER};
use crate::server::chat::{self, ConversationRequest, SendMessageRequest};
use crate::server::error::AppResult;
use crate::server::notifications;
use crate::server::payments::{self, CreateIntentRequest, ProcessPaymentRequest};
use crate::server::projects::{
    self, BidRequest, CreateProjectRequest, MilestoneStatusRequest, NewMilestone, ProjectFilters, UpdateProjectRequest,
};
use crate::server::state::SharedState;
use crate::server::validation::{require_id, Validated};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

pub fn build_router(state: SharedState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());

    let auth_routes = Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/logout", post(logout));

    let project_routes = Router::new()
        .route("/", get(list_projects).post(create_project))
        .route("/:id", get(get_project).put(update_project).delete(delete_project))
        .route("/:id/bid", post(submit_bid))
        .route("/:id/bid/:bid_id/accept", post(accept_bid))
        .route("/:id/milestones", post(add_milestone))
        .route("/:id/milestones/:milestone_id/status", post(update_milestone_status));

    let chat_routes = Router::new()
        .route("/conversations", get(list_conversations).post(get_or_create_conversation))
        .route("/conversations/:id/messages", get(conversation_messages))
        .route("/conversations/:id/read", post(mark_as_read))
        .route("/messages", post(send_message));

    let payment_routes = Router::new()
        .route("/create-intent", post(create_payment_intent))
        .route("/process", post(process_payment))
        .route("/history", get(payment_history))
        .route("/release/:project_id/:bid_id", post(release_payment))
        .route("/:id", get(payment_details));

    let notification_routes = Router::new()
        .route("/", get(list_notifications).delete(clear_notifications))
        .route("/:id/read", post(mark_notification_read));

    Router::new()
        .route("/health", get(health))
        .nest("/api/auth", auth_routes)
        .nest("/api/projects", project_routes)
        .nest("/api/chat", chat_routes)
        .nest("/api/payments", payment_routes)
        .nest("/api/notifications", notification_routes)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let allow_origin = match origin.map(HeaderValue::from_str) {
        Some(Ok(value)) => AllowOrigin::exact(value),
        Some(Err(_)) => {
            log::warn!("[SERVER] CORS_ORIGIN is not a valid header value, allowing any origin");
            AllowOrigin::from(Any)
        }
        None => AllowOrigin::from(Any),
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, HeaderName::from_static(TOKEN_HEADER)])
        .max_age(Duration::from_secs(60 * 60))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

// auth

async fn register(
    State(state): State<SharedState>,
    Validated(req): Validated<RegisterRequest>,
) -> AppResult<(StatusCode, Json<AuthResponse>)> {
    Ok((StatusCode::CREATED, Json(auth::register(&state, req).await?)))
}

async fn login(State(state): State<SharedState>, Validated(req): Validated<LoginRequest>) -> AppResult<Json<AuthResponse>> {
    Ok(Json(auth::login(&state, req).await?))
}

async fn me(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<User>> {
    Ok(Json(auth::current_user(&state.db, &user.user_id).await?))
}

async fn logout(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<Value>> {
    auth::logout(&state, &user.token).await?;
    Ok(Json(json!({ "message": "Logged out" })))
}

// projects

async fn list_projects(
    State(state): State<SharedState>,
    _user: AuthUser,
    Query(filters): Query<ProjectFilters>,
) -> AppResult<Json<Vec<Project>>> {
    Ok(Json(projects::list_projects(&state.db, &filters).await?))
}

async fn create_project(
    State(state): State<SharedState>,
    user: AuthUser,
    Validated(req): Validated<CreateProjectRequest>,
) -> AppResult<(StatusCode, Json<Project>)> {
    Ok((StatusCode::CREATED, Json(projects::create_project(&state, &user, req).await?)))
}

async fn get_project(State(state): State<SharedState>, _user: AuthUser, Path(id): Path<String>) -> AppResult<Json<Project>> {
    let id = require_id(&id, "project")?;
    Ok(Json(projects::get_project(&state.db, &id).await?))
}

async fn update_project(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<String>,
    Validated(req): Validated<UpdateProjectRequest>,
) -> AppResult<Json<Project>> {
    let id = require_id(&id, "project")?;
    Ok(Json(projects::update_project(&state, &user, &id, req).await?))
}

async fn delete_project(State(state): State<SharedState>, user: AuthUser, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let id = require_id(&id, "project")?;
    projects::delete_project(&state, &user, &id).await?;
    Ok(Json(json!({ "message": "Project removed" })))
}

async fn submit_bid(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<String>,
    Validated(req): Validated<BidRequest>,
) -> AppResult<Json<Project>> {
    let id = require_id(&id, "project")?;
    Ok(Json(projects::submit_bid(&state, &user, &id, req).await?))
}

async fn accept_bid(
    State(state): State<SharedState>,
    user: AuthUser,
    Path((project_id, bid_id)): Path<(String, String)>,
) -> AppResult<Json<Project>> {
    let project_id = require_id(&project_id, "project")?;
    let bid_id = require_id(&bid_id, "bid")?;
    Ok(Json(projects::accept_bid(&state, &user, &project_id, &bid_id).await?))
}

async fn add_milestone(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<String>,
    Validated(req): Validated<NewMilestone>,
) -> AppResult<(StatusCode, Json<Project>)> {
    let id = require_id(&id, "project")?;
    Ok((StatusCode::CREATED, Json(projects::add_milestone(&state, &user, &id, req).await?)))
}

async fn update_milestone_status(
    State(state): State<SharedState>,
    user: AuthUser,
    Path((project_id, milestone_id)): Path<(String, String)>,
    Validated(req): Validated<MilestoneStatusRequest>,
) -> AppResult<Json<Project>> {
    let project_id = require_id(&project_id, "project")?;
    let milestone_id = require_id(&milestone_id, "milestone")?;
    Ok(Json(
        projects::update_milestone_status(&state, &user, &project_id, &milestone_id, req.status).await?,
    ))
}

// chat

async fn list_conversations(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<Vec<Conversation>>> {
    Ok(Json(chat::list_conversations(&state.db, &user.user_id).await?))
}

async fn get_or_create_conversation(
    State(state): State<SharedState>,
    user: AuthUser,
    Validated(req): Validated<ConversationRequest>,
) -> AppResult<Json<Conversation>> {
    Ok(Json(chat::get_or_create_conversation(&state, &user, req).await?))
}

async fn conversation_messages(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Vec<Message>>> {
    let id = require_id(&id, "conversation")?;
    Ok(Json(chat::conversation_messages(&state, &user, &id).await?))
}

async fn send_message(
    State(state): State<SharedState>,
    user: AuthUser,
    Validated(req): Validated<SendMessageRequest>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let conversation_id = require_id(&req.conversation_id, "conversation")?;
    let message = chat::send_message(&state, &user.user_id, &conversation_id, &req.content, req.attachments).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_as_read(State(state): State<SharedState>, user: AuthUser, Path(id): Path<String>) -> AppResult<Json<Value>> {
    let id = require_id(&id, "conversation")?;
    chat::mark_as_read(&state.db, &user, &id).await?;
    Ok(Json(json!({ "success": true })))
}

// payments

async fn create_payment_intent(
    State(state): State<SharedState>,
    user: AuthUser,
    Validated(req): Validated<CreateIntentRequest>,
) -> AppResult<(StatusCode, Json<Payment>)> {
    Ok((StatusCode::CREATED, Json(payments::create_intent(&state, &user, req).await?)))
}

async fn process_payment(
    State(state): State<SharedState>,
    user: AuthUser,
    Validated(req): Validated<ProcessPaymentRequest>,
) -> AppResult<Json<Payment>> {
    Ok(Json(payments::process_payment(&state, &user, req).await?))
}

async fn payment_history(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<Vec<Payment>>> {
    Ok(Json(payments::history(&state.db, &user.user_id).await?))
}

async fn payment_details(State(state): State<SharedState>, user: AuthUser, Path(id): Path<String>) -> AppResult<Json<Payment>> {
    let id = require_id(&id, "payment")?;
    Ok(Json(payments::details(&state.db, &user, &id).await?))
}

async fn release_payment(
    State(state): State<SharedState>,
    user: AuthUser,
    Path((project_id, bid_id)): Path<(String, String)>,
) -> AppResult<Json<Payment>> {
    let project_id = require_id(&project_id, "project")?;
    let bid_id = require_id(&bid_id, "bid")?;
    Ok(Json(payments::release(&state, &user, &project_id, &bid_id).await?))
}

// notifications

async fn list_notifications(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<Vec<Notification>>> {
    Ok(Json(notifications::list(&state.db, &user.user_id).await?))
}

async fn mark_notification_read(
    State(state): State<SharedState>,
    user: AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Notification>> {
    let id = require_id(&id, "notification")?;
    Ok(Json(notifications::mark_read(&state.db, &user.user_id, &id).await?))
}

async fn clear_notifications(State(state): State<SharedState>, user: AuthUser) -> AppResult<Json<Value>> {
    let cleared = notifications::clear(&state.db, &user.user_id).await?;
    Ok(Json(json!({ "cleared": cleared })))
}
