use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bidhub::server::routes::build_router;
use bidhub::server::state::AppState;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn app() -> Router {
    build_router(AppState::in_memory().await.unwrap())
}

async fn call(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        req = req.header("x-auth-token", token);
    }
    let req = match body {
        Some(body) => req
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => req.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, value)
}

/// Registers a user and returns `(token, id)`.
async fn register(app: &Router, name: &str, role: &str) -> (String, String) {
    let (status, body) = call(
        app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({
            "username": name,
            "email": format!("{}@example.com", name),
            "password": "secret123",
            "role": role,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    (body["token"].as_str().unwrap().to_string(), body["user"]["id"].as_str().unwrap().to_string())
}

fn project_body() -> Value {
    json!({
        "title": "  Marketplace redesign ",
        "description": "New landing and checkout pages",
        "budget": "1200",
        "deadline": "2999-06-30",
        "category": "Web Development",
        "skills": ["React", "CSS"],
    })
}

async fn open_project(app: &Router, client: &str) -> String {
    let (status, project) = call(app, "POST", "/api/projects", Some(client), Some(project_body())).await;
    assert_eq!(status, StatusCode::CREATED, "{}", project);
    project["id"].as_str().unwrap().to_string()
}

async fn bid(app: &Router, freelancer: &str, project_id: &str, amount: f64) -> (StatusCode, Value) {
    call(
        app,
        "POST",
        &format!("/api/projects/{}/bid", project_id),
        Some(freelancer),
        Some(json!({ "amount": amount, "proposal": "I have shipped five of these", "timeframe": 14 })),
    )
    .await
}

#[tokio::test]
async fn health_is_public() {
    let app = app().await;
    let (status, body) = call(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn registration_reports_one_error_per_field() {
    let app = app().await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/auth/register",
        None,
        Some(json!({ "username": "ab", "email": "not-an-email", "password": "", "role": "client" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let errors = body["errors"].as_array().unwrap();
    let params: Vec<&str> = errors.iter().map(|e| e["param"].as_str().unwrap()).collect();
    assert_eq!(params, vec!["username", "email", "password"]);
    assert_eq!(errors[2]["msg"], "Password is required");
    assert_eq!(errors[0]["location"], "body");
}

#[tokio::test]
async fn protected_routes_require_a_valid_token() {
    let app = app().await;
    let (status, body) = call(&app, "GET", "/api/auth/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "No token, authorization denied");

    let (status, body) = call(&app, "GET", "/api/auth/me", Some("forged"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Token is not valid");

    let (token, id) = register(&app, "carol", "client").await;
    let (status, body) = call(&app, "GET", "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["email"], "carol@example.com");

    let (status, _) = call(&app, "POST", "/api/auth/logout", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/api/auth/me", Some(&token), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn bearer_tokens_are_accepted() {
    let app = app().await;
    let (token, _) = register(&app, "dora", "freelancer").await;
    let req = Request::builder()
        .uri("/api/auth/me")
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn project_validation_and_sanitizing() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;

    let mut bad = project_body();
    bad["budget"] = json!("lots");
    bad["skills"] = json!([]);
    bad["deadline"] = json!("2001-01-01");
    let (status, body) = call(&app, "POST", "/api/projects", Some(&client), Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let msgs: Vec<&str> = body["errors"].as_array().unwrap().iter().map(|e| e["msg"].as_str().unwrap()).collect();
    assert_eq!(msgs, vec!["Budget must be a number", "Deadline must be in the future", "At least one skill is required"]);

    let (status, project) = call(&app, "POST", "/api/projects", Some(&client), Some(project_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(project["title"], "Marketplace redesign");
    assert_eq!(project["budget"], 1200.0);
    assert_eq!(project["status"], "open");
    assert_eq!(project["client"]["username"], "client");
}

#[tokio::test]
async fn project_reads_require_a_login() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;
    let project_id = open_project(&app, &client).await;

    let (status, body) = call(&app, "GET", "/api/projects", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "No token, authorization denied");
    let (status, body) = call(&app, "GET", &format!("/api/projects/{}", project_id), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.get("bids").is_none());

    let (status, listed) = call(&app, "GET", "/api/projects", Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn nested_milestones_follow_the_milestone_rules() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;

    let mut body = project_body();
    body["milestones"] = json!([
        { "title": " Wireframes ", "amount": "300", "dueDate": "2999-01-01" },
        { "title": "Launch", "amount": 500 },
    ]);
    let (status, project) = call(&app, "POST", "/api/projects", Some(&client), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", project);
    assert_eq!(project["milestones"][0]["title"], "Wireframes");
    assert_eq!(project["milestones"][0]["amount"], 300.0);
    assert!(project["milestones"][0]["dueDate"].as_str().unwrap().starts_with("2999-01-01"));
    let project_id = project["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &app,
        "POST",
        &format!("/api/projects/{}/milestones", project_id),
        Some(&client),
        Some(json!({ "title": "Polish", "amount": 100, "dueDate": "2999-01-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let mut body = project_body();
    body["milestones"] = json!([
        { "title": "Wireframes", "amount": 300 },
        { "title": "", "amount": 200, "dueDate": "2001-01-01" },
    ]);
    let (status, body) = call(&app, "POST", "/api/projects", Some(&client), Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let params: Vec<&str> = body["errors"].as_array().unwrap().iter().map(|e| e["param"].as_str().unwrap()).collect();
    assert_eq!(params, vec!["milestones[1].title", "milestones[1].dueDate"]);

    let (status, body) = call(
        &app,
        "POST",
        &format!("/api/projects/{}/milestones", project_id),
        Some(&client),
        Some(json!({ "title": "Late", "amount": 100, "dueDate": "2001-01-01" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["msg"], "Due date must be in the future");
}

#[tokio::test]
async fn completed_projects_cannot_be_deleted() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;
    let (alice, _) = register(&app, "alice", "freelancer").await;
    let project_id = open_project(&app, &client).await;
    let (_, project) = bid(&app, &alice, &project_id, 1000.0).await;
    let bid_id = project["bids"][0]["id"].as_str().unwrap().to_string();
    call(&app, "POST", &format!("/api/projects/{}/bid/{}/accept", project_id, bid_id), Some(&client), None).await;
    let (_, intent) = call(
        &app,
        "POST",
        "/api/payments/create-intent",
        Some(&client),
        Some(json!({ "projectId": project_id, "bidId": bid_id, "amount": 1000 })),
    )
    .await;
    let intent_id = intent["id"].as_str().unwrap().to_string();
    let (status, _) = call(
        &app,
        "POST",
        "/api/payments/process",
        Some(&client),
        Some(json!({
            "paymentIntentId": intent_id,
            "cardNumber": "4242424242424242",
            "expiryDate": "12/99",
            "cvc": "123",
            "name": "Client Person",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "POST", &format!("/api/payments/release/{}/{}", project_id, bid_id), Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "DELETE", &format!("/api/projects/{}", project_id), Some(&client), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Cannot delete a completed project");

    let (_, history) = call(&app, "GET", "/api/payments/history", Some(&alice), None).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
    let (status, _) = call(&app, "GET", &format!("/api/payments/{}", intent_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_and_unknown_ids() {
    let app = app().await;
    let (token, _) = register(&app, "erin", "freelancer").await;
    let (status, body) = call(&app, "GET", "/api/projects/mock1", Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid project id");

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(&app, "GET", &format!("/api/projects/{}", missing), Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["message"], "Project not found");
}

#[tokio::test]
async fn bid_lifecycle_over_http() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;
    let (alice, alice_id) = register(&app, "alice", "freelancer").await;
    let (bob, _) = register(&app, "bob", "freelancer").await;

    let (status, _) = call(&app, "POST", "/api/projects", Some(&alice), Some(project_body())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let project_id = open_project(&app, &client).await;

    let (status, _) = bid(&app, &client, &project_id, 900.0).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, project) = bid(&app, &alice, &project_id, 900.0).await;
    assert_eq!(status, StatusCode::OK);
    let bid_id = project["bids"][0]["id"].as_str().unwrap().to_string();
    assert_eq!(project["bids"][0]["freelancer"]["username"], "alice");

    let (status, body) = bid(&app, &alice, &project_id, 850.0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "You have already submitted a bid");

    bid(&app, &bob, &project_id, 1000.0).await;

    let accept = format!("/api/projects/{}/bid/{}/accept", project_id, bid_id);
    let (status, body) = call(&app, "POST", &accept, Some(&bob), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Not authorized");

    let (status, project) = call(&app, "POST", &accept, Some(&client), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(project["status"], "in-progress");
    assert_eq!(project["freelancer"]["id"], alice_id.as_str());
    let statuses: Vec<&str> = project["bids"].as_array().unwrap().iter().map(|b| b["status"].as_str().unwrap()).collect();
    assert_eq!(statuses, vec!["accepted", "rejected"]);

    let (status, body) = bid(&app, &bob, &project_id, 700.0).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Project is not open for bids");

    let (_, listed) = call(&app, "GET", "/api/projects?status=in-progress", Some(&alice), None).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let (_, listed) = call(&app, "GET", "/api/projects?status=open", Some(&alice), None).await;
    assert!(listed.as_array().unwrap().is_empty());

    let (_, inbox) = call(&app, "GET", "/api/notifications", Some(&alice), None).await;
    assert_eq!(inbox[0]["type"], "bid_accepted");
}

#[tokio::test]
async fn chat_over_http() {
    let app = app().await;
    let (client, client_id) = register(&app, "client", "client").await;
    let (alice, alice_id) = register(&app, "alice", "freelancer").await;
    let (mallory, _) = register(&app, "mallory", "freelancer").await;

    let (status, first) = call(&app, "POST", "/api/chat/conversations", Some(&client), Some(json!({ "participantId": alice_id }))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, second) = call(&app, "POST", "/api/chat/conversations", Some(&alice), Some(json!({ "participantId": client_id }))).await;
    assert_eq!(first["id"], second["id"]);
    let conversation_id = first["id"].as_str().unwrap().to_string();

    let (status, body) = call(&app, "POST", "/api/chat/conversations", Some(&client), Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"][0]["msg"], "Participant ID is required");

    let (status, message) = call(
        &app,
        "POST",
        "/api/chat/messages",
        Some(&client),
        Some(json!({ "conversationId": conversation_id, "content": " hi alice " })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(message["content"], "hi alice");
    assert_eq!(message["sender"]["username"], "client");

    let (status, _) = call(
        &app,
        "POST",
        "/api/chat/messages",
        Some(&mallory),
        Some(json!({ "conversationId": conversation_id, "content": "let me in" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, conversations) = call(&app, "GET", "/api/chat/conversations", Some(&alice), None).await;
    let conv = &conversations[0];
    assert_eq!(conv["lastMessage"]["content"], "hi alice");
    let unread = conv["unreadCounts"].as_array().unwrap();
    let count_for = |id: &str| unread.iter().find(|u| u["user"] == id).map(|u| u["count"].as_i64().unwrap());
    assert_eq!(count_for(&alice_id), Some(1));
    assert_eq!(count_for(&client_id), Some(0));

    let read = format!("/api/chat/conversations/{}/read", conversation_id);
    let (status, body) = call(&app, "POST", &read, Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, messages) = call(&app, "GET", &format!("/api/chat/conversations/{}/messages", conversation_id), Some(&alice), None).await;
    assert_eq!(messages.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, "GET", &format!("/api/chat/conversations/{}/messages", conversation_id), Some(&mallory), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn payment_flow_over_http() {
    let app = app().await;
    let (client, _) = register(&app, "client", "client").await;
    let (alice, _) = register(&app, "alice", "freelancer").await;
    let project_id = open_project(&app, &client).await;
    let (_, project) = bid(&app, &alice, &project_id, 1000.0).await;
    let bid_id = project["bids"][0]["id"].as_str().unwrap().to_string();
    call(&app, "POST", &format!("/api/projects/{}/bid/{}/accept", project_id, bid_id), Some(&client), None).await;

    let (status, intent) = call(
        &app,
        "POST",
        "/api/payments/create-intent",
        Some(&client),
        Some(json!({ "projectId": project_id, "bidId": bid_id, "amount": 1000 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", intent);
    assert_eq!(intent["fee"], 50.0);
    assert_eq!(intent["total"], 1050.0);
    assert_eq!(intent["status"], "pending");
    let intent_id = intent["id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        "/api/payments/process",
        Some(&client),
        Some(json!({ "paymentIntentId": intent_id, "cardNumber": "4242", "expiryDate": "1/9", "cvc": "12", "name": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errors"].as_array().unwrap().len(), 4);

    let (status, paid) = call(
        &app,
        "POST",
        "/api/payments/process",
        Some(&client),
        Some(json!({
            "paymentIntentId": intent_id,
            "cardNumber": "4242 4242 4242 4242",
            "expiryDate": "12/99",
            "cvc": "123",
            "name": "Client Person",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", paid);
    assert_eq!(paid["status"], "held");
    assert_eq!(paid["cardLast4"], "4242");
    assert!(!paid.to_string().contains("4242424242424242"));

    let (status, details) = call(&app, "GET", &format!("/api/payments/{}", intent_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(details["status"], "held");

    let (status, released) = call(
        &app,
        "POST",
        &format!("/api/payments/release/{}/{}", project_id, bid_id),
        Some(&client),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(released["status"], "released");

    let (_, project) = call(&app, "GET", &format!("/api/projects/{}", project_id), Some(&alice), None).await;
    assert_eq!(project["status"], "completed");

    let (_, history) = call(&app, "GET", "/api/payments/history", Some(&alice), None).await;
    assert_eq!(history.as_array().unwrap().len(), 1);

    let (_, inbox) = call(&app, "GET", "/api/notifications", Some(&alice), None).await;
    let first_id = inbox[0]["id"].as_str().unwrap().to_string();
    assert_eq!(inbox[0]["type"], "payment_released");
    let (status, marked) = call(&app, "POST", &format!("/api/notifications/{}/read", first_id), Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(marked["read"], true);
    let (_, cleared) = call(&app, "DELETE", "/api/notifications", Some(&alice), None).await;
    assert_eq!(cleared["cleared"], 3);
}
