use crate::common::models::{
    from_millis, now_millis, Attachment, Bid, BidStatus, Milestone, MilestoneStatus, NotificationKind, Project,
    ProjectStatus, Role,
};
use crate::server::auth::AuthUser;
use crate::server::database::Database;
use crate::server::error::{is_unique_violation, AppError, AppResult, FieldError};
use crate::server::notifications;
use crate::server::state::AppState;
use crate::server::users;
use crate::server::validation::{rule, Check, Rule, Validate};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMilestone {
    pub title: String,
    pub description: Option<String>,
    pub amount: f64,
    pub due_date: Option<DateTime<Utc>>,
}

const MILESTONE_RULES: &[Rule] = &[
    rule("title", Check::Required, "Milestone title is required"),
    rule("amount", Check::Numeric, "Milestone amount must be a number"),
    rule("amount", Check::Positive, "Milestone amount must be greater than 0"),
    rule("dueDate", Check::Optional(&Check::Date), "Invalid due date"),
    rule("dueDate", Check::Optional(&Check::FutureDate), "Due date must be in the future"),
];

impl Validate for NewMilestone {
    const RULES: &'static [Rule] = MILESTONE_RULES;
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAttachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateProjectRequest {
    pub title: String,
    pub description: String,
    pub budget: f64,
    pub deadline: DateTime<Utc>,
    pub category: String,
    pub skills: Vec<String>,
    #[serde(default)]
    pub milestones: Vec<NewMilestone>,
    #[serde(default)]
    pub attachments: Vec<NewAttachment>,
}

const PROJECT_RULES: &[Rule] = &[
    rule("title", Check::Required, "Project title is required"),
    rule("description", Check::Required, "Project description is required"),
    rule("budget", Check::Numeric, "Budget must be a number"),
    rule("budget", Check::Positive, "Budget must be greater than 0"),
    rule("deadline", Check::Date, "Invalid deadline date"),
    rule("deadline", Check::FutureDate, "Deadline must be in the future"),
    rule("category", Check::Required, "Category is required"),
    rule("skills", Check::Array, "Skills must be an array"),
    rule("skills", Check::NonEmptyArray, "At least one skill is required"),
    rule("milestones", Check::Each(MILESTONE_RULES), "Invalid milestones"),
];

impl Validate for CreateProjectRequest {
    const RULES: &'static [Rule] = PROJECT_RULES;
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProjectRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub budget: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub skills: Option<Vec<String>>,
}

impl Validate for UpdateProjectRequest {
    const RULES: &'static [Rule] = PROJECT_RULES;
    const PARTIAL: bool = true;
}

#[derive(Debug, Clone, Deserialize)]
pub struct BidRequest {
    pub amount: f64,
    pub proposal: String,
    pub timeframe: f64,
}

impl Validate for BidRequest {
    const RULES: &'static [Rule] = &[
        rule("amount", Check::Numeric, "Bid amount must be a number"),
        rule("amount", Check::Positive, "Bid amount must be greater than 0"),
        rule("proposal", Check::Required, "Proposal is required"),
        rule("timeframe", Check::Numeric, "Timeframe must be a number"),
        rule("timeframe", Check::Positive, "Timeframe must be greater than 0"),
    ];
}

#[derive(Debug, Clone, Deserialize)]
pub struct MilestoneStatusRequest {
    pub status: MilestoneStatus,
}

impl Validate for MilestoneStatusRequest {
    const RULES: &'static [Rule] = &[rule(
        "status",
        Check::OneOf(&["pending", "in-progress", "completed", "paid"]),
        "Invalid milestone status",
    )];
}

/// Query-string filters for the project listing. Values arrive as text.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFilters {
    pub status: Option<String>,
    pub category: Option<String>,
    pub min_budget: Option<String>,
    pub max_budget: Option<String>,
    /// Comma separated; a project matches when it lists any of them.
    pub skills: Option<String>,
    pub search: Option<String>,
}

fn clean_skills(skills: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in skills.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if !out.iter().any(|o| o == s) {
            out.push(s.to_string());
        }
    }
    out
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// `%word%` with LIKE wildcards in `word` taken literally; pair with `ESCAPE '\'`.
fn like_pattern(word: &str) -> String {
    let mut out = String::with_capacity(word.len() + 2);
    out.push('%');
    for c in word.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

fn parse_budget(raw: &Option<String>, name: &str) -> AppResult<Option<f64>> {
    match non_empty(raw) {
        Some(s) => s
            .parse::<f64>()
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("{} must be a number", name))),
        None => Ok(None),
    }
}

fn row_to_project(row: &SqliteRow) -> Project {
    let status: String = row.get("status");
    let skills: String = row.get("skills");
    Project {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        client: None,
        client_id: row.get("client_id"),
        freelancer: None,
        freelancer_id: row.get("freelancer_id"),
        budget: row.get("budget"),
        deadline: from_millis(row.get("deadline")),
        category: row.get("category"),
        skills: serde_json::from_str(&skills).unwrap_or_default(),
        status: ProjectStatus::parse(&status).unwrap_or(ProjectStatus::Open),
        bids: Vec::new(),
        milestones: Vec::new(),
        attachments: Vec::new(),
        version: row.get("version"),
        created_at: from_millis(row.get("created_at")),
        updated_at: from_millis(row.get("updated_at")),
    }
}

fn row_to_bid(row: &SqliteRow) -> Bid {
    let status: String = row.get("status");
    Bid {
        id: row.get("id"),
        freelancer: None,
        freelancer_id: row.get("freelancer_id"),
        amount: row.get("amount"),
        proposal: row.get("proposal"),
        timeframe: row.get("timeframe"),
        status: BidStatus::parse(&status).unwrap_or(BidStatus::Pending),
        submitted_at: from_millis(row.get("submitted_at")),
    }
}

fn row_to_milestone(row: &SqliteRow) -> Milestone {
    let status: String = row.get("status");
    Milestone {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        amount: row.get("amount"),
        due_date: row.get::<Option<i64>, _>("due_date").map(from_millis),
        status: MilestoneStatus::parse(&status).unwrap_or(MilestoneStatus::Pending),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
    }
}

fn row_to_attachment(row: &SqliteRow) -> Attachment {
    Attachment {
        filename: row.get("filename"),
        url: row.get("url"),
        uploaded_by: row.get("uploaded_by"),
        uploaded_at: from_millis(row.get("uploaded_at")),
    }
}

/// Loads a project with its bids, milestones and attachments, and resolves user references.
pub async fn find_project(db: &Database, project_id: &str) -> AppResult<Option<Project>> {
    let Some(row) = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(project_id)
        .fetch_optional(&db.pool)
        .await?
    else {
        return Ok(None);
    };
    let mut project = row_to_project(&row);

    project.bids = sqlx::query("SELECT * FROM bids WHERE project_id = ? ORDER BY submitted_at, rowid")
        .bind(project_id)
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(row_to_bid)
        .collect();
    project.milestones = sqlx::query("SELECT * FROM milestones WHERE project_id = ? ORDER BY created_at, rowid")
        .bind(project_id)
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(row_to_milestone)
        .collect();
    project.attachments = sqlx::query("SELECT * FROM attachments WHERE project_id = ? ORDER BY id")
        .bind(project_id)
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(row_to_attachment)
        .collect();

    let mut ids: Vec<&str> = vec![project.client_id.as_str()];
    ids.extend(project.freelancer_id.as_deref());
    ids.extend(project.bids.iter().map(|b| b.freelancer_id.as_str()));
    let people = users::summaries(db, ids).await?;

    project.client = people.get(&project.client_id).cloned();
    project.freelancer = project.freelancer_id.as_ref().and_then(|id| people.get(id).cloned());
    for bid in project.bids.iter_mut() {
        bid.freelancer = people.get(&bid.freelancer_id).cloned();
    }
    Ok(Some(project))
}

pub async fn get_project(db: &Database, project_id: &str) -> AppResult<Project> {
    find_project(db, project_id)
        .await?
        .ok_or_else(|| AppError::not_found("Project not found"))
}

async fn insert_milestone(
    conn: &mut sqlx::SqliteConnection,
    project_id: &str,
    m: &NewMilestone,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO milestones (id, project_id, title, description, amount, due_date, status, created_at) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?)")
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(m.title.trim())
        .bind(m.description.as_deref().map(str::trim))
        .bind(m.amount)
        .bind(m.due_date.map(|d| d.timestamp_millis()))
        .bind(now_millis())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn create_project(state: &AppState, caller: &AuthUser, req: CreateProjectRequest) -> AppResult<Project> {
    if caller.role != Role::Client {
        return Err(AppError::forbidden("Only clients can post projects"));
    }
    let skills = clean_skills(&req.skills);
    if skills.is_empty() {
        return Err(AppError::Validation(vec![FieldError::new(
            "skills",
            "At least one skill is required",
            serde_json::json!(req.skills),
        )]));
    }

    let project_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    let skills_json = serde_json::to_string(&skills).map_err(anyhow::Error::from)?;

    let mut tx = state.db.pool.begin().await?;
    sqlx::query(
        "INSERT INTO projects (id, title, description, client_id, budget, deadline, category, skills, status, version, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', 0, ?, ?)",
    )
    .bind(&project_id)
    .bind(&req.title)
    .bind(&req.description)
    .bind(&caller.user_id)
    .bind(req.budget)
    .bind(req.deadline.timestamp_millis())
    .bind(&req.category)
    .bind(&skills_json)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    for m in &req.milestones {
        insert_milestone(&mut *tx, &project_id, m).await?;
    }
    for a in &req.attachments {
        sqlx::query("INSERT INTO attachments (project_id, filename, url, uploaded_by, uploaded_at) VALUES (?, ?, ?, ?, ?)")
            .bind(&project_id)
            .bind(&a.filename)
            .bind(&a.url)
            .bind(&caller.user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    log::info!("[PROJECTS] {} created project {} ({})", caller.user_id, project_id, req.title);
    get_project(&state.db, &project_id).await
}

pub async fn list_projects(db: &Database, filters: &ProjectFilters) -> AppResult<Vec<Project>> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT id FROM projects WHERE 1 = 1");

    if let Some(status) = non_empty(&filters.status) {
        let status = ProjectStatus::parse(status).ok_or_else(|| AppError::bad_request("Invalid status filter"))?;
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(category) = non_empty(&filters.category) {
        qb.push(" AND category = ").push_bind(category.to_string());
    }
    if let Some(min) = parse_budget(&filters.min_budget, "minBudget")? {
        qb.push(" AND budget >= ").push_bind(min);
    }
    if let Some(max) = parse_budget(&filters.max_budget, "maxBudget")? {
        qb.push(" AND budget <= ").push_bind(max);
    }
    if let Some(skills) = non_empty(&filters.skills) {
        let wanted: Vec<String> = skills.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        if !wanted.is_empty() {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(projects.skills) WHERE json_each.value IN (");
            let mut sep = qb.separated(", ");
            for s in wanted {
                sep.push_bind(s);
            }
            sep.push_unseparated("))");
        }
    }
    if let Some(search) = non_empty(&filters.search) {
        // any word may match any of the text columns
        qb.push(" AND (");
        for (i, word) in search.split_whitespace().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            let pattern = like_pattern(word);
            for (j, column) in ["title", "description", "category", "skills"].iter().enumerate() {
                if j > 0 {
                    qb.push(" OR ");
                }
                qb.push(*column).push(" LIKE ").push_bind(pattern.clone()).push(" ESCAPE '\\'");
            }
        }
        qb.push(")");
    }
    qb.push(" ORDER BY created_at DESC, rowid DESC");

    let ids: Vec<String> = qb
        .build()
        .fetch_all(&db.pool)
        .await?
        .iter()
        .map(|r| r.get("id"))
        .collect();

    let mut projects = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(p) = find_project(db, &id).await? {
            projects.push(p);
        }
    }
    Ok(projects)
}

pub async fn update_project(
    state: &AppState,
    caller: &AuthUser,
    project_id: &str,
    req: UpdateProjectRequest,
) -> AppResult<Project> {
    let project = get_project(&state.db, project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    if project.status != ProjectStatus::Open {
        return Err(AppError::bad_request("Only open projects can be edited"));
    }
    let skills = match &req.skills {
        Some(s) => {
            let cleaned = clean_skills(s);
            if cleaned.is_empty() {
                return Err(AppError::Validation(vec![FieldError::new(
                    "skills",
                    "At least one skill is required",
                    serde_json::json!(s),
                )]));
            }
            Some(serde_json::to_string(&cleaned).map_err(anyhow::Error::from)?)
        }
        None => None,
    };

    let res = sqlx::query(
        "UPDATE projects SET title = COALESCE(?, title), description = COALESCE(?, description), \
         budget = COALESCE(?, budget), deadline = COALESCE(?, deadline), category = COALESCE(?, category), \
         skills = COALESCE(?, skills), version = version + 1, updated_at = ? \
         WHERE id = ? AND status = 'open' AND version = ?",
    )
    .bind(req.title.as_deref())
    .bind(req.description.as_deref())
    .bind(req.budget)
    .bind(req.deadline.map(|d| d.timestamp_millis()))
    .bind(req.category.as_deref())
    .bind(skills)
    .bind(now_millis())
    .bind(project_id)
    .bind(project.version)
    .execute(&state.db.pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::conflict("Project was modified concurrently, reload and try again"));
    }

    log::info!("[PROJECTS] Project {} updated by {}", project_id, caller.user_id);
    get_project(&state.db, project_id).await
}

pub async fn delete_project(state: &AppState, caller: &AuthUser, project_id: &str) -> AppResult<()> {
    let project = get_project(&state.db, project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    match project.status {
        ProjectStatus::InProgress => return Err(AppError::bad_request("Cannot delete a project that is in progress")),
        ProjectStatus::Completed => return Err(AppError::bad_request("Cannot delete a completed project")),
        ProjectStatus::Open | ProjectStatus::Cancelled => {}
    }
    // payment records outlive the listing; only failed attempts may cascade away
    let res = sqlx::query(
        "DELETE FROM projects WHERE id = ? AND status IN ('open', 'cancelled') \
         AND NOT EXISTS (SELECT 1 FROM payments WHERE payments.project_id = projects.id AND payments.status != 'failed')",
    )
    .bind(project_id)
    .execute(&state.db.pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(AppError::conflict("Project changed state, reload and try again"));
    }
    log::info!("[PROJECTS] Project {} deleted by {}", project_id, caller.user_id);
    Ok(())
}

pub async fn submit_bid(state: &AppState, caller: &AuthUser, project_id: &str, req: BidRequest) -> AppResult<Project> {
    if caller.role != Role::Freelancer {
        return Err(AppError::forbidden("Only freelancers can submit bids"));
    }
    let project = get_project(&state.db, project_id).await?;
    if project.client_id == caller.user_id {
        return Err(AppError::bad_request("You cannot bid on your own project"));
    }
    if project.status != ProjectStatus::Open {
        return Err(AppError::bad_request("Project is not open for bids"));
    }
    if project.bids.iter().any(|b| b.freelancer_id == caller.user_id) {
        return Err(AppError::bad_request("You have already submitted a bid"));
    }

    let bid_id = uuid::Uuid::new_v4().to_string();
    let now = now_millis();
    // the status guard and the (project, freelancer) key make this safe against concurrent accepts and resubmits
    let inserted = sqlx::query(
        "INSERT INTO bids (id, project_id, freelancer_id, amount, proposal, timeframe, status, submitted_at) \
         SELECT ?, ?, ?, ?, ?, ?, 'pending', ? WHERE EXISTS (SELECT 1 FROM projects WHERE id = ? AND status = 'open')",
    )
    .bind(&bid_id)
    .bind(project_id)
    .bind(&caller.user_id)
    .bind(req.amount)
    .bind(req.proposal.trim())
    .bind(req.timeframe.ceil() as i64)
    .bind(now)
    .bind(project_id)
    .execute(&state.db.pool)
    .await;
    match inserted {
        Ok(res) if res.rows_affected() == 0 => {
            return Err(AppError::bad_request("Project is not open for bids"));
        }
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => {
            return Err(AppError::bad_request("You have already submitted a bid"));
        }
        Err(e) => return Err(e.into()),
    }
    sqlx::query("UPDATE projects SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(project_id)
        .execute(&state.db.pool)
        .await?;

    log::info!("[PROJECTS] Bid {} by {} on project {}", bid_id, caller.user_id, project_id);
    notifications::notify(
        state,
        &project.client_id,
        NotificationKind::BidReceived,
        &format!("New bid of {:.2} on \"{}\"", req.amount, project.title),
    )
    .await;

    get_project(&state.db, project_id).await
}

/// Accepts one bid and moves the project to in-progress.
///
/// The transition is a single guarded update on (status = open, version), so of
/// two concurrent accepts exactly one succeeds and the other gets a conflict.
/// Remaining pending bids are rejected in the same transaction.
pub async fn accept_bid(state: &AppState, caller: &AuthUser, project_id: &str, bid_id: &str) -> AppResult<Project> {
    let project = get_project(&state.db, project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    let bid = project
        .bid(bid_id)
        .ok_or_else(|| AppError::not_found("Bid not found"))?
        .clone();
    if project.status != ProjectStatus::Open {
        return Err(AppError::bad_request("Project is not open for bids"));
    }

    let now = now_millis();
    let mut tx = state.db.pool.begin().await?;
    let res = sqlx::query(
        "UPDATE projects SET status = 'in-progress', freelancer_id = ?, version = version + 1, updated_at = ? \
         WHERE id = ? AND status = 'open' AND version = ?",
    )
    .bind(&bid.freelancer_id)
    .bind(now)
    .bind(project_id)
    .bind(project.version)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        log::warn!("[PROJECTS] Lost accept race on project {} (bid {})", project_id, bid_id);
        return Err(AppError::conflict("Project was modified concurrently, reload and try again"));
    }
    sqlx::query("UPDATE bids SET status = 'accepted' WHERE id = ? AND project_id = ?")
        .bind(bid_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE bids SET status = 'rejected' WHERE project_id = ? AND id != ? AND status = 'pending'")
        .bind(project_id)
        .bind(bid_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    log::info!("[PROJECTS] Bid {} accepted on project {}", bid_id, project_id);
    notifications::notify(
        state,
        &bid.freelancer_id,
        NotificationKind::BidAccepted,
        &format!("Your bid on \"{}\" was accepted", project.title),
    )
    .await;

    get_project(&state.db, project_id).await
}

pub async fn add_milestone(state: &AppState, caller: &AuthUser, project_id: &str, req: NewMilestone) -> AppResult<Project> {
    let project = get_project(&state.db, project_id).await?;
    if project.client_id != caller.user_id {
        return Err(AppError::forbidden("Not authorized"));
    }
    if matches!(project.status, ProjectStatus::Completed | ProjectStatus::Cancelled) {
        return Err(AppError::bad_request("Project is closed"));
    }
    let mut conn = state.db.pool.acquire().await?;
    insert_milestone(&mut *conn, project_id, &req).await?;
    drop(conn);
    get_project(&state.db, project_id).await
}

/// The assigned freelancer may move a milestone through pending, in-progress and
/// completed; only the owner may mark it paid.
pub async fn update_milestone_status(
    state: &AppState,
    caller: &AuthUser,
    project_id: &str,
    milestone_id: &str,
    status: MilestoneStatus,
) -> AppResult<Project> {
    let project = get_project(&state.db, project_id).await?;
    let is_owner = project.client_id == caller.user_id;
    let is_assignee = project.freelancer_id.as_deref() == Some(caller.user_id.as_str());
    if !is_owner && !is_assignee {
        return Err(AppError::forbidden("Not authorized"));
    }
    if status == MilestoneStatus::Paid && !is_owner {
        return Err(AppError::forbidden("Only the project owner can mark a milestone paid"));
    }
    if !project.milestones.iter().any(|m| m.id == milestone_id) {
        return Err(AppError::not_found("Milestone not found"));
    }

    let completed_at = (status == MilestoneStatus::Completed).then(now_millis);
    sqlx::query("UPDATE milestones SET status = ?, completed_at = COALESCE(?, completed_at) WHERE id = ? AND project_id = ?")
        .bind(status.as_str())
        .bind(completed_at)
        .bind(milestone_id)
        .bind(project_id)
        .execute(&state.db.pool)
        .await?;
    get_project(&state.db, project_id).await
}
