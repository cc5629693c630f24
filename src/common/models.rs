// Common models shared between the HTTP API and the socket server
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Converts a stored millisecond timestamp back into a UTC datetime.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Freelancer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Freelancer => "freelancer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "client" => Some(Role::Client),
            "freelancer" => Some(Role::Freelancer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    pub avatar: Option<String>,
    pub bio: Option<String>,
}

/// Full user record as returned by `/api/auth/me`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub profile: Profile,
    pub is_online: bool,
    pub created_at: DateTime<Utc>,
}

/// The populated form of a user reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub email: String,
    pub profile: Profile,
    pub is_online: bool,
}

impl From<User> for UserSummary {
    fn from(u: User) -> Self {
        Self {
            id: u.id,
            username: u.username,
            email: u.email,
            profile: u.profile,
            is_online: u.is_online,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Open => "open",
            ProjectStatus::InProgress => "in-progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ProjectStatus::Open),
            "in-progress" => Some(ProjectStatus::InProgress),
            "completed" => Some(ProjectStatus::Completed),
            "cancelled" => Some(ProjectStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Pending => "pending",
            BidStatus::Accepted => "accepted",
            BidStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BidStatus::Pending),
            "accepted" => Some(BidStatus::Accepted),
            "rejected" => Some(BidStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    pub id: String,
    pub freelancer: Option<UserSummary>,
    pub freelancer_id: String,
    pub amount: f64,
    pub proposal: String,
    /// Delivery time in days.
    pub timeframe: i64,
    pub status: BidStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MilestoneStatus {
    Pending,
    InProgress,
    Completed,
    Paid,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::InProgress => "in-progress",
            MilestoneStatus::Completed => "completed",
            MilestoneStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MilestoneStatus::Pending),
            "in-progress" => Some(MilestoneStatus::InProgress),
            "completed" => Some(MilestoneStatus::Completed),
            "paid" => Some(MilestoneStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub amount: f64,
    pub due_date: Option<DateTime<Utc>>,
    pub status: MilestoneStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub url: String,
    pub uploaded_by: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    pub description: String,
    pub client: Option<UserSummary>,
    pub client_id: String,
    pub freelancer: Option<UserSummary>,
    pub freelancer_id: Option<String>,
    pub budget: f64,
    pub deadline: DateTime<Utc>,
    pub category: String,
    pub skills: Vec<String>,
    pub status: ProjectStatus,
    pub bids: Vec<Bid>,
    pub milestones: Vec<Milestone>,
    pub attachments: Vec<Attachment>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn bid(&self, bid_id: &str) -> Option<&Bid> {
        self.bids.iter().find(|b| b.id == bid_id)
    }

    pub fn accepted_bid(&self) -> Option<&Bid> {
        self.bids.iter().find(|b| b.status == BidStatus::Accepted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnreadCount {
    pub user: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<UserSummary>,
    pub project: Option<ProjectRef>,
    pub last_message: Option<Message>,
    pub unread_counts: Vec<UnreadCount>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn unread_for(&self, user_id: &str) -> i64 {
        self.unread_counts
            .iter()
            .find(|u| u.user == user_id)
            .map(|u| u.count)
            .unwrap_or(0)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.id == user_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageAttachment {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation: String,
    pub sender: Option<UserSummary>,
    pub sender_id: String,
    pub content: String,
    pub attachments: Vec<MessageAttachment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    /// Funds captured and held by the platform until release.
    Held,
    Released,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Held => "held",
            PaymentStatus::Released => "released",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "held" => Some(PaymentStatus::Held),
            "released" => Some(PaymentStatus::Released),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: String,
    pub project_id: String,
    pub bid_id: String,
    pub payer_id: String,
    pub payee_id: String,
    pub amount: f64,
    pub fee: f64,
    pub total: f64,
    pub status: PaymentStatus,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    BidReceived,
    BidAccepted,
    PaymentHeld,
    PaymentReleased,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BidReceived => "bid_received",
            NotificationKind::BidAccepted => "bid_accepted",
            NotificationKind::PaymentHeld => "payment_held",
            NotificationKind::PaymentReleased => "payment_released",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bid_received" => Some(NotificationKind::BidReceived),
            "bid_accepted" => Some(NotificationKind::BidAccepted),
            "payment_held" => Some(NotificationKind::PaymentHeld),
            "payment_released" => Some(NotificationKind::PaymentReleased),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_status_uses_kebab_case_on_the_wire() {
        let json = serde_json::to_string(&ProjectStatus::InProgress).unwrap();
        assert_eq!(json, "\"in-progress\"");
        assert_eq!(ProjectStatus::parse("in-progress"), Some(ProjectStatus::InProgress));
        assert_eq!(ProjectStatus::parse("done"), None);
    }

    #[test]
    fn unread_for_missing_participant_is_zero() {
        let now = Utc::now();
        let conv = Conversation {
            id: "c1".into(),
            participants: vec![],
            project: None,
            last_message: None,
            unread_counts: vec![UnreadCount { user: "a".into(), count: 3 }],
            created_at: now,
            updated_at: now,
        };
        assert_eq!(conv.unread_for("a"), 3);
        assert_eq!(conv.unread_for("b"), 0);
    }

    #[test]
    fn millis_round_trip_keeps_precision() {
        let ms = 1_700_000_000_123;
        assert_eq!(from_millis(ms).timestamp_millis(), ms);
    }
}
