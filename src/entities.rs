//! Record types for every collection.
//!
//! Shared by the server (save file, HTTP bodies) and the client (decoded list
//! responses). JSON names follow the collection schema (`phoneNumber`,
//! `createdBy`, ...). Postcard ignores field names, so renames are safe for the
//! save file; anything that changes field presence or order is not.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ── Collections ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Collection {
    #[serde(rename = "tasks")]
    Tasks,
    #[serde(rename = "departments")]
    Departments,
    #[serde(rename = "groups")]
    Groups,
    #[serde(rename = "roles")]
    Roles,
    #[serde(rename = "users")]
    Users,
    #[serde(rename = "feedbacks")]
    Feedbacks,
    #[serde(rename = "oauth_sessions")]
    OAuthSessions,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Tasks,
        Collection::Departments,
        Collection::Groups,
        Collection::Roles,
        Collection::Users,
        Collection::Feedbacks,
        Collection::OAuthSessions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Departments => "departments",
            Collection::Groups => "groups",
            Collection::Roles => "roles",
            Collection::Users => "users",
            Collection::Feedbacks => "feedbacks",
            Collection::OAuthSessions => "oauth_sessions",
        }
    }

    /// Internal collections are never exposed over the records API or realtime.
    pub fn is_public(self) -> bool {
        self != Collection::OAuthSessions
    }

    /// Fields accepted by `sort`. Filters may reference anything in the JSON.
    pub fn sortable_fields(self) -> &'static [&'static str] {
        match self {
            Collection::Tasks => &[
                "id", "title", "description", "status", "priority", "label", "due_date",
                "createdBy", "updatedBy", "created", "updated",
            ],
            Collection::Departments | Collection::Groups | Collection::Roles => {
                &["id", "name", "code", "created", "updated"]
            }
            Collection::Users => &[
                "id", "name", "username", "email", "phoneNumber", "status", "verified",
                "created", "updated",
            ],
            Collection::Feedbacks => &[
                "id", "message", "type", "sender", "task", "timestamp", "created", "updated",
            ],
            Collection::OAuthSessions => &["id", "created"],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown collection `{s}`"))
    }
}

// ── Enums ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    #[default]
    Todo,
    InProgress,
    Done,
    Canceled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Backlog,
        TaskStatus::Todo,
        TaskStatus::InProgress,
        TaskStatus::Done,
        TaskStatus::Canceled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Canceled => "canceled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    #[default]
    Comment,
    Report,
}

impl FeedbackType {
    pub fn as_str(self) -> &'static str {
        match self {
            FeedbackType::Comment => "comment",
            FeedbackType::Report => "report",
        }
    }
}

// ── Entity types ──────────────────────────────────────────────

/// A unit of work. `assignees` and `departments` are relation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub assignees: Vec<Uuid>,
    #[serde(default)]
    pub departments: Vec<Uuid>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, rename = "createdBy")]
    pub created_by: Option<Uuid>,
    #[serde(default, rename = "updatedBy")]
    pub updated_by: Option<Uuid>,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
}

/// Departments, groups and roles share the same name + code shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, rename = "phoneNumber")]
    pub phone_number: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub status: UserStatus,
    #[serde(default)]
    pub roles: Vec<Uuid>,
    #[serde(default)]
    pub verified: bool,
    /// Stripped from every JSON view by `Record::to_json`.
    #[serde(default, rename = "passwordHash")]
    pub password_hash: String,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
}

/// A comment or report attached to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub kind: FeedbackType,
    pub sender: Uuid,
    pub task: Uuid,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub updated: DateTime<Utc>,
}

/// Single-use code handed to the frontend after a Mattermost login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthSession {
    pub id: Uuid,
    pub code: String,
    pub user: Uuid,
    pub used: bool,
    pub state: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

// ── Record ─────────────────────────────────────────────────────

/// Any record of any collection. This is what events carry and what the
/// save file stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Record {
    Task(Task),
    Department(CodeRecord),
    Group(CodeRecord),
    Role(CodeRecord),
    User(User),
    Feedback(Feedback),
    OAuthSession(OAuthSession),
}

impl Record {
    pub fn id(&self) -> Uuid {
        match self {
            Record::Task(t) => t.id,
            Record::Department(r) | Record::Group(r) | Record::Role(r) => r.id,
            Record::User(u) => u.id,
            Record::Feedback(f) => f.id,
            Record::OAuthSession(s) => s.id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            Record::Task(_) => Collection::Tasks,
            Record::Department(_) => Collection::Departments,
            Record::Group(_) => Collection::Groups,
            Record::Role(_) => Collection::Roles,
            Record::User(_) => Collection::Users,
            Record::Feedback(_) => Collection::Feedbacks,
            Record::OAuthSession(_) => Collection::OAuthSessions,
        }
    }

    /// Public JSON view: schema field names plus `collectionName`,
    /// never the password hash.
    pub fn to_json(&self) -> Value {
        let mut value = match self {
            Record::Task(t) => serde_json::to_value(t),
            Record::Department(r) | Record::Group(r) | Record::Role(r) => serde_json::to_value(r),
            Record::User(u) => serde_json::to_value(u),
            Record::Feedback(f) => serde_json::to_value(f),
            Record::OAuthSession(s) => serde_json::to_value(s),
        }
        .unwrap_or_default();

        if let Value::Object(map) = &mut value {
            map.remove("passwordHash");
            map.insert(
                "collectionName".to_string(),
                Value::String(self.collection().as_str().to_string()),
            );
        }
        value
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User {
            id: Uuid::new_v4(),
            name: "Lan Pham".into(),
            username: "lan".into(),
            email: "lan@example.com".into(),
            phone_number: "0901".into(),
            avatar: String::new(),
            status: UserStatus::Active,
            roles: vec![],
            verified: true,
            password_hash: "$argon2id$secret".into(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    #[test]
    fn collection_names_round_trip() {
        for c in Collection::ALL {
            assert_eq!(c.as_str().parse::<Collection>().unwrap(), c);
        }
        assert!("comments".parse::<Collection>().is_err());
        assert!(!Collection::OAuthSessions.is_public());
    }

    #[test]
    fn user_json_never_contains_password_hash() {
        let json = Record::User(user()).to_json();
        assert!(json.get("passwordHash").is_none());
        assert_eq!(json["phoneNumber"], "0901");
        assert_eq!(json["collectionName"], "users");
    }

    #[test]
    fn task_decodes_with_missing_fields() {
        let id = Uuid::new_v4();
        let json = serde_json::json!({ "id": id, "title": "Ship it" });
        let task: Task = serde_json::from_value(json).unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.assignees.is_empty());
    }

    #[test]
    fn feedback_type_uses_schema_name() {
        let fb = Feedback {
            id: Uuid::new_v4(),
            message: "looks good".into(),
            kind: FeedbackType::Report,
            sender: Uuid::new_v4(),
            task: Uuid::new_v4(),
            timestamp: Utc::now(),
            created: Utc::now(),
            updated: Utc::now(),
        };
        let json = Record::Feedback(fb).to_json();
        assert_eq!(json["type"], "report");
    }

    #[test]
    fn records_survive_postcard() {
        let record = Record::User(user());
        let bytes = postcard::to_allocvec(&record).unwrap();
        let back: Record = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, record);
    }
}
