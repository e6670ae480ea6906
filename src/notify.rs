//! Mattermost bot posts.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

use crate::auth::AuthUser;
use crate::config::MattermostSettings;
use crate::entities::Task;
use crate::error::ApiError;
use crate::state::SharedState;

#[derive(Debug, Serialize)]
struct PostBody<'a> {
    channel_id: &'a str,
    message: &'a str,
}

/// The subset of Mattermost's post object we read back.
#[derive(Debug, Clone, Deserialize)]
pub struct MattermostPost {
    pub id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub create_at: i64,
}

#[derive(Debug, Deserialize)]
struct MattermostErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug)]
pub enum NotifyError {
    NotConfigured,
    Http(reqwest::Error),
    /// Mattermost answered with something other than 201.
    Rejected { status: u16, message: String },
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::NotConfigured => write!(f, "mattermost bot is not configured"),
            NotifyError::Http(e) => write!(f, "mattermost request failed: {e}"),
            NotifyError::Rejected { status, message } => {
                write!(f, "mattermost rejected the post with status {status}: {message}")
            }
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(e: reqwest::Error) -> Self {
        NotifyError::Http(e)
    }
}

/// Mentions go on their own line above the message.
pub fn format_message(message: &str, usernames: &[String]) -> String {
    let mentions: Vec<String> = usernames
        .iter()
        .map(|u| u.trim().trim_start_matches('@'))
        .filter(|u| !u.is_empty())
        .map(|u| format!("@{u}"))
        .collect();
    if mentions.is_empty() {
        message.to_string()
    } else {
        format!("{}\n{message}", mentions.join(" "))
    }
}

pub async fn post_message(
    http: &reqwest::Client,
    settings: &MattermostSettings,
    channel_id: &str,
    message: &str,
    usernames: &[String],
) -> Result<MattermostPost, NotifyError> {
    if !settings.bot_configured() {
        return Err(NotifyError::NotConfigured);
    }
    let message = format_message(message, usernames);
    let response = http
        .post(format!("{}/api/v4/posts", settings.server()))
        .bearer_auth(&settings.bot_token)
        .json(&PostBody { channel_id, message: &message })
        .send()
        .await?;

    let status = response.status();
    if status != reqwest::StatusCode::CREATED {
        let message = response
            .json::<MattermostErrorBody>()
            .await
            .map(|body| body.message)
            .unwrap_or_else(|e| format!("undecodable error body: {e}"));
        return Err(NotifyError::Rejected { status: status.as_u16(), message });
    }
    Ok(response.json().await?)
}

/// Announce a new task to its assignees in the configured channel. Runs in
/// the background; failures are only logged.
pub fn spawn_task_notification(state: &SharedState, task: &Task) {
    let settings = &state.settings.mattermost;
    if task.assignees.is_empty() || settings.task_channel_id.is_empty() || !settings.bot_configured() {
        return;
    }

    let usernames: Vec<String> = {
        let world = state.read_world();
        task.assignees
            .iter()
            .filter_map(|id| world.users.get(id))
            .map(|u| u.username.clone())
            .collect()
    };
    let mut message = format!("New task assigned: **{}** (priority: {})", task.title, task.priority.as_str());
    if let Some(due) = task.due_date {
        message.push_str(&format!(", due {}", due.format("%Y-%m-%d")));
    }

    let state = state.clone();
    let task_id = task.id;
    tokio::spawn(async move {
        let settings = &state.settings.mattermost;
        match post_message(&state.http, settings, &settings.task_channel_id, &message, &usernames).await {
            Ok(post) => tracing::info!(task = %task_id, post = %post.id, "task notification posted"),
            Err(e) => tracing::warn!(task = %task_id, error = %e, "task notification failed"),
        }
    });
}

// ── Handler ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NotificationRequest {
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub usernames: Vec<String>,
}

// POST /api/notifications/mattermost
pub async fn post_notification(
    State(state): State<SharedState>,
    _auth: AuthUser,
    Json(body): Json<NotificationRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.channel_id.trim().is_empty() || body.message.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "Missing required fields: channel_id, message are required".into(),
        ));
    }

    let post = post_message(
        &state.http,
        &state.settings.mattermost,
        &body.channel_id,
        &body.message,
        &body.usernames,
    )
    .await
    .map_err(|e| match e {
        NotifyError::NotConfigured => ApiError::Unavailable("Mattermost notifications are not configured.".into()),
        other => ApiError::Internal(other.to_string()),
    })?;

    Ok(Json(json!({
        "success": true,
        "message": "Message posted successfully to Mattermost",
        "data": {
            "message_id": post.id,
            "channel_id": post.channel_id,
            "created_at": post.create_at.to_string(),
        },
    })))
}

// ── Tests ──────────────────────────────────────────────────────
