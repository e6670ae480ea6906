//! Create/patch payloads and their form-level checks.
//!
//! Every field is optional so the same type serves as a create body (where
//! `validate(true)` enforces required fields) and as a partial patch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::entities::{FeedbackType, TaskPriority, TaskStatus, UserStatus};

pub const MIN_PASSWORD_LEN: usize = 8;

/// One failed check on one field, in the backend error `data` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub code: String,
    pub message: String,
}

pub type FieldErrors = BTreeMap<String, FieldError>;

fn reject(errors: &mut FieldErrors, field: &str, code: &str, message: &str) {
    errors.entry(field.to_string()).or_insert_with(|| FieldError {
        code: code.to_string(),
        message: message.to_string(),
    });
}

/// Required on create; when present it must not be blank.
fn check_text(errors: &mut FieldErrors, field: &str, value: Option<&str>, creating: bool) {
    match value {
        Some(v) if v.trim().is_empty() => {
            reject(errors, field, "validation_required", "Cannot be blank.")
        }
        None if creating => reject(errors, field, "validation_required", "Cannot be blank."),
        _ => {}
    }
}

fn finish(errors: FieldErrors) -> Result<(), FieldErrors> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.contains(char::is_whitespace) {
        return false;
    }
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.contains('@')
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS[.fff]Z` and bare `YYYY-MM-DD`
/// (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let trimmed = raw.trim_end_matches('Z');
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

// ── Tasks ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignees: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub departments: Option<Vec<Uuid>>,
    /// Empty string clears the due date.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

impl TaskInput {
    pub fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_text(&mut errors, "title", self.title.as_deref(), creating);
        if let Some(raw) = self.due_date.as_deref() {
            if !raw.trim().is_empty() && parse_timestamp(raw).is_none() {
                reject(&mut errors, "due_date", "validation_invalid_date", "Must be a valid date.");
            }
        }
        finish(errors)
    }

    /// `Some(None)` clears, `None` leaves the field alone.
    pub fn due_date_patch(&self) -> Option<Option<DateTime<Utc>>> {
        self.due_date.as_deref().map(|raw| {
            if raw.trim().is_empty() {
                None
            } else {
                parse_timestamp(raw)
            }
        })
    }
}

// ── Departments / groups / roles ──────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CodeInput {
    pub fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_text(&mut errors, "name", self.name.as_deref(), creating);
        check_text(&mut errors, "code", self.code.as_deref(), creating);
        finish(errors)
    }
}

// ── Users ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "phoneNumber", skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "passwordConfirm", skip_serializing_if = "Option::is_none")]
    pub password_confirm: Option<String>,
    /// Filled in by the server after hashing `password`; never read from a body.
    #[serde(skip)]
    pub password_hash: Option<String>,
}

impl UserInput {
    /// `creating` also requires a password; accounts created by the OAuth flow
    /// carry a hash instead and skip the password checks.
    pub fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_text(&mut errors, "username", self.username.as_deref(), creating);
        check_text(&mut errors, "email", self.email.as_deref(), creating);
        if let Some(email) = self.email.as_deref() {
            if !email.trim().is_empty() && !is_valid_email(email) {
                reject(&mut errors, "email", "validation_invalid_email", "Must be a valid email address.");
            }
        }

        let needs_password = creating && self.password_hash.is_none();
        match self.password.as_deref() {
            Some(pw) => {
                if pw.chars().count() < MIN_PASSWORD_LEN {
                    reject(
                        &mut errors,
                        "password",
                        "validation_length_out_of_range",
                        "Must be at least 8 characters.",
                    );
                }
                if self.password_confirm.as_deref() != Some(pw) {
                    reject(&mut errors, "passwordConfirm", "validation_values_mismatch", "Values don't match.");
                }
            }
            None if needs_password => {
                reject(&mut errors, "password", "validation_required", "Cannot be blank.")
            }
            None => {}
        }
        finish(errors)
    }
}

// ── Feedbacks ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<FeedbackType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl FeedbackInput {
    pub fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_text(&mut errors, "message", self.message.as_deref(), creating);
        if creating && self.task.is_none() {
            reject(&mut errors, "task", "validation_required", "Cannot be blank.");
        }
        finish(errors)
    }
}

// ── OAuth sessions (server-internal) ──────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OAuthSessionInput {
    pub code: Option<String>,
    pub user: Option<Uuid>,
    pub state: Option<String>,
    pub used: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthSessionInput {
    pub fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        let mut errors = FieldErrors::new();
        check_text(&mut errors, "code", self.code.as_deref(), creating);
        if creating && self.user.is_none() {
            reject(&mut errors, "user", "validation_required", "Cannot be blank.");
        }
        if creating && self.expires_at.is_none() {
            reject(&mut errors, "expiresAt", "validation_required", "Cannot be blank.");
        }
        finish(errors)
    }
}

// ── Tests ──────────────────────────────────────────────────────
