use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use uuid::Uuid;

use crate::dto::{CodeInput, FeedbackInput, FieldErrors, OAuthSessionInput, TaskInput, UserInput};
use crate::entities::{CodeRecord, Collection, Feedback, OAuthSession, Record, Task, User};

/// Bounded replay window for reconnecting subscribers.
pub const LOG_CAPACITY: usize = 1024;

// ── Commands ──────────────────────────────────────────────────

/// Payload of a create or patch, tagged with its collection.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordInput {
    Task(TaskInput),
    Department(CodeInput),
    Group(CodeInput),
    Role(CodeInput),
    User(UserInput),
    Feedback(FeedbackInput),
    OAuthSession(OAuthSessionInput),
}

impl RecordInput {
    pub fn collection(&self) -> Collection {
        match self {
            RecordInput::Task(_) => Collection::Tasks,
            RecordInput::Department(_) => Collection::Departments,
            RecordInput::Group(_) => Collection::Groups,
            RecordInput::Role(_) => Collection::Roles,
            RecordInput::User(_) => Collection::Users,
            RecordInput::Feedback(_) => Collection::Feedbacks,
            RecordInput::OAuthSession(_) => Collection::OAuthSessions,
        }
    }

    fn validate(&self, creating: bool) -> Result<(), FieldErrors> {
        match self {
            RecordInput::Task(i) => i.validate(creating),
            RecordInput::Department(i) | RecordInput::Group(i) | RecordInput::Role(i) => {
                i.validate(creating)
            }
            RecordInput::User(i) => i.validate(creating),
            RecordInput::Feedback(i) => i.validate(creating),
            RecordInput::OAuthSession(i) => i.validate(creating),
        }
    }
}

/// Something a caller wants to happen. `World::apply` validates it and
/// returns the Event describing what actually happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create { input: RecordInput },
    /// Partial patch: absent fields are left alone.
    Update { id: Uuid, input: RecordInput },
    Delete { collection: Collection, id: Uuid },
}

/// Who issued a command. Record hooks read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Option<Uuid>,
    pub superuser: bool,
}

impl Actor {
    /// Seeds, OAuth callbacks and other server-side writes.
    pub fn system() -> Self {
        Actor { user_id: None, superuser: true }
    }

    /// Unauthenticated caller (registration).
    pub fn guest() -> Self {
        Actor { user_id: None, superuser: false }
    }

    pub fn user(user_id: Uuid, superuser: bool) -> Self {
        Actor { user_id: Some(user_id), superuser }
    }

    /// Who a task's `createdBy`/`updatedBy` records. Superusers leave no trace.
    fn author(&self) -> Option<Uuid> {
        if self.superuser {
            None
        } else {
            self.user_id
        }
    }
}

// ── Events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

/// What happened. Each event carries the revision it was applied at and the
/// full record (its last state for deletes).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Created { revision: u64, record: Record },
    Updated { revision: u64, record: Record },
    Deleted { revision: u64, record: Record },
}

impl Event {
    pub fn revision(&self) -> u64 {
        match self {
            Event::Created { revision, .. }
            | Event::Updated { revision, .. }
            | Event::Deleted { revision, .. } => *revision,
        }
    }

    pub fn record(&self) -> &Record {
        match self {
            Event::Created { record, .. }
            | Event::Updated { record, .. }
            | Event::Deleted { record, .. } => record,
        }
    }

    pub fn action(&self) -> Action {
        match self {
            Event::Created { .. } => Action::Create,
            Event::Updated { .. } => Action::Update,
            Event::Deleted { .. } => Action::Delete,
        }
    }

    pub fn collection(&self) -> Collection {
        self.record().collection()
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldError {
    NotFound,
    Invalid(FieldErrors),
    /// A relation field points at a record that does not exist.
    RelationNotFound { field: &'static str },
    Duplicate { field: &'static str },
    /// Delete refused: records in `collection` still reference the target.
    StillReferenced { collection: Collection },
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorldError::NotFound => write!(f, "The requested resource wasn't found."),
            WorldError::Invalid(_) => write!(f, "Failed to validate the submitted data."),
            WorldError::RelationNotFound { field } => {
                write!(f, "Field `{field}` references a record that doesn't exist.")
            }
            WorldError::Duplicate { field } => write!(f, "Value of `{field}` must be unique."),
            WorldError::StillReferenced { collection } => {
                write!(f, "The record is still referenced by {collection}.")
            }
        }
    }
}

impl std::error::Error for WorldError {}

// ── The World ──────────────────────────────────────────────────

/// The authoritative state of every collection. Lives in memory, loaded from
/// redb on boot. All mutations go through apply().
#[derive(Debug, Default)]
pub struct World {
    pub tasks: HashMap<Uuid, Task>,
    pub departments: HashMap<Uuid, CodeRecord>,
    pub groups: HashMap<Uuid, CodeRecord>,
    pub roles: HashMap<Uuid, CodeRecord>,
    pub users: HashMap<Uuid, User>,
    pub feedbacks: HashMap<Uuid, Feedback>,
    pub oauth_sessions: HashMap<Uuid, OAuthSession>,
    pub revision: u64,
    /// Recent events for reconnect replay, oldest first.
    pub log: VecDeque<(u64, Event)>,
}

impl World {
    pub fn new() -> Self {
        World::default()
    }

    /// Apply a command. This is the only mutation path after boot; a failed
    /// command leaves records, revision and log untouched.
    pub fn apply(&mut self, cmd: Command, actor: Actor) -> Result<Event, WorldError> {
        let now = Utc::now();
        match cmd {
            Command::Create { input } => {
                input.validate(true).map_err(WorldError::Invalid)?;
                let record = match input {
                    RecordInput::Task(i) => {
                        let due_date = i.due_date_patch().flatten();
                        let assignees = dedup(i.assignees.unwrap_or_default());
                        let departments = dedup(i.departments.unwrap_or_default());
                        self.check_users("assignees", &assignees)?;
                        self.check_departments(&departments)?;
                        Record::Task(Task {
                            id: Uuid::new_v4(),
                            title: trimmed(i.title.as_deref()),
                            description: i.description.unwrap_or_default(),
                            status: i.status.unwrap_or_default(),
                            priority: i.priority.unwrap_or_default(),
                            label: trimmed(i.label.as_deref()),
                            due_date,
                            assignees,
                            departments,
                            created_by: actor.author(),
                            updated_by: actor.author(),
                            created: now,
                            updated: now,
                        })
                    }
                    RecordInput::Department(i) => {
                        Record::Department(self.new_code_record(Collection::Departments, i)?)
                    }
                    RecordInput::Group(i) => Record::Group(self.new_code_record(Collection::Groups, i)?),
                    RecordInput::Role(i) => Record::Role(self.new_code_record(Collection::Roles, i)?),
                    RecordInput::User(i) => {
                        let username = trimmed(i.username.as_deref());
                        let email = trimmed(i.email.as_deref());
                        self.check_user_unique(None, &username, &email)?;
                        let roles = dedup(i.roles.unwrap_or_default());
                        self.check_roles(&roles)?;
                        Record::User(User {
                            id: Uuid::new_v4(),
                            name: trimmed(i.name.as_deref()),
                            username,
                            email,
                            phone_number: trimmed(i.phone_number.as_deref()),
                            avatar: i.avatar.unwrap_or_default(),
                            status: i.status.unwrap_or_default(),
                            roles,
                            verified: i.verified.unwrap_or(false),
                            password_hash: i.password_hash.unwrap_or_default(),
                            created: now,
                            updated: now,
                        })
                    }
                    RecordInput::Feedback(i) => {
                        let sender = i
                            .sender
                            .or(actor.user_id)
                            .ok_or(WorldError::RelationNotFound { field: "sender" })?;
                        if !self.users.contains_key(&sender) {
                            return Err(WorldError::RelationNotFound { field: "sender" });
                        }
                        let task = i.task.ok_or(WorldError::RelationNotFound { field: "task" })?;
                        if !self.tasks.contains_key(&task) {
                            return Err(WorldError::RelationNotFound { field: "task" });
                        }
                        Record::Feedback(Feedback {
                            id: Uuid::new_v4(),
                            message: i.message.unwrap_or_default(),
                            kind: i.kind.unwrap_or_default(),
                            sender,
                            task,
                            timestamp: i.timestamp.unwrap_or(now),
                            created: now,
                            updated: now,
                        })
                    }
                    RecordInput::OAuthSession(i) => {
                        let user = i.user.ok_or(WorldError::RelationNotFound { field: "user" })?;
                        if !self.users.contains_key(&user) {
                            return Err(WorldError::RelationNotFound { field: "user" });
                        }
                        let code = i.code.unwrap_or_default();
                        if self.oauth_sessions.values().any(|s| s.code == code) {
                            return Err(WorldError::Duplicate { field: "code" });
                        }
                        Record::OAuthSession(OAuthSession {
                            id: Uuid::new_v4(),
                            code,
                            user,
                            used: i.used.unwrap_or(false),
                            state: i.state.unwrap_or_default(),
                            expires_at: i.expires_at.unwrap_or(now),
                            created: now,
                        })
                    }
                };

                self.insert_record(record.clone());
                Ok(self.commit(|revision| Event::Created { revision, record }))
            }

            Command::Update { id, input } => {
                input.validate(false).map_err(WorldError::Invalid)?;
                let record = match input {
                    RecordInput::Task(i) => {
                        let mut task = self.tasks.get(&id).cloned().ok_or(WorldError::NotFound)?;
                        if let Some(assignees) = i.assignees.clone() {
                            let assignees = dedup(assignees);
                            self.check_users("assignees", &assignees)?;
                            task.assignees = assignees;
                        }
                        if let Some(departments) = i.departments.clone() {
                            let departments = dedup(departments);
                            self.check_departments(&departments)?;
                            task.departments = departments;
                        }
                        if let Some(title) = i.title.as_deref() {
                            task.title = title.trim().to_string();
                        }
                        if let Some(description) = i.description.clone() {
                            task.description = description;
                        }
                        if let Some(status) = i.status {
                            task.status = status;
                        }
                        if let Some(priority) = i.priority {
                            task.priority = priority;
                        }
                        if let Some(label) = i.label.as_deref() {
                            task.label = label.trim().to_string();
                        }
                        if let Some(due) = i.due_date_patch() {
                            task.due_date = due;
                        }
                        if let Some(author) = actor.author() {
                            task.updated_by = Some(author);
                        }
                        task.updated = now;
                        Record::Task(task)
                    }
                    RecordInput::Department(i) => {
                        Record::Department(self.patch_code_record(Collection::Departments, id, i, now)?)
                    }
                    RecordInput::Group(i) => {
                        Record::Group(self.patch_code_record(Collection::Groups, id, i, now)?)
                    }
                    RecordInput::Role(i) => Record::Role(self.patch_code_record(Collection::Roles, id, i, now)?),
                    RecordInput::User(i) => {
                        let mut user = self.users.get(&id).cloned().ok_or(WorldError::NotFound)?;
                        let username = i.username.as_deref().map(str::trim).unwrap_or(&user.username).to_string();
                        let email = i.email.as_deref().map(str::trim).unwrap_or(&user.email).to_string();
                        self.check_user_unique(Some(id), &username, &email)?;
                        if let Some(roles) = i.roles {
                            let roles = dedup(roles);
                            self.check_roles(&roles)?;
                            user.roles = roles;
                        }
                        user.username = username;
                        user.email = email;
                        if let Some(name) = i.name.as_deref() {
                            user.name = name.trim().to_string();
                        }
                        if let Some(phone) = i.phone_number.as_deref() {
                            user.phone_number = phone.trim().to_string();
                        }
                        if let Some(avatar) = i.avatar {
                            user.avatar = avatar;
                        }
                        if let Some(status) = i.status {
                            user.status = status;
                        }
                        if let Some(verified) = i.verified {
                            user.verified = verified;
                        }
                        if let Some(hash) = i.password_hash {
                            user.password_hash = hash;
                        }
                        user.updated = now;
                        Record::User(user)
                    }
                    RecordInput::Feedback(i) => {
                        let mut feedback = self.feedbacks.get(&id).cloned().ok_or(WorldError::NotFound)?;
                        if let Some(sender) = i.sender {
                            if !self.users.contains_key(&sender) {
                                return Err(WorldError::RelationNotFound { field: "sender" });
                            }
                            feedback.sender = sender;
                        }
                        if let Some(task) = i.task {
                            if !self.tasks.contains_key(&task) {
                                return Err(WorldError::RelationNotFound { field: "task" });
                            }
                            feedback.task = task;
                        }
                        if let Some(message) = i.message {
                            feedback.message = message;
                        }
                        if let Some(kind) = i.kind {
                            feedback.kind = kind;
                        }
                        if let Some(timestamp) = i.timestamp {
                            feedback.timestamp = timestamp;
                        }
                        feedback.updated = now;
                        Record::Feedback(feedback)
                    }
                    RecordInput::OAuthSession(i) => {
                        let mut session = self.oauth_sessions.get(&id).cloned().ok_or(WorldError::NotFound)?;
                        if let Some(used) = i.used {
                            session.used = used;
                        }
                        if let Some(expires_at) = i.expires_at {
                            session.expires_at = expires_at;
                        }
                        Record::OAuthSession(session)
                    }
                };

                self.insert_record(record.clone());
                Ok(self.commit(|revision| Event::Updated { revision, record }))
            }

            Command::Delete { collection, id } => {
                if self.get(collection, id).is_none() {
                    return Err(WorldError::NotFound);
                }
                if let Some(referrer) = self.referenced_by(collection, id) {
                    return Err(WorldError::StillReferenced { collection: referrer });
                }
                let record = self.remove_record(collection, id).ok_or(WorldError::NotFound)?;
                Ok(self.commit(|revision| Event::Deleted { revision, record }))
            }
        }
    }

    /// Bump the revision, build the event and append it to the bounded log.
    fn commit(&mut self, build: impl FnOnce(u64) -> Event) -> Event {
        self.revision += 1;
        let event = build(self.revision);
        self.log.push_back((self.revision, event.clone()));
        while self.log.len() > LOG_CAPACITY {
            self.log.pop_front();
        }
        event
    }

    // ── Record access ──────────────────────────────────────────

    /// Put a record in place without producing an event. Used on boot and by
    /// seeding, and by apply() once a command has been validated.
    pub fn insert_record(&mut self, record: Record) {
        match record {
            Record::Task(t) => {
                self.tasks.insert(t.id, t);
            }
            Record::Department(r) => {
                self.departments.insert(r.id, r);
            }
            Record::Group(r) => {
                self.groups.insert(r.id, r);
            }
            Record::Role(r) => {
                self.roles.insert(r.id, r);
            }
            Record::User(u) => {
                self.users.insert(u.id, u);
            }
            Record::Feedback(f) => {
                self.feedbacks.insert(f.id, f);
            }
            Record::OAuthSession(s) => {
                self.oauth_sessions.insert(s.id, s);
            }
        }
    }

    fn remove_record(&mut self, collection: Collection, id: Uuid) -> Option<Record> {
        match collection {
            Collection::Tasks => self.tasks.remove(&id).map(Record::Task),
            Collection::Departments => self.departments.remove(&id).map(Record::Department),
            Collection::Groups => self.groups.remove(&id).map(Record::Group),
            Collection::Roles => self.roles.remove(&id).map(Record::Role),
            Collection::Users => self.users.remove(&id).map(Record::User),
            Collection::Feedbacks => self.feedbacks.remove(&id).map(Record::Feedback),
            Collection::OAuthSessions => self.oauth_sessions.remove(&id).map(Record::OAuthSession),
        }
    }

    pub fn get(&self, collection: Collection, id: Uuid) -> Option<Record> {
        match collection {
            Collection::Tasks => self.tasks.get(&id).cloned().map(Record::Task),
            Collection::Departments => self.departments.get(&id).cloned().map(Record::Department),
            Collection::Groups => self.groups.get(&id).cloned().map(Record::Group),
            Collection::Roles => self.roles.get(&id).cloned().map(Record::Role),
            Collection::Users => self.users.get(&id).cloned().map(Record::User),
            Collection::Feedbacks => self.feedbacks.get(&id).cloned().map(Record::Feedback),
            Collection::OAuthSessions => self.oauth_sessions.get(&id).cloned().map(Record::OAuthSession),
        }
    }

    /// Every record of a collection, in no particular order.
    pub fn records(&self, collection: Collection) -> Vec<Record> {
        match collection {
            Collection::Tasks => self.tasks.values().cloned().map(Record::Task).collect(),
            Collection::Departments => self.departments.values().cloned().map(Record::Department).collect(),
            Collection::Groups => self.groups.values().cloned().map(Record::Group).collect(),
            Collection::Roles => self.roles.values().cloned().map(Record::Role).collect(),
            Collection::Users => self.users.values().cloned().map(Record::User).collect(),
            Collection::Feedbacks => self.feedbacks.values().cloned().map(Record::Feedback).collect(),
            Collection::OAuthSessions => self.oauth_sessions.values().cloned().map(Record::OAuthSession).collect(),
        }
    }

    /// Look up a user by e-mail (case-insensitive) or exact username.
    pub fn get_user_by_identity(&self, identity: &str) -> Option<&User> {
        let identity = identity.trim();
        self.users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(identity) || u.username == identity)
    }

    pub fn get_user_by_email(&self, email: &str) -> Option<&User> {
        let email = email.trim();
        self.users.values().find(|u| u.email.eq_ignore_ascii_case(email))
    }

    pub fn role_by_code(&self, code: &str) -> Option<&CodeRecord> {
        self.roles.values().find(|r| r.code == code)
    }

    /// A superuser is a user holding the `admin` role.
    pub fn is_superuser(&self, user_id: Uuid) -> bool {
        let Some(user) = self.users.get(&user_id) else {
            return false;
        };
        user.roles
            .iter()
            .filter_map(|id| self.roles.get(id))
            .any(|role| role.code == crate::persist::ADMIN_ROLE)
    }

    pub fn oauth_session_by_code(&self, code: &str) -> Option<&OAuthSession> {
        self.oauth_sessions.values().find(|s| s.code == code)
    }

    pub fn oauth_session_by_state(&self, state: &str) -> Option<&OAuthSession> {
        self.oauth_sessions.values().find(|s| s.state == state)
    }

    /// Events after `since_rev` for reconnect replay, oldest first.
    /// `None` if the log no longer reaches back that far.
    pub fn events_since(&self, since_rev: u64) -> Option<Vec<(u64, Event)>> {
        if since_rev >= self.revision {
            return Some(Vec::new());
        }
        match self.log.front() {
            Some((oldest, _)) if *oldest <= since_rev + 1 => Some(
                self.log
                    .iter()
                    .filter(|(rev, _)| *rev > since_rev)
                    .cloned()
                    .collect(),
            ),
            _ => None,
        }
    }

    // ── Validation helpers ─────────────────────────────────────

    fn code_records(&self, collection: Collection) -> &HashMap<Uuid, CodeRecord> {
        match collection {
            Collection::Departments => &self.departments,
            Collection::Groups => &self.groups,
            _ => &self.roles,
        }
    }

    fn check_code_unique(&self, collection: Collection, except: Option<Uuid>, code: &str) -> Result<(), WorldError> {
        let taken = self
            .code_records(collection)
            .values()
            .any(|r| Some(r.id) != except && r.code.eq_ignore_ascii_case(code));
        if taken {
            Err(WorldError::Duplicate { field: "code" })
        } else {
            Ok(())
        }
    }

    fn new_code_record(&self, collection: Collection, input: CodeInput) -> Result<CodeRecord, WorldError> {
        let code = trimmed(input.code.as_deref());
        self.check_code_unique(collection, None, &code)?;
        let now = Utc::now();
        Ok(CodeRecord {
            id: Uuid::new_v4(),
            name: trimmed(input.name.as_deref()),
            code,
            created: now,
            updated: now,
        })
    }

    fn patch_code_record(
        &self,
        collection: Collection,
        id: Uuid,
        input: CodeInput,
        now: chrono::DateTime<Utc>,
    ) -> Result<CodeRecord, WorldError> {
        let mut record = self.code_records(collection).get(&id).cloned().ok_or(WorldError::NotFound)?;
        if let Some(code) = input.code.as_deref() {
            let code = code.trim();
            self.check_code_unique(collection, Some(id), code)?;
            record.code = code.to_string();
        }
        if let Some(name) = input.name.as_deref() {
            record.name = name.trim().to_string();
        }
        record.updated = now;
        Ok(record)
    }

    fn check_user_unique(&self, except: Option<Uuid>, username: &str, email: &str) -> Result<(), WorldError> {
        for user in self.users.values().filter(|u| Some(u.id) != except) {
            if user.username == username {
                return Err(WorldError::Duplicate { field: "username" });
            }
            if user.email.eq_ignore_ascii_case(email) {
                return Err(WorldError::Duplicate { field: "email" });
            }
        }
        Ok(())
    }

    fn check_users(&self, field: &'static str, ids: &[Uuid]) -> Result<(), WorldError> {
        if ids.iter().all(|id| self.users.contains_key(id)) {
            Ok(())
        } else {
            Err(WorldError::RelationNotFound { field })
        }
    }

    fn check_departments(&self, ids: &[Uuid]) -> Result<(), WorldError> {
        if ids.iter().all(|id| self.departments.contains_key(id)) {
            Ok(())
        } else {
            Err(WorldError::RelationNotFound { field: "departments" })
        }
    }

    fn check_roles(&self, ids: &[Uuid]) -> Result<(), WorldError> {
        if ids.iter().all(|id| self.roles.contains_key(id)) {
            Ok(())
        } else {
            Err(WorldError::RelationNotFound { field: "roles" })
        }
    }

    /// First collection with a record pointing at `id` through a membership
    /// or required relation. Audit fields (createdBy, updatedBy) and OAuth
    /// sessions may dangle and never block a delete.
    fn referenced_by(&self, collection: Collection, id: Uuid) -> Option<Collection> {
        match collection {
            Collection::Users => {
                if self.tasks.values().any(|t| t.assignees.contains(&id)) {
                    Some(Collection::Tasks)
                } else if self.feedbacks.values().any(|f| f.sender == id) {
                    Some(Collection::Feedbacks)
                } else {
                    None
                }
            }
            Collection::Tasks => self
                .feedbacks
                .values()
                .any(|f| f.task == id)
                .then_some(Collection::Feedbacks),
            Collection::Departments => self
                .tasks
                .values()
                .any(|t| t.departments.contains(&id))
                .then_some(Collection::Tasks),
            Collection::Roles => self
                .users
                .values()
                .any(|u| u.roles.contains(&id))
                .then_some(Collection::Users),
            Collection::Groups | Collection::Feedbacks | Collection::OAuthSessions => None,
        }
    }
}

fn trimmed(value: Option<&str>) -> String {
    value.map(str::trim).unwrap_or_default().to_string()
}

/// Drop repeated ids, keeping first-seen order.
fn dedup(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

// ── Tests ──────────────────────────────────────────────────────
