//! Per-collection wrappers with typed filters.

use chrono::Utc;
use futures_util::future::try_join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::realtime::RealtimeClient;
use super::store::{Identified, ListStore, Placement, SyncMode};
use super::{Client, ClientError, RecordService};
use crate::dto::{CodeInput, FeedbackInput, TaskInput, UserInput};
use crate::entities::{CodeRecord, Collection, Feedback, FeedbackType, Task, TaskPriority, TaskStatus, User, UserStatus};
use crate::filter::Filter;
use crate::query::{ListParams, ListResult, MAX_PER_PAGE};

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PER_PAGE: u32 = 20;
pub const DEFAULT_SORT: &str = "-created";

// ── Entries with expansions ────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserExpand {
    #[serde(default)]
    pub roles: Vec<CodeRecord>,
}

/// A user as listed, roles expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(flatten)]
    pub user: User,
    #[serde(default)]
    pub expand: UserExpand,
}

impl UserEntry {
    pub fn role_codes(&self) -> impl Iterator<Item = &str> {
        self.expand.roles.iter().map(|r| r.code.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackExpand {
    #[serde(default)]
    pub sender: Option<User>,
}

/// A feedback with its sender expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    #[serde(flatten)]
    pub feedback: Feedback,
    #[serde(default)]
    pub expand: FeedbackExpand,
}

impl FeedbackEntry {
    /// Sender name for display; unknown when the sender is gone.
    pub fn sender_name(&self) -> &str {
        self.expand.sender.as_ref().map_or("Unknown User", |u| u.name.as_str())
    }
}

impl Identified for UserEntry {
    fn id(&self) -> Uuid {
        self.user.id
    }
}

impl Identified for FeedbackEntry {
    fn id(&self) -> Uuid {
        self.feedback.id
    }
}

// ── Filters ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Paging {
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub sort: Option<String>,
}

pub trait ListFilter: Clone + Default + Send + Sync {
    fn paging(&self) -> &Paging;
    fn paging_mut(&mut self) -> &mut Paging;
    fn to_filter(&self) -> Filter;
}

macro_rules! paging_accessors {
    () => {
        fn paging(&self) -> &Paging {
            &self.paging
        }
        fn paging_mut(&mut self) -> &mut Paging {
            &mut self.paging
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub paging: Paging,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub assignee: Option<Uuid>,
    pub label: Option<String>,
    pub search: Option<String>,
}

impl ListFilter for TaskFilter {
    paging_accessors!();

    fn to_filter(&self) -> Filter {
        let mut f = Filter::all();
        if let Some(status) = self.status {
            f = f.eq("status", status.as_str());
        }
        if let Some(priority) = self.priority {
            f = f.eq("priority", priority.as_str());
        }
        if let Some(assignee) = self.assignee {
            f = f.any_eq("assignees", &assignee.to_string());
        }
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty()) {
            f = f.eq("label", label);
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            f = f.group(Filter::any().contains("title", search).contains("description", search));
        }
        f
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DepartmentFilter {
    pub paging: Paging,
    pub name: Option<String>,
    pub code: Option<String>,
}

impl ListFilter for DepartmentFilter {
    paging_accessors!();

    fn to_filter(&self) -> Filter {
        let mut f = Filter::any();
        if let Some(name) = self.name.as_deref().filter(|s| !s.is_empty()) {
            f = f.contains("name", name);
        }
        if let Some(code) = self.code.as_deref().filter(|s| !s.is_empty()) {
            f = f.contains("code", code);
        }
        f
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupFilter {
    pub paging: Paging,
    pub name: Option<String>,
    pub code: Option<String>,
}

impl ListFilter for GroupFilter {
    paging_accessors!();

    fn to_filter(&self) -> Filter {
        let mut f = Filter::all();
        if let Some(name) = self.name.as_deref().filter(|s| !s.is_empty()) {
            f = f.contains("name", name);
        }
        if let Some(code) = self.code.as_deref().filter(|s| !s.is_empty()) {
            f = f.eq("code", code);
        }
        f
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserFilter {
    pub paging: Paging,
    pub status: Option<UserStatus>,
    /// Role record id.
    pub role: Option<Uuid>,
    pub search: Option<String>,
}

impl ListFilter for UserFilter {
    paging_accessors!();

    fn to_filter(&self) -> Filter {
        let mut f = Filter::all();
        if let Some(status) = self.status {
            f = f.eq("status", status.as_str());
        }
        if let Some(role) = self.role {
            f = f.any_eq("roles", &role.to_string());
        }
        if let Some(search) = self.search.as_deref().filter(|s| !s.is_empty()) {
            f = f.group(
                Filter::any()
                    .contains("name", search)
                    .contains("username", search)
                    .contains("email", search),
            );
        }
        f
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackFilter {
    pub paging: Paging,
    pub kind: Option<FeedbackType>,
    pub task: Option<Uuid>,
    pub sender: Option<Uuid>,
}

impl ListFilter for FeedbackFilter {
    paging_accessors!();

    fn to_filter(&self) -> Filter {
        let mut f = Filter::all();
        if let Some(kind) = self.kind {
            f = f.eq("type", kind.as_str());
        }
        if let Some(task) = self.task {
            f = f.eq("task", &task.to_string());
        }
        if let Some(sender) = self.sender {
            f = f.eq("sender", &sender.to_string());
        }
        f
    }
}

// ── Resources ──────────────────────────────────────────────────

/// Binds a collection to its item, filter and input types.
pub trait Resource: Send + Sync + 'static {
    const COLLECTION: Collection;
    const DEFAULT_SORT: &'static str = DEFAULT_SORT;
    /// Sort a list store starts with.
    const STORE_SORT: &'static str = DEFAULT_SORT;
    const EXPAND: Option<&'static str> = None;
    const PLACEMENT: Placement = Placement::Front;
    const MODE: SyncMode = SyncMode::Patch;

    type Item: DeserializeOwned + Identified + Clone + Send;
    type Filter: ListFilter;
    type Input: Serialize + Sync;
}

#[derive(Debug, Clone, Copy)]
pub struct Tasks;
#[derive(Debug, Clone, Copy)]
pub struct Departments;
#[derive(Debug, Clone, Copy)]
pub struct Groups;
#[derive(Debug, Clone, Copy)]
pub struct Users;
#[derive(Debug, Clone, Copy)]
pub struct Feedbacks;

impl Resource for Tasks {
    const COLLECTION: Collection = Collection::Tasks;
    type Item = Task;
    type Filter = TaskFilter;
    type Input = TaskInput;
}

impl Resource for Departments {
    const COLLECTION: Collection = Collection::Departments;
    const STORE_SORT: &'static str = "name";
    type Item = CodeRecord;
    type Filter = DepartmentFilter;
    type Input = CodeInput;
}

impl Resource for Groups {
    const COLLECTION: Collection = Collection::Groups;
    type Item = CodeRecord;
    type Filter = GroupFilter;
    type Input = CodeInput;
}

impl Resource for Users {
    const COLLECTION: Collection = Collection::Users;
    const EXPAND: Option<&'static str> = Some("roles");
    const MODE: SyncMode = SyncMode::Invalidate;
    type Item = UserEntry;
    type Filter = UserFilter;
    type Input = UserInput;
}

impl Resource for Feedbacks {
    const COLLECTION: Collection = Collection::Feedbacks;
    const DEFAULT_SORT: &'static str = "timestamp";
    const STORE_SORT: &'static str = "timestamp";
    const EXPAND: Option<&'static str> = Some("sender");
    const PLACEMENT: Placement = Placement::Back;
    type Item = FeedbackEntry;
    type Filter = FeedbackFilter;
    type Input = FeedbackInput;
}

// ── API ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EntityApi<R: Resource> {
    records: RecordService,
    _resource: PhantomData<R>,
}

pub type TasksApi = EntityApi<Tasks>;
pub type DepartmentsApi = EntityApi<Departments>;
pub type GroupsApi = EntityApi<Groups>;
pub type UsersApi = EntityApi<Users>;
pub type FeedbacksApi = EntityApi<Feedbacks>;

impl<R: Resource> EntityApi<R> {
    pub fn new(client: &Client) -> Self {
        EntityApi { records: client.collection(R::COLLECTION), _resource: PhantomData }
    }

    /// Query parameters for a filter, defaults filled in.
    pub fn params(filter: &R::Filter) -> ListParams {
        let paging = filter.paging();
        let built = filter.to_filter();
        ListParams {
            page: Some(paging.page.unwrap_or(DEFAULT_PAGE)),
            per_page: Some(paging.per_page.unwrap_or(DEFAULT_PER_PAGE)),
            sort: Some(paging.sort.clone().unwrap_or_else(|| R::DEFAULT_SORT.to_string())),
            filter: (!built.is_empty()).then(|| built.build()),
            expand: R::EXPAND.map(str::to_string),
            skip_total: None,
        }
    }

    pub async fn list(&self, filter: &R::Filter) -> Result<ListResult<R::Item>, ClientError> {
        self.records.get_list(&Self::params(filter)).await
    }

    pub async fn get(&self, id: Uuid) -> Result<R::Item, ClientError> {
        self.records.get_one(id, R::EXPAND).await
    }

    pub async fn create(&self, input: &R::Input) -> Result<R::Item, ClientError> {
        self.records.create(input, R::EXPAND).await
    }

    pub async fn update(&self, id: Uuid, input: &R::Input) -> Result<R::Item, ClientError> {
        self.records.update(id, input, R::EXPAND).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
        self.records.delete(id).await
    }

    /// Delete concurrently; the first failure is returned.
    pub async fn delete_many(&self, ids: &[Uuid]) -> Result<(), ClientError> {
        try_join_all(ids.iter().map(|id| self.records.delete(*id))).await?;
        Ok(())
    }

    /// Subscribe to every change in the collection, expanded like lists.
    pub fn subscribe(&self, realtime: &RealtimeClient, since: Option<u64>) -> Result<(), ClientError> {
        realtime.subscribe(&[format!("{}/*", R::COLLECTION)], R::EXPAND, since)
    }

    /// An empty store and the filter it starts with.
    pub fn new_store(&self) -> (ListStore<R::Item>, R::Filter) {
        let mut store = ListStore::new(R::PLACEMENT, R::MODE);
        store.set_auth_id(self.records.client().auth().user_id());
        let mut filter = R::Filter::default();
        filter.paging_mut().sort = Some(R::STORE_SORT.to_string());
        (store, filter)
    }

    /// Fetch into a shared store. A response that lost the race to a newer
    /// refresh is dropped.
    pub async fn refresh(&self, store: &Mutex<ListStore<R::Item>>, filter: &R::Filter) -> bool {
        let ticket = {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = store.set_filter(&filter.to_filter().build()) {
                store.error = Some(e.to_string());
            }
            store.begin_fetch()
        };
        let result = self.list(filter).await;
        store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .finish_fetch(ticket, result)
    }
}

// ── Statistics ─────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCounts {
    pub low: usize,
    pub medium: usize,
    pub high: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub backlog: usize,
    pub todo: usize,
    pub in_progress: usize,
    pub done: usize,
    pub canceled: usize,
    pub by_priority: PriorityCounts,
}

impl TaskStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = TaskStats::default();
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Backlog => stats.backlog += 1,
                TaskStatus::Todo => stats.todo += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Canceled => stats.canceled += 1,
            }
            match task.priority {
                TaskPriority::Low => stats.by_priority.low += 1,
                TaskPriority::Medium => stats.by_priority.medium += 1,
                TaskPriority::High => stats.by_priority.high += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Keyed by role code.
    pub by_role: BTreeMap<String, usize>,
}

impl UserStats {
    pub fn from_users<'a>(users: impl IntoIterator<Item = &'a UserEntry>) -> Self {
        let mut stats = UserStats::default();
        for entry in users {
            stats.total += 1;
            *stats.by_status.entry(entry.user.status.as_str().to_string()).or_default() += 1;
            for code in entry.role_codes() {
                *stats.by_role.entry(code.to_string()).or_default() += 1;
            }
        }
        stats
    }
}

fn stats_params<R: Resource>() -> R::Filter {
    let mut filter = R::Filter::default();
    let paging = filter.paging_mut();
    paging.page = Some(1);
    paging.per_page = Some(MAX_PER_PAGE);
    filter
}

impl TasksApi {
    /// Counts over the first 1000 tasks.
    pub async fn stats(&self) -> Result<TaskStats, ClientError> {
        let page = self.list(&stats_params::<Tasks>()).await?;
        Ok(TaskStats::from_tasks(&page.items))
    }
}

impl UsersApi {
    /// Counts over the first 1000 users.
    pub async fn stats(&self) -> Result<UserStats, ClientError> {
        let page = self.list(&stats_params::<Users>()).await?;
        Ok(UserStats::from_users(&page.items))
    }
}

impl FeedbacksApi {
    /// Post a feedback as the logged-in user, stamped now.
    pub async fn send(&self, task: Uuid, message: &str, kind: FeedbackType) -> Result<FeedbackEntry, ClientError> {
        let sender = self.records.client().auth().user_id().ok_or(ClientError::SessionExpired)?;
        let input = FeedbackInput {
            message: Some(message.to_string()),
            kind: Some(kind),
            sender: Some(sender),
            task: Some(task),
            timestamp: Some(Utc::now()),
        };
        self.create(&input).await
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::realtime::RealtimeUpdate;
    use crate::client::tests::admin_client;
    use crate::client::store::SyncOutcome;

    #[test]
    fn task_filters_translate() {
        let assignee = Uuid::nil();
        let filter = TaskFilter {
            status: Some(TaskStatus::InProgress),
            assignee: Some(assignee),
            search: Some("db".into()),
            ..Default::default()
        };
        assert_eq!(
            filter.to_filter().build(),
            format!(r#"status = "in_progress" && assignees ?= "{assignee}" && (title ~ "db" || description ~ "db")"#)
        );

        let params = TasksApi::params(&TaskFilter::default());
        assert_eq!(params.page, Some(1));
        assert_eq!(params.per_page, Some(20));
        assert_eq!(params.sort.as_deref(), Some("-created"));
        assert_eq!(params.filter, None);
    }

    #[test]
    fn other_filters_translate() {
        let departments = DepartmentFilter { name: Some("ops".into()), code: Some("OP".into()), ..Default::default() };
        assert_eq!(departments.to_filter().build(), r#"name ~ "ops" || code ~ "OP""#);

        let groups = GroupFilter { name: Some("core".into()), code: Some("C1".into()), ..Default::default() };
        assert_eq!(groups.to_filter().build(), r#"name ~ "core" && code = "C1""#);

        let users = UserFilter { status: Some(UserStatus::Active), search: Some("an".into()), ..Default::default() };
        assert_eq!(
            users.to_filter().build(),
            r#"status = "active" && (name ~ "an" || username ~ "an" || email ~ "an")"#
        );

        let params = FeedbacksApi::params(&FeedbackFilter { kind: Some(FeedbackType::Report), ..Default::default() });
        assert_eq!(params.filter.as_deref(), Some(r#"type = "report""#));
        assert_eq!(params.sort.as_deref(), Some("timestamp"));
        assert_eq!(params.expand.as_deref(), Some("sender"));
    }

    #[test]
    fn stats_count_by_status_priority_and_role() {
        let task = |status, priority| Task {
            id: Uuid::new_v4(),
            title: "t".into(),
            description: String::new(),
            status,
            priority,
            label: String::new(),
            assignees: vec![],
            departments: vec![],
            due_date: None,
            created_by: None,
            updated_by: None,
            created: Utc::now(),
            updated: Utc::now(),
        };
        let tasks = vec![
            task(TaskStatus::Todo, TaskPriority::High),
            task(TaskStatus::Done, TaskPriority::High),
            task(TaskStatus::Todo, TaskPriority::Low),
        ];
        let stats = TaskStats::from_tasks(&tasks);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.todo, 2);
        assert_eq!(stats.done, 1);
        assert_eq!(stats.by_priority, PriorityCounts { low: 1, medium: 0, high: 2 });
    }

    #[tokio::test]
    async fn entity_api_against_a_live_server() {
        let (client, _state, path) = admin_client("client_api").await;
        let tasks = TasksApi::new(&client);

        let input = |title: &str, priority| TaskInput {
            title: Some(title.into()),
            priority: Some(priority),
            ..Default::default()
        };
        let a = tasks.create(&input("Alpha", TaskPriority::High)).await.unwrap();
        let b = tasks.create(&input("Beta", TaskPriority::Low)).await.unwrap();
        tasks.create(&input("Gamma", TaskPriority::High)).await.unwrap();

        let found = tasks
            .list(&TaskFilter { search: Some("alp".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(found.items.len(), 1);
        assert_eq!(found.items[0].id, a.id);

        let stats = tasks.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_priority.high, 2);

        tasks.delete_many(&[a.id, b.id]).await.unwrap();
        assert_eq!(tasks.list(&TaskFilter::default()).await.unwrap().total_items, 1);

        let users = UsersApi::new(&client).stats().await.unwrap();
        assert_eq!(users.by_role.get("admin"), Some(&1));
        assert_eq!(users.by_status.get("active"), Some(&1));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn feedback_is_sent_as_the_current_user() {
        let (client, _state, path) = admin_client("client_feedback").await;
        let task = TasksApi::new(&client)
            .create(&TaskInput { title: Some("Review".into()), ..Default::default() })
            .await
            .unwrap();

        let feedbacks = FeedbacksApi::new(&client);
        let sent = feedbacks.send(task.id, "Looks good", FeedbackType::Comment).await.unwrap();
        assert_eq!(Some(sent.feedback.sender), client.auth().user_id());
        assert_eq!(sent.sender_name(), client.auth().record().unwrap()["name"].as_str().unwrap());

        let listed = feedbacks
            .list(&FeedbackFilter { task: Some(task.id), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(listed.items.len(), 1);
        assert!(listed.items[0].expand.sender.is_some());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn store_follows_pushed_changes() {
        let (client, _state, path) = admin_client("client_store").await;
        let tasks = TasksApi::new(&client);
        let (store, filter) = tasks.new_store();
        let store = Mutex::new(store);
        assert!(tasks.refresh(&store, &filter).await);

        let (rt, mut updates) = RealtimeClient::connect(&client).await.unwrap();
        assert!(matches!(updates.recv().await, Some(RealtimeUpdate::Connected { .. })));
        let since = store.lock().unwrap().revision();
        tasks.subscribe(&rt, Some(since)).unwrap();

        let created = tasks
            .create(&TaskInput { title: Some("Pushed".into()), ..Default::default() })
            .await
            .unwrap();
        let change = match updates.recv().await {
            Some(RealtimeUpdate::Change(change)) => change,
            other => panic!("unexpected {other:?}"),
        };
        let outcome = store.lock().unwrap().apply(change);
        assert_eq!(outcome, SyncOutcome::Inserted);

        let store = store.into_inner().unwrap();
        assert_eq!(store.items[0].id, created.id);
        assert_eq!(store.total_items, 1);
        let _ = std::fs::remove_file(path);
    }
}
