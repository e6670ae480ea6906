//! `/api/collections/{collection}/records` CRUD.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use uuid::Uuid;

use crate::auth::{hash_password, AuthUser, MaybeAuth};
use crate::dto::UserInput;
use crate::entities::{Collection, Record, UserStatus};
use crate::error::ApiError;
use crate::expand::expand_record;
use crate::filter::{self, EvalContext};
use crate::notify;
use crate::persist::MEMBER_ROLE;
use crate::query::{paginate, parse_sort, sort_records, ListParams, ListResult, SortKey};
use crate::state::SharedState;
use crate::world::{Actor, Command, Event, RecordInput};

#[derive(Debug, Default, Deserialize)]
pub struct ExpandParams {
    pub expand: Option<String>,
}

fn public_collection(name: &str) -> Result<Collection, ApiError> {
    name.parse::<Collection>()
        .ok()
        .filter(|c| c.is_public())
        .ok_or(ApiError::NotFound)
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse().map_err(|_| ApiError::NotFound)
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body).map_err(|e| ApiError::BadRequest(format!("Failed to load the submitted data: {e}")))
}

fn parse_input(collection: Collection, body: Value) -> Result<RecordInput, ApiError> {
    Ok(match collection {
        Collection::Tasks => RecordInput::Task(decode(body)?),
        Collection::Departments => RecordInput::Department(decode(body)?),
        Collection::Groups => RecordInput::Group(decode(body)?),
        Collection::Roles => RecordInput::Role(decode(body)?),
        Collection::Users => RecordInput::User(decode(body)?),
        Collection::Feedbacks => RecordInput::Feedback(decode(body)?),
        Collection::OAuthSessions => return Err(ApiError::NotFound),
    })
}

/// Validate and hash a submitted password so the plain text never reaches
/// the world.
fn hash_user_password(input: &mut UserInput, creating: bool) -> Result<(), ApiError> {
    input.validate(creating).map_err(ApiError::Validation)?;
    if let Some(password) = input.password.as_deref() {
        let hash = hash_password(password).map_err(|e| ApiError::Internal(format!("hash: {e}")))?;
        input.password_hash = Some(hash);
    }
    Ok(())
}

/// Expanded JSON of the record an event carries.
fn respond(state: &SharedState, event: &Event, expand: Option<&str>) -> Value {
    let world = state.read_world();
    expand_record(&world, event.record(), expand)
}

// GET /api/collections/:collection/records
pub async fn list(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path(collection): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResult<Value>>, ApiError> {
    let collection = public_collection(&collection)?;
    let filter = match params.filter.as_deref() {
        Some(raw) => filter::parse(raw)?,
        None => None,
    };
    let mut sort = parse_sort(params.sort.as_deref().unwrap_or(""), collection)?;
    if sort.is_empty() {
        sort.push(SortKey { field: "created".into(), descending: false });
    }
    let ctx = EvalContext::new(Some(auth.id));

    let world = state.read_world();
    let mut items: Vec<Value> = world
        .records(collection)
        .iter()
        .map(|record| expand_record(&world, record, params.expand.as_deref()))
        .filter(|json| filter.as_ref().map_or(true, |f| f.matches(json, &ctx)))
        .collect();
    sort_records(&mut items, &sort);

    Ok(Json(paginate(
        items,
        params.page(),
        params.per_page(),
        params.skip_total.unwrap_or(false),
        world.revision,
    )))
}

// GET /api/collections/:collection/records/:id
pub async fn view(
    State(state): State<SharedState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
    Query(params): Query<ExpandParams>,
) -> Result<Json<Value>, ApiError> {
    let collection = public_collection(&collection)?;
    let id = parse_id(&id)?;
    let world = state.read_world();
    let record = world.get(collection, id).ok_or(ApiError::NotFound)?;
    Ok(Json(expand_record(&world, &record, params.expand.as_deref())))
}

// POST /api/collections/:collection/records
pub async fn create(
    State(state): State<SharedState>,
    MaybeAuth(auth): MaybeAuth,
    Path(collection): Path<String>,
    Query(params): Query<ExpandParams>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let collection = public_collection(&collection)?;
    let mut input = parse_input(collection, body)?;

    let actor = match (&mut input, auth) {
        // Registration: guests get a plain active member account
        (RecordInput::User(user), None) => {
            let member = state.read_world().role_by_code(MEMBER_ROLE).map(|r| r.id);
            user.roles = Some(member.into_iter().collect());
            user.status = Some(UserStatus::Active);
            user.verified = Some(false);
            hash_user_password(user, true)?;
            Actor::guest()
        }
        (RecordInput::User(user), Some(auth)) => {
            if !auth.superuser {
                return Err(ApiError::forbidden());
            }
            hash_user_password(user, true)?;
            auth.actor()
        }
        (RecordInput::Role(_), Some(auth)) if !auth.superuser => return Err(ApiError::forbidden()),
        (RecordInput::Feedback(feedback), Some(auth)) => {
            if !auth.superuser {
                feedback.sender = Some(auth.id);
            }
            auth.actor()
        }
        (_, Some(auth)) => auth.actor(),
        (_, None) => return Err(ApiError::unauthorized()),
    };

    let event = state.commit(Command::Create { input }, actor)?;
    if let Record::Task(task) = event.record() {
        notify::spawn_task_notification(&state, task);
    }
    tracing::info!(%collection, id = %event.record().id(), "record created");
    Ok(Json(respond(&state, &event, params.expand.as_deref())))
}

// PATCH /api/collections/:collection/records/:id
pub async fn update(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
    Query(params): Query<ExpandParams>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let collection = public_collection(&collection)?;
    let id = parse_id(&id)?;
    let mut input = parse_input(collection, body)?;

    match &mut input {
        RecordInput::Role(_) if !auth.superuser => return Err(ApiError::forbidden()),
        RecordInput::User(user) => {
            if !auth.superuser {
                let privileged = user.roles.is_some() || user.status.is_some() || user.verified.is_some();
                if id != auth.id || privileged {
                    return Err(ApiError::forbidden());
                }
            }
            hash_user_password(user, false)?;
        }
        _ => {}
    }

    let event = state.commit(Command::Update { id, input }, auth.actor())?;
    Ok(Json(respond(&state, &event, params.expand.as_deref())))
}

// DELETE /api/collections/:collection/records/:id
pub async fn delete(
    State(state): State<SharedState>,
    auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let collection = public_collection(&collection)?;
    let id = parse_id(&id)?;
    if matches!(collection, Collection::Roles | Collection::Users) && !auth.superuser {
        return Err(ApiError::forbidden());
    }

    state.commit(Command::Delete { collection, id }, auth.actor())?;
    tracing::info!(%collection, %id, "record deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ──────────────────────────────────────────────────────
