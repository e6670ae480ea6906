//! Mattermost sign-in.
//!
//! login redirects to Mattermost with a random `state` (also set as a
//! cookie). The callback checks the cookie, trades the code for a
//! Mattermost token, upserts the local user and parks a short-lived
//! one-time code in `oauth_sessions`. The frontend swaps that code for our
//! own JWT at `/api/auth/exchange`.

use axum::{
    extract::{Query, State},
    http::{
        header::{COOKIE, LOCATION, SET_COOKIE},
        HeaderMap, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{create_token, hash_password};
use crate::config::MattermostSettings;
use crate::dto::{OAuthSessionInput, UserInput};
use crate::entities::{Collection, Record, UserStatus};
use crate::error::ApiError;
use crate::persist::MEMBER_ROLE;
use crate::state::SharedState;
use crate::world::{Actor, Command, RecordInput};

pub const STATE_COOKIE: &str = "oauth_state";

/// How long the one-time exchange code stays valid.
pub fn code_ttl() -> Duration {
    Duration::minutes(2)
}

// ── Wire types ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
}

/// The fields of Mattermost's `/api/v4/users/me` we use.
#[derive(Debug, Clone, Deserialize)]
pub struct MattermostUser {
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar_url: String,
}

impl MattermostUser {
    /// "First Last", falling back to the username.
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name.trim(), self.last_name.trim());
        let name = name.trim();
        if name.is_empty() {
            self.username.clone()
        } else {
            name.to_string()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExchangeResponse {
    pub success: bool,
    pub user: Value,
    pub token: String,
}

/// Errors on these routes use a `{success: false, error}` body instead of
/// the collection API's shape; the login page reads it directly.
#[derive(Debug)]
pub struct OAuthFailure {
    pub status: StatusCode,
    pub error: String,
}

impl OAuthFailure {
    fn new(status: StatusCode, error: &str) -> Self {
        OAuthFailure { status, error: error.to_string() }
    }
}

impl IntoResponse for OAuthFailure {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "success": false, "error": self.error }))).into_response()
    }
}

// ── Helpers ────────────────────────────────────────────────────

/// 256 bits from the OS generator, hex encoded.
pub fn random_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

fn state_cookie(value: &str) -> String {
    format!("{STATE_COOKIE}={value}; Path=/; HttpOnly; Secure; SameSite=Lax")
}

fn clear_state_cookie() -> String {
    format!("{STATE_COOKIE}=; Path=/; Max-Age=0; HttpOnly; Secure; SameSite=Lax")
}

fn require_configured(settings: &MattermostSettings) -> Result<(), OAuthFailure> {
    if settings.oauth_configured() {
        Ok(())
    } else {
        Err(OAuthFailure::new(StatusCode::SERVICE_UNAVAILABLE, "Mattermost login is not configured"))
    }
}

pub fn authorize_url(settings: &MattermostSettings, state: &str) -> Result<reqwest::Url, String> {
    reqwest::Url::parse_with_params(
        &format!("{}/oauth/authorize", settings.server()),
        &[
            ("client_id", settings.client_id.as_str()),
            ("redirect_uri", settings.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", "read"),
            ("state", state),
        ],
    )
    .map_err(|e| e.to_string())
}

fn app_redirect(app_url: &str, code: &str) -> Result<reqwest::Url, String> {
    reqwest::Url::parse_with_params(&format!("{}/oauth/callback", app_url.trim_end_matches('/')), &[("code", code)])
        .map_err(|e| e.to_string())
}

fn redirect(location: &reqwest::Url, cookie: String) -> Response {
    (StatusCode::FOUND, [(SET_COOKIE, cookie), (LOCATION, location.to_string())]).into_response()
}

async fn exchange_code(
    http: &reqwest::Client,
    settings: &MattermostSettings,
    code: &str,
) -> Result<String, reqwest::Error> {
    let token: TokenResponse = http
        .post(format!("{}/oauth/access_token", settings.server()))
        .form(&[
            ("grant_type", "authorization_code"),
            ("client_id", settings.client_id.as_str()),
            ("client_secret", settings.client_secret.as_str()),
            ("code", code),
            ("redirect_uri", settings.redirect_uri.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(token.access_token)
}

async fn fetch_user(
    http: &reqwest::Client,
    settings: &MattermostSettings,
    access_token: &str,
) -> Result<MattermostUser, reqwest::Error> {
    http.get(format!("{}/api/v4/users/me", settings.server()))
        .bearer_auth(access_token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await
}

/// Find the local user by e-mail and refresh their profile, or create them
/// as an active, verified member.
pub fn upsert_user(state: &SharedState, mm: &MattermostUser) -> Result<Uuid, ApiError> {
    let (existing, member_role) = {
        let world = state.read_world();
        (
            world.get_user_by_email(&mm.email).map(|u| u.id),
            world.role_by_code(MEMBER_ROLE).map(|r| r.id),
        )
    };

    let mut input = UserInput {
        name: Some(mm.display_name()),
        username: Some(mm.username.clone()),
        ..Default::default()
    };
    if !mm.avatar_url.is_empty() {
        input.avatar = Some(mm.avatar_url.clone());
    }

    let cmd = match existing {
        Some(id) => Command::Update { id, input: RecordInput::User(input) },
        None => {
            // Mattermost users never log in with a password
            let unusable = hash_password(&random_token()).map_err(|e| ApiError::Internal(e.to_string()))?;
            input.email = Some(mm.email.clone());
            input.status = Some(UserStatus::Active);
            input.verified = Some(true);
            input.roles = Some(member_role.into_iter().collect());
            input.password_hash = Some(unusable);
            Command::Create { input: RecordInput::User(input) }
        }
    };
    let event = state.commit(cmd, Actor::system())?;
    Ok(event.record().id())
}

// ── Handlers ───────────────────────────────────────────────────

/// Delete sessions whose code has expired. Used codes stay until then so a
/// replayed callback still finds its state.
pub fn prune_sessions(state: &SharedState, now: DateTime<Utc>) -> usize {
    let stale: Vec<Uuid> = state
        .read_world()
        .oauth_sessions
        .values()
        .filter(|s| s.expires_at <= now)
        .map(|s| s.id)
        .collect();
    let mut pruned = 0;
    for id in stale {
        match state.commit(Command::Delete { collection: Collection::OAuthSessions, id }, Actor::system()) {
            Ok(_) => pruned += 1,
            Err(e) => tracing::warn!(session = %id, error = %e, "oauth session prune failed"),
        }
    }
    if pruned > 0 {
        tracing::debug!(pruned, "expired oauth sessions removed");
    }
    pruned
}

// GET /api/auth/mattermost/login
pub async fn mattermost_login(State(state): State<SharedState>) -> Result<Response, OAuthFailure> {
    let settings = &state.settings.mattermost;
    require_configured(settings)?;
    prune_sessions(&state, Utc::now());

    let oauth_state = random_token();
    let url = authorize_url(settings, &oauth_state).map_err(|e| {
        tracing::error!(error = %e, "bad mattermost server url");
        OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Mattermost login is misconfigured")
    })?;
    Ok(redirect(&url, state_cookie(&oauth_state)))
}

// GET /api/auth/mattermost/callback
pub async fn mattermost_callback(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, OAuthFailure> {
    let settings = &state.settings.mattermost;
    require_configured(settings)?;

    if params.state.is_empty() || cookie_value(&headers, STATE_COOKIE) != Some(params.state.as_str()) {
        return Err(OAuthFailure::new(StatusCode::BAD_REQUEST, "Invalid state parameter"));
    }
    let redirect_to = |code: &str| {
        app_redirect(&state.settings.app_url, code).map_err(|e| {
            tracing::error!(error = %e, "bad app url");
            OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Invalid app url")
        })
    };

    // A browser replaying the callback gets the code it was already given
    let existing = state.read_world().oauth_session_by_state(&params.state).map(|s| s.code.clone());
    if let Some(code) = existing {
        return Ok(redirect(&redirect_to(&code)?, clear_state_cookie()));
    }

    let access_token = exchange_code(&state.http, settings, &params.code).await.map_err(|e| {
        tracing::warn!(error = %e, "mattermost code exchange failed");
        OAuthFailure::new(StatusCode::BAD_REQUEST, "Failed to exchange authorization code")
    })?;
    let mm_user = fetch_user(&state.http, settings, &access_token).await.map_err(|e| {
        tracing::warn!(error = %e, "mattermost user lookup failed");
        OAuthFailure::new(StatusCode::BAD_REQUEST, "Failed to get user information")
    })?;

    let user_id = upsert_user(&state, &mm_user).map_err(|e| {
        tracing::error!(error = %e, email = %mm_user.email, "mattermost user upsert failed");
        OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create user account")
    })?;

    let code = random_token();
    let session = OAuthSessionInput {
        code: Some(code.clone()),
        user: Some(user_id),
        state: Some(params.state.clone()),
        used: Some(false),
        expires_at: Some(Utc::now() + code_ttl()),
    };
    state
        .commit(Command::Create { input: RecordInput::OAuthSession(session) }, Actor::system())
        .map_err(|e| {
            tracing::error!(error = %e, "oauth session create failed");
            OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session")
        })?;

    tracing::info!(user = %user_id, mattermost_id = %mm_user.id, "mattermost login");
    Ok(redirect(&redirect_to(&code)?, clear_state_cookie()))
}

// POST /api/auth/exchange
pub async fn exchange(
    State(state): State<SharedState>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponse>, OAuthFailure> {
    let bad = |msg: &str| OAuthFailure::new(StatusCode::BAD_REQUEST, msg);

    // Check and spend under one write lock so a code works exactly once
    let (_, user) = state
        .commit_checked(
            |world| {
                let session = world
                    .oauth_session_by_code(&body.code)
                    .filter(|s| !body.code.is_empty() && !s.used)
                    .ok_or_else(|| ApiError::BadRequest("invalid code".into()))?;
                if session.expires_at < Utc::now() {
                    return Err(ApiError::BadRequest("code expired".into()));
                }
                let user = world
                    .users
                    .get(&session.user)
                    .cloned()
                    .ok_or_else(|| ApiError::BadRequest("user not found".into()))?;
                let roles: Vec<Value> = user
                    .roles
                    .iter()
                    .filter_map(|id| world.roles.get(id))
                    .map(|r| json!({ "id": r.id, "name": r.name, "code": r.code }))
                    .collect();
                let spend = OAuthSessionInput { used: Some(true), ..Default::default() };
                let cmd = Command::Update { id: session.id, input: RecordInput::OAuthSession(spend) };
                Ok((cmd, (user, roles)))
            },
            Actor::system(),
        )
        .map_err(|e| match e {
            ApiError::BadRequest(msg) => bad(&msg),
            other => {
                tracing::error!(error = %other, "oauth exchange failed");
                OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to complete login")
            }
        })?;
    let (user, roles) = user;

    let token = create_token(&state.settings, &user).map_err(|e| {
        tracing::error!(error = %e, "token signing failed");
        OAuthFailure::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to issue token")
    })?;

    let mut record = Record::User(user).to_json();
    let user = json!({
        "id": record["id"].take(),
        "email": record["email"].take(),
        "name": record["name"].take(),
        "username": record["username"].take(),
        "avatar": record["avatar"].take(),
        "roles": roles,
    });
    Ok(Json(ExchangeResponse { success: true, user, token }))
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::state::testing::test_state_with;
    use axum::{
        http::HeaderValue,
        routing::{get, post},
        Form, Router,
    };
    use std::collections::HashMap;

    async fn fake_mattermost() -> String {
        let app = Router::new()
            .route(
                "/oauth/access_token",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    if form.get("code").map(String::as_str) == Some("good") && form["client_secret"] == "secret" {
                        (StatusCode::OK, Json(json!({ "access_token": "mm-token", "token_type": "bearer" })))
                    } else {
                        (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" })))
                    }
                }),
            )
            .route(
                "/api/v4/users/me",
                get(|headers: HeaderMap| async move {
                    if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer mm-token") {
                        return (StatusCode::UNAUTHORIZED, Json(json!({})));
                    }
                    (
                        StatusCode::OK,
                        Json(json!({
                            "id": "mm1",
                            "email": "lan@example.com",
                            "username": "lan",
                            "first_name": "Lan",
                            "last_name": "Nguyen",
                        })),
                    )
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn configure(server_url: String) -> impl FnOnce(&mut Settings) {
        move |s| {
            s.app_url = "http://app.test/".into();
            s.mattermost.server_url = server_url;
            s.mattermost.client_id = "client".into();
            s.mattermost.client_secret = "secret".into();
            s.mattermost.redirect_uri = "http://api.test/api/auth/mattermost/callback".into();
        }
    }

    fn with_cookie(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(&format!("theme=dark; {STATE_COOKIE}={value}")).unwrap());
        headers
    }

    fn location(res: &Response) -> String {
        res.headers()[LOCATION].to_str().unwrap().to_string()
    }

    fn code_from(location: &str) -> String {
        location.split("code=").nth(1).unwrap().to_string()
    }

    async fn callback(state: &SharedState, code: &str, oauth_state: &str) -> Result<Response, OAuthFailure> {
        mattermost_callback(
            State(state.clone()),
            with_cookie(oauth_state),
            Query(CallbackParams { code: code.into(), state: oauth_state.into() }),
        )
        .await
    }

    #[test]
    fn cookie_lookup() {
        let headers = with_cookie("abc");
        assert_eq!(cookie_value(&headers, STATE_COOKIE), Some("abc"));
        assert_eq!(cookie_value(&headers, "theme"), Some("dark"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let mut user = MattermostUser {
            id: "x".into(),
            email: String::new(),
            username: "lan".into(),
            first_name: " Lan ".into(),
            last_name: String::new(),
            avatar_url: String::new(),
        };
        assert_eq!(user.display_name(), "Lan");
        user.first_name.clear();
        assert_eq!(user.display_name(), "lan");
    }

    #[tokio::test]
    async fn login_redirects_with_state_cookie() {
        let (state, path) = test_state_with("oauth_login", configure("http://mm.test/".into()));
        let res = mattermost_login(State(state.clone())).await.unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);

        let url = reqwest::Url::parse(&location(&res)).unwrap();
        assert_eq!(url.path(), "/oauth/authorize");
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(params["client_id"], "client");
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["state"].len(), 64);

        let cookie = res.headers()[SET_COOKIE].to_str().unwrap();
        assert!(cookie.starts_with(&format!("{STATE_COOKIE}={}", params["state"])));
        assert!(cookie.contains("HttpOnly"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn unconfigured_login_is_unavailable() {
        let (state, path) = test_state_with("oauth_off", |_| {});
        let err = mattermost_login(State(state)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn callback_rejects_mismatched_state() {
        let (state, path) = test_state_with("oauth_state", configure("http://mm.test".into()));
        let err = mattermost_callback(
            State(state.clone()),
            with_cookie("expected"),
            Query(CallbackParams { code: "good".into(), state: "forged".into() }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error, "Invalid state parameter");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn full_flow_creates_user_and_spends_code_once() {
        let server = fake_mattermost().await;
        let (state, path) = test_state_with("oauth_flow", configure(server));

        let res = callback(&state, "good", "s1").await.unwrap();
        assert_eq!(res.status(), StatusCode::FOUND);
        let loc = location(&res);
        assert!(loc.starts_with("http://app.test/oauth/callback?code="));
        assert!(res.headers()[SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

        {
            let world = state.read_world();
            let user = world.get_user_by_email("lan@example.com").unwrap();
            assert_eq!(user.name, "Lan Nguyen");
            assert!(user.verified);
            assert_eq!(user.status, UserStatus::Active);
            assert_eq!(user.roles, vec![world.role_by_code(MEMBER_ROLE).unwrap().id]);
        }

        // Replayed callback reuses the session instead of exchanging again
        let again = callback(&state, "already-spent", "s1").await.unwrap();
        assert_eq!(code_from(&location(&again)), code_from(&loc));

        let code = code_from(&loc);
        let res = exchange(State(state.clone()), Json(ExchangeRequest { code: code.clone() }))
            .await
            .unwrap();
        assert!(res.success);
        assert_eq!(res.user["username"], "lan");
        assert_eq!(res.user["roles"][0]["code"], MEMBER_ROLE);
        assert!(res.user.get("passwordHash").is_none());
        let claims = crate::auth::verify_token(&state.settings, &res.token).unwrap();
        assert_eq!(claims.email, "lan@example.com");

        let err = exchange(State(state.clone()), Json(ExchangeRequest { code })).await.unwrap_err();
        assert_eq!(err.error, "invalid code");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn second_login_updates_existing_user() {
        let server = fake_mattermost().await;
        let (state, path) = test_state_with("oauth_relogin", configure(server));
        callback(&state, "good", "a").await.unwrap();
        callback(&state, "good", "b").await.unwrap();
        let world = state.read_world();
        assert_eq!(world.users.values().filter(|u| u.email == "lan@example.com").count(), 1);
        assert_eq!(world.oauth_sessions.len(), 2);
        drop(world);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn bad_code_fails_exchange_with_mattermost() {
        let server = fake_mattermost().await;
        let (state, path) = test_state_with("oauth_badcode", configure(server));
        let err = callback(&state, "bad", "s").await.unwrap_err();
        assert_eq!(err.error, "Failed to exchange authorization code");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn expired_codes_are_rejected() {
        let (state, path) = test_state_with("oauth_expired", |_| {});
        let admin = state.read_world().get_user_by_identity("admin").unwrap().id;
        let session = OAuthSessionInput {
            code: Some("stale".into()),
            user: Some(admin),
            state: Some("st".into()),
            used: Some(false),
            expires_at: Some(Utc::now() - Duration::seconds(1)),
        };
        state
            .commit(Command::Create { input: RecordInput::OAuthSession(session) }, Actor::system())
            .unwrap();

        let err = exchange(State(state.clone()), Json(ExchangeRequest { code: "stale".into() }))
            .await
            .unwrap_err();
        assert_eq!(err.error, "code expired");
        let err = exchange(State(state), Json(ExchangeRequest { code: String::new() })).await.unwrap_err();
        assert_eq!(err.error, "invalid code");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn expired_sessions_are_pruned() {
        let (state, path) = test_state_with("oauth_prune", |_| {});
        let admin = state.read_world().get_user_by_identity("admin").unwrap().id;
        for (code, age) in [("old", -5), ("spent", -1), ("fresh", 2)] {
            let session = OAuthSessionInput {
                code: Some(code.into()),
                user: Some(admin),
                state: Some(format!("st-{code}")),
                used: Some(code == "spent"),
                expires_at: Some(Utc::now() + Duration::minutes(age)),
            };
            state
                .commit(Command::Create { input: RecordInput::OAuthSession(session) }, Actor::system())
                .unwrap();
        }

        assert_eq!(prune_sessions(&state, Utc::now()), 2);
        let world = state.read_world();
        assert_eq!(world.oauth_sessions.len(), 1);
        assert!(world.oauth_session_by_code("fresh").is_some());
        drop(world);
        let _ = std::fs::remove_file(path);
    }
}
