//! Typed client for the taskdesk backend.
//!
//! [`Client`] owns the HTTP connection and the [`AuthStore`]; every request
//! except the auth endpoints first makes sure the token has at least
//! [`REFRESH_BUFFER_SECS`] left, refreshing it otherwise.

pub mod api;
pub mod debounce;
pub mod realtime;
pub mod store;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, DecodingKey, Validation};
use reqwest::{Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

use crate::auth::AuthResponse;
use crate::dto::{FieldErrors, UserInput};
use crate::entities::Collection;
use crate::oauth::ExchangeResponse;
use crate::query::{ListParams, ListResult};

/// Tokens this close to expiry are refreshed before the next request.
pub const REFRESH_BUFFER_SECS: i64 = 5 * 60;

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ClientError {
    Http(reqwest::Error),
    /// The backend answered with an error body.
    Api { status: u16, message: String },
    /// Field validation failed.
    Invalid { message: String, fields: FieldErrors },
    /// The token expired and could not be refreshed; log in again.
    SessionExpired,
    WebSocket(tokio_tungstenite::tungstenite::Error),
    /// The realtime connection is gone.
    Disconnected,
    Decode(serde_json::Error),
}

impl ClientError {
    /// Short text for a toast or status line.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Invalid { message, fields } => match fields.iter().next() {
                Some((field, err)) => format!("{field}: {}", err.message),
                None => message.clone(),
            },
            ClientError::Api { message, .. } => message.clone(),
            ClientError::SessionExpired => "Session expired. Please login again.".into(),
            other => other.to_string(),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Invalid { .. } => Some(400),
            ClientError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Http(e) => write!(f, "request failed: {e}"),
            ClientError::Api { status, message } => write!(f, "{status}: {message}"),
            ClientError::Invalid { message, fields } => {
                write!(f, "{message}")?;
                for (field, err) in fields {
                    write!(f, " {field}: {} ({})", err.message, err.code)?;
                }
                Ok(())
            }
            ClientError::SessionExpired => write!(f, "session expired"),
            ClientError::WebSocket(e) => write!(f, "realtime connection failed: {e}"),
            ClientError::Disconnected => write!(f, "realtime connection closed"),
            ClientError::Decode(e) => write!(f, "unexpected response: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Decode(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e)
    }
}

/// Both error shapes the backend uses: `{status, message, data}` and the
/// OAuth routes' `{success: false, error}`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    message: String,
    error: String,
    data: Value,
}

async fn error_from(response: Response) -> ClientError {
    let status = response.status().as_u16();
    let body: ErrorBody = response.json().await.unwrap_or_default();
    let message = if body.message.is_empty() { body.error } else { body.message };

    if status == 400 {
        if let Ok(fields) = serde_json::from_value::<FieldErrors>(body.data) {
            if !fields.is_empty() {
                return ClientError::Invalid { message, fields };
            }
        }
    }
    ClientError::Api { status, message }
}

// ── Auth store ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub token: String,
    /// The user record, roles expanded.
    pub record: Value,
}

#[derive(Debug, Deserialize)]
struct ExpiryClaim {
    exp: i64,
}

/// Read `exp` without checking the signature; only the server can do that.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    let data = decode::<ExpiryClaim>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    DateTime::from_timestamp(data.claims.exp, 0)
}

/// Shared, cloneable holder of the current session.
#[derive(Debug, Clone, Default)]
pub struct AuthStore {
    inner: Arc<RwLock<Option<AuthSession>>>,
}

impl AuthStore {
    pub fn save(&self, token: String, record: Value) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(AuthSession { token, record });
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn token(&self) -> Option<String> {
        self.session().map(|s| s.token)
    }

    pub fn record(&self) -> Option<Value> {
        self.session().map(|s| s.record)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.record()?.get("id")?.as_str()?.parse().ok()
    }

    /// A token that has not expired yet.
    pub fn is_valid(&self) -> bool {
        self.token()
            .and_then(|t| token_expiry(&t))
            .map_or(false, |exp| exp > Utc::now())
    }

    /// True when there is a token that expires within the buffer, or whose
    /// expiry can't be read.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.token() {
            Some(token) => token_expiry(&token).map_or(true, |exp| exp <= now + Duration::seconds(REFRESH_BUFFER_SECS)),
            None => false,
        }
    }
}

// ── Client ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    auth: AuthStore,
}

impl Client {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Client {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: AuthStore::default(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn collection(&self, collection: Collection) -> RecordService {
        RecordService { client: self.clone(), collection }
    }

    /// Refresh a token that is about to expire. A failed refresh ends the
    /// session.
    async fn ensure_fresh(&self) -> Result<(), ClientError> {
        if !self.auth.needs_refresh(Utc::now()) {
            return Ok(());
        }
        match self.auth_refresh().await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed");
                self.auth.clear();
                Err(ClientError::SessionExpired)
            }
        }
    }

    fn build(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match self.auth.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Request builder with a fresh token attached.
    pub async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        self.ensure_fresh().await?;
        Ok(self.build(method, path))
    }

    pub async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        Ok(response.json().await?)
    }

    async fn send_empty(&self, builder: RequestBuilder) -> Result<(), ClientError> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }
        Ok(())
    }

    // ── Auth ───────────────────────────────────────────────────

    pub async fn auth_with_password(&self, identity: &str, password: &str) -> Result<AuthResponse, ClientError> {
        let builder = self
            .build(Method::POST, "/api/collections/users/auth-with-password")
            .json(&json!({ "identity": identity, "password": password }));
        let auth: AuthResponse = self.send(builder).await?;
        self.auth.save(auth.token.clone(), auth.record.clone());
        Ok(auth)
    }

    /// Create an account, then log in with it.
    pub async fn register(&self, input: &UserInput) -> Result<AuthResponse, ClientError> {
        let builder = self.build(Method::POST, "/api/collections/users/records").json(input);
        let _: Value = self.send(builder).await?;
        let identity = input.email.as_deref().or(input.username.as_deref()).unwrap_or_default();
        self.auth_with_password(identity, input.password.as_deref().unwrap_or_default()).await
    }

    pub async fn auth_refresh(&self) -> Result<AuthResponse, ClientError> {
        let builder = self.build(Method::POST, "/api/collections/users/auth-refresh");
        let auth: AuthResponse = self.send(builder).await?;
        self.auth.save(auth.token.clone(), auth.record.clone());
        Ok(auth)
    }

    pub fn logout(&self) {
        self.auth.clear();
    }

    /// Finish a Mattermost login with the code from the callback redirect.
    pub async fn exchange_oauth_code(&self, code: &str) -> Result<ExchangeResponse, ClientError> {
        let builder = self.build(Method::POST, "/api/auth/exchange").json(&json!({ "code": code }));
        let res: ExchangeResponse = self.send(builder).await?;
        self.auth.save(res.token.clone(), res.user.clone());
        Ok(res)
    }

    pub async fn notify_mattermost(
        &self,
        channel_id: &str,
        message: &str,
        usernames: &[String],
    ) -> Result<Value, ClientError> {
        let builder = self
            .request(Method::POST, "/api/notifications/mattermost")
            .await?
            .json(&json!({ "channel_id": channel_id, "message": message, "usernames": usernames }));
        self.send(builder).await
    }
}

// ── Records ────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct ExpandQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    expand: Option<&'a str>,
}

/// CRUD on one collection.
#[derive(Debug, Clone)]
pub struct RecordService {
    client: Client,
    collection: Collection,
}

impl RecordService {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn path(&self, id: Option<Uuid>) -> String {
        match id {
            Some(id) => format!("/api/collections/{}/records/{id}", self.collection),
            None => format!("/api/collections/{}/records", self.collection),
        }
    }

    pub async fn get_list<T: DeserializeOwned>(&self, params: &ListParams) -> Result<ListResult<T>, ClientError> {
        let builder = self.client.request(Method::GET, &self.path(None)).await?.query(params);
        self.client.send(builder).await
    }

    pub async fn get_one<T: DeserializeOwned>(&self, id: Uuid, expand: Option<&str>) -> Result<T, ClientError> {
        let builder = self
            .client
            .request(Method::GET, &self.path(Some(id)))
            .await?
            .query(&ExpandQuery { expand });
        self.client.send(builder).await
    }

    pub async fn create<T, B>(&self, body: &B, expand: Option<&str>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let builder = self
            .client
            .request(Method::POST, &self.path(None))
            .await?
            .query(&ExpandQuery { expand })
            .json(body);
        self.client.send(builder).await
    }

    pub async fn update<T, B>(&self, id: Uuid, body: &B, expand: Option<&str>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let builder = self
            .client
            .request(Method::PATCH, &self.path(Some(id)))
            .await?
            .query(&ExpandQuery { expand })
            .json(body);
        self.client.send(builder).await
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), ClientError> {
        let builder = self.client.request(Method::DELETE, &self.path(Some(id))).await?;
        self.client.send_empty(builder).await
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entities::Task;
    use crate::state::testing::test_state;
    use crate::state::SharedState;
    use std::path::PathBuf;

    /// A real server on a random port, seeded like production.
    pub(crate) async fn spawn_server(name: &str) -> (String, SharedState, PathBuf) {
        let (state, path) = test_state(name);
        let app = crate::routes::router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state, path)
    }

    pub(crate) async fn admin_client(name: &str) -> (Client, SharedState, PathBuf) {
        let (base, state, path) = spawn_server(name).await;
        let client = Client::new(base);
        client.auth_with_password("admin", "changeme123").await.unwrap();
        (client, state, path)
    }

    fn token_expiring_in(settings: &crate::config::Settings, minutes: i64) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        let exp = (Utc::now() + Duration::minutes(minutes)).timestamp();
        encode(
            &Header::default(),
            &json!({ "sub": Uuid::new_v4(), "email": "x@example.com", "exp": exp, "iat": exp - 60 }),
            &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn expiry_is_read_without_the_secret() {
        let settings = crate::config::Settings::default();
        let store = AuthStore::default();
        assert!(!store.needs_refresh(Utc::now()));

        store.save(token_expiring_in(&settings, 60), json!({ "id": Uuid::nil() }));
        assert!(store.is_valid());
        assert!(!store.needs_refresh(Utc::now()));
        assert!(store.needs_refresh(Utc::now() + Duration::minutes(56)));
        assert_eq!(store.user_id(), Some(Uuid::nil()));

        store.save("garbage".into(), Value::Null);
        assert!(!store.is_valid());
        assert!(store.needs_refresh(Utc::now()));
    }

    #[tokio::test]
    async fn login_and_crud_round_trip() {
        let (client, _state, path) = admin_client("client_crud").await;
        assert_eq!(client.auth().record().unwrap()["username"], "admin");

        let tasks = client.collection(Collection::Tasks);
        let created: Task = tasks.create(&json!({ "title": "From client" }), None).await.unwrap();
        let fetched: Task = tasks.get_one(created.id, None).await.unwrap();
        assert_eq!(fetched.title, "From client");

        let updated: Task = tasks.update(created.id, &json!({ "label": "bug" }), None).await.unwrap();
        assert_eq!(updated.label, "bug");

        let page: ListResult<Task> = tasks.get_list(&ListParams::default()).await.unwrap();
        assert_eq!(page.total_items, 1);

        tasks.delete(created.id).await.unwrap();
        let err = tasks.get_one::<Task>(created.id, None).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn validation_errors_carry_fields() {
        let (client, _state, path) = admin_client("client_invalid").await;
        let err = client
            .collection(Collection::Tasks)
            .create::<Task, _>(&json!({ "title": "" }), None)
            .await
            .unwrap_err();
        match &err {
            ClientError::Invalid { fields, .. } => assert_eq!(fields["title"].code, "validation_required"),
            other => panic!("unexpected {other}"),
        }
        assert!(err.user_message().starts_with("title:"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn register_then_logged_in() {
        let (base, _state, path) = spawn_server("client_register").await;
        let client = Client::new(base);
        let input = UserInput {
            username: Some("newbie".into()),
            email: Some("newbie@example.com".into()),
            password: Some("password123".into()),
            password_confirm: Some("password123".into()),
            ..Default::default()
        };
        let auth = client.register(&input).await.unwrap();
        assert_eq!(auth.record["expand"]["roles"][0]["code"], "member");
        assert!(client.auth().is_valid());

        client.logout();
        assert!(client.auth().token().is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_bad_one_ends_the_session() {
        let (client, state, path) = admin_client("client_refresh").await;
        let admin_id = client.auth().user_id().unwrap();
        let record = client.auth().record().unwrap();

        // Valid signature, four minutes left
        let soon = {
            use jsonwebtoken::{encode, EncodingKey, Header};
            let exp = (Utc::now() + Duration::minutes(4)).timestamp();
            encode(
                &Header::default(),
                &json!({ "sub": admin_id, "email": "admin@example.com", "exp": exp, "iat": exp - 60 }),
                &EncodingKey::from_secret(state.settings.jwt_secret.as_bytes()),
            )
            .unwrap()
        };
        client.auth().save(soon.clone(), record.clone());
        let _: ListResult<Value> = client.collection(Collection::Tasks).get_list(&ListParams::default()).await.unwrap();
        assert_ne!(client.auth().token().unwrap(), soon);

        // Signed with the wrong key: refresh fails and the store is cleared
        let forged = token_expiring_in(&crate::config::Settings { jwt_secret: "other".into(), ..Default::default() }, 1);
        client.auth().save(forged, record);
        let err = client
            .collection(Collection::Tasks)
            .get_list::<Value>(&ListParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::SessionExpired));
        assert!(client.auth().session().is_none());
        let _ = std::fs::remove_file(path);
    }
}
