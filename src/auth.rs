use crate::config::Settings;
use crate::entities::{Record, User, UserStatus};
use crate::error::ApiError;
use crate::expand::expand_record;
use crate::state::{AppState, SharedState};
use crate::world::{Actor, World};
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Request/response types ─────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PasswordLogin {
    /// E-mail or username.
    pub identity: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    /// The user record with `roles` expanded.
    pub record: Value,
}

// ── JWT ────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid, // user id
    pub email: String,
    pub exp: usize,
    pub iat: usize,
}

pub fn create_token(settings: &Settings, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let expiry = now + Duration::hours(settings.token_ttl_hours);

    let claims = Claims {
        sub: user.id,
        email: user.email.clone(),
        exp: expiry.timestamp() as usize,
        iat: now.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
    )
}

pub fn verify_token(settings: &Settings, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

// ── Passwords ──────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

// ── Request authentication ─────────────────────────────────────

/// The authenticated caller. Extracting it rejects the request with 401
/// when the token is missing, invalid, expired, or belongs to an inactive
/// or deleted user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub superuser: bool,
}

impl AuthUser {
    pub fn actor(&self) -> Actor {
        Actor::user(self.id, self.superuser)
    }
}

/// Resolve a raw token to its user.
pub fn authenticate(state: &AppState, token: &str) -> Result<AuthUser, ApiError> {
    let claims = verify_token(&state.settings, token).map_err(|_| ApiError::unauthorized())?;
    let world = state.read_world();
    match world.users.get(&claims.sub) {
        Some(user) if user.status == UserStatus::Active => Ok(AuthUser {
            id: user.id,
            superuser: world.is_superuser(user.id),
        }),
        _ => Err(ApiError::unauthorized()),
    }
}

/// `Authorization: Bearer <token>` or the bare token.
fn token_from_parts(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

#[async_trait]
impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let token = token_from_parts(parts).ok_or_else(ApiError::unauthorized)?;
        authenticate(state, token)
    }
}

/// Like [`AuthUser`] but lets guests through.
#[derive(Debug, Clone, Copy)]
pub struct MaybeAuth(pub Option<AuthUser>);

#[async_trait]
impl FromRequestParts<SharedState> for MaybeAuth {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        Ok(MaybeAuth(token_from_parts(parts).and_then(|t| authenticate(state, t).ok())))
    }
}

// ── Helpers ────────────────────────────────────────────────────

/// Token plus the user record with its roles expanded.
pub fn auth_response(settings: &Settings, world: &World, user: &User) -> Result<AuthResponse, ApiError> {
    let token = create_token(settings, user)?;
    let record = expand_record(world, &Record::User(user.clone()), Some("roles"));
    Ok(AuthResponse { token, record })
}

// ── Handlers ───────────────────────────────────────────────────

// POST /api/collections/users/auth-with-password
pub async fn auth_with_password(
    State(state): State<SharedState>,
    Json(payload): Json<PasswordLogin>,
) -> Result<Json<AuthResponse>, ApiError> {
    let failed = || ApiError::BadRequest("Failed to authenticate.".into());

    let user = {
        let world = state.read_world();
        world.get_user_by_identity(&payload.identity).cloned().ok_or_else(failed)?
    };

    // Hash check runs without holding the world lock
    if !verify_password(&payload.password, &user.password_hash) {
        tracing::info!(identity = %payload.identity, "password login rejected");
        return Err(failed());
    }
    if user.status != UserStatus::Active {
        return Err(ApiError::Forbidden("This account is inactive.".into()));
    }

    tracing::info!(user = %user.id, "password login");
    let world = state.read_world();
    Ok(Json(auth_response(&state.settings, &world, &user)?))
}

// POST /api/collections/users/auth-refresh
pub async fn auth_refresh(State(state): State<SharedState>, auth: AuthUser) -> Result<Json<AuthResponse>, ApiError> {
    let world = state.read_world();
    let user = world.users.get(&auth.id).ok_or_else(ApiError::unauthorized)?;
    Ok(Json(auth_response(&state.settings, &world, user)?))
}

// ── Tests ──────────────────────────────────────────────────────
