use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use std::fmt;

use crate::dto::FieldErrors;
use crate::filter::FilterError;
use crate::persist::SaveFileError;
use crate::query::QueryError;
use crate::world::WorldError;

/// Error returned by every HTTP handler, rendered as
/// `{"status": 400, "message": "...", "data": {...}}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Validation(FieldErrors),
    Unauthorized(String),
    Forbidden(String),
    NotFound,
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn unauthorized() -> Self {
        ApiError::Unauthorized("The request requires valid record authorization token.".into())
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden("You are not allowed to perform this request.".into())
    }

    fn data(&self) -> Value {
        match self {
            ApiError::Validation(fields) => serde_json::to_value(fields).unwrap_or_default(),
            _ => Value::Object(Map::new()),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Validation(_) => f.write_str("Failed to validate the submitted data."),
            ApiError::NotFound => f.write_str("The requested resource wasn't found."),
            ApiError::BadRequest(m)
            | ApiError::Unauthorized(m)
            | ApiError::Forbidden(m)
            | ApiError::Conflict(m)
            | ApiError::Unavailable(m) => f.write_str(m),
            // Internal details are logged, not returned
            ApiError::Internal(_) => f.write_str("Something went wrong while processing your request."),
        }
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal(detail) = &self {
            tracing::error!(%detail, "request failed");
        }
        let body = json!({
            "status": status.as_u16(),
            "message": self.to_string(),
            "data": self.data(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<WorldError> for ApiError {
    fn from(e: WorldError) -> Self {
        match e {
            WorldError::NotFound => ApiError::NotFound,
            WorldError::Invalid(fields) => ApiError::Validation(fields),
            WorldError::RelationNotFound { field } => {
                let mut fields = FieldErrors::new();
                fields.insert(
                    field.to_string(),
                    crate::dto::FieldError {
                        code: "validation_missing_rel_records".into(),
                        message: "Failed to find all relation records with the provided ids.".into(),
                    },
                );
                ApiError::Validation(fields)
            }
            WorldError::Duplicate { .. } | WorldError::StillReferenced { .. } => ApiError::Conflict(e.to_string()),
        }
    }
}

impl From<SaveFileError> for ApiError {
    fn from(e: SaveFileError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<FilterError> for ApiError {
    fn from(e: FilterError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for ApiError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        ApiError::Internal(format!("token: {e}"))
    }
}
