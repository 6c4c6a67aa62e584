use std::fmt::Display;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use strum::Display as EnumDisplay;

/// The kinds of failure the control plane surfaces to API callers. Everything
/// that is not one of the first six collapses into [`ErrorKind::Internal`],
/// which never leaks its source to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    AlreadyExists,
    Validation,
    InsufficientCapacity,
    Unauthorized,
    Internal,
}

impl ErrorKind {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict | Self::AlreadyExists | Self::InsufficientCapacity => {
                StatusCode::CONFLICT
            }
            Self::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            Self::NotFound => "entity not found",
            Self::Conflict => "operation conflicts with an in-progress action",
            Self::AlreadyExists => "a resource with this identifier already exists",
            Self::Validation => "input failed validation",
            Self::InsufficientCapacity => "the fleet cannot satisfy this request",
            Self::Unauthorized => "invalid or expired credentials",
            Self::Internal => "internal server error",
        }
    }
}

/// The JSON error body every endpoint returns on failure.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiError {
    pub message: String,
    pub status_code: u16,
    pub kind: ErrorKind,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Display) -> Self {
        Self {
            message: message.to_string(),
            status_code: kind.status().as_u16(),
            kind,
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl From<ErrorKind> for ApiError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }
}

impl Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self)).into_response()
    }
}
