use std::error::Error as StdError;
use std::fmt::Formatter;

use flotilla_common::models::error::{ApiError, ErrorKind};

use crate::persistence;

/// Control-plane errors carry an [`ErrorKind`] and an optional source. The
/// [`axum::response::IntoResponse`] implementation never leaks the source;
/// internal details stay in the logs.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl Error {
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    pub fn source<E: StdError + Sync + Send + 'static>(kind: ErrorKind, err: E) -> Self {
        Self {
            kind,
            message: None,
            source: Some(Box::new(err)),
        }
    }

    pub fn custom<S: AsRef<str>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: Some(message.as_ref().to_string()),
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::from_kind(kind)
    }
}

impl From<persistence::Error> for Error {
    fn from(err: persistence::Error) -> Self {
        match err {
            persistence::Error::NotFound(what) => {
                Self::custom(ErrorKind::NotFound, format!("{what} not found"))
            }
            persistence::Error::AlreadyExists(what) => {
                Self::custom(ErrorKind::AlreadyExists, format!("{what} already exists"))
            }
            persistence::Error::Conflict(message) => Self::custom(ErrorKind::Conflict, message),
            other => Self::source(ErrorKind::Internal, other),
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match &error.message {
            // Internal messages are not safe to show; everything else is
            // crafted for the caller.
            Some(message) if error.kind != ErrorKind::Internal => {
                ApiError::new(error.kind, message)
            }
            _ => error.kind.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &dyn StdError)
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        if self.kind == ErrorKind::Internal {
            tracing::error!(error = &self as &dyn StdError, "internal error on api surface");
        }

        ApiError::from(self).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
